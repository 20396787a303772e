// Copyright 2026 Chainscope contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Tracing setup. The library itself only emits `tracing` events; installing a
//! subscriber is the embedding application's choice, with this helper as the default.

use tracing_subscriber::EnvFilter;

/// Installs a global subscriber reading `RUST_LOG` (default `info`). `json` switches
/// to structured output for log shippers. Safe to call once per process; later calls
/// are no-ops.
pub fn init(json: bool) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new("info"));

	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	let result = if json {
		builder.json().try_init()
	} else {
		builder.try_init()
	};
	if result.is_err() {
		tracing::debug!("a global tracing subscriber was already installed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn init_is_idempotent() {
		init(false);
		init(true);
	}
}
