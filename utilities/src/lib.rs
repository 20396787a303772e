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

pub mod redact;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::time::Duration;

pub use redact::SecretUrl;

/// Makes a tick that outputs every `interval` and if ticks are "missed" (as tick() wasn't
/// called for some time) it will immediately output a single tick on the next call to
/// tick() and resume ticking every `interval`.
///
/// The supplied interval must be non-zero.
pub fn make_periodic_tick(interval: Duration, yield_immediately: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		tokio::time::Instant::now() +
			if yield_immediately { Duration::ZERO } else { interval },
		interval,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}

/// Trims and lowercases a string so values differing only in case or padding compare
/// equal. Cache keys, address dedupe keys and case-insensitive key matching all
/// normalise through here.
pub fn normalise_hex(s: &str) -> String {
	s.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_periodic_tick() {
		tokio::time::pause();

		let mut tick = make_periodic_tick(Duration::from_secs(10), false);

		// The first tick should not be immediate.
		assert!(futures::poll!(Box::pin(tick.tick())).is_pending());

		tokio::time::advance(Duration::from_secs(11)).await;
		tick.tick().await;
	}

	#[tokio::test]
	async fn test_immediate_tick() {
		let mut tick = make_periodic_tick(Duration::from_secs(10), true);
		tick.tick().await;
	}

	#[test]
	fn test_normalise_hex() {
		assert_eq!(
			normalise_hex(" 0xABCDef0123456789abcdef0123456789ABCDEF01 "),
			"0xabcdef0123456789abcdef0123456789abcdef01"
		);
	}
}
