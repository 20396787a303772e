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

//! Helpers shared by the engine's tests.

use std::{future::Future, time::Duration};

/// Awaits `fut`, panicking if it does not resolve within `secs` seconds. Used to keep
/// hanging tests from stalling the whole suite.
pub async fn with_timeout<F: Future>(secs: u64, fut: F) -> F::Output {
	tokio::time::timeout(Duration::from_secs(secs), fut)
		.await
		.expect("future did not resolve within the test deadline")
}

/// Asserts that a stream-like recv future yields nothing for a short while.
#[macro_export]
macro_rules! assert_pending {
	($fut:expr) => {
		assert!(
			futures::poll!(Box::pin($fut)).is_pending(),
			"expected the future to be pending"
		)
	};
}
