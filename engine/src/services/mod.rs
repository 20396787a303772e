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

//! User-facing services. Validation happens here, at the top of the pipeline, before a
//! request is allowed anywhere near a transport.

pub mod accounts;
pub mod balance;
pub mod subscriptions;
pub mod transactions;

use std::{collections::BTreeMap, sync::Arc, sync::OnceLock};

use ethers::types::H160;
use regex::Regex;

use crate::{
	adapter::ChainAdapter,
	connection::ConnectionManager,
	errors::RpcError,
	evm::rpc::ChainRpcApi,
	settings::ChainSettings,
	types::ChainId,
};

/// Everything chain-scoped that the services share.
pub(crate) struct ChainContext<Rpc: ChainRpcApi> {
	pub settings: ChainSettings,
	pub adapter: Arc<ChainAdapter<Rpc>>,
	pub manager: Arc<ConnectionManager>,
}

pub(crate) type ChainMap<Rpc> = Arc<BTreeMap<ChainId, ChainContext<Rpc>>>;

pub(crate) fn chain_context<Rpc: ChainRpcApi>(
	chains: &ChainMap<Rpc>,
	chain: ChainId,
) -> Result<&ChainContext<Rpc>, RpcError> {
	chains.get(&chain).ok_or(RpcError::ChainUnsupported(chain))
}

fn address_regex() -> &'static Regex {
	static ADDRESS_RE: OnceLock<Regex> = OnceLock::new();
	ADDRESS_RE.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("valid regex"))
}

/// Accepts exactly `0x` + 40 hex digits, case-insensitively.
pub fn validate_address(address: &str) -> Result<H160, RpcError> {
	if !address_regex().is_match(address) {
		return Err(RpcError::Validation {
			field: "address".to_string(),
			expected: "a 0x-prefixed 20-byte hex address".to_string(),
			received: address.to_string(),
		})
	}
	address.parse::<H160>().map_err(|_| RpcError::Validation {
		field: "address".to_string(),
		expected: "a 0x-prefixed 20-byte hex address".to_string(),
		received: address.to_string(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_checksummed_and_lowercase_addresses() {
		assert!(validate_address("0x742d35Cc6634C0532925a3b844Bc454e4438bEb0").is_ok());
		assert!(validate_address("0x742d35cc6634c0532925a3b844bc454e4438beb0").is_ok());
	}

	#[test]
	fn rejects_malformed_addresses() {
		for bad in [
			"",
			"0x",
			"742d35cc6634c0532925a3b844bc454e4438beb0",
			"0x742d35cc6634c0532925a3b844bc454e4438beb",
			"0x742d35cc6634c0532925a3b844bc454e4438beb0ff",
			"0xzzzd35cc6634c0532925a3b844bc454e4438beb0",
		] {
			assert!(
				matches!(validate_address(bad), Err(RpcError::Validation { .. })),
				"{bad:?} should be rejected"
			);
		}
	}
}
