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

//! Static per-chain configuration lookup. Purely data; transports and adapters are
//! built from these entries at engine construction.

use std::collections::BTreeMap;

use crate::{
	errors::RpcError,
	settings::{ChainSettings, Settings},
	types::{ChainId, ChainInfo},
};

pub struct ChainRegistry {
	chains: BTreeMap<ChainId, ChainSettings>,
}

impl ChainRegistry {
	pub fn new(settings: &Settings) -> Self {
		Self {
			chains: settings
				.chains
				.iter()
				.map(|chain| (chain.id, chain.clone()))
				.collect(),
		}
	}

	pub fn contains(&self, chain: ChainId) -> bool {
		self.chains.contains_key(&chain)
	}

	pub fn get(&self, chain: ChainId) -> Result<&ChainSettings, RpcError> {
		self.chains.get(&chain).ok_or(RpcError::ChainUnsupported(chain))
	}

	pub fn ids(&self) -> Vec<ChainId> {
		self.chains.keys().copied().collect()
	}

	pub fn iter(&self) -> impl Iterator<Item = &ChainSettings> {
		self.chains.values()
	}

	pub fn info(&self, chain: ChainId) -> Result<ChainInfo, RpcError> {
		self.get(chain).map(|chain| ChainInfo {
			chain_id: chain.id,
			name: chain.name.clone(),
			native_symbol: chain.native_symbol.clone(),
			native_decimals: chain.native_decimals,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn settings() -> Settings {
		Settings {
			chains: vec![
				ChainSettings {
					id: 1,
					name: "Ethereum".to_string(),
					native_symbol: "ETH".to_string(),
					native_decimals: 18,
					http_endpoints: vec!["http://localhost:8545".into()],
					ws_endpoints: vec![],
					tokens: vec![],
				},
				ChainSettings {
					id: 137,
					name: "Polygon".to_string(),
					native_symbol: "POL".to_string(),
					native_decimals: 18,
					http_endpoints: vec!["http://localhost:8547".into()],
					ws_endpoints: vec![],
					tokens: vec![],
				},
			],
			..Default::default()
		}
	}

	#[test]
	fn lookup_by_chain_id() {
		let registry = ChainRegistry::new(&settings());
		assert!(registry.contains(1));
		assert_eq!(registry.get(137).unwrap().native_symbol, "POL");
		assert_eq!(registry.ids(), vec![1, 137]);
	}

	#[test]
	fn unknown_chain_is_a_configuration_error() {
		let registry = ChainRegistry::new(&settings());
		assert!(matches!(registry.get(42), Err(RpcError::ChainUnsupported(42))));
		assert!(matches!(registry.info(42), Err(RpcError::ChainUnsupported(42))));
	}

	#[test]
	fn info_carries_native_currency() {
		let registry = ChainRegistry::new(&settings());
		let info = registry.info(1).unwrap();
		assert_eq!(info.name, "Ethereum");
		assert_eq!(info.native_decimals, 18);
	}
}
