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

//! Protocol adapters: a shared capability surface over DeFi protocols, each
//! implementation a stateless translation layer on top of `read_contract`. No
//! inheritance anywhere; adapters hold a chain-adapter reference and compose.

pub mod uniswap_v3;

use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::H160;
use serde::Serialize;

use crate::{
	errors::RpcError,
	types::{Asset, AssetAmount, ChainId},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LendingPosition {
	pub protocol: String,
	pub chain: ChainId,
	pub asset: Asset,
	pub supplied: String,
	pub borrowed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StakedPosition {
	pub protocol: String,
	pub chain: ChainId,
	pub asset: Asset,
	pub amount: String,
	pub rewards: Vec<AssetAmount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiquidityPosition {
	pub protocol: String,
	pub chain: ChainId,
	pub pool: H160,
	pub token0: Asset,
	pub token1: Asset,
	pub fee_tier: u32,
	pub tick_lower: i32,
	pub tick_upper: i32,
	pub liquidity: String,
	pub amount0: String,
	pub amount1: String,
	pub in_range: bool,
}

/// The capability set every protocol adapter provides. A protocol without one of the
/// position kinds simply returns an empty list for it.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
	fn protocol_name(&self) -> &'static str;

	fn supports_chain(&self, chain: ChainId) -> bool;

	async fn get_lending_positions(
		&self,
		address: H160,
		chain: ChainId,
	) -> Result<Vec<LendingPosition>, RpcError>;

	async fn get_staked_positions(
		&self,
		address: H160,
		chain: ChainId,
	) -> Result<Vec<StakedPosition>, RpcError>;

	async fn get_liquidity_positions(
		&self,
		address: H160,
		chain: ChainId,
	) -> Result<Vec<LiquidityPosition>, RpcError>;
}

/// Aggregated positions across every registered protocol. A failing protocol lands in
/// `errors` and never hides the others' results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DefiPositions {
	pub lending: Vec<LendingPosition>,
	pub staked: Vec<StakedPosition>,
	pub liquidity: Vec<LiquidityPosition>,
	pub errors: Vec<(String, String)>,
}

#[derive(Default)]
pub struct DefiService {
	adapters: Vec<Arc<dyn ProtocolAdapter>>,
}

impl DefiService {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
		self.adapters.push(adapter);
	}

	pub fn protocols(&self) -> Vec<&'static str> {
		self.adapters.iter().map(|adapter| adapter.protocol_name()).collect()
	}

	pub async fn get_positions(&self, address: H160, chain: ChainId) -> DefiPositions {
		let mut positions = DefiPositions::default();

		for adapter in self.adapters.iter().filter(|adapter| adapter.supports_chain(chain)) {
			let name = adapter.protocol_name();

			match adapter.get_lending_positions(address, chain).await {
				Ok(found) => positions.lending.extend(found),
				Err(e) => positions.errors.push((name.to_string(), e.to_string())),
			}
			match adapter.get_staked_positions(address, chain).await {
				Ok(found) => positions.staked.extend(found),
				Err(e) => positions.errors.push((name.to_string(), e.to_string())),
			}
			match adapter.get_liquidity_positions(address, chain).await {
				Ok(found) => positions.liquidity.extend(found),
				Err(e) => positions.errors.push((name.to_string(), e.to_string())),
			}
		}

		positions
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct StubAdapter {
		name: &'static str,
		chains: Vec<ChainId>,
		fail: bool,
	}

	#[async_trait]
	impl ProtocolAdapter for StubAdapter {
		fn protocol_name(&self) -> &'static str {
			self.name
		}

		fn supports_chain(&self, chain: ChainId) -> bool {
			self.chains.contains(&chain)
		}

		async fn get_lending_positions(
			&self,
			_address: H160,
			chain: ChainId,
		) -> Result<Vec<LendingPosition>, RpcError> {
			if self.fail {
				return Err(RpcError::connection(chain, "down"))
			}
			Ok(vec![LendingPosition {
				protocol: self.name.to_string(),
				chain,
				asset: Asset::native(chain, "ETH", "Ethereum", 18),
				supplied: "100".to_string(),
				borrowed: "0".to_string(),
			}])
		}

		async fn get_staked_positions(
			&self,
			_address: H160,
			_chain: ChainId,
		) -> Result<Vec<StakedPosition>, RpcError> {
			Ok(vec![])
		}

		async fn get_liquidity_positions(
			&self,
			_address: H160,
			_chain: ChainId,
		) -> Result<Vec<LiquidityPosition>, RpcError> {
			Ok(vec![])
		}
	}

	#[tokio::test]
	async fn dispatches_only_to_supporting_adapters() {
		let mut service = DefiService::new();
		service.register(Arc::new(StubAdapter { name: "a", chains: vec![1], fail: false }));
		service.register(Arc::new(StubAdapter { name: "b", chains: vec![137], fail: false }));

		let positions = service.get_positions(H160::zero(), 1).await;
		assert_eq!(positions.lending.len(), 1);
		assert_eq!(positions.lending[0].protocol, "a");
		assert!(positions.errors.is_empty());
	}

	#[tokio::test]
	async fn a_failing_protocol_does_not_hide_the_others() {
		let mut service = DefiService::new();
		service.register(Arc::new(StubAdapter { name: "ok", chains: vec![1], fail: false }));
		service.register(Arc::new(StubAdapter { name: "broken", chains: vec![1], fail: true }));

		let positions = service.get_positions(H160::zero(), 1).await;
		assert_eq!(positions.lending.len(), 1);
		assert_eq!(positions.errors.len(), 1);
		assert_eq!(positions.errors[0].0, "broken");
	}
}
