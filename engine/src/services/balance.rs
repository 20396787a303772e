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

//! Balance queries, single- and multi-chain.

use futures::future::join_all;

use crate::{
	errors::RpcError,
	evm::rpc::ChainRpcApi,
	services::{chain_context, validate_address, ChainMap},
	types::{Balance, ChainId, MultichainResult},
};

#[derive(Clone)]
pub struct BalanceService<Rpc: ChainRpcApi> {
	chains: ChainMap<Rpc>,
}

impl<Rpc: ChainRpcApi> BalanceService<Rpc> {
	pub(crate) fn new(chains: ChainMap<Rpc>) -> Self {
		Self { chains }
	}

	/// Native balance of `address` on `chain`.
	pub async fn get_balance(
		&self,
		address: &str,
		chain: ChainId,
		force_fresh: bool,
	) -> Result<Balance, RpcError> {
		let address = validate_address(address)?;
		let context = chain_context(&self.chains, chain)?;
		context.adapter.get_balance(address, force_fresh).await
	}

	/// ERC-20 balances of `address` on `chain`; `tokens` defaults to the chain's
	/// configured list.
	pub async fn get_token_balances(
		&self,
		address: &str,
		chain: ChainId,
		tokens: Option<Vec<String>>,
		force_fresh: bool,
	) -> Result<Vec<Balance>, RpcError> {
		let address = validate_address(address)?;
		let tokens = tokens
			.map(|tokens| {
				tokens.iter().map(|token| validate_address(token)).collect::<Result<Vec<_>, _>>()
			})
			.transpose()?;
		let context = chain_context(&self.chains, chain)?;
		context.adapter.get_token_balances(address, tokens, force_fresh).await
	}

	/// Fans out across `chains` in parallel and collects partial results. A failing
	/// chain contributes an error entry; it never fails the batch.
	pub async fn get_multichain_balance(
		&self,
		address: &str,
		chains: &[ChainId],
	) -> Result<MultichainResult<Balance>, RpcError> {
		let address = validate_address(address)?;

		let fetches = join_all(chains.iter().map(|&chain| async move {
			let result = match chain_context(&self.chains, chain) {
				Ok(context) => context.adapter.get_balance(address, false).await,
				Err(e) => Err(e),
			};
			(chain, result)
		}))
		.await;

		let mut result = MultichainResult::default();
		for (chain, fetch) in fetches {
			result.insert(chain, fetch);
		}
		Ok(result)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		adapter::ChainAdapter,
		errors::RpcError,
		event_bus::EventBus,
		services::ChainContext,
		settings::{ChainSettings, Settings},
		testing::ScriptedRpc,
	};
	use std::{collections::BTreeMap, sync::Arc};

	const ADDR: &str = "0x742d35cc6634c0532925a3b844bc454e4438beb0";

	fn service(chains: Vec<(ChainId, ScriptedRpc)>) -> BalanceService<ScriptedRpc> {
		let bus = EventBus::new();
		let mut map = BTreeMap::new();
		for (chain_id, rpc) in chains {
			let chain = ChainSettings {
				id: chain_id,
				name: format!("chain-{chain_id}"),
				native_symbol: "ETH".to_string(),
				native_decimals: 18,
				http_endpoints: vec!["http://localhost:8545".into()],
				ws_endpoints: vec![],
				tokens: vec![],
			};
			let settings = Settings { chains: vec![chain.clone()], ..Default::default() };
			let adapter =
				Arc::new(ChainAdapter::new(&settings, &chain, rpc, bus.clone()));
			let manager = Arc::new(crate::connection::ConnectionManager::new(
				&chain,
				&settings.ws_connection,
				bus.clone(),
			));
			map.insert(chain_id, ChainContext { settings: chain, adapter, manager });
		}
		BalanceService::new(Arc::new(map))
	}

	#[tokio::test]
	async fn rejects_invalid_address_without_touching_the_adapter() {
		let service = service(vec![(1, ScriptedRpc::healthy(5))]);
		assert!(matches!(
			service.get_balance("nonsense", 1, false).await,
			Err(RpcError::Validation { .. })
		));
	}

	#[tokio::test]
	async fn unknown_chain_is_a_configuration_error() {
		let service = service(vec![(1, ScriptedRpc::healthy(5))]);
		assert!(matches!(
			service.get_balance(ADDR, 999, false).await,
			Err(RpcError::ChainUnsupported(999))
		));
	}

	#[tokio::test]
	async fn multichain_partial_failure_keeps_the_batch() {
		let service =
			service(vec![(1, ScriptedRpc::healthy(5)), (137, ScriptedRpc::failing(137))]);

		let result = service.get_multichain_balance(ADDR, &[1, 137]).await.unwrap();

		assert_eq!(result.successes.keys().copied().collect::<Vec<_>>(), vec![1]);
		assert_eq!(result.errors.keys().copied().collect::<Vec<_>>(), vec![137]);
		assert!(matches!(result.errors[&137], RpcError::Connection { chain: 137, .. }));
	}

	#[tokio::test]
	async fn multichain_with_unknown_chain_reports_it_per_chain() {
		let service = service(vec![(1, ScriptedRpc::healthy(5))]);

		let result = service.get_multichain_balance(ADDR, &[1, 42]).await.unwrap();
		assert!(result.successes.contains_key(&1));
		assert_eq!(result.errors[&42], RpcError::ChainUnsupported(42));
	}
}
