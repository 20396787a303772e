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

//! Transaction queries over the recent-block window.

use futures::future::join_all;

use crate::{
	errors::RpcError,
	evm::rpc::ChainRpcApi,
	services::{chain_context, validate_address, ChainMap},
	settings::TransactionServiceSettings,
	types::{ChainId, MultichainResult, Transaction, TransactionQuery},
};

#[derive(Clone)]
pub struct TransactionService<Rpc: ChainRpcApi> {
	chains: ChainMap<Rpc>,
	settings: TransactionServiceSettings,
}

impl<Rpc: ChainRpcApi> TransactionService<Rpc> {
	pub(crate) fn new(chains: ChainMap<Rpc>, settings: TransactionServiceSettings) -> Self {
		Self { chains, settings }
	}

	fn resolve_limit(&self, query: &TransactionQuery) -> Result<usize, RpcError> {
		let limit = query.limit.unwrap_or(self.settings.default_page_size);
		if limit == 0 || limit > self.settings.max_transactions {
			return Err(RpcError::Validation {
				field: "limit".to_string(),
				expected: format!("1..={}", self.settings.max_transactions),
				received: limit.to_string(),
			})
		}
		if let (Some(from), Some(to)) = (query.from_block, query.to_block) {
			if from > to {
				return Err(RpcError::Validation {
					field: "from_block".to_string(),
					expected: format!("<= to_block ({to})"),
					received: from.to_string(),
				})
			}
		}
		Ok(limit)
	}

	/// Recent transactions involving `address` on `chain`.
	pub async fn get_transactions(
		&self,
		address: &str,
		chain: ChainId,
		query: TransactionQuery,
		force_fresh: bool,
	) -> Result<Vec<Transaction>, RpcError> {
		let parsed = validate_address(address)?;
		let limit = self.resolve_limit(&query)?;
		let context = chain_context(&self.chains, chain)?;
		context.adapter.get_transactions(parsed, query, limit, force_fresh).await
	}

	/// Parallel fan-out across chains; per-chain failures never fail the batch.
	pub async fn get_multichain_transactions(
		&self,
		address: &str,
		chains: &[ChainId],
		query: TransactionQuery,
	) -> Result<MultichainResult<Vec<Transaction>>, RpcError> {
		let parsed = validate_address(address)?;
		let limit = self.resolve_limit(&query)?;

		let fetches = join_all(chains.iter().map(|&chain| async move {
			let result = match chain_context(&self.chains, chain) {
				Ok(context) =>
					context.adapter.get_transactions(parsed, query, limit, false).await,
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
