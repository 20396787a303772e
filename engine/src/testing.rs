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

//! Scripted transport fake shared by service-level tests. For expectation-style
//! verification of a single call, prefer the mockall mock in `evm::rpc::mocks`.

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

use async_trait::async_trait;
use ethers::types::{
	Block, Bytes, Filter, Log, Transaction as EvmTransaction, H160, H256, U256,
};

use crate::{errors::RpcError, evm::rpc::ChainRpcApi, types::ChainId};

struct ScriptedInner {
	chain: ChainId,
	head: u64,
	fail: bool,
	balance_calls: AtomicU64,
	log_queries: AtomicU64,
}

/// A transport whose behaviour is fixed at construction: either every call succeeds
/// with deterministic data, or every call fails with a retriable connection error.
#[derive(Clone)]
pub(crate) struct ScriptedRpc {
	inner: Arc<ScriptedInner>,
}

impl ScriptedRpc {
	pub fn healthy(head: u64) -> Self {
		Self {
			inner: Arc::new(ScriptedInner {
				chain: 0,
				head,
				fail: false,
				balance_calls: AtomicU64::new(0),
				log_queries: AtomicU64::new(0),
			}),
		}
	}

	pub fn failing(chain: ChainId) -> Self {
		Self {
			inner: Arc::new(ScriptedInner {
				chain,
				head: 0,
				fail: true,
				balance_calls: AtomicU64::new(0),
				log_queries: AtomicU64::new(0),
			}),
		}
	}

	pub fn balance_calls(&self) -> u64 {
		self.inner.balance_calls.load(Ordering::SeqCst)
	}

	pub fn log_queries(&self) -> u64 {
		self.inner.log_queries.load(Ordering::SeqCst)
	}

	fn check(&self) -> Result<(), RpcError> {
		if self.inner.fail {
			Err(RpcError::connection(self.inner.chain, "scripted failure"))
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl ChainRpcApi for ScriptedRpc {
	async fn get_balance(
		&self,
		_address: H160,
		_block: Option<u64>,
	) -> Result<U256, RpcError> {
		self.check()?;
		self.inner.balance_calls.fetch_add(1, Ordering::SeqCst);
		Ok(U256::exp10(18))
	}

	async fn get_block_number(&self) -> Result<u64, RpcError> {
		self.check()?;
		Ok(self.inner.head)
	}

	async fn get_block(&self, number: u64) -> Result<Block<H256>, RpcError> {
		self.check()?;
		Ok(Block {
			number: Some(number.into()),
			timestamp: U256::from(1_700_000_000u64 + number),
			..Default::default()
		})
	}

	async fn get_block_with_txs(
		&self,
		number: u64,
	) -> Result<Block<EvmTransaction>, RpcError> {
		self.check()?;
		Ok(Block { number: Some(number.into()), ..Default::default() })
	}

	async fn get_logs(&self, _filter: Filter) -> Result<Vec<Log>, RpcError> {
		self.check()?;
		self.inner.log_queries.fetch_add(1, Ordering::SeqCst);
		Ok(vec![])
	}

	async fn call(&self, _to: H160, _data: Bytes) -> Result<Bytes, RpcError> {
		self.check()?;
		Ok(Bytes::new())
	}

	async fn chain_id(&self) -> Result<U256, RpcError> {
		self.check()?;
		Ok(U256::one())
	}
}
