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

//! Chain-scoped transports.
//!
//! Request/response traffic runs over [`EvmRpcClient`], which owns one `ethers` HTTP
//! provider per configured endpoint and fails over in priority order. `newHeads`
//! subscriptions run over [`WsSubscriptionClient`], which dials the chain's WS endpoints
//! in priority order and liveness-probes each before accepting it. At most one client of
//! each kind exists per chain; everything above shares it.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use ethers::{
	providers::{Http, Middleware, Provider, ProviderError},
	types::{
		Block, BlockId, BlockNumber, Bytes, Filter, Log, Transaction as EvmTransaction,
		TransactionRequest, H160, H256, U256,
	},
};
use utilities::SecretUrl;

use crate::{
	constants::LIVENESS_PROBE_TIMEOUT,
	errors::RpcError,
	evm::ConscientiousEvmWebsocketBlockHeaderStream,
	settings::{ChainSettings, WsConnectionSettings},
	types::ChainId,
};

/// The raw capability surface a chain transport provides. Implementations must not
/// retry beyond structural failover across their own endpoint list; semantic retry
/// belongs to the resilience stack.
#[async_trait]
pub trait ChainRpcApi: Send + Sync + Clone + 'static {
	async fn get_balance(&self, address: H160, block: Option<u64>) -> Result<U256, RpcError>;

	async fn get_block_number(&self) -> Result<u64, RpcError>;

	/// Gets a block, failing when the request fails or the node knows no such block.
	async fn get_block(&self, number: u64) -> Result<Block<H256>, RpcError>;

	async fn get_block_with_txs(
		&self,
		number: u64,
	) -> Result<Block<EvmTransaction>, RpcError>;

	async fn get_logs(&self, filter: Filter) -> Result<Vec<Log>, RpcError>;

	/// `eth_call` against `to` with pre-encoded calldata.
	async fn call(&self, to: H160, data: Bytes) -> Result<Bytes, RpcError>;

	async fn chain_id(&self) -> Result<U256, RpcError>;
}

/// HTTP request/response client with ordered endpoint failover.
#[derive(Clone)]
pub struct EvmRpcClient {
	chain: ChainId,
	chain_name: Arc<str>,
	providers: Arc<Vec<(SecretUrl, Provider<Http>)>>,
}

impl EvmRpcClient {
	pub fn new(settings: &ChainSettings, request_timeout: Duration) -> Result<Self, RpcError> {
		let http_client = reqwest::Client::builder()
			.timeout(request_timeout)
			.build()
			.map_err(|e| RpcError::connection(settings.id, e.to_string()))?;

		let mut providers = Vec::with_capacity(settings.http_endpoints.len());
		for endpoint in &settings.http_endpoints {
			let url = url::Url::parse(endpoint.as_ref()).map_err(|e| {
				RpcError::connection(settings.id, format!("invalid endpoint {endpoint}: {e}"))
			})?;
			providers.push((
				endpoint.clone(),
				Provider::new(Http::new_with_client(url, http_client.clone())),
			));
		}

		Ok(Self {
			chain: settings.id,
			chain_name: settings.name.as_str().into(),
			providers: Arc::new(providers),
		})
	}

	/// Runs `f` against each endpoint in priority order, returning the first non-error
	/// response. Per-endpoint failures are logged, not propagated, unless every endpoint
	/// fails.
	async fn with_fallback<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, RpcError>
	where
		F: Fn(Provider<Http>) -> Fut,
		Fut: Future<Output = Result<T, ProviderError>>,
	{
		let mut last_error = None;
		for (endpoint, provider) in self.providers.iter() {
			match f(provider.clone()).await {
				Ok(value) => return Ok(value),
				Err(e) => {
					tracing::warn!(
						chain = self.chain,
						endpoint = %endpoint,
						op,
						"{} endpoint failed: {e}",
						self.chain_name,
					);
					last_error = Some(RpcError::from_provider(self.chain, e));
				},
			}
		}
		Err(last_error
			.unwrap_or_else(|| RpcError::connection(self.chain, "no http endpoints configured")))
	}

	fn block_id(number: Option<u64>) -> Option<BlockId> {
		number.map(|n| BlockId::Number(BlockNumber::Number(n.into())))
	}
}

#[async_trait]
impl ChainRpcApi for EvmRpcClient {
	async fn get_balance(&self, address: H160, block: Option<u64>) -> Result<U256, RpcError> {
		self.with_fallback("get_balance", |provider| async move {
			provider.get_balance(address, Self::block_id(block)).await
		})
		.await
	}

	async fn get_block_number(&self) -> Result<u64, RpcError> {
		self.with_fallback("get_block_number", |provider| async move {
			provider.get_block_number().await
		})
		.await
		.map(|number| number.as_u64())
	}

	async fn get_block(&self, number: u64) -> Result<Block<H256>, RpcError> {
		self.with_fallback("get_block", |provider| async move {
			provider.get_block(number).await
		})
		.await?
		.ok_or_else(|| {
			RpcError::data(self.chain, format!("block {number} returned None"))
		})
	}

	async fn get_block_with_txs(
		&self,
		number: u64,
	) -> Result<Block<EvmTransaction>, RpcError> {
		self.with_fallback("get_block_with_txs", |provider| async move {
			provider.get_block_with_txs(number).await
		})
		.await?
		.ok_or_else(|| {
			RpcError::data(self.chain, format!("block {number} with txs returned None"))
		})
	}

	async fn get_logs(&self, filter: Filter) -> Result<Vec<Log>, RpcError> {
		self.with_fallback("get_logs", |provider| {
			let filter = filter.clone();
			async move { provider.get_logs(&filter).await }
		})
		.await
	}

	async fn call(&self, to: H160, data: Bytes) -> Result<Bytes, RpcError> {
		self.with_fallback("call", |provider| {
			let data = data.clone();
			async move {
				let tx = TransactionRequest::new().to(to).data(data);
				provider.call(&tx.into(), None).await
			}
		})
		.await
	}

	async fn chain_id(&self) -> Result<U256, RpcError> {
		self.with_fallback("chain_id", |provider| async move { provider.get_chainid().await })
			.await
	}
}

/// On each subscription this creates a new WS connection, walking the chain's WS
/// endpoints in priority order. Every candidate is liveness-probed with a cheap block
/// number call and verified against the expected chain id before it is accepted.
#[derive(Clone)]
pub struct WsSubscriptionClient {
	chain: ChainId,
	chain_name: String,
	ws_endpoints: Vec<SecretUrl>,
	connection_timeout: Duration,
}

impl WsSubscriptionClient {
	pub fn new(settings: &ChainSettings, ws_settings: &WsConnectionSettings) -> Self {
		Self {
			chain: settings.id,
			chain_name: settings.name.clone(),
			ws_endpoints: settings.ws_endpoints.clone(),
			connection_timeout: ws_settings.connection_timeout(),
		}
	}

	pub fn has_endpoints(&self) -> bool {
		!self.ws_endpoints.is_empty()
	}

	/// Connects and subscribes to `newHeads`, returning the stream and the endpoint it
	/// runs over.
	pub async fn subscribe_new_heads(
		&self,
	) -> Result<(ConscientiousEvmWebsocketBlockHeaderStream, SecretUrl), RpcError> {
		if self.ws_endpoints.is_empty() {
			return Err(RpcError::connection(self.chain, "no ws endpoints configured"))
		}

		let mut last_error = None;
		for endpoint in &self.ws_endpoints {
			match self.try_endpoint(endpoint).await {
				Ok(stream) => return Ok((stream, endpoint.clone())),
				Err(e) => {
					tracing::warn!(
						chain = self.chain,
						endpoint = %endpoint,
						"{} ws endpoint failed: {e:#}",
						self.chain_name,
					);
					last_error = Some(RpcError::connection(self.chain, e.to_string()));
				},
			}
		}
		Err(last_error
			.unwrap_or_else(|| RpcError::connection(self.chain, "no ws endpoint available")))
	}

	async fn try_endpoint(
		&self,
		endpoint: &SecretUrl,
	) -> anyhow::Result<ConscientiousEvmWebsocketBlockHeaderStream> {
		use anyhow::Context;

		let transport = tokio::time::timeout(
			self.connection_timeout,
			web3::transports::WebSocket::new(endpoint.as_ref()),
		)
		.await
		.context("connection timed out")??;
		let web3 = web3::Web3::new(transport);

		// Cheap liveness call, bounded by the same timeout as the dial.
		tokio::time::timeout(
			LIVENESS_PROBE_TIMEOUT.max(self.connection_timeout),
			web3.eth().block_number(),
		)
		.await
		.context("liveness probe timed out")?
		.context("liveness probe failed")?;

		let reported = tokio::time::timeout(self.connection_timeout, web3.eth().chain_id())
			.await
			.context("chain id check timed out")?
			.context("chain id check failed")?;
		if reported != web3::types::U256::from(self.chain) {
			anyhow::bail!(
				"expected chain id {}, ws endpoint returned {reported}",
				self.chain
			)
		}

		ConscientiousEvmWebsocketBlockHeaderStream::new(web3, self.chain_name.clone()).await
	}
}
