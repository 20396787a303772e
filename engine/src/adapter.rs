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

//! The uniform per-chain capability surface.
//!
//! Primitive operations (one JSON-RPC round trip) run through the full resilience
//! stack. Compound operations (token balances, transaction scans) add a coalesce+cache
//! layer of their own on top, while each inner round trip they issue remains fully
//! wrapped; wrapping the compound whole in limiter/breaker as well would double-count
//! admissions. Nothing here reaches a raw transport except through [`ResilienceStack`].

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use ethers::{
	abi::Token as AbiToken,
	types::{Bytes, Filter, Log, ValueOrArray, H160, H256, U256},
};
use futures::future::join_all;
use itertools::Itertools;

use crate::{
	constants::{HEALTH_PROBE_TIMEOUT, RECENT_BLOCK_WINDOW},
	errors::RpcError,
	event_bus::EventBus,
	evm::{erc20_abi, rpc::ChainRpcApi, transfer_topic},
	resilience::{Batcher, Coalescer, Joined, ResilienceStack, StackStats, TtlCache},
	settings::{ChainSettings, Settings},
	types::{
		Asset, AssetAmount, Balance, BlockInfo, ChainId, ChainInfo, Transaction,
		TransactionQuery, TransactionStatus, TransactionType, TransferEvent,
	},
};

/// On-chain metadata reads are near-immutable; cache them for an hour.
const TOKEN_METADATA_TTL: Duration = Duration::from_secs(60 * 60);

/// Native-transfer scans walk full blocks, so bound them harder than log scans.
const NATIVE_SCAN_BLOCKS: u64 = 32;

pub struct ChainAdapter<Rpc: ChainRpcApi> {
	chain_settings: ChainSettings,
	environment: String,
	rpc: Rpc,
	stack: Arc<ResilienceStack>,

	native_balance_cache: Option<TtlCache<Balance>>,
	token_balances_cache: Option<TtlCache<Vec<Balance>>>,
	transactions_cache: Option<TtlCache<Vec<Transaction>>>,
	token_metadata_cache: TtlCache<Asset>,

	native_coalescer: Coalescer<Balance>,
	token_coalescer: Coalescer<Vec<Balance>>,
	tx_coalescer: Coalescer<Vec<Transaction>>,
	read_coalescer: Coalescer<Bytes>,
	metadata_coalescer: Coalescer<Asset>,

	balance_batcher: Option<Batcher<(H160, Option<u64>), U256>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AdapterStats {
	pub cache_hits: u64,
	pub cache_misses: u64,
	pub coalesced_requests: u64,
	pub stack: StackStats,
}

impl<Rpc: ChainRpcApi> ChainAdapter<Rpc> {
	pub fn new(settings: &Settings, chain: &ChainSettings, rpc: Rpc, bus: EventBus) -> Self {
		let balance = &settings.balance_service;
		let transactions = &settings.transaction_service;
		let capacity = settings.cache.capacity;

		let stack = Arc::new(ResilienceStack::new(chain.id, settings, bus));

		let balance_batcher = balance.enable_batching.then(|| {
			let rpc = rpc.clone();
			Batcher::new(
				Duration::from_millis(balance.batch_window_ms),
				balance.max_batch_size,
				Arc::new(move |keys: Vec<(H160, Option<u64>)>| {
					let rpc = rpc.clone();
					Box::pin(async move {
						join_all(keys.into_iter().map(|(address, block)| {
							let rpc = rpc.clone();
							async move { rpc.get_balance(address, block).await }
						}))
						.await
					}) as _
				}),
			)
		});

		Self {
			chain_settings: chain.clone(),
			environment: settings.cache.environment.clone(),
			rpc,
			stack,
			native_balance_cache: balance.enable_cache.then(|| {
				TtlCache::new(Duration::from_secs(balance.cache_ttl_secs), capacity)
			}),
			token_balances_cache: balance.enable_cache.then(|| {
				TtlCache::new(Duration::from_secs(balance.cache_ttl_secs), capacity)
			}),
			transactions_cache: transactions.enable_cache.then(|| {
				TtlCache::new(Duration::from_secs(transactions.cache_ttl_secs), capacity)
			}),
			token_metadata_cache: TtlCache::new(TOKEN_METADATA_TTL, capacity),
			native_coalescer: Coalescer::new(),
			token_coalescer: Coalescer::new(),
			tx_coalescer: Coalescer::new(),
			read_coalescer: Coalescer::new(),
			metadata_coalescer: Coalescer::new(),
			balance_batcher,
		}
	}

	pub fn chain(&self) -> ChainId {
		self.chain_settings.id
	}

	pub fn get_chain_info(&self) -> ChainInfo {
		ChainInfo {
			chain_id: self.chain_settings.id,
			name: self.chain_settings.name.clone(),
			native_symbol: self.chain_settings.native_symbol.clone(),
			native_decimals: self.chain_settings.native_decimals,
		}
	}

	pub fn native_asset(&self) -> Asset {
		Asset::native(
			self.chain_settings.id,
			&self.chain_settings.native_symbol,
			&self.chain_settings.name,
			self.chain_settings.native_decimals,
		)
	}

	fn key(&self, op: &str, args: &[&str]) -> String {
		ResilienceStack::cache_key(&self.environment, self.chain_settings.id, op, args)
	}

	/// Timeout-bounded liveness probe, admission-checked like any other call.
	pub async fn is_healthy(&self) -> bool {
		let rpc = self.rpc.clone();
		self.stack
			.probe(HEALTH_PROBE_TIMEOUT, move || {
				let rpc = rpc.clone();
				async move { rpc.get_block_number().await }
			})
			.await
			.is_ok()
	}

	/// The native balance of `address` at the chain head.
	pub async fn get_balance(
		&self,
		address: H160,
		force_fresh: bool,
	) -> Result<Balance, RpcError> {
		let key = self.key("get_balance", &[&format!("{address:#x}")]);
		let asset = self.native_asset();
		self.stack
			.execute(
				self.native_balance_cache.as_ref(),
				&self.native_coalescer,
				&key,
				force_fresh,
				|| {
					let asset = asset.clone();
					async move {
						Ok(Balance::new(asset, self.raw_native_balance(address, None).await?))
					}
				},
			)
			.await
	}

	/// The native balance pinned to a specific block, for subscription refreshes.
	/// Never cached (each block is new), but coalesced so concurrent watchers of the
	/// same address share one call.
	pub async fn get_balance_at(
		&self,
		address: H160,
		block: u64,
	) -> Result<Balance, RpcError> {
		let key =
			self.key("get_balance_at", &[&format!("{address:#x}"), &block.to_string()]);
		let asset = self.native_asset();
		self.stack
			.execute(None, &self.native_coalescer, &key, false, || {
				let asset = asset.clone();
				async move {
					Ok(Balance::new(
						asset,
						self.raw_native_balance(address, Some(block)).await?,
					))
				}
			})
			.await
	}

	async fn raw_native_balance(
		&self,
		address: H160,
		block: Option<u64>,
	) -> Result<U256, RpcError> {
		match &self.balance_batcher {
			Some(batcher) => batcher.submit((address, block)).await,
			None => self.rpc.get_balance(address, block).await,
		}
	}

	/// ERC-20 balances for `address`. `tokens` defaults to the chain's configured
	/// token list. Tokens whose metadata or balance cannot be read are skipped with a
	/// warning rather than failing the whole query.
	pub async fn get_token_balances(
		&self,
		address: H160,
		tokens: Option<Vec<H160>>,
		force_fresh: bool,
	) -> Result<Vec<Balance>, RpcError> {
		let tokens = match tokens {
			Some(tokens) => tokens,
			None => self.configured_tokens()?,
		};
		if tokens.is_empty() {
			return Ok(vec![])
		}

		let token_list = tokens.iter().map(|token| format!("{token:#x}")).sorted().join(",");
		let key = self.key("get_token_balances", &[&format!("{address:#x}"), &token_list]);

		self.coalesced_cached(
			self.token_balances_cache.as_ref(),
			&self.token_coalescer,
			&key,
			force_fresh,
			|| async {
				let results = join_all(tokens.iter().map(|&token| async move {
					let asset = self.token_metadata(token).await?;
					let amount = self.erc20_balance_of(token, address).await?;
					Ok::<_, RpcError>(Balance::new(asset, amount))
				}))
				.await;

				let mut balances = Vec::with_capacity(tokens.len());
				for (token, result) in tokens.iter().zip(results) {
					match result {
						Ok(balance) => balances.push(balance),
						Err(e) => tracing::warn!(
							chain = self.chain_settings.id,
							token = %format!("{token:#x}"),
							"skipping token balance: {e}"
						),
					}
				}
				Ok(balances)
			},
		)
		.await
	}

	/// Transactions involving `address` over a bounded recent block window: ERC-20
	/// Transfer logs plus a native-transfer scan of the most recent blocks. This is a
	/// recent-activity view, not a historical index.
	pub async fn get_transactions(
		&self,
		address: H160,
		query: TransactionQuery,
		limit: usize,
		force_fresh: bool,
	) -> Result<Vec<Transaction>, RpcError> {
		let key = self.key(
			"get_transactions",
			&[
				&format!("{address:#x}"),
				&limit.to_string(),
				&query.from_block.map(|b| b.to_string()).unwrap_or_default(),
				&query.to_block.map(|b| b.to_string()).unwrap_or_default(),
			],
		);

		self.coalesced_cached(
			self.transactions_cache.as_ref(),
			&self.tx_coalescer,
			&key,
			force_fresh,
			|| async {
				let latest = self.get_block_number().await?;
				let to_block = query.to_block.map_or(latest, |b| b.min(latest));
				let from_block = query
					.from_block
					.unwrap_or_else(|| to_block.saturating_sub(RECENT_BLOCK_WINDOW))
					.min(to_block);

				let mut transactions =
					self.erc20_transfer_transactions(address, from_block, to_block).await?;
				transactions.extend(
					self.native_transfer_transactions(address, from_block, to_block)
						.await?,
				);

				transactions.sort_by(|a, b| {
					b.block_number
						.cmp(&a.block_number)
						.then_with(|| a.hash.cmp(&b.hash))
				});
				transactions.truncate(limit);
				Ok(transactions)
			},
		)
		.await
	}

	/// Decoded calldata round trip: encode `function(args)` against `abi`, `eth_call`
	/// it, decode the output tokens.
	pub async fn read_contract(
		&self,
		contract: H160,
		abi: &ethers::abi::Abi,
		function: &str,
		args: &[AbiToken],
	) -> Result<Vec<AbiToken>, RpcError> {
		let function = abi.function(function).map_err(|e| RpcError::Validation {
			field: "function".to_string(),
			expected: "a function present in the supplied ABI".to_string(),
			received: format!("{function} ({e})"),
		})?;
		let data = function.encode_input(args).map_err(|e| RpcError::Validation {
			field: "args".to_string(),
			expected: format!("arguments matching {}", function.signature()),
			received: e.to_string(),
		})?;

		let key = self.key(
			"read_contract",
			&[&format!("{contract:#x}"), &function.signature(), &hex::encode(&data)],
		);
		let raw = self
			.stack
			.execute(None, &self.read_coalescer, &key, false, || {
				let rpc = self.rpc.clone();
				let data = data.clone();
				async move { rpc.call(contract, data.into()).await }
			})
			.await?;

		let decoded = function.decode_output(raw.as_ref()).map_err(|e| {
			RpcError::data(
				self.chain_settings.id,
				format!("undecodable {} output: {e}", function.signature()),
			)
		})?;
		Ok(decoded)
	}

	pub async fn get_block_number(&self) -> Result<u64, RpcError> {
		self.stack
			.call(|| {
				let rpc = self.rpc.clone();
				async move { rpc.get_block_number().await }
			})
			.await
	}

	pub async fn get_block_info(&self, number: u64) -> Result<BlockInfo, RpcError> {
		let block = self
			.stack
			.call(|| {
				let rpc = self.rpc.clone();
				async move { rpc.get_block(number).await }
			})
			.await?;

		Ok(BlockInfo {
			number,
			hash: block.hash.unwrap_or_default(),
			parent_hash: block.parent_hash,
			timestamp: block.timestamp.as_u64(),
			gas_used: block.gas_used,
			gas_limit: block.gas_limit,
			base_fee_per_gas: block.base_fee_per_gas,
			transaction_count: block.transactions.len(),
		})
	}

	/// All ERC-20 Transfer logs of one block, decoded and ordered by log index. One
	/// `eth_getLogs` round trip regardless of how many addresses are tracked.
	pub async fn transfer_logs_for_block(
		&self,
		block: u64,
	) -> Result<Vec<TransferEvent>, RpcError> {
		let filter = transfer_filter(block, block, None, None);
		let logs = self
			.stack
			.call(|| {
				let rpc = self.rpc.clone();
				let filter = filter.clone();
				async move { rpc.get_logs(filter).await }
			})
			.await?;

		let mut transfers: Vec<_> =
			logs.iter().filter_map(|log| self.decode_transfer(log)).collect();
		transfers.sort_by_key(|transfer| transfer.log_index);
		Ok(transfers)
	}

	fn decode_transfer(&self, log: &Log) -> Option<TransferEvent> {
		if log.topics.len() != 3 ||
			log.topics[0] != transfer_topic() ||
			log.data.len() != 32
		{
			return None
		}
		Some(TransferEvent {
			chain: self.chain_settings.id,
			token: log.address,
			from: H160::from(log.topics[1]),
			to: H160::from(log.topics[2]),
			amount: U256::from_big_endian(&log.data).to_string(),
			block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
			log_index: log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
			tx_hash: log.transaction_hash.unwrap_or_default(),
		})
	}

	/// Token identity, preferring the configured token list over an on-chain read.
	pub async fn token_metadata(&self, token: H160) -> Result<Asset, RpcError> {
		if let Some(configured) = self
			.chain_settings
			.tokens
			.iter()
			.find(|t| t.address.eq_ignore_ascii_case(&format!("{token:#x}")))
		{
			return Ok(Asset::erc20(
				self.chain_settings.id,
				token,
				&configured.symbol,
				&configured.name,
				configured.decimals,
			))
		}

		let key = self.key("token_metadata", &[&format!("{token:#x}")]);
		self.coalesced_cached(
			Some(&self.token_metadata_cache),
			&self.metadata_coalescer,
			&key,
			false,
			|| async {
				let abi = erc20_abi();
				let symbol = self.read_string(token, abi, "symbol").await?;
				let name = self.read_string(token, abi, "name").await?;
				let decimals =
					match self.read_contract(token, abi, "decimals", &[]).await?.first() {
						Some(AbiToken::Uint(value)) => value.as_u64().min(255) as u8,
						_ =>
							return Err(RpcError::data(
								self.chain_settings.id,
								format!("token {token:#x} returned no decimals"),
							)),
					};
				Ok(Asset::erc20(self.chain_settings.id, token, &symbol, &name, decimals))
			},
		)
		.await
	}

	async fn read_string(
		&self,
		contract: H160,
		abi: &ethers::abi::Abi,
		function: &str,
	) -> Result<String, RpcError> {
		match self.read_contract(contract, abi, function, &[]).await?.first() {
			Some(AbiToken::String(value)) => Ok(value.clone()),
			other => Err(RpcError::data(
				self.chain_settings.id,
				format!("{function}() on {contract:#x} returned {other:?}"),
			)),
		}
	}

	async fn erc20_balance_of(&self, token: H160, owner: H160) -> Result<U256, RpcError> {
		match self
			.read_contract(token, erc20_abi(), "balanceOf", &[AbiToken::Address(owner)])
			.await?
			.first()
		{
			Some(AbiToken::Uint(value)) => Ok(*value),
			other => Err(RpcError::data(
				self.chain_settings.id,
				format!("balanceOf on {token:#x} returned {other:?}"),
			)),
		}
	}

	/// Block timestamps for the given block numbers, one wrapped fetch per unique
	/// block.
	async fn block_timestamps(
		&self,
		blocks: impl IntoIterator<Item = u64>,
	) -> BTreeMap<u64, DateTime<Utc>> {
		let unique: Vec<u64> = blocks.into_iter().unique().collect();
		let mut timestamps = BTreeMap::new();
		for number in unique {
			match self.get_block_info(number).await {
				Ok(info) =>
					if let Some(at) = DateTime::from_timestamp(info.timestamp as i64, 0) {
						timestamps.insert(number, at);
					},
				Err(e) => tracing::warn!(
					chain = self.chain_settings.id,
					block = number,
					"could not fetch block timestamp: {e}"
				),
			}
		}
		timestamps
	}

	async fn erc20_transfer_transactions(
		&self,
		address: H160,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<Transaction>, RpcError> {
		let address_topic = H256::from(address);
		let outbound = transfer_filter(from_block, to_block, Some(address_topic), None);
		let inbound = transfer_filter(from_block, to_block, None, Some(address_topic));

		let mut transfers = Vec::new();
		for (filter, direction) in
			[(outbound, TransactionType::TransferOut), (inbound, TransactionType::TransferIn)]
		{
			let logs = self
				.stack
				.call(|| {
					let rpc = self.rpc.clone();
					let filter = filter.clone();
					async move { rpc.get_logs(filter).await }
				})
				.await?;
			transfers.extend(
				logs.iter()
					.filter_map(|log| self.decode_transfer(log))
					.map(|transfer| (transfer, direction)),
			);
		}

		let timestamps = self
			.block_timestamps(transfers.iter().map(|(transfer, _)| transfer.block_number))
			.await;

		let mut transactions = Vec::with_capacity(transfers.len());
		for (transfer, direction) in transfers {
			let asset = match self.token_metadata(transfer.token).await {
				Ok(asset) => asset,
				Err(e) => {
					tracing::warn!(
						chain = self.chain_settings.id,
						token = %format!("{:#x}", transfer.token),
						"using placeholder metadata: {e}"
					);
					Asset::erc20(self.chain_settings.id, transfer.token, "UNKNOWN", "Unknown", 18)
				},
			};
			let amount = AssetAmount { asset, amount: transfer.amount.clone() };
			let (assets_in, assets_out) = match direction {
				TransactionType::TransferIn => (vec![amount], vec![]),
				_ => (vec![], vec![amount]),
			};
			transactions.push(Transaction {
				id: format!(
					"{}:{:#x}:{}",
					self.chain_settings.id, transfer.tx_hash, transfer.log_index
				),
				account_id: None,
				tx_type: direction,
				status: TransactionStatus::Completed,
				hash: transfer.tx_hash,
				chain: self.chain_settings.id,
				from: transfer.from,
				to: Some(transfer.to),
				timestamp: timestamps
					.get(&transfer.block_number)
					.copied()
					.unwrap_or_else(Utc::now),
				block_number: Some(transfer.block_number),
				assets_in,
				assets_out,
				fees: None,
			});
		}
		Ok(transactions)
	}

	async fn native_transfer_transactions(
		&self,
		address: H160,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<Transaction>, RpcError> {
		let native = self.native_asset();
		let scan_from = to_block.saturating_sub(NATIVE_SCAN_BLOCKS.min(to_block - from_block));

		let mut transactions = Vec::new();
		for number in scan_from..=to_block {
			let block = self
				.stack
				.call(|| {
					let rpc = self.rpc.clone();
					async move { rpc.get_block_with_txs(number).await }
				})
				.await?;

			let block_time = DateTime::from_timestamp(block.timestamp.as_u64() as i64, 0)
				.unwrap_or_else(Utc::now);

			for tx in &block.transactions {
				let incoming = tx.to == Some(address);
				let outgoing = tx.from == address;
				if tx.value.is_zero() || (!incoming && !outgoing) {
					continue
				}
				let amount =
					AssetAmount { asset: native.clone(), amount: tx.value.to_string() };
				transactions.push(Transaction {
					id: format!("{}:{:#x}", self.chain_settings.id, tx.hash),
					account_id: None,
					tx_type: if incoming {
						TransactionType::TransferIn
					} else {
						TransactionType::TransferOut
					},
					status: TransactionStatus::Completed,
					hash: tx.hash,
					chain: self.chain_settings.id,
					from: tx.from,
					to: tx.to,
					timestamp: block_time,
					block_number: Some(number),
					assets_in: if incoming { vec![amount.clone()] } else { vec![] },
					assets_out: if incoming { vec![] } else { vec![amount] },
					fees: None,
				});
			}
		}
		Ok(transactions)
	}

	fn configured_tokens(&self) -> Result<Vec<H160>, RpcError> {
		self.chain_settings
			.tokens
			.iter()
			.map(|token| {
				token.address.parse::<H160>().map_err(|_| RpcError::Validation {
					field: "tokens".to_string(),
					expected: "a 0x-prefixed 20-byte hex address".to_string(),
					received: token.address.clone(),
				})
			})
			.collect()
	}

	/// Coalesce + cache for compound operations whose inner round trips are already
	/// fully wrapped.
	async fn coalesced_cached<V, F, Fut>(
		&self,
		cache: Option<&TtlCache<V>>,
		coalescer: &Coalescer<V>,
		key: &str,
		force_fresh: bool,
		f: F,
	) -> Result<V, RpcError>
	where
		V: Clone + Send + 'static,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<V, RpcError>>,
	{
		if force_fresh {
			if let Some(cache) = cache {
				cache.note_miss();
			}
			return f().await
		}
		match coalescer.join(key) {
			Joined::Waiter(receiver) => Coalescer::await_leader(receiver).await,
			Joined::Leader(guard) => {
				if let Some(cache) = cache {
					if let Some(value) = cache.get(key) {
						guard.complete(Ok(value.clone()));
						return Ok(value)
					}
				}
				let result = f().await;
				if let (Some(cache), Ok(value)) = (cache, &result) {
					cache.insert(key.to_string(), value.clone());
				}
				guard.complete(result.clone());
				result
			},
		}
	}

	pub fn stats(&self) -> AdapterStats {
		let mut stats = AdapterStats { stack: self.stack.stats(), ..Default::default() };
		for cache_stats in [
			self.native_balance_cache.as_ref().map(|c| c.stats()),
			self.token_balances_cache.as_ref().map(|c| c.stats()),
			self.transactions_cache.as_ref().map(|c| c.stats()),
			Some(self.token_metadata_cache.stats()),
		]
		.into_iter()
		.flatten()
		{
			stats.cache_hits += cache_stats.hits;
			stats.cache_misses += cache_stats.misses;
		}
		for (_, coalesced) in [
			self.native_coalescer.stats(),
			self.token_coalescer.stats(),
			self.tx_coalescer.stats(),
			self.read_coalescer.stats(),
			self.metadata_coalescer.stats(),
		] {
			stats.coalesced_requests += coalesced;
		}
		stats
	}

	pub fn breaker_state(&self) -> crate::resilience::CircuitState {
		self.stack.breaker_state()
	}
}

/// Builds an ERC-20 Transfer filter over an inclusive block range. `from`/`to` topics
/// restrict by sender/recipient.
fn transfer_filter(
	from_block: u64,
	to_block: u64,
	from_topic: Option<H256>,
	to_topic: Option<H256>,
) -> Filter {
	let mut filter = Filter::new().from_block(from_block).to_block(to_block);
	filter.topics = [
		Some(ValueOrArray::Value(Some(transfer_topic()))),
		from_topic.map(|topic| ValueOrArray::Value(Some(topic))),
		to_topic.map(|topic| ValueOrArray::Value(Some(topic))),
		None,
	];
	filter
}
