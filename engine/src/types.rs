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

//! The normalized domain schema handed to consumers. Raw RPC shapes never escape the
//! adapter layer; everything below is stable across chains.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use ethers::types::{H160, H256, U256};
use serde::{Deserialize, Serialize};

use crate::errors::RpcError;

pub type ChainId = u64;

/// The chains the schema knows by name. Anything else is reported as `Other`, carrying
/// its numeric id alongside in [`Asset::id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetChain {
	Ethereum,
	Polygon,
	Arbitrum,
	Optimism,
	Base,
	BinanceSmartChain,
	Avalanche,
	Other,
}

impl AssetChain {
	pub fn from_chain_id(chain_id: ChainId) -> Self {
		match chain_id {
			1 => AssetChain::Ethereum,
			10 => AssetChain::Optimism,
			56 => AssetChain::BinanceSmartChain,
			137 => AssetChain::Polygon,
			8453 => AssetChain::Base,
			42161 => AssetChain::Arbitrum,
			43114 => AssetChain::Avalanche,
			_ => AssetChain::Other,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
	/// Deterministic id, e.g. `eth:1:native` or `erc20:1:0xa0b8…eb48`.
	pub id: String,
	pub symbol: String,
	pub name: String,
	pub decimals: u8,
	pub chain: AssetChain,
	/// `None` for the native asset.
	pub contract: Option<H160>,
}

impl Asset {
	pub fn native(chain_id: ChainId, symbol: &str, name: &str, decimals: u8) -> Self {
		Self {
			id: format!("eth:{chain_id}:native"),
			symbol: symbol.to_string(),
			name: name.to_string(),
			decimals,
			chain: AssetChain::from_chain_id(chain_id),
			contract: None,
		}
	}

	pub fn erc20(
		chain_id: ChainId,
		contract: H160,
		symbol: &str,
		name: &str,
		decimals: u8,
	) -> Self {
		Self {
			id: format!("erc20:{chain_id}:{contract:#x}"),
			symbol: symbol.to_string(),
			name: name.to_string(),
			decimals,
			chain: AssetChain::from_chain_id(chain_id),
			contract: Some(contract),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiatValue {
	pub amount: String,
	pub currency: String,
	pub timestamp: DateTime<Utc>,
}

/// A balance in base units.
///
/// `amount` is always a base-10 decimal string so the full 256-bit precision survives
/// serialization to any consumer language. It must never be reinterpreted as a binary
/// integer without explicit conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
	pub asset_id: String,
	pub asset: Asset,
	pub amount: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub value: Option<FiatValue>,
}

impl Balance {
	pub fn new(asset: Asset, amount: U256) -> Self {
		Self { asset_id: asset.id.clone(), asset, amount: amount.to_string(), value: None }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
	TransferIn,
	TransferOut,
	Swap,
	ContractInteraction,
	Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
	Pending,
	Completed,
	Failed,
	Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetAmount {
	pub asset: Asset,
	pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
	pub id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub account_id: Option<String>,
	#[serde(rename = "type")]
	pub tx_type: TransactionType,
	pub status: TransactionStatus,
	pub hash: H256,
	pub chain: ChainId,
	pub from: H160,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub to: Option<H160>,
	pub timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub block_number: Option<u64>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub assets_in: Vec<AssetAmount>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub assets_out: Vec<AssetAmount>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub fees: Option<AssetAmount>,
}

/// Query bounds for `get_transactions`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionQuery {
	pub limit: Option<usize>,
	pub from_block: Option<u64>,
	pub to_block: Option<u64>,
}

/// Static per-chain facts, served without touching the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainInfo {
	pub chain_id: ChainId,
	pub name: String,
	pub native_symbol: String,
	pub native_decimals: u8,
}

/// Block metadata as observed by the subscription engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
	pub number: u64,
	pub hash: H256,
	pub parent_hash: H256,
	pub timestamp: u64,
	pub gas_used: U256,
	pub gas_limit: U256,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub base_fee_per_gas: Option<U256>,
	pub transaction_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
	Ws,
	Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
	Disconnected,
	Connecting,
	ConnectedWs,
	ConnectedHttp,
	Reconnecting,
	Failed,
}

/// Per-chain connection report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
	pub status: ConnectionStatus,
	pub transport: Option<TransportKind>,
	/// Redacted endpoint currently in use.
	pub url: Option<String>,
	pub connected_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub reconnect_attempts: u32,
	pub subscription_count: usize,
}

impl Default for ConnectionInfo {
	fn default() -> Self {
		Self {
			status: ConnectionStatus::Disconnected,
			transport: None,
			url: None,
			connected_at: None,
			last_error: None,
			reconnect_attempts: 0,
			subscription_count: 0,
		}
	}
}

/// A live native-balance refresh for one tracked address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceUpdate {
	pub chain: ChainId,
	pub address: H160,
	pub balance: Balance,
	pub block_number: u64,
	pub timestamp: DateTime<Utc>,
}

/// A decoded ERC-20 Transfer touching a tracked address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferEvent {
	pub chain: ChainId,
	pub token: H160,
	pub from: H160,
	pub to: H160,
	pub amount: String,
	pub block_number: u64,
	pub log_index: u64,
	pub tx_hash: H256,
}

/// Caller-supplied query for the account attribution layer. `account_id` is opaque to
/// the engine and flows back out unchanged on every result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRequest {
	pub account_id: String,
	pub address: String,
	pub chain_scope: BTreeSet<ChainId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountError {
	pub account_id: String,
	pub address: String,
	pub chain_id: ChainId,
	pub error: String,
	pub code: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalance {
	pub account_id: String,
	pub address: String,
	pub chain_id: ChainId,
	pub balance: Balance,
}

/// A live balance update enriched with the caller's account id, as delivered by
/// account-level subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalanceUpdate {
	pub account_id: String,
	pub address: String,
	pub chain_id: ChainId,
	pub balance: Balance,
	pub block_number: u64,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalanceList {
	pub balances: Vec<AccountBalance>,
	pub errors: Vec<AccountError>,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountTransactions {
	pub account_id: String,
	pub address: String,
	pub chain_id: ChainId,
	pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountTransactionList {
	pub transactions: Vec<AccountTransactions>,
	pub errors: Vec<AccountError>,
	pub timestamp: DateTime<Utc>,
}

/// Result of a multi-chain fan-out. A per-chain failure lands in `errors` without
/// failing the batch.
#[derive(Debug, Clone)]
pub struct MultichainResult<T> {
	pub successes: BTreeMap<ChainId, T>,
	pub errors: BTreeMap<ChainId, RpcError>,
}

impl<T> Default for MultichainResult<T> {
	fn default() -> Self {
		Self { successes: BTreeMap::new(), errors: BTreeMap::new() }
	}
}

impl<T> MultichainResult<T> {
	pub fn insert(&mut self, chain: ChainId, result: Result<T, RpcError>) {
		match result {
			Ok(value) => {
				self.successes.insert(chain, value);
			},
			Err(e) => {
				self.errors.insert(chain, e);
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	#[test]
	fn balance_amount_round_trips_u256_max() {
		let max = U256::MAX;
		let balance = Balance::new(Asset::native(1, "ETH", "Ether", 18), max);
		assert_eq!(U256::from_dec_str(&balance.amount).unwrap(), max);
	}

	#[test]
	fn asset_ids_are_deterministic() {
		let contract =
			H160::from_str("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").unwrap();
		let a = Asset::erc20(1, contract, "USDC", "USD Coin", 6);
		let b = Asset::erc20(1, contract, "USDC", "USD Coin", 6);
		assert_eq!(a.id, b.id);
		assert_ne!(a.id, Asset::native(1, "ETH", "Ether", 18).id);
	}

	#[test]
	fn asset_chain_mapping() {
		assert_eq!(AssetChain::from_chain_id(1), AssetChain::Ethereum);
		assert_eq!(AssetChain::from_chain_id(137), AssetChain::Polygon);
		assert_eq!(AssetChain::from_chain_id(4242), AssetChain::Other);
	}

	#[test]
	fn multichain_result_collects_partial_failures() {
		let mut result = MultichainResult::default();
		result.insert(1, Ok(17u64));
		result.insert(137, Err(RpcError::connection(137, "timeout")));

		assert_eq!(result.successes.len(), 1);
		assert_eq!(result.successes[&1], 17);
		assert_eq!(result.errors.len(), 1);
		assert!(matches!(result.errors[&137], RpcError::Connection { chain: 137, .. }));
	}
}
