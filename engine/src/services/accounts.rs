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

//! Account attribution: callers tag address queries with opaque account ids; the
//! engine deduplicates by `(address lowercased, chain)`, performs each unique query
//! once, and fans results back out per account id. One failing key produces one error
//! entry per referencing account and never blocks the other keys.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;

use crate::{
	errors::RpcError,
	evm::rpc::ChainRpcApi,
	services::{
		balance::BalanceService, subscriptions::SubscriptionService,
		transactions::TransactionService, validate_address,
	},
	types::{
		AccountBalance, AccountBalanceList, AccountBalanceUpdate, AccountError,
		AccountTransactionList, AccountTransactions, AddressRequest, ChainId,
		TransactionQuery,
	},
};

/// `(address lowercased, chain)` → the accounts that asked for it.
type DedupeMap = BTreeMap<(String, ChainId), Vec<String>>;

pub struct AccountService<Rpc: ChainRpcApi> {
	balances: BalanceService<Rpc>,
	transactions: TransactionService<Rpc>,
	subscriptions: Arc<SubscriptionService<Rpc>>,
}

impl<Rpc: ChainRpcApi> AccountService<Rpc> {
	pub(crate) fn new(
		balances: BalanceService<Rpc>,
		transactions: TransactionService<Rpc>,
		subscriptions: Arc<SubscriptionService<Rpc>>,
	) -> Self {
		Self { balances, transactions, subscriptions }
	}

	fn dedupe(requests: &[AddressRequest]) -> (DedupeMap, Vec<AccountError>) {
		let mut map: DedupeMap = BTreeMap::new();
		let mut errors = Vec::new();

		for request in requests {
			match validate_address(&request.address) {
				Ok(_) =>
					for &chain in &request.chain_scope {
						map.entry((utilities::normalise_hex(&request.address), chain))
							.or_default()
							.push(request.account_id.clone());
					},
				Err(e) =>
					for &chain in &request.chain_scope {
						errors.push(AccountError {
							account_id: request.account_id.clone(),
							address: request.address.clone(),
							chain_id: chain,
							error: e.user_message(),
							code: e.code(),
						});
					},
			}
		}
		(map, errors)
	}

	/// Native balances for a batch of address requests. Requests sharing an
	/// `(address, chain)` key produce one upstream query whose result every
	/// referencing account receives under its own `account_id`.
	pub async fn get_account_balances(
		&self,
		requests: &[AddressRequest],
	) -> AccountBalanceList {
		let (map, mut errors) = Self::dedupe(requests);
		let mut balances = Vec::new();

		let results = join_all(map.iter().map(|((address, chain), accounts)| {
			let address = address.clone();
			async move {
				let result = self.balances.get_balance(&address, *chain, false).await;
				(address, *chain, accounts, result)
			}
		}))
		.await;

		for (address, chain, accounts, result) in results {
			match result {
				Ok(balance) =>
					for account_id in accounts {
						balances.push(AccountBalance {
							account_id: account_id.clone(),
							address: address.clone(),
							chain_id: chain,
							balance: balance.clone(),
						});
					},
				Err(e) =>
					for account_id in accounts {
						errors.push(AccountError {
							account_id: account_id.clone(),
							address: address.clone(),
							chain_id: chain,
							error: e.user_message(),
							code: e.code(),
						});
					},
			}
		}

		AccountBalanceList { balances, errors, timestamp: Utc::now() }
	}

	/// Recent transactions for a batch of address requests, deduplicated the same way.
	/// Every account's result list carries its own `account_id` on each transaction.
	pub async fn get_account_transactions(
		&self,
		requests: &[AddressRequest],
	) -> AccountTransactionList {
		let (map, mut errors) = Self::dedupe(requests);
		let mut transactions = Vec::new();

		let results = join_all(map.iter().map(|((address, chain), accounts)| {
			let address = address.clone();
			async move {
				let result = self
					.transactions
					.get_transactions(&address, *chain, TransactionQuery::default(), false)
					.await;
				(address, *chain, accounts, result)
			}
		}))
		.await;

		for (address, chain, accounts, result) in results {
			match result {
				Ok(list) =>
					for account_id in accounts {
						transactions.push(AccountTransactions {
							account_id: account_id.clone(),
							address: address.clone(),
							chain_id: chain,
							transactions: list
								.iter()
								.cloned()
								.map(|mut tx| {
									tx.account_id = Some(account_id.clone());
									tx
								})
								.collect(),
						});
					},
				Err(e) =>
					for account_id in accounts {
						errors.push(AccountError {
							account_id: account_id.clone(),
							address: address.clone(),
							chain_id: chain,
							error: e.user_message(),
							code: e.code(),
						});
					},
			}
		}

		AccountTransactionList { transactions, errors, timestamp: Utc::now() }
	}

	/// Live account-attributed balance updates. One underlying subscription exists per
	/// unique `(address, chain)`; each update fans out as one enriched event per
	/// account id. Dropping the returned stream tears down the underlying
	/// subscriptions.
	pub fn subscribe_account_balances(
		&self,
		requests: &[AddressRequest],
	) -> Result<AccountBalanceStream, RpcError> {
		let (map, errors) = Self::dedupe(requests);
		if let Some(error) = errors.into_iter().next() {
			return Err(RpcError::Validation {
				field: "address".to_string(),
				expected: "a 0x-prefixed 20-byte hex address".to_string(),
				received: error.address,
			})
		}

		let (sender, receiver) = mpsc::channel(64);
		let mut tasks = Vec::with_capacity(map.len());

		for ((address, chain), accounts) in map {
			let mut handle = self.subscriptions.subscribe_balance(&address, chain)?;
			let sender = sender.clone();
			tasks.push(tokio::spawn(async move {
				while let Some(update) = handle.next().await {
					for account_id in &accounts {
						let enriched = AccountBalanceUpdate {
							account_id: account_id.clone(),
							address: address.clone(),
							chain_id: chain,
							balance: update.balance.clone(),
							block_number: update.block_number,
							timestamp: update.timestamp,
						};
						if sender.send(enriched).await.is_err() {
							return
						}
					}
				}
			}));
		}

		Ok(AccountBalanceStream { receiver, tasks })
	}
}

/// Stream of account-enriched balance updates; dropping it unsubscribes everything it
/// owns.
pub struct AccountBalanceStream {
	receiver: mpsc::Receiver<AccountBalanceUpdate>,
	tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl AccountBalanceStream {
	pub async fn next(&mut self) -> Option<AccountBalanceUpdate> {
		self.receiver.recv().await
	}
}

impl Drop for AccountBalanceStream {
	fn drop(&mut self) {
		// Aborting the relay tasks drops their subscription handles, which
		// unsubscribes from the watchers.
		for task in &self.tasks {
			task.abort();
		}
	}
}
