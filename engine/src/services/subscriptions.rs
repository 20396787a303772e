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

//! Subscription entry point: one watcher task per chain, started lazily with the first
//! subscription and stopped when the last handle goes away.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use tokio::sync::watch;

use crate::{
	errors::RpcError,
	event_bus::EventBus,
	evm::rpc::ChainRpcApi,
	services::{chain_context, validate_address, ChainMap},
	settings::{PollingSettings, WsConnectionSettings},
	subscription::{watcher::BlockWatcher, ChainSubscriptions, SubscriptionHandle},
	types::{BalanceUpdate, ChainId, TransferEvent},
};

struct WatcherSlot {
	subs: Arc<ChainSubscriptions>,
	task: tokio::task::JoinHandle<()>,
}

pub struct SubscriptionService<Rpc: ChainRpcApi> {
	chains: ChainMap<Rpc>,
	polling: PollingSettings,
	ws_settings: WsConnectionSettings,
	bus: EventBus,
	shutdown: watch::Receiver<bool>,
	watchers: Mutex<HashMap<ChainId, WatcherSlot>>,
}

impl<Rpc: ChainRpcApi> SubscriptionService<Rpc> {
	pub(crate) fn new(
		chains: ChainMap<Rpc>,
		polling: PollingSettings,
		ws_settings: WsConnectionSettings,
		bus: EventBus,
		shutdown: watch::Receiver<bool>,
	) -> Self {
		Self {
			chains,
			polling,
			ws_settings,
			bus,
			shutdown,
			watchers: Mutex::new(HashMap::new()),
		}
	}

	/// Live native-balance updates for `address` on `chain`, refreshed on every new
	/// block and coalesced to latest-known under backpressure.
	pub fn subscribe_balance(
		&self,
		address: &str,
		chain: ChainId,
	) -> Result<SubscriptionHandle<BalanceUpdate>, RpcError> {
		let address = validate_address(address)?;
		self.with_registry(chain, |subs| subs.try_insert_balance(address))
	}

	/// Live ERC-20 Transfer events touching `address` on `chain`. Lossless: a
	/// subscriber that cannot keep up is moved to `Error` rather than missing events
	/// silently.
	pub fn subscribe_transfers(
		&self,
		address: &str,
		chain: ChainId,
	) -> Result<SubscriptionHandle<TransferEvent>, RpcError> {
		let address = validate_address(address)?;
		self.with_registry(chain, |subs| subs.try_insert_transfers(address))
	}

	/// Number of live subscriptions on `chain`.
	pub fn subscription_count(&self, chain: ChainId) -> usize {
		self.watchers
			.lock()
			.expect("watcher table lock poisoned")
			.get(&chain)
			.map(|slot| slot.subs.len())
			.unwrap_or(0)
	}

	/// Whether the chain's watcher task is currently alive.
	pub fn watcher_running(&self, chain: ChainId) -> bool {
		self.watchers
			.lock()
			.expect("watcher table lock poisoned")
			.get(&chain)
			.is_some_and(|slot| !slot.task.is_finished())
	}

	/// Inserts through `insert`, (re)starting the chain's watcher as needed. An insert
	/// can find the registry closed when the watcher exited between lookup and insert;
	/// in that case a fresh registry + watcher replaces the slot and the insert is
	/// retried there, where it cannot fail again.
	fn with_registry<T>(
		&self,
		chain: ChainId,
		insert: impl Fn(&Arc<ChainSubscriptions>) -> Option<SubscriptionHandle<T>>,
	) -> Result<SubscriptionHandle<T>, RpcError> {
		let context = chain_context(&self.chains, chain)?;

		let mut watchers = self.watchers.lock().expect("watcher table lock poisoned");
		if let Some(slot) = watchers.get(&chain) {
			if let Some(handle) = insert(&slot.subs) {
				return Ok(handle)
			}
		}

		let subs = Arc::new(ChainSubscriptions::with_manager(
			chain,
			self.bus.clone(),
			Some(context.manager.clone()),
		));
		let handle = insert(&subs).expect("fresh registry accepts inserts");

		let watcher = BlockWatcher::new(
			context.adapter.clone(),
			context.manager.clone(),
			subs.clone(),
			self.bus.clone(),
			self.polling.clone(),
			&self.ws_settings,
			self.shutdown.clone(),
		);
		watchers.insert(chain, WatcherSlot { subs, task: tokio::spawn(watcher.run()) });

		Ok(handle)
	}

	/// Healthy when every chain that has live subscriptions also has a live watcher.
	pub fn healthy(&self) -> bool {
		let watchers = self.watchers.lock().expect("watcher table lock poisoned");
		watchers
			.values()
			.all(|slot| slot.subs.is_empty() || !slot.task.is_finished())
	}

	/// Aborts every watcher task. Handles observe the closed channels as end-of-stream.
	pub(crate) fn abort_all(&self) {
		let watchers = self.watchers.lock().expect("watcher table lock poisoned");
		for slot in watchers.values() {
			slot.subs.close();
			slot.task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		adapter::ChainAdapter,
		event_bus::EventBus,
		services::ChainContext,
		settings::{ChainSettings, Settings},
		testing::ScriptedRpc,
	};
	use std::collections::BTreeMap;

	const ADDR: &str = "0x742d35cc6634c0532925a3b844bc454e4438beb0";

	fn service(rpc: ScriptedRpc) -> (SubscriptionService<ScriptedRpc>, watch::Sender<bool>) {
		let bus = EventBus::new();
		let chain = ChainSettings {
			id: 1,
			name: "Ethereum".to_string(),
			native_symbol: "ETH".to_string(),
			native_decimals: 18,
			http_endpoints: vec!["http://localhost:8545".into()],
			ws_endpoints: vec![],
			tokens: vec![],
		};
		let settings = Settings {
			chains: vec![chain.clone()],
			polling: PollingSettings { poll_interval_ms: 20, ws_recovery_interval_ms: 60_000 },
			..Default::default()
		};
		let adapter = Arc::new(ChainAdapter::new(&settings, &chain, rpc, bus.clone()));
		let manager = Arc::new(crate::connection::ConnectionManager::new(
			&chain,
			&settings.ws_connection,
			bus.clone(),
		));
		let mut map = BTreeMap::new();
		map.insert(1, ChainContext { settings: chain, adapter, manager });
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		(
			SubscriptionService::new(
				Arc::new(map),
				settings.polling,
				settings.ws_connection,
				bus,
				shutdown_rx,
			),
			shutdown_tx,
		)
	}

	#[tokio::test]
	async fn first_subscription_starts_the_watcher() {
		let (service, _shutdown) = service(ScriptedRpc::healthy(5));
		assert!(!service.watcher_running(1));

		let mut handle = service.subscribe_balance(ADDR, 1).unwrap();
		assert!(service.watcher_running(1));
		assert_eq!(service.subscription_count(1), 1);

		let update = utilities::testing::with_timeout(5, handle.next()).await.unwrap();
		assert_eq!(update.block_number, 5);
		assert_eq!(update.balance.asset.symbol, "ETH");
	}

	#[tokio::test]
	async fn watcher_restarts_after_full_teardown() {
		let (service, _shutdown) = service(ScriptedRpc::healthy(5));

		let handle = service.subscribe_balance(ADDR, 1).unwrap();
		drop(handle);

		// Allow the watcher to notice the empty registry and exit.
		tokio::time::sleep(std::time::Duration::from_millis(200)).await;

		// A new subscription transparently gets a fresh watcher.
		let _handle = service.subscribe_balance(ADDR, 1).unwrap();
		assert!(service.watcher_running(1));
		assert_eq!(service.subscription_count(1), 1);
	}

	#[tokio::test]
	async fn invalid_inputs_are_rejected() {
		let (service, _shutdown) = service(ScriptedRpc::healthy(5));
		assert!(matches!(
			service.subscribe_balance("bogus", 1),
			Err(RpcError::Validation { .. })
		));
		assert!(matches!(
			service.subscribe_transfers(ADDR, 404),
			Err(RpcError::ChainUnsupported(404))
		));
		assert!(!service.watcher_running(1));
	}

	#[tokio::test]
	async fn duplicate_subscriptions_share_one_watcher() {
		let (service, _shutdown) = service(ScriptedRpc::healthy(5));

		let _a = service.subscribe_balance(ADDR, 1).unwrap();
		let _b = service.subscribe_balance(ADDR, 1).unwrap();

		assert_eq!(service.subscription_count(1), 2);
		// One watcher serves both; the underlying registry is shared.
		assert!(service.watcher_running(1));
	}
}
