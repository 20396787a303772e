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

//! Multi-chain EVM data access engine.
//!
//! An [`Engine`] owns one HTTP transport and at most one WebSocket watcher per
//! configured chain, wraps every outbound call in a per-chain resilience stack
//! (rate limit → coalesce → cache → circuit breaker → retry → timeout), and exposes
//! balance, transaction, subscription, account-attribution and DeFi services over a
//! normalized schema. There is no process-global state: everything lives in the engine
//! value, and [`Engine::shutdown`] tears all of it down.

pub mod adapter;
pub mod connection;
pub mod constants;
pub mod defi;
pub mod errors;
pub mod event_bus;
pub mod evm;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod observability;
pub mod registry;
pub mod resilience;
pub mod services;
pub mod settings;
pub mod subscription;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tokio::sync::watch;

use crate::{
	adapter::ChainAdapter,
	connection::ConnectionManager,
	constants::RPC_TIMEOUT,
	defi::{uniswap_v3::UniswapV3Adapter, DefiService},
	errors::RpcError,
	event_bus::{EngineEvent, EventBus},
	evm::rpc::EvmRpcClient,
	health::{HealthMonitor, HealthReport},
	metrics::Metrics,
	registry::ChainRegistry,
	services::{
		accounts::AccountService, balance::BalanceService,
		subscriptions::SubscriptionService, transactions::TransactionService,
		ChainContext, ChainMap,
	},
	settings::Settings,
	types::{ChainId, ChainInfo, ConnectionInfo},
};

/// Per-chain counters surfaced by [`Engine::metrics_report`].
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatsReport {
	pub cache_hits: u64,
	pub cache_misses: u64,
	pub coalesced_requests: u64,
	pub retries: u64,
	pub timeouts: u64,
	pub rate_limited: u64,
	pub breaker_state: String,
	pub connection: ConnectionInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetricsReport {
	/// Prometheus text exposition.
	pub prometheus: String,
	pub chains: BTreeMap<ChainId, ChainStatsReport>,
}

struct EngineInner {
	settings: Settings,
	registry: ChainRegistry,
	chains: ChainMap<EvmRpcClient>,
	balance_service: BalanceService<EvmRpcClient>,
	transaction_service: TransactionService<EvmRpcClient>,
	subscription_service: Arc<SubscriptionService<EvmRpcClient>>,
	account_service: AccountService<EvmRpcClient>,
	defi_service: DefiService,
	bus: EventBus,
	metrics: Arc<Metrics>,
	health: Arc<HealthMonitor>,
	shutdown: watch::Sender<bool>,
	tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// The root handle. Construct one per application; drop or [`Engine::shutdown`] it to
/// release every transport, timer and task it owns.
pub struct Engine {
	inner: Arc<EngineInner>,
}

impl Engine {
	/// Builds an engine from validated settings and starts its background duties.
	/// Must be called within a tokio runtime.
	pub fn new(settings: Settings) -> anyhow::Result<Self> {
		settings.validate()?;

		let bus = EventBus::new();
		let (shutdown, shutdown_rx) = watch::channel(false);
		let registry = ChainRegistry::new(&settings);

		let mut chains = BTreeMap::new();
		for chain in registry.iter() {
			let rpc = EvmRpcClient::new(chain, RPC_TIMEOUT)?;
			let adapter =
				Arc::new(ChainAdapter::new(&settings, chain, rpc, bus.clone()));
			let manager = Arc::new(ConnectionManager::new(
				chain,
				&settings.ws_connection,
				bus.clone(),
			));
			chains.insert(
				chain.id,
				ChainContext { settings: chain.clone(), adapter, manager },
			);
		}
		let chains: ChainMap<EvmRpcClient> = Arc::new(chains);

		let balance_service = BalanceService::new(chains.clone());
		let transaction_service =
			TransactionService::new(chains.clone(), settings.transaction_service.clone());
		let subscription_service = Arc::new(SubscriptionService::new(
			chains.clone(),
			settings.polling.clone(),
			settings.ws_connection.clone(),
			bus.clone(),
			shutdown_rx.clone(),
		));
		let account_service = AccountService::new(
			balance_service.clone(),
			transaction_service.clone(),
			subscription_service.clone(),
		);

		let mut defi_service = DefiService::new();
		for context in chains.values() {
			defi_service.register(Arc::new(UniswapV3Adapter::new(context.adapter.clone())));
		}

		let metrics = Arc::new(Metrics::new()?);
		let health = Arc::new(HealthMonitor::new());
		for context in chains.values() {
			let adapter = context.adapter.clone();
			health.register_check(format!("rpc-{}", context.settings.id), true, move || {
				let adapter = adapter.clone();
				async move { adapter.is_healthy().await }
			});
		}
		{
			let chains = chains.clone();
			health.register_check("cache", false, move || {
				let healthy = chains
					.values()
					.all(|context| context.adapter.stats().cache_misses < u64::MAX);
				async move { healthy }
			});
		}
		{
			let subscriptions = subscription_service.clone();
			health.register_check("subscriptions", false, move || {
				let healthy = subscriptions.healthy();
				async move { healthy }
			});
		}

		let mut tasks = Vec::new();
		tasks.push(tokio::spawn(metrics::run_collector(
			metrics.clone(),
			bus.clone(),
			shutdown_rx.clone(),
		)));
		if settings.metrics.enabled {
			let metrics = metrics.clone();
			let hostname = settings.metrics.hostname.clone();
			let port = settings.metrics.port;
			let shutdown_rx = shutdown_rx.clone();
			tasks.push(tokio::spawn(async move {
				if let Err(e) = metrics::serve(metrics, &hostname, port, shutdown_rx).await
				{
					tracing::error!("metrics endpoint failed: {e:#}");
				}
			}));
		}
		if settings.health.enabled {
			let health = health.clone();
			let hostname = settings.health.hostname.clone();
			let port = settings.health.port;
			let shutdown_rx = shutdown_rx.clone();
			tasks.push(tokio::spawn(async move {
				if let Err(e) = health::serve(health, &hostname, port, shutdown_rx).await {
					tracing::error!("health endpoint failed: {e:#}");
				}
			}));
		}

		tracing::info!(
			chains = ?registry.ids(),
			environment = %settings.cache.environment,
			"engine started"
		);

		Ok(Self {
			inner: Arc::new(EngineInner {
				settings,
				registry,
				chains,
				balance_service,
				transaction_service,
				subscription_service,
				account_service,
				defi_service,
				bus,
				metrics,
				health,
				shutdown,
				tasks: std::sync::Mutex::new(tasks),
			}),
		})
	}

	pub fn balance_service(&self) -> &BalanceService<EvmRpcClient> {
		&self.inner.balance_service
	}

	pub fn transaction_service(&self) -> &TransactionService<EvmRpcClient> {
		&self.inner.transaction_service
	}

	pub fn subscription_service(&self) -> &SubscriptionService<EvmRpcClient> {
		&self.inner.subscription_service
	}

	pub fn account_service(&self) -> &AccountService<EvmRpcClient> {
		&self.inner.account_service
	}

	pub fn defi_service(&self) -> &DefiService {
		&self.inner.defi_service
	}

	pub fn settings(&self) -> &Settings {
		&self.inner.settings
	}

	pub fn chain_ids(&self) -> Vec<ChainId> {
		self.inner.registry.ids()
	}

	pub fn chain_info(&self, chain: ChainId) -> Result<ChainInfo, RpcError> {
		self.inner.registry.info(chain)
	}

	/// Live engine events: transports, subscriptions, circuit breakers, live data.
	pub fn events(&self) -> async_broadcast::Receiver<EngineEvent> {
		self.inner.bus.subscribe()
	}

	pub fn connection_info(&self, chain: ChainId) -> Result<ConnectionInfo, RpcError> {
		self.inner
			.chains
			.get(&chain)
			.map(|context| context.manager.info())
			.ok_or(RpcError::ChainUnsupported(chain))
	}

	/// Aggregated health over every registered check.
	pub async fn health(&self) -> HealthReport {
		self.inner.health.report().await
	}

	/// Prometheus text plus per-chain counter snapshots.
	pub fn metrics_report(&self) -> EngineMetricsReport {
		let chains = self
			.inner
			.chains
			.iter()
			.map(|(&chain_id, context)| {
				let stats = context.adapter.stats();
				(
					chain_id,
					ChainStatsReport {
						cache_hits: stats.cache_hits,
						cache_misses: stats.cache_misses,
						coalesced_requests: stats.coalesced_requests,
						retries: stats.stack.retries,
						timeouts: stats.stack.timeouts,
						rate_limited: stats.stack.rate_limit_rejections,
						breaker_state: format!("{:?}", context.adapter.breaker_state()),
						connection: context.manager.info(),
					},
				)
			})
			.collect();

		EngineMetricsReport { prometheus: self.inner.metrics.export(), chains }
	}

	/// Stops every watcher, timer and endpoint. Pending subscription streams end;
	/// in-flight one-shot calls resolve with cancellation as their transports close.
	pub async fn shutdown(&self) {
		let _ = self.inner.shutdown.send(true);
		self.inner.subscription_service.abort_all();
		let tasks = {
			let mut tasks = self.inner.tasks.lock().expect("task list lock poisoned");
			std::mem::take(&mut *tasks)
		};
		for task in tasks {
			task.abort();
			let _ = task.await;
		}
		tracing::info!("engine stopped");
	}
}

impl Drop for EngineInner {
	fn drop(&mut self) {
		let _ = self.shutdown.send(true);
		self.subscription_service.abort_all();
		for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
			task.abort();
		}
	}
}
