//! Metric monitoring for the engine.
//!
//! The registry is owned by the engine value, not by the process: two engines in one
//! process keep disjoint metrics. A collector task folds bus events into the counters;
//! the text export is Prometheus format, optionally served over HTTP.

use std::net::IpAddr;

use prometheus::{
	HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use tokio::sync::watch;
use warp::Filter;

use crate::event_bus::{EngineEvent, EventBus};

pub struct Metrics {
	registry: Registry,
	pub rpc_requests: IntCounterVec,
	pub rpc_request_duration: HistogramVec,
	pub cache_hits: IntCounterVec,
	pub cache_misses: IntCounterVec,
	pub coalesced_requests: IntCounterVec,
	pub ws_reconnects: IntCounterVec,
	pub transport_fallbacks: IntCounterVec,
	pub live_blocks: IntCounterVec,
	pub live_balance_updates: IntCounterVec,
	pub live_transfers: IntCounterVec,
	pub circuit_state: IntGaugeVec,
	pub subscriptions: IntGaugeVec,
}

impl Metrics {
	pub fn new() -> anyhow::Result<Self> {
		let registry = Registry::new();

		let rpc_requests = IntCounterVec::new(
			Opts::new("rpc_requests_total", "Outbound RPC calls by chain, method and outcome"),
			&["chain", "method", "outcome"],
		)?;
		let rpc_request_duration = HistogramVec::new(
			HistogramOpts::new("rpc_request_duration_seconds", "Outbound RPC call latency"),
			&["chain", "method"],
		)?;
		let cache_hits = IntCounterVec::new(
			Opts::new("cache_hits_total", "Cache hits by chain"),
			&["chain"],
		)?;
		let cache_misses = IntCounterVec::new(
			Opts::new("cache_misses_total", "Cache misses by chain"),
			&["chain"],
		)?;
		let coalesced_requests = IntCounterVec::new(
			Opts::new("coalesced_requests_total", "Requests served by an in-flight duplicate"),
			&["chain"],
		)?;
		let ws_reconnects = IntCounterVec::new(
			Opts::new("ws_reconnects_total", "WebSocket reconnect attempts"),
			&["chain"],
		)?;
		let transport_fallbacks = IntCounterVec::new(
			Opts::new("transport_fallbacks_total", "Falls from WS to HTTP polling"),
			&["chain"],
		)?;
		let live_blocks = IntCounterVec::new(
			Opts::new("live_blocks_total", "Blocks observed by watchers"),
			&["chain"],
		)?;
		let live_balance_updates = IntCounterVec::new(
			Opts::new("live_balance_updates_total", "Balance updates emitted"),
			&["chain"],
		)?;
		let live_transfers = IntCounterVec::new(
			Opts::new("live_transfers_total", "Transfer events emitted"),
			&["chain"],
		)?;
		let circuit_state = IntGaugeVec::new(
			Opts::new("circuit_state", "Circuit breaker state (0 closed, 1 open)"),
			&["chain"],
		)?;
		let subscriptions = IntGaugeVec::new(
			Opts::new("subscriptions", "Live subscriptions"),
			&["chain"],
		)?;

		for collector in [
			&rpc_requests,
			&cache_hits,
			&cache_misses,
			&coalesced_requests,
			&ws_reconnects,
			&transport_fallbacks,
			&live_blocks,
			&live_balance_updates,
			&live_transfers,
		] {
			registry.register(Box::new(collector.clone()))?;
		}
		registry.register(Box::new(rpc_request_duration.clone()))?;
		registry.register(Box::new(circuit_state.clone()))?;
		registry.register(Box::new(subscriptions.clone()))?;

		Ok(Self {
			registry,
			rpc_requests,
			rpc_request_duration,
			cache_hits,
			cache_misses,
			coalesced_requests,
			ws_reconnects,
			transport_fallbacks,
			live_blocks,
			live_balance_updates,
			live_transfers,
			circuit_state,
			subscriptions,
		})
	}

	/// Prometheus text exposition of every registered metric.
	pub fn export(&self) -> String {
		use prometheus::Encoder;
		let encoder = prometheus::TextEncoder::new();
		let mut buffer = Vec::new();
		if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
			tracing::error!("could not encode metrics: {e}");
		}
		String::from_utf8(buffer).unwrap_or_default()
	}
}

/// Folds engine events into the metric families until shutdown.
pub async fn run_collector(
	metrics: std::sync::Arc<Metrics>,
	bus: EventBus,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut events = bus.subscribe();
	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			event = events.recv() => {
				let event = match event {
					Ok(event) => event,
					// Overflow skips ahead; a closed bus means teardown.
					Err(async_broadcast::RecvError::Overflowed(_)) => continue,
					Err(async_broadcast::RecvError::Closed) => break,
				};
				let chain = |id: u64| id.to_string();
				match event {
					EngineEvent::WebsocketReconnecting { chain: id, .. } =>
						metrics.ws_reconnects.with_label_values(&[&chain(id)]).inc(),
					EngineEvent::TransportFallbackToPolling { chain: id } =>
						metrics.transport_fallbacks.with_label_values(&[&chain(id)]).inc(),
					EngineEvent::LiveBlockReceived { chain: id, .. } =>
						metrics.live_blocks.with_label_values(&[&chain(id)]).inc(),
					EngineEvent::LiveBalanceUpdated(update) => metrics
						.live_balance_updates
						.with_label_values(&[&chain(update.chain)])
						.inc(),
					EngineEvent::LiveTransferDetected(transfer) => metrics
						.live_transfers
						.with_label_values(&[&chain(transfer.chain)])
						.inc(),
					EngineEvent::CircuitOpened { chain: id } => metrics
						.circuit_state
						.with_label_values(&[&chain(id)])
						.set(1),
					EngineEvent::CircuitClosed { chain: id } => metrics
						.circuit_state
						.with_label_values(&[&chain(id)])
						.set(0),
					EngineEvent::SubscriptionCreated { chain: id, .. } => metrics
						.subscriptions
						.with_label_values(&[&chain(id)])
						.inc(),
					EngineEvent::SubscriptionRemoved { chain: id, .. } => metrics
						.subscriptions
						.with_label_values(&[&chain(id)])
						.dec(),
					_ => {},
				}
			},
		}
	}
}

/// Serves `GET /metrics` until `shutdown` flips.
pub async fn serve(
	metrics: std::sync::Arc<Metrics>,
	hostname: &str,
	port: u16,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let address: IpAddr = hostname.parse()?;

	let route = warp::get()
		.and(warp::path("metrics"))
		.and(warp::path::end())
		.map(move || metrics.export());

	let (bound, server) =
		warp::serve(route).bind_with_graceful_shutdown((address, port), async move {
			let _ = shutdown.changed().await;
		});
	tracing::info!("metrics endpoint listening on {bound}");
	server.await;
	Ok(())
}
