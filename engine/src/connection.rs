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

//! Per-chain connection state machine.
//!
//! ```text
//! Disconnected → Connecting → (ConnectedWs | ConnectedHttp) → Reconnecting → …
//!                                     └────────── exhausted + no fallback ──→ Failed
//! ```
//!
//! The manager governs the *subscription* transport: WS preferred, HTTP polling as the
//! fallback, with reverse recovery back to WS. Request/response traffic always flows
//! over the HTTP failover client and is unaffected by this state machine. Lifecycle
//! transitions are published on the event bus.

use std::{cmp::min, sync::Mutex, time::Duration};

use chrono::Utc;
use rand::Rng;

use crate::{
	errors::RpcError,
	event_bus::{EngineEvent, EventBus},
	evm::{rpc::WsSubscriptionClient, ConscientiousEvmWebsocketBlockHeaderStream},
	settings::{ChainSettings, WsConnectionSettings},
	types::{ChainId, ConnectionInfo, ConnectionStatus, TransportKind},
};

/// What `connect` / `reconnect_ws` settled on.
pub enum ConnectOutcome {
	/// A live `newHeads` stream.
	Ws(ConscientiousEvmWebsocketBlockHeaderStream),
	/// No WS available; the caller should poll over HTTP.
	Polling,
}

pub struct ConnectionManager {
	chain: ChainId,
	ws_client: WsSubscriptionClient,
	ws_settings: WsConnectionSettings,
	has_http_fallback: bool,
	bus: EventBus,
	state: Mutex<ConnectionInfo>,
}

impl ConnectionManager {
	pub fn new(
		settings: &ChainSettings,
		ws_settings: &WsConnectionSettings,
		bus: EventBus,
	) -> Self {
		Self {
			chain: settings.id,
			ws_client: WsSubscriptionClient::new(settings, ws_settings),
			ws_settings: ws_settings.clone(),
			has_http_fallback: !settings.http_endpoints.is_empty(),
			bus,
			state: Mutex::new(ConnectionInfo::default()),
		}
	}

	pub fn info(&self) -> ConnectionInfo {
		self.state.lock().expect("connection state lock poisoned").clone()
	}

	pub fn chain(&self) -> ChainId {
		self.chain
	}

	fn update<R>(&self, f: impl FnOnce(&mut ConnectionInfo) -> R) -> R {
		f(&mut self.state.lock().expect("connection state lock poisoned"))
	}

	pub fn adjust_subscription_count(&self, delta: isize) {
		self.update(|state| {
			state.subscription_count = state.subscription_count.saturating_add_signed(delta)
		});
	}

	pub fn subscription_count(&self) -> usize {
		self.update(|state| state.subscription_count)
	}

	/// Initial connect: WS first when any WS endpoint exists, HTTP polling otherwise.
	/// `Failed` is only entered when no transport at all can be established.
	pub async fn connect(&self) -> Result<ConnectOutcome, RpcError> {
		self.update(|state| state.status = ConnectionStatus::Connecting);

		if self.ws_client.has_endpoints() {
			match self.ws_client.subscribe_new_heads().await {
				Ok((stream, endpoint)) => {
					self.note_ws_connected(endpoint.to_string());
					return Ok(ConnectOutcome::Ws(stream))
				},
				Err(e) => {
					tracing::warn!(
						chain = self.chain,
						"ws connect failed, considering http fallback: {e}"
					);
					self.update(|state| state.last_error = Some(e.to_string()));
				},
			}
		}

		if self.has_http_fallback {
			self.note_http_fallback();
			return Ok(ConnectOutcome::Polling)
		}

		let error = RpcError::connection(self.chain, "no transport available");
		self.update(|state| {
			state.status = ConnectionStatus::Failed;
			state.last_error = Some(error.to_string());
		});
		Err(error)
	}

	/// Reconnect after WS loss: exponential backoff with jitter, bounded by
	/// `max_reconnect_attempts`, then HTTP fallback, then `Failed`.
	pub async fn reconnect_ws(&self) -> Result<ConnectOutcome, RpcError> {
		for attempt in 0..self.ws_settings.max_reconnect_attempts {
			self.update(|state| {
				state.status = ConnectionStatus::Reconnecting;
				state.reconnect_attempts = attempt + 1;
			});
			self.bus.publish(EngineEvent::WebsocketReconnecting {
				chain: self.chain,
				attempt: attempt + 1,
			});

			tokio::time::sleep(self.reconnect_delay(attempt)).await;

			match self.ws_client.subscribe_new_heads().await {
				Ok((stream, endpoint)) => {
					self.note_ws_connected(endpoint.to_string());
					return Ok(ConnectOutcome::Ws(stream))
				},
				Err(e) => {
					tracing::warn!(
						chain = self.chain,
						attempt = attempt + 1,
						"ws reconnect attempt failed: {e}"
					);
					self.update(|state| state.last_error = Some(e.to_string()));
				},
			}
		}

		self.bus.publish(EngineEvent::WebsocketFailed { chain: self.chain });
		if self.has_http_fallback {
			self.note_http_fallback();
			return Ok(ConnectOutcome::Polling)
		}

		let error = RpcError::connection(self.chain, "ws reconnect attempts exhausted");
		self.update(|state| {
			state.status = ConnectionStatus::Failed;
			state.last_error = Some(error.to_string());
		});
		Err(error)
	}

	/// One recovery attempt from polling back to WS. Quiet on failure; polling simply
	/// continues until the next recovery tick.
	pub async fn try_ws_recovery(
		&self,
	) -> Option<ConscientiousEvmWebsocketBlockHeaderStream> {
		if !self.ws_client.has_endpoints() {
			return None
		}
		match self.ws_client.subscribe_new_heads().await {
			Ok((stream, endpoint)) => {
				self.note_ws_connected(endpoint.to_string());
				self.bus.publish(EngineEvent::TransportRestoredToWs { chain: self.chain });
				tracing::info!(chain = self.chain, "restored ws transport");
				Some(stream)
			},
			Err(e) => {
				tracing::debug!(chain = self.chain, "ws recovery attempt failed: {e}");
				None
			},
		}
	}

	/// Marks the WS transport lost and publishes the disconnect. The caller decides
	/// whether to reconnect or fall back.
	pub fn note_ws_lost(&self, reason: &str) {
		tracing::warn!(chain = self.chain, "ws transport lost: {reason}");
		self.update(|state| {
			state.status = ConnectionStatus::Reconnecting;
			state.transport = None;
			state.last_error = Some(reason.to_string());
		});
		self.bus.publish(EngineEvent::WebsocketDisconnected {
			chain: self.chain,
			reason: reason.to_string(),
		});
	}

	pub fn disconnect(&self) {
		self.update(|state| {
			state.status = ConnectionStatus::Disconnected;
			state.transport = None;
			state.url = None;
		});
	}

	fn note_ws_connected(&self, url: String) {
		self.update(|state| {
			state.status = ConnectionStatus::ConnectedWs;
			state.transport = Some(TransportKind::Ws);
			state.url = Some(url.clone());
			state.connected_at = Some(Utc::now());
			state.reconnect_attempts = 0;
			state.last_error = None;
		});
		self.bus
			.publish(EngineEvent::WebsocketConnected { chain: self.chain, url });
	}

	fn note_http_fallback(&self) {
		self.update(|state| {
			state.status = ConnectionStatus::ConnectedHttp;
			state.transport = Some(TransportKind::Http);
			state.url = None;
			state.connected_at = Some(Utc::now());
		});
		self.bus.publish(EngineEvent::TransportFallbackToPolling { chain: self.chain });
		tracing::info!(chain = self.chain, "falling back to http polling");
	}

	/// `min(base * 2^attempt, max_delay)`, jittered to land in `[half, full)` so
	/// stampedes across chains cannot synchronise.
	fn reconnect_delay(&self, attempt: u32) -> Duration {
		let full = min(
			Duration::from_millis(self.ws_settings.reconnect_max_delay_ms),
			Duration::from_millis(self.ws_settings.reconnect_base_delay_ms)
				.saturating_mul(2u32.saturating_pow(attempt)),
		);
		let half = full / 2;
		if half.is_zero() {
			return full
		}
		half + rand::thread_rng().gen_range(Duration::ZERO..half)
	}
}
