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

//! In-process typed pub/sub for lifecycle and live-data events. Publishing never blocks
//! the engine: the channel runs in overflow mode, so a slow listener loses the oldest
//! events rather than stalling emitters.

use ethers::types::H160;

use crate::{
	subscription::{SubscriptionId, SubscriptionKind},
	types::{BalanceUpdate, BlockInfo, ChainId, TransferEvent},
};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
	WebsocketConnected { chain: ChainId, url: String },
	WebsocketDisconnected { chain: ChainId, reason: String },
	WebsocketReconnecting { chain: ChainId, attempt: u32 },
	WebsocketFailed { chain: ChainId },
	TransportFallbackToPolling { chain: ChainId },
	TransportRestoredToWs { chain: ChainId },
	SubscriptionCreated { chain: ChainId, id: SubscriptionId, kind: SubscriptionKind },
	SubscriptionRemoved { chain: ChainId, id: SubscriptionId },
	SubscriptionError { chain: ChainId, id: SubscriptionId, reason: String },
	CircuitOpened { chain: ChainId },
	CircuitClosed { chain: ChainId },
	LiveBlockReceived { chain: ChainId, block: BlockInfo },
	LiveBalanceUpdated(BalanceUpdate),
	LiveTransferDetected(TransferEvent),
	/// An address joined or left the tracked set of a chain's watcher.
	TrackedAddressChanged { chain: ChainId, address: H160, tracked: bool },
}

const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Cloneable bus handle. All clones publish into and subscribe to the same channel.
#[derive(Clone)]
pub struct EventBus {
	sender: async_broadcast::Sender<EngineEvent>,
	// Keeps the channel open while no subscriber exists.
	_keepalive: async_broadcast::InactiveReceiver<EngineEvent>,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

impl EventBus {
	pub fn new() -> Self {
		let (mut sender, receiver) = async_broadcast::broadcast(EVENT_CHANNEL_CAPACITY);
		sender.set_overflow(true);
		Self { sender, _keepalive: receiver.deactivate() }
	}

	/// Publishes an event. Fire-and-forget: with overflow enabled this cannot block, and
	/// an event nobody listens to is simply dropped.
	pub fn publish(&self, event: EngineEvent) {
		let _ = self.sender.try_broadcast(event);
	}

	pub fn subscribe(&self) -> async_broadcast::Receiver<EngineEvent> {
		self.sender.new_receiver()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn subscribers_receive_published_events() {
		let bus = EventBus::new();
		let mut rx = bus.subscribe();

		bus.publish(EngineEvent::TransportFallbackToPolling { chain: 1 });

		assert_eq!(
			rx.recv().await.unwrap(),
			EngineEvent::TransportFallbackToPolling { chain: 1 }
		);
	}

	#[tokio::test]
	async fn events_published_before_subscribe_are_not_replayed() {
		let bus = EventBus::new();
		bus.publish(EngineEvent::CircuitOpened { chain: 1 });

		let mut rx = bus.subscribe();
		bus.publish(EngineEvent::CircuitClosed { chain: 1 });

		assert_eq!(rx.recv().await.unwrap(), EngineEvent::CircuitClosed { chain: 1 });
	}

	#[tokio::test]
	async fn publishing_without_subscribers_does_not_error() {
		let bus = EventBus::new();
		for _ in 0..10_000 {
			bus.publish(EngineEvent::CircuitOpened { chain: 1 });
		}
	}

	#[tokio::test]
	async fn slow_subscriber_loses_oldest_events_only() {
		let bus = EventBus::new();
		let mut rx = bus.subscribe();

		for chain in 0..(EVENT_CHANNEL_CAPACITY as u64 + 10) {
			bus.publish(EngineEvent::CircuitOpened { chain });
		}

		// The earliest events overflowed; the stream resumes from the oldest retained
		// one and stays in order.
		let first = rx.recv().await;
		assert!(matches!(
			first,
			Err(async_broadcast::RecvError::Overflowed(_)) |
				Ok(EngineEvent::CircuitOpened { .. })
		));
		let EngineEvent::CircuitOpened { chain: a } = rx.recv().await.unwrap() else {
			panic!("unexpected event")
		};
		let EngineEvent::CircuitOpened { chain: b } = rx.recv().await.unwrap() else {
			panic!("unexpected event")
		};
		assert!(b > a);
	}
}
