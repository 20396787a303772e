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

//! Subscription handles and the per-chain registry behind them.
//!
//! Handles and the chain-wide watcher never reference each other directly: the registry
//! keyed by subscription id sits between them. The watcher looks entries up per tick
//! and skips ids that have gone away; dropping a handle removes its entry.
//!
//! Delivery differs by kind, implementing the backpressure contract: balance updates
//! coalesce to latest-known on a slow consumer (a `watch` channel), transfer events are
//! buffered and never silently dropped; overflowing the buffer moves the handle to
//! `Error`.

pub mod watcher;

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
};

use chrono::{DateTime, Utc};
use ethers::types::H160;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::{
	event_bus::{EngineEvent, EventBus},
	types::{BalanceUpdate, ChainId, TransferEvent},
};

pub type SubscriptionId = u64;

/// Capacity of each transfer-subscription buffer. Overflow is a consumer falling
/// behind, surfaced as `SubscriptionStatus::Error`.
const TRANSFER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionKind {
	Balance,
	Transfers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
	Active,
	Paused,
	Error,
	Closed,
}

pub(crate) enum SubscriptionSender {
	/// Latest-value semantics for balances.
	Balance(watch::Sender<Option<BalanceUpdate>>),
	/// Lossless bounded queue for transfers.
	Transfers(mpsc::Sender<TransferEvent>),
}

pub(crate) struct SubscriptionEntry {
	pub address: H160,
	pub kind: SubscriptionKind,
	pub sender: SubscriptionSender,
	pub status: Arc<Mutex<SubscriptionStatus>>,
}

struct RegistryInner {
	/// Set by the watcher on exit; a closed registry accepts no new entries, so a
	/// subscription can never land in a registry whose watcher is gone.
	closed: bool,
	entries: HashMap<SubscriptionId, Arc<SubscriptionEntry>>,
}

/// Shared between the chain's watcher task and every handle on that chain.
pub struct ChainSubscriptions {
	chain: ChainId,
	bus: EventBus,
	manager: Option<Arc<crate::connection::ConnectionManager>>,
	next_id: AtomicU64,
	inner: Mutex<RegistryInner>,
}

impl ChainSubscriptions {
	pub fn new(chain: ChainId, bus: EventBus) -> Self {
		Self::with_manager(chain, bus, None)
	}

	pub(crate) fn with_manager(
		chain: ChainId,
		bus: EventBus,
		manager: Option<Arc<crate::connection::ConnectionManager>>,
	) -> Self {
		Self {
			chain,
			bus,
			manager,
			next_id: AtomicU64::new(1),
			inner: Mutex::new(RegistryInner { closed: false, entries: HashMap::new() }),
		}
	}

	pub fn chain(&self) -> ChainId {
		self.chain
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().expect("subscription registry lock poisoned").entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().expect("subscription registry lock poisoned").entries.len()
	}

	/// Closes the registry if it has no entries. Called by the watcher before exiting,
	/// under the same lock that guards inserts, so exit and insert cannot interleave.
	pub(crate) fn close_if_empty(&self) -> bool {
		let mut inner = self.inner.lock().expect("subscription registry lock poisoned");
		if inner.entries.is_empty() {
			inner.closed = true;
			true
		} else {
			false
		}
	}

	pub(crate) fn close(&self) {
		self.inner.lock().expect("subscription registry lock poisoned").closed = true;
	}

	/// Snapshot for one processing tick. Addresses added afterwards are picked up on
	/// the next tick; that is the documented contract.
	pub(crate) fn snapshot(&self) -> Vec<(SubscriptionId, Arc<SubscriptionEntry>)> {
		self.inner
			.lock()
			.expect("subscription registry lock poisoned")
			.entries
			.iter()
			.map(|(&id, entry)| (id, entry.clone()))
			.collect()
	}

	pub(crate) fn insert_balance(
		self: &Arc<Self>,
		address: H160,
	) -> SubscriptionHandle<BalanceUpdate> {
		self.try_insert_balance(address).expect("registry accepts inserts until closed")
	}

	pub(crate) fn insert_transfers(
		self: &Arc<Self>,
		address: H160,
	) -> SubscriptionHandle<TransferEvent> {
		self.try_insert_transfers(address).expect("registry accepts inserts until closed")
	}

	/// `None` when the registry is closed (its watcher exited); the caller builds a
	/// fresh registry + watcher and retries.
	pub(crate) fn try_insert_balance(
		self: &Arc<Self>,
		address: H160,
	) -> Option<SubscriptionHandle<BalanceUpdate>> {
		let (sender, receiver) = watch::channel(None);
		self.try_insert(
			address,
			SubscriptionKind::Balance,
			SubscriptionSender::Balance(sender),
			UpdateReceiver::Coalesced(receiver),
		)
	}

	pub(crate) fn try_insert_transfers(
		self: &Arc<Self>,
		address: H160,
	) -> Option<SubscriptionHandle<TransferEvent>> {
		let (sender, receiver) = mpsc::channel(TRANSFER_BUFFER);
		self.try_insert(
			address,
			SubscriptionKind::Transfers,
			SubscriptionSender::Transfers(sender),
			UpdateReceiver::Buffered(receiver),
		)
	}

	fn try_insert<T>(
		self: &Arc<Self>,
		address: H160,
		kind: SubscriptionKind,
		sender: SubscriptionSender,
		receiver: UpdateReceiver<T>,
	) -> Option<SubscriptionHandle<T>> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let status = Arc::new(Mutex::new(SubscriptionStatus::Active));
		let entry =
			Arc::new(SubscriptionEntry { address, kind, sender, status: status.clone() });
		{
			let mut inner = self.inner.lock().expect("subscription registry lock poisoned");
			if inner.closed {
				return None
			}
			inner.entries.insert(id, entry);
		}

		if let Some(manager) = &self.manager {
			manager.adjust_subscription_count(1);
		}
		self.bus
			.publish(EngineEvent::SubscriptionCreated { chain: self.chain, id, kind });
		self.bus.publish(EngineEvent::TrackedAddressChanged {
			chain: self.chain,
			address,
			tracked: true,
		});

		Some(SubscriptionHandle {
			id,
			chain: self.chain,
			kind,
			created_at: Utc::now(),
			status,
			receiver,
			registry: self.clone(),
		})
	}

	fn remove(&self, id: SubscriptionId) {
		let removed = self
			.inner
			.lock()
			.expect("subscription registry lock poisoned")
			.entries
			.remove(&id);
		if let Some(entry) = removed {
			*entry.status.lock().expect("subscription status lock poisoned") =
				SubscriptionStatus::Closed;
			if let Some(manager) = &self.manager {
				manager.adjust_subscription_count(-1);
			}
			self.bus.publish(EngineEvent::SubscriptionRemoved { chain: self.chain, id });
			self.bus.publish(EngineEvent::TrackedAddressChanged {
				chain: self.chain,
				address: entry.address,
				tracked: false,
			});
		}
	}

	pub(crate) fn mark_error(&self, id: SubscriptionId, entry: &SubscriptionEntry, reason: &str) {
		*entry.status.lock().expect("subscription status lock poisoned") =
			SubscriptionStatus::Error;
		self.bus.publish(EngineEvent::SubscriptionError {
			chain: self.chain,
			id,
			reason: reason.to_string(),
		});
	}

	/// Moves every live subscription to `Error`, when the chain loses all transports.
	pub(crate) fn mark_all_error(&self, reason: &str) {
		for (id, entry) in self.snapshot() {
			self.mark_error(id, &entry, reason);
		}
	}

	/// Silent-recovery counterpart of [`Self::mark_all_error`].
	pub(crate) fn mark_all_active(&self) {
		for (_, entry) in self.snapshot() {
			let mut status = entry.status.lock().expect("subscription status lock poisoned");
			if *status == SubscriptionStatus::Error {
				*status = SubscriptionStatus::Active;
			}
		}
	}
}

enum UpdateReceiver<T> {
	Coalesced(watch::Receiver<Option<BalanceUpdate>>),
	Buffered(mpsc::Receiver<T>),
}

/// Caller-owned token for one live subscription. Updates arrive through
/// [`SubscriptionHandle::next`]; dropping the handle (or calling `unsubscribe`)
/// removes it from the registry. The watcher itself never holds handles.
pub struct SubscriptionHandle<T> {
	id: SubscriptionId,
	chain: ChainId,
	kind: SubscriptionKind,
	created_at: DateTime<Utc>,
	status: Arc<Mutex<SubscriptionStatus>>,
	receiver: UpdateReceiver<T>,
	registry: Arc<ChainSubscriptions>,
}

impl<T> SubscriptionHandle<T> {
	pub fn id(&self) -> SubscriptionId {
		self.id
	}

	pub fn chain(&self) -> ChainId {
		self.chain
	}

	pub fn kind(&self) -> SubscriptionKind {
		self.kind
	}

	pub fn created_at(&self) -> DateTime<Utc> {
		self.created_at
	}

	pub fn status(&self) -> SubscriptionStatus {
		*self.status.lock().expect("subscription status lock poisoned")
	}

	/// Explicit teardown. Equivalent to dropping the handle.
	pub fn unsubscribe(self) {}
}

impl SubscriptionHandle<BalanceUpdate> {
	/// The next balance update, coalesced to the latest known value. `None` once the
	/// watcher has gone away.
	pub async fn next(&mut self) -> Option<BalanceUpdate> {
		let UpdateReceiver::Coalesced(receiver) = &mut self.receiver else {
			unreachable!("balance handles are built with a coalesced receiver")
		};
		loop {
			receiver.changed().await.ok()?;
			if let Some(update) = receiver.borrow_and_update().clone() {
				return Some(update)
			}
		}
	}
}

impl SubscriptionHandle<TransferEvent> {
	/// The next transfer event, in emission order. `None` once the watcher has gone
	/// away.
	pub async fn next(&mut self) -> Option<TransferEvent> {
		let UpdateReceiver::Buffered(receiver) = &mut self.receiver else {
			unreachable!("transfer handles are built with a buffered receiver")
		};
		receiver.recv().await
	}
}

impl<T> Drop for SubscriptionHandle<T> {
	fn drop(&mut self) {
		self.registry.remove(self.id);
	}
}
