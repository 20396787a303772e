//! Deduplication of identical in-flight requests.
//!
//! The first caller for a key becomes the *leader* and performs the actual work; every
//! concurrent caller with the same key becomes a *waiter* and receives a clone of the
//! leader's result. The map lookup is synchronous; only waiting suspends. Entries are
//! removed on completion, success or failure alike.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
};

use tokio::sync::broadcast;

use crate::errors::RpcError;

type SharedResult<V> = Result<V, RpcError>;

struct InFlightCell<V> {
	sender: broadcast::Sender<SharedResult<V>>,
}

pub struct Coalescer<V> {
	in_flight: Arc<Mutex<HashMap<String, Arc<InFlightCell<V>>>>>,
	coalesced: AtomicU64,
	led: AtomicU64,
}

/// Outcome of joining a key: either you do the work, or you wait for whoever does.
pub enum Joined<V> {
	Leader(LeaderGuard<V>),
	Waiter(broadcast::Receiver<SharedResult<V>>),
}

impl<V: Clone + Send + 'static> Default for Coalescer<V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<V: Clone + Send + 'static> Coalescer<V> {
	pub fn new() -> Self {
		Self {
			in_flight: Arc::new(Mutex::new(HashMap::new())),
			coalesced: AtomicU64::new(0),
			led: AtomicU64::new(0),
		}
	}

	pub fn join(&self, key: &str) -> Joined<V> {
		let mut map = self.in_flight.lock().expect("coalescer lock poisoned");
		if let Some(cell) = map.get(key) {
			self.coalesced.fetch_add(1, Ordering::Relaxed);
			return Joined::Waiter(cell.sender.subscribe())
		}

		let (sender, _receiver) = broadcast::channel(1);
		map.insert(key.to_string(), Arc::new(InFlightCell { sender: sender.clone() }));
		self.led.fetch_add(1, Ordering::Relaxed);
		Joined::Leader(LeaderGuard {
			key: key.to_string(),
			in_flight: self.in_flight.clone(),
			sender,
			completed: false,
		})
	}

	/// Awaits the leader's result. A closed channel means the leader went away without
	/// completing, which surfaces as cancellation.
	pub async fn await_leader(
		mut receiver: broadcast::Receiver<SharedResult<V>>,
	) -> SharedResult<V> {
		match receiver.recv().await {
			Ok(result) => result,
			Err(_) => Err(RpcError::Cancelled),
		}
	}

	pub fn in_flight_count(&self) -> usize {
		self.in_flight.lock().expect("coalescer lock poisoned").len()
	}

	/// (requests led, requests that piggybacked on a leader)
	pub fn stats(&self) -> (u64, u64) {
		(self.led.load(Ordering::Relaxed), self.coalesced.load(Ordering::Relaxed))
	}
}

/// Held by the leading caller for the duration of the underlying call. Completing (or
/// dropping) removes the in-flight entry so later callers start fresh.
pub struct LeaderGuard<V> {
	key: String,
	in_flight: Arc<Mutex<HashMap<String, Arc<InFlightCell<V>>>>>,
	sender: broadcast::Sender<SharedResult<V>>,
	completed: bool,
}

impl<V> LeaderGuard<V> {
	fn remove_entry(&self) {
		self.in_flight.lock().expect("coalescer lock poisoned").remove(&self.key);
	}
}

impl<V: Clone> LeaderGuard<V> {
	pub fn complete(mut self, result: SharedResult<V>) {
		self.completed = true;
		self.remove_entry();
		// No waiters is fine.
		let _ = self.sender.send(result);
	}
}

impl<V> Drop for LeaderGuard<V> {
	fn drop(&mut self) {
		if !self.completed {
			// The leader was cancelled mid-flight; unblock any waiters.
			self.remove_entry();
			let _ = self.sender.send(Err(RpcError::Cancelled));
		}
	}
}
