//! TTL + LRU response cache.
//!
//! Lookups and inserts are synchronous and never held across an await. Keys are opaque
//! strings assembled by the caller from every semantically significant input (environment
//! prefix, chain, operation, canonical arguments), so equal queries collide and
//! differing ones cannot.

use std::{
	collections::{HashMap, VecDeque},
	sync::{
		atomic::{AtomicU64, Ordering},
		Mutex,
	},
	time::Duration,
};

// tokio's Instant so paused-clock tests can drive expiry deterministically.
use tokio::time::Instant;

struct CacheEntry<V> {
	value: V,
	inserted_at: Instant,
	expires_at: Instant,
	hits: u64,
	// Monotonic access stamp used for LRU eviction.
	access_seq: u64,
}

struct CacheInner<V> {
	entries: HashMap<String, CacheEntry<V>>,
	// Access log with lazy deletion: stale pairs are skipped during eviction.
	access_order: VecDeque<(String, u64)>,
	next_seq: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
	pub hits: u64,
	pub misses: u64,
	pub evictions: u64,
	pub expirations: u64,
	pub entries: usize,
}

/// A bounded TTL cache for one operation family. Values must be cheap to clone; large
/// payloads should be wrapped in `Arc` by the caller.
pub struct TtlCache<V> {
	inner: Mutex<CacheInner<V>>,
	ttl: Duration,
	capacity: usize,
	hits: AtomicU64,
	misses: AtomicU64,
	evictions: AtomicU64,
	expirations: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
	pub fn new(ttl: Duration, capacity: usize) -> Self {
		assert!(capacity > 0, "cache capacity must be non-zero");
		Self {
			inner: Mutex::new(CacheInner {
				entries: HashMap::new(),
				access_order: VecDeque::new(),
				next_seq: 0,
			}),
			ttl,
			capacity,
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			evictions: AtomicU64::new(0),
			expirations: AtomicU64::new(0),
		}
	}

	pub fn get(&self, key: &str) -> Option<V> {
		let mut inner = self.inner.lock().expect("cache lock poisoned");
		let now = Instant::now();

		let expired = match inner.entries.get(key) {
			Some(entry) => now >= entry.expires_at,
			None => {
				self.misses.fetch_add(1, Ordering::Relaxed);
				return None
			},
		};
		if expired {
			inner.entries.remove(key);
			self.expirations.fetch_add(1, Ordering::Relaxed);
			self.misses.fetch_add(1, Ordering::Relaxed);
			return None
		}

		let seq = inner.next_seq;
		inner.next_seq += 1;
		inner.access_order.push_back((key.to_string(), seq));
		let entry = inner.entries.get_mut(key).expect("checked above");
		entry.hits += 1;
		entry.access_seq = seq;
		let value = entry.value.clone();

		self.hits.fetch_add(1, Ordering::Relaxed);
		Some(value)
	}

	/// Inserts or replaces an entry; replacement restarts the TTL.
	pub fn insert(&self, key: String, value: V) {
		let mut inner = self.inner.lock().expect("cache lock poisoned");
		let now = Instant::now();

		let seq = inner.next_seq;
		inner.next_seq += 1;
		inner.access_order.push_back((key.clone(), seq));
		inner.entries.insert(
			key,
			CacheEntry {
				value,
				inserted_at: now,
				expires_at: now + self.ttl,
				hits: 0,
				access_seq: seq,
			},
		);

		while inner.entries.len() > self.capacity {
			// Skip stale access-log pairs until the true least-recently-used key
			// surfaces.
			match inner.access_order.pop_front() {
				Some((candidate, seq)) => {
					let is_current = inner
						.entries
						.get(&candidate)
						.is_some_and(|entry| entry.access_seq == seq);
					if is_current {
						inner.entries.remove(&candidate);
						self.evictions.fetch_add(1, Ordering::Relaxed);
					}
				},
				None => break,
			}
		}
	}

	/// Counts a lookup that was deliberately bypassed (`force_fresh`) as a miss, so
	/// hit/miss stats reflect every request that could have been served from cache.
	pub fn note_miss(&self) {
		self.misses.fetch_add(1, Ordering::Relaxed);
	}

	pub fn remove(&self, key: &str) {
		self.inner.lock().expect("cache lock poisoned").entries.remove(key);
	}

	pub fn clear(&self) {
		let mut inner = self.inner.lock().expect("cache lock poisoned");
		inner.entries.clear();
		inner.access_order.clear();
	}

	/// Age of an entry, for health/diagnostic reporting.
	pub fn entry_age(&self, key: &str) -> Option<Duration> {
		let inner = self.inner.lock().expect("cache lock poisoned");
		inner.entries.get(key).map(|entry| entry.inserted_at.elapsed())
	}

	pub fn stats(&self) -> CacheStats {
		let entries = self.inner.lock().expect("cache lock poisoned").entries.len();
		CacheStats {
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			evictions: self.evictions.load(Ordering::Relaxed),
			expirations: self.expirations.load(Ordering::Relaxed),
			entries,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cache(ttl_ms: u64, capacity: usize) -> TtlCache<u64> {
		TtlCache::new(Duration::from_millis(ttl_ms), capacity)
	}

	#[test]
	fn get_after_insert_hits() {
		let cache = cache(1_000, 8);
		cache.insert("k".into(), 7);
		assert_eq!(cache.get("k"), Some(7));
		assert_eq!(cache.get("other"), None);

		let stats = cache.stats();
		assert_eq!(stats.hits, 1);
		assert_eq!(stats.misses, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn entries_expire_after_ttl() {
		let cache = cache(50, 8);
		cache.insert("k".into(), 7);

		tokio::time::advance(Duration::from_millis(60)).await;

		assert_eq!(cache.get("k"), None);
		assert_eq!(cache.stats().expirations, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn replacement_restarts_ttl() {
		let cache = cache(50, 8);
		cache.insert("k".into(), 1);

		tokio::time::advance(Duration::from_millis(40)).await;
		cache.insert("k".into(), 2);
		tokio::time::advance(Duration::from_millis(40)).await;

		// 80ms after the first insert, but only 40ms after the replacement.
		assert_eq!(cache.get("k"), Some(2));
	}

	#[test]
	fn lru_eviction_prefers_least_recently_used() {
		let cache = cache(10_000, 2);
		cache.insert("a".into(), 1);
		cache.insert("b".into(), 2);

		// Touch "a" so "b" becomes the LRU entry.
		assert_eq!(cache.get("a"), Some(1));
		cache.insert("c".into(), 3);

		assert_eq!(cache.get("a"), Some(1));
		assert_eq!(cache.get("b"), None);
		assert_eq!(cache.get("c"), Some(3));
		assert_eq!(cache.stats().evictions, 1);
	}

	#[test]
	fn distinct_keys_do_not_collide() {
		let cache = cache(10_000, 8);
		cache.insert("production:1:get_balance:0xabc".into(), 1);
		assert_eq!(cache.get("testnet:1:get_balance:0xabc"), None);
		assert_eq!(cache.get("production:1:get_balance:0xabc:filter=f"), None);
	}
}
