//! The resilience stack wrapping every outbound RPC call.
//!
//! Stage order is fixed: validate → rate-limit → coalesce → cache → circuit-breaker →
//! retry → timeout → transport. Validation happens at the service boundary before a
//! call reaches [`ResilienceStack::execute`]; the remaining stages live here. Higher
//! layers never call a raw transport directly.

pub mod batcher;
pub mod cache;
pub mod circuit_breaker;
pub mod coalescer;
pub mod rate_limiter;
pub mod retry;

use std::{
	future::Future,
	sync::atomic::{AtomicU64, Ordering},
	time::Duration,
};

pub use batcher::Batcher;
pub use cache::{CacheStats, TtlCache};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState, StateChange};
pub use coalescer::{Coalescer, Joined};
pub use rate_limiter::TokenBucket;
pub use retry::RetryPolicy;

use crate::{
	errors::RpcError,
	event_bus::{EngineEvent, EventBus},
	settings::Settings,
	types::ChainId,
};

/// Composes the chain-scoped pieces of the pipeline. One stack exists per chain;
/// caches and coalescers are per operation family and are passed in by the adapter.
pub struct ResilienceStack {
	chain: ChainId,
	limiter: TokenBucket,
	breaker: CircuitBreaker,
	retry: RetryPolicy,
	call_timeout: Duration,
	breaker_enabled: bool,
	bus: EventBus,
	retries: AtomicU64,
	timeouts: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StackStats {
	pub retries: u64,
	pub timeouts: u64,
	pub throttled: u64,
	pub rate_limit_rejections: u64,
	pub breaker: Option<BreakerSnapshot>,
}

impl ResilienceStack {
	pub fn new(chain: ChainId, settings: &Settings, bus: EventBus) -> Self {
		let retry = if settings.balance_service.enable_retry {
			RetryPolicy::new(&settings.retry)
		} else {
			RetryPolicy::no_retries()
		};
		Self {
			chain,
			limiter: TokenBucket::new(chain, &settings.rate_limit),
			breaker: CircuitBreaker::new(chain, settings.circuit_breaker.clone()),
			retry,
			call_timeout: crate::constants::RPC_TIMEOUT,
			breaker_enabled: settings.balance_service.enable_circuit_breaker,
			bus,
			retries: AtomicU64::new(0),
			timeouts: AtomicU64::new(0),
		}
	}

	/// Builds the deterministic cache/coalescing key for one operation. Every
	/// semantically significant input must appear in `args`.
	pub fn cache_key(environment: &str, chain: ChainId, op: &str, args: &[&str]) -> String {
		let mut key = format!("{environment}:{chain}:{op}");
		for arg in args {
			key.push(':');
			key.push_str(&utilities::normalise_hex(arg));
		}
		key
	}

	/// Runs `call` through coalesce → cache → breaker → retry → timeout.
	///
	/// `force_fresh` skips both cache lookup and store, and deliberately skips
	/// coalescing too: the caller asked for its own fresh round-trip.
	pub async fn execute<V, F, Fut>(
		&self,
		cache: Option<&TtlCache<V>>,
		coalescer: &Coalescer<V>,
		key: &str,
		force_fresh: bool,
		call: F,
	) -> Result<V, RpcError>
	where
		V: Clone + Send + 'static,
		F: Fn() -> Fut,
		Fut: Future<Output = Result<V, RpcError>>,
	{
		self.limiter.acquire().await?;

		if force_fresh {
			if let Some(cache) = cache {
				cache.note_miss();
			}
			return self.call_guarded(self.call_timeout, &call).await
		}

		match coalescer.join(key) {
			Joined::Waiter(receiver) => Coalescer::await_leader(receiver).await,
			Joined::Leader(guard) => {
				if let Some(cache) = cache {
					if let Some(value) = cache.get(key) {
						guard.complete(Ok(value.clone()));
						return Ok(value)
					}
				}

				let result = self.call_guarded(self.call_timeout, &call).await;
				if let (Some(cache), Ok(value)) = (cache, &result) {
					cache.insert(key.to_string(), value.clone());
				}
				guard.complete(result.clone());
				result
			},
		}
	}

	/// Breaker → retry → timeout, with no coalescing or caching. For calls whose results
	/// are inherently unshareable (block-pinned reads, log scans) and for the inner
	/// round trips of compound operations.
	pub async fn call<V, F, Fut>(&self, call: F) -> Result<V, RpcError>
	where
		V: Send + 'static,
		F: Fn() -> Fut,
		Fut: Future<Output = Result<V, RpcError>>,
	{
		self.limiter.acquire().await?;
		self.call_guarded(self.call_timeout, &call).await
	}

	/// Short-deadline single-attempt variant for health probes. Still admission-checked
	/// by limiter and breaker so a probing loop cannot starve or bypass them.
	pub async fn probe<V, F, Fut>(&self, deadline: Duration, call: F) -> Result<V, RpcError>
	where
		V: Send + 'static,
		F: Fn() -> Fut,
		Fut: Future<Output = Result<V, RpcError>>,
	{
		self.limiter.acquire().await?;
		if self.breaker_enabled {
			self.breaker.try_acquire()?;
		}
		let result = self.attempt(deadline, &call).await;
		self.record_outcome(&result);
		result
	}

	async fn call_guarded<V, F, Fut>(
		&self,
		deadline: Duration,
		call: &F,
	) -> Result<V, RpcError>
	where
		V: Send + 'static,
		F: Fn() -> Fut,
		Fut: Future<Output = Result<V, RpcError>>,
	{
		let mut attempt: u32 = 1;
		loop {
			if self.breaker_enabled {
				self.breaker.try_acquire()?;
			}

			let result = self.attempt(deadline, call).await;
			self.record_outcome(&result);

			match result {
				Ok(value) => return Ok(value),
				Err(error) => {
					if !self.retry.should_retry(&error, attempt) {
						return Err(error)
					}
					let delay = self.retry.delay(attempt, &error);
					self.retries.fetch_add(1, Ordering::Relaxed);
					tracing::debug!(
						chain = self.chain,
						attempt,
						delay_ms = delay.as_millis() as u64,
						%error,
						"retrying after transient failure"
					);
					tokio::time::sleep(delay).await;
					attempt += 1;
				},
			}
		}
	}

	async fn attempt<V, F, Fut>(&self, deadline: Duration, call: &F) -> Result<V, RpcError>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<V, RpcError>>,
	{
		match tokio::time::timeout(deadline, call()).await {
			Ok(result) => result,
			Err(_) => {
				self.timeouts.fetch_add(1, Ordering::Relaxed);
				Err(RpcError::connection(
					self.chain,
					format!("request timed out after {deadline:?}"),
				))
			},
		}
	}

	fn record_outcome<V>(&self, result: &Result<V, RpcError>) {
		if !self.breaker_enabled {
			return
		}
		let change = match result {
			Ok(_) => self.breaker.record_success(),
			// Cancellation is not the chain's fault; everything else that got past
			// admission counts against the breaker.
			Err(RpcError::Cancelled) => None,
			Err(_) => self.breaker.record_failure(),
		};
		match change {
			Some(StateChange::Opened) => {
				tracing::warn!(chain = self.chain, "circuit breaker opened");
				self.bus.publish(EngineEvent::CircuitOpened { chain: self.chain });
			},
			Some(StateChange::Closed) => {
				tracing::info!(chain = self.chain, "circuit breaker closed");
				self.bus.publish(EngineEvent::CircuitClosed { chain: self.chain });
			},
			None => {},
		}
	}

	pub fn breaker_state(&self) -> CircuitState {
		self.breaker.state()
	}

	pub fn stats(&self) -> StackStats {
		let (throttled, rejected) = self.limiter.stats();
		StackStats {
			retries: self.retries.load(Ordering::Relaxed),
			timeouts: self.timeouts.load(Ordering::Relaxed),
			throttled,
			rate_limit_rejections: rejected,
			breaker: Some(self.breaker.snapshot()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{
		atomic::{AtomicUsize, Ordering as AtomicOrdering},
		Arc,
	};

	fn test_stack(chain: ChainId) -> ResilienceStack {
		let settings = Settings {
			chains: vec![],
			retry: crate::settings::RetrySettings {
				max_attempts: 3,
				base_delay_ms: 1,
				max_delay_ms: 5,
				multiplier: 2.0,
				jitter: 0.0,
			},
			circuit_breaker: crate::settings::CircuitBreakerSettings {
				failure_threshold: 2,
				volume_threshold: 4,
				success_threshold: 1,
				timeout_ms: 50,
			},
			..Default::default()
		};
		ResilienceStack::new(chain, &settings, EventBus::new())
	}

	fn counting_call(
		calls: Arc<AtomicUsize>,
	) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = Result<u64, RpcError>> + Send>>
	{
		move || {
			let calls = calls.clone();
			Box::pin(async move {
				calls.fetch_add(1, AtomicOrdering::SeqCst);
				Ok(7u64)
			})
		}
	}

	#[test]
	fn cache_keys_compose_every_significant_input() {
		let key = ResilienceStack::cache_key(
			"production",
			1,
			"get_balance",
			&["0xABCDef0123456789abcdef0123456789ABCDEF01"],
		);
		assert_eq!(
			key,
			"production:1:get_balance:0xabcdef0123456789abcdef0123456789abcdef01"
		);

		// Environments are disjoint namespaces.
		let testnet = ResilienceStack::cache_key(
			"testnet",
			1,
			"get_balance",
			&["0xabcdef0123456789abcdef0123456789abcdef01"],
		);
		assert_ne!(key, testnet);

		// Any extra argument (a filter, a page) changes the key.
		let with_filter =
			ResilienceStack::cache_key("production", 1, "get_balance", &["0xabc", "page=2"]);
		assert_ne!(key, with_filter);
	}

	#[tokio::test]
	async fn cache_hit_skips_the_transport() {
		let stack = test_stack(1);
		let cache = TtlCache::new(Duration::from_secs(30), 16);
		let coalescer = Coalescer::new();
		let calls = Arc::new(AtomicUsize::new(0));

		for _ in 0..3 {
			let value = stack
				.execute(Some(&cache), &coalescer, "k", false, counting_call(calls.clone()))
				.await
				.unwrap();
			assert_eq!(value, 7);
		}

		assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
		assert_eq!(cache.stats().hits, 2);
	}

	#[tokio::test]
	async fn force_fresh_always_calls_and_never_caches() {
		let stack = test_stack(1);
		let cache = TtlCache::new(Duration::from_secs(30), 16);
		let coalescer = Coalescer::new();
		let calls = Arc::new(AtomicUsize::new(0));

		stack
			.execute(Some(&cache), &coalescer, "k", true, counting_call(calls.clone()))
			.await
			.unwrap();
		stack
			.execute(Some(&cache), &coalescer, "k", true, counting_call(calls.clone()))
			.await
			.unwrap();

		assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
		// Nothing was stored, so a regular call leads and misses.
		assert_eq!(cache.stats().entries, 0);
	}

	#[tokio::test]
	async fn concurrent_identical_requests_coalesce_to_one_call() {
		let stack = Arc::new(test_stack(1));
		let cache = Arc::new(TtlCache::new(Duration::from_secs(30), 16));
		let coalescer = Arc::new(Coalescer::new());
		let calls = Arc::new(AtomicUsize::new(0));

		let (release_tx, release_rx) = tokio::sync::watch::channel(false);

		let tasks: Vec<_> = (0..8)
			.map(|_| {
				let stack = stack.clone();
				let cache = cache.clone();
				let coalescer = coalescer.clone();
				let calls = calls.clone();
				let release = release_rx.clone();
				tokio::spawn(async move {
					stack
						.execute(Some(cache.as_ref()), &coalescer, "k", false, move || {
							let calls = calls.clone();
							let mut release = release.clone();
							async move {
								calls.fetch_add(1, AtomicOrdering::SeqCst);
								// Hold the leader open until every waiter has joined.
								while !*release.borrow() {
									if release.changed().await.is_err() {
										break
									}
								}
								Ok(7u64)
							}
						})
						.await
				})
			})
			.collect();

		// Give all tasks a chance to join the in-flight entry, then release.
		tokio::time::sleep(Duration::from_millis(50)).await;
		release_tx.send(true).unwrap();

		for task in tasks {
			assert_eq!(task.await.unwrap().unwrap(), 7);
		}
		assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
	}

	#[tokio::test]
	async fn retries_until_success_within_attempt_limit() {
		let stack = test_stack(1);
		let coalescer = Coalescer::new();
		let calls = Arc::new(AtomicUsize::new(0));

		let calls_in = calls.clone();
		let result = stack
			.execute(None, &coalescer, "k", false, move || {
				let calls = calls_in.clone();
				async move {
					if calls.fetch_add(1, AtomicOrdering::SeqCst) < 2 {
						Err(RpcError::connection(1, "flaky"))
					} else {
						Ok(1u64)
					}
				}
			})
			.await;

		assert_eq!(result.unwrap(), 1);
		assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
		assert_eq!(stack.stats().retries, 2);
	}

	#[tokio::test]
	async fn validation_style_errors_are_not_retried() {
		let stack = test_stack(1);
		let coalescer = Coalescer::new();
		let calls = Arc::new(AtomicUsize::new(0));

		let calls_in = calls.clone();
		let result: Result<u64, _> = stack
			.execute(None, &coalescer, "k", false, move || {
				let calls = calls_in.clone();
				async move {
					calls.fetch_add(1, AtomicOrdering::SeqCst);
					Err(RpcError::data(1, "garbled"))
				}
			})
			.await;

		assert!(matches!(result, Err(RpcError::Data { .. })));
		assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
	}

	#[tokio::test]
	async fn breaker_opens_and_fails_fast_per_chain() {
		let stack = test_stack(1);
		let other_chain = test_stack(137);
		let coalescer = Coalescer::new();

		// Drive the breaker open: volume 4, failures ≥ 2 (each execute makes up to
		// 3 attempts, all failing).
		for i in 0..4 {
			let key = format!("k{i}");
			let _: Result<u64, _> = stack
				.execute(None, &coalescer, &key, false, || async {
					Err(RpcError::connection(1, "down"))
				})
				.await;
		}
		assert_eq!(stack.breaker_state(), CircuitState::Open);

		let started = std::time::Instant::now();
		let result: Result<u64, _> = stack
			.execute(None, &coalescer, "fresh", false, || async { Ok(1u64) })
			.await;
		assert!(matches!(result, Err(RpcError::CircuitOpen { chain: 1, .. })));
		assert!(started.elapsed() < Duration::from_millis(50));

		// The other chain's breaker is untouched.
		assert_eq!(other_chain.breaker_state(), CircuitState::Closed);
		let ok: Result<u64, _> = other_chain
			.execute(None, &coalescer, "fresh", false, || async { Ok(2u64) })
			.await;
		assert_eq!(ok.unwrap(), 2);
	}

	#[tokio::test]
	async fn timeout_produces_a_retriable_connection_error() {
		let mut stack = test_stack(1);
		stack.call_timeout = Duration::from_millis(20);
		stack.retry = RetryPolicy::no_retries();
		let coalescer = Coalescer::new();

		let result: Result<u64, _> = stack
			.execute(None, &coalescer, "k", false, || async {
				tokio::time::sleep(Duration::from_secs(5)).await;
				Ok(1u64)
			})
			.await;

		match result {
			Err(error @ RpcError::Connection { .. }) => assert!(error.is_retriable()),
			other => panic!("expected timeout as Connection error, got {other:?}"),
		}
		assert_eq!(stack.stats().timeouts, 1);
	}
}
