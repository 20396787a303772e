//! Per-chain failure isolator.
//!
//! One breaker guards one chain; failures on one chain can never trip another's
//! breaker. Transitions happen inside a short synchronous critical section driven by the
//! call site on each call outcome.

use std::{sync::Mutex, time::Duration};

use tokio::time::Instant;

use crate::{errors::RpcError, settings::CircuitBreakerSettings, types::ChainId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

/// Emitted by `record_*` when a call outcome moved the breaker, so the caller can
/// publish the matching lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
	Opened,
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
	pub state: CircuitState,
	pub failure_count: u32,
	pub success_count: u32,
	pub volume_since_reset: u32,
}

struct BreakerInner {
	state: CircuitState,
	failure_count: u32,
	success_count: u32,
	volume_since_reset: u32,
	opened_at: Option<Instant>,
	// In HalfOpen exactly one probe call may be outstanding.
	probe_in_flight: bool,
}

pub struct CircuitBreaker {
	chain: ChainId,
	config: CircuitBreakerSettings,
	inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
	pub fn new(chain: ChainId, config: CircuitBreakerSettings) -> Self {
		Self {
			chain,
			config,
			inner: Mutex::new(BreakerInner {
				state: CircuitState::Closed,
				failure_count: 0,
				success_count: 0,
				volume_since_reset: 0,
				opened_at: None,
				probe_in_flight: false,
			}),
		}
	}

	fn timeout(&self) -> Duration {
		Duration::from_millis(self.config.timeout_ms)
	}

	/// Admission check, run before every attempt. Fails fast with `CircuitOpen` while
	/// the breaker is open; after the open timeout the next call through becomes the
	/// half-open probe.
	pub fn try_acquire(&self) -> Result<(), RpcError> {
		let mut inner = self.inner.lock().expect("breaker lock poisoned");
		match inner.state {
			CircuitState::Closed => {
				inner.volume_since_reset += 1;
				Ok(())
			},
			CircuitState::Open => {
				let opened_at = inner.opened_at.expect("opened_at set when opening");
				let reset_at = opened_at + self.timeout();
				let now = Instant::now();
				if now >= reset_at {
					inner.state = CircuitState::HalfOpen;
					inner.probe_in_flight = true;
					Ok(())
				} else {
					Err(RpcError::CircuitOpen {
						chain: self.chain,
						reset_in: reset_at - now,
					})
				}
			},
			CircuitState::HalfOpen =>
				if inner.probe_in_flight {
					Err(RpcError::CircuitOpen { chain: self.chain, reset_in: Duration::ZERO })
				} else {
					inner.probe_in_flight = true;
					Ok(())
				},
		}
	}

	pub fn record_success(&self) -> Option<StateChange> {
		let mut inner = self.inner.lock().expect("breaker lock poisoned");
		match inner.state {
			CircuitState::Closed => None,
			CircuitState::HalfOpen => {
				inner.probe_in_flight = false;
				inner.success_count += 1;
				if inner.success_count >= self.config.success_threshold {
					inner.state = CircuitState::Closed;
					inner.failure_count = 0;
					inner.success_count = 0;
					inner.volume_since_reset = 0;
					inner.opened_at = None;
					Some(StateChange::Closed)
				} else {
					None
				}
			},
			// A success landing while Open (e.g. a slow call issued pre-open) changes
			// nothing; the open timeout governs recovery.
			CircuitState::Open => None,
		}
	}

	pub fn record_failure(&self) -> Option<StateChange> {
		let mut inner = self.inner.lock().expect("breaker lock poisoned");
		match inner.state {
			CircuitState::Closed => {
				inner.failure_count += 1;
				if inner.volume_since_reset >= self.config.volume_threshold &&
					inner.failure_count >= self.config.failure_threshold
				{
					inner.state = CircuitState::Open;
					inner.opened_at = Some(Instant::now());
					Some(StateChange::Opened)
				} else {
					None
				}
			},
			CircuitState::HalfOpen => {
				// The probe failed; back to Open for a full timeout.
				inner.probe_in_flight = false;
				inner.success_count = 0;
				inner.state = CircuitState::Open;
				inner.opened_at = Some(Instant::now());
				Some(StateChange::Opened)
			},
			CircuitState::Open => None,
		}
	}

	pub fn state(&self) -> CircuitState {
		self.inner.lock().expect("breaker lock poisoned").state
	}

	pub fn snapshot(&self) -> BreakerSnapshot {
		let inner = self.inner.lock().expect("breaker lock poisoned");
		BreakerSnapshot {
			state: inner.state,
			failure_count: inner.failure_count,
			success_count: inner.success_count,
			volume_since_reset: inner.volume_since_reset,
		}
	}
}
