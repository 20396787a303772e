//! Bounded retry with exponential backoff and jitter.
//!
//! `delay = min(base * multiplier^(attempt-1), max_delay) * (1 + rand(-jitter, jitter))`
//!
//! Only retriable kinds are retried; `Validation`, `Data` and `CircuitOpen` surface
//! immediately. A `RateLimit` failure waits out its own `retry_after` instead of the
//! backoff schedule.

use std::time::Duration;

use rand::Rng;

use crate::{errors::RpcError, settings::RetrySettings};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
	max_attempts: u32,
	base_delay: Duration,
	max_delay: Duration,
	multiplier: f64,
	jitter: f64,
}

impl RetryPolicy {
	pub fn new(settings: &RetrySettings) -> Self {
		Self {
			max_attempts: settings.max_attempts.max(1),
			base_delay: Duration::from_millis(settings.base_delay_ms),
			max_delay: Duration::from_millis(settings.max_delay_ms),
			multiplier: settings.multiplier,
			jitter: settings.jitter,
		}
	}

	/// A policy that never re-attempts; used when retries are disabled in settings.
	pub fn no_retries() -> Self {
		Self {
			max_attempts: 1,
			base_delay: Duration::ZERO,
			max_delay: Duration::ZERO,
			multiplier: 1.0,
			jitter: 0.0,
		}
	}

	pub fn max_attempts(&self) -> u32 {
		self.max_attempts
	}

	/// Whether `error` warrants another attempt after `attempt` failed attempts.
	pub fn should_retry(&self, error: &RpcError, attempt: u32) -> bool {
		attempt < self.max_attempts && error.is_retriable()
	}

	/// The wait before attempt `attempt + 1`, where `attempt` counts completed
	/// attempts (1-based).
	pub fn delay(&self, attempt: u32, error: &RpcError) -> Duration {
		if let RpcError::RateLimit { retry_after, .. } = error {
			return *retry_after
		}

		let exponent = attempt.saturating_sub(1);
		let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
		let capped = raw.min(self.max_delay.as_secs_f64());

		let jittered = if self.jitter > 0.0 {
			capped * (1.0 + rand::thread_rng().gen_range(-self.jitter..self.jitter))
		} else {
			capped
		};
		Duration::from_secs_f64(jittered.max(0.0))
	}
}
