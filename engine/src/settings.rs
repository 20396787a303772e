//! Engine configuration. Loaded from an optional TOML file merged with
//! `CS__`-prefixed environment overrides (double-underscore separated), then validated.

use std::{collections::BTreeSet, path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use utilities::SecretUrl;

use crate::{
	constants::{ENV_SEPARATOR, SETTINGS_ENV_PREFIX},
	types::ChainId,
};

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TokenSettings {
	pub address: String,
	pub symbol: String,
	pub name: String,
	pub decimals: u8,
}

/// Static description of one chain: identity plus ordered endpoint lists. Endpoints are
/// tried in the order given; the first that works wins.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChainSettings {
	pub id: ChainId,
	pub name: String,
	pub native_symbol: String,
	#[serde(default = "default_native_decimals")]
	pub native_decimals: u8,
	#[serde(default)]
	pub http_endpoints: Vec<SecretUrl>,
	#[serde(default)]
	pub ws_endpoints: Vec<SecretUrl>,
	/// Default ERC-20 token list consulted when a token-balance query names no tokens.
	#[serde(default)]
	pub tokens: Vec<TokenSettings>,
}

fn default_native_decimals() -> u8 {
	18
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BalanceServiceSettings {
	pub enable_cache: bool,
	pub cache_ttl_secs: u64,
	pub enable_batching: bool,
	pub batch_window_ms: u64,
	pub max_batch_size: usize,
	pub enable_circuit_breaker: bool,
	pub enable_retry: bool,
}

impl Default for BalanceServiceSettings {
	fn default() -> Self {
		Self {
			enable_cache: true,
			cache_ttl_secs: 30,
			enable_batching: true,
			batch_window_ms: 50,
			max_batch_size: 20,
			enable_circuit_breaker: true,
			enable_retry: true,
		}
	}
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransactionServiceSettings {
	pub enable_cache: bool,
	pub cache_ttl_secs: u64,
	pub default_page_size: usize,
	pub max_transactions: usize,
}

impl Default for TransactionServiceSettings {
	fn default() -> Self {
		Self { enable_cache: true, cache_ttl_secs: 60, default_page_size: 50, max_transactions: 500 }
	}
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WsConnectionSettings {
	pub reconnect_base_delay_ms: u64,
	pub reconnect_max_delay_ms: u64,
	pub max_reconnect_attempts: u32,
	pub heartbeat_interval_ms: u64,
	pub pong_timeout_ms: u64,
	pub connection_timeout_ms: u64,
}

impl Default for WsConnectionSettings {
	fn default() -> Self {
		Self {
			reconnect_base_delay_ms: 1_000,
			reconnect_max_delay_ms: 30_000,
			max_reconnect_attempts: 10,
			heartbeat_interval_ms: 30_000,
			pong_timeout_ms: 5_000,
			connection_timeout_ms: 10_000,
		}
	}
}

impl WsConnectionSettings {
	pub fn connection_timeout(&self) -> Duration {
		Duration::from_millis(self.connection_timeout_ms)
	}

	pub fn heartbeat_deadline(&self) -> Duration {
		Duration::from_millis(self.heartbeat_interval_ms + self.pong_timeout_ms)
	}
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PollingSettings {
	pub poll_interval_ms: u64,
	pub ws_recovery_interval_ms: u64,
}

impl Default for PollingSettings {
	fn default() -> Self {
		Self { poll_interval_ms: 30_000, ws_recovery_interval_ms: 60_000 }
	}
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RateLimitSettings {
	pub capacity: f64,
	pub refill_per_sec: f64,
	pub max_wait_ms: u64,
}

impl Default for RateLimitSettings {
	fn default() -> Self {
		Self { capacity: 50.0, refill_per_sec: 25.0, max_wait_ms: 2_000 }
	}
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSettings {
	pub failure_threshold: u32,
	pub volume_threshold: u32,
	pub success_threshold: u32,
	pub timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
	fn default() -> Self {
		Self { failure_threshold: 5, volume_threshold: 10, success_threshold: 2, timeout_ms: 30_000 }
	}
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
	pub max_attempts: u32,
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
	pub multiplier: f64,
	/// Fractional jitter applied to each delay, e.g. `0.2` for ±20%.
	pub jitter: f64,
}

impl Default for RetrySettings {
	fn default() -> Self {
		Self { max_attempts: 3, base_delay_ms: 250, max_delay_ms: 10_000, multiplier: 2.0, jitter: 0.2 }
	}
}

/// Cache namespace. The prefix segregates entries between deployments sharing code
/// (e.g. `testnet` vs `production`).
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
	pub environment: String,
	pub capacity: usize,
}

impl Default for CacheSettings {
	fn default() -> Self {
		Self { environment: "production".to_string(), capacity: 4_096 }
	}
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EndpointSettings {
	pub enabled: bool,
	pub hostname: String,
	pub port: u16,
}

impl Default for EndpointSettings {
	fn default() -> Self {
		Self { enabled: false, hostname: "127.0.0.1".to_string(), port: 0 }
	}
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct Settings {
	#[serde(default)]
	pub chains: Vec<ChainSettings>,
	#[serde(default)]
	pub cache: CacheSettings,
	#[serde(default)]
	pub balance_service: BalanceServiceSettings,
	#[serde(default)]
	pub transaction_service: TransactionServiceSettings,
	#[serde(default)]
	pub ws_connection: WsConnectionSettings,
	#[serde(default)]
	pub polling: PollingSettings,
	#[serde(default)]
	pub rate_limit: RateLimitSettings,
	#[serde(default)]
	pub circuit_breaker: CircuitBreakerSettings,
	#[serde(default)]
	pub retry: RetrySettings,
	#[serde(default)]
	pub metrics: EndpointSettings,
	#[serde(default)]
	pub health: EndpointSettings,
}

impl Settings {
	/// Loads settings from `path` (if given) with environment overrides applied on top,
	/// then validates.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut builder = Config::builder();
		if let Some(path) = path {
			builder = builder.add_source(File::from(path));
		}
		let settings: Settings = builder
			.add_source(
				Environment::with_prefix(SETTINGS_ENV_PREFIX).separator(ENV_SEPARATOR),
			)
			.build()?
			.try_deserialize()?;

		settings.validate()?;
		Ok(settings)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.chains.is_empty() {
			return Err(ConfigError::Message("at least one chain must be configured".into()))
		}

		let mut seen = BTreeSet::new();
		for chain in &self.chains {
			if !seen.insert(chain.id) {
				return Err(ConfigError::Message(format!(
					"chain id {} is configured twice",
					chain.id
				)))
			}
			if chain.http_endpoints.is_empty() && chain.ws_endpoints.is_empty() {
				return Err(ConfigError::Message(format!(
					"chain {} ({}) has no endpoints",
					chain.id, chain.name
				)))
			}
			for endpoint in &chain.http_endpoints {
				validate_endpoint(endpoint, &["http", "https"], chain.id)?;
			}
			for endpoint in &chain.ws_endpoints {
				validate_endpoint(endpoint, &["ws", "wss"], chain.id)?;
			}
		}

		if self.rate_limit.capacity <= 0.0 || self.rate_limit.refill_per_sec <= 0.0 {
			return Err(ConfigError::Message(
				"rate_limit capacity and refill_per_sec must be positive".into(),
			))
		}
		if self.retry.max_attempts == 0 {
			return Err(ConfigError::Message("retry.max_attempts must be at least 1".into()))
		}
		if !(0.0..1.0).contains(&self.retry.jitter) {
			return Err(ConfigError::Message("retry.jitter must be in [0, 1)".into()))
		}
		if self.circuit_breaker.failure_threshold == 0 ||
			self.circuit_breaker.success_threshold == 0
		{
			return Err(ConfigError::Message(
				"circuit_breaker thresholds must be at least 1".into(),
			))
		}
		if self.balance_service.max_batch_size == 0 {
			return Err(ConfigError::Message(
				"balance_service.max_batch_size must be at least 1".into(),
			))
		}
		if self.transaction_service.default_page_size == 0 ||
			self.transaction_service.default_page_size > self.transaction_service.max_transactions
		{
			return Err(ConfigError::Message(
				"transaction_service.default_page_size must be in 1..=max_transactions".into(),
			))
		}
		if self.cache.capacity == 0 {
			return Err(ConfigError::Message("cache.capacity must be at least 1".into()))
		}

		Ok(())
	}

	pub fn chain(&self, chain_id: ChainId) -> Option<&ChainSettings> {
		self.chains.iter().find(|chain| chain.id == chain_id)
	}
}

fn validate_endpoint(
	endpoint: &SecretUrl,
	expected_schemes: &[&str],
	chain_id: ChainId,
) -> Result<(), ConfigError> {
	let url = url::Url::parse(endpoint.as_ref()).map_err(|e| {
		ConfigError::Message(format!("chain {chain_id}: invalid endpoint {endpoint}: {e}"))
	})?;
	if !expected_schemes.contains(&url.scheme()) {
		return Err(ConfigError::Message(format!(
			"chain {chain_id}: endpoint {endpoint} must use one of {expected_schemes:?}",
		)))
	}
	Ok(())
}
