//! Health monitor: named critical and non-critical checks, aggregated into one
//! status. HEALTHY when everything passes, UNHEALTHY when any critical check fails,
//! DEGRADED otherwise. Optionally served over HTTP for external probes.

use std::{future::Future, net::IpAddr, pin::Pin, sync::Arc, time::Duration};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use warp::Filter;

use crate::constants::HEALTH_PROBE_TIMEOUT;

type CheckFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type CheckFn = Arc<dyn Fn() -> CheckFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
	Healthy,
	Degraded,
	Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
	pub name: String,
	pub healthy: bool,
	pub critical: bool,
	pub checked_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
	pub status: HealthStatus,
	pub components: Vec<ComponentHealth>,
	pub uptime: Duration,
}

struct HealthCheck {
	name: String,
	critical: bool,
	check: CheckFn,
}

pub struct HealthMonitor {
	checks: std::sync::Mutex<Vec<HealthCheck>>,
	started_at: tokio::time::Instant,
}

impl Default for HealthMonitor {
	fn default() -> Self {
		Self::new()
	}
}

impl HealthMonitor {
	pub fn new() -> Self {
		Self {
			checks: std::sync::Mutex::new(Vec::new()),
			started_at: tokio::time::Instant::now(),
		}
	}

	/// Registers a named check. A failing critical check makes the whole report
	/// UNHEALTHY; a failing non-critical one degrades it.
	pub fn register_check<F, Fut>(&self, name: impl Into<String>, critical: bool, check: F)
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = bool> + Send + 'static,
	{
		self.checks.lock().expect("health check lock poisoned").push(HealthCheck {
			name: name.into(),
			critical,
			check: Arc::new(move || Box::pin(check()) as CheckFuture),
		});
	}

	/// Runs every check, each bounded by its own deadline so one wedged dependency
	/// cannot stall the report.
	pub async fn report(&self) -> HealthReport {
		let checks: Vec<(String, bool, CheckFn)> = self
			.checks
			.lock()
			.expect("health check lock poisoned")
			.iter()
			.map(|check| (check.name.clone(), check.critical, check.check.clone()))
			.collect();

		let components = join_all(checks.into_iter().map(
			|(name, critical, check)| async move {
				let healthy =
					tokio::time::timeout(HEALTH_PROBE_TIMEOUT * 2, check())
						.await
						.unwrap_or(false);
				ComponentHealth { name, healthy, critical, checked_at: Utc::now() }
			},
		))
		.await;

		let status = if components.iter().all(|component| component.healthy) {
			HealthStatus::Healthy
		} else if components
			.iter()
			.any(|component| component.critical && !component.healthy)
		{
			HealthStatus::Unhealthy
		} else {
			HealthStatus::Degraded
		};

		HealthReport { status, components, uptime: self.started_at.elapsed() }
	}
}

/// Serves `GET /health` until `shutdown` flips. UNHEALTHY maps to 503 so load
/// balancers can act on the status code alone.
pub async fn serve(
	monitor: Arc<HealthMonitor>,
	hostname: &str,
	port: u16,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let address: IpAddr = hostname.parse()?;

	let route = warp::get().and(warp::path("health")).and(warp::path::end()).then(
		move || {
			let monitor = monitor.clone();
			async move {
				let report = monitor.report().await;
				let status_code = match report.status {
					HealthStatus::Unhealthy =>
						warp::http::StatusCode::SERVICE_UNAVAILABLE,
					_ => warp::http::StatusCode::OK,
				};
				warp::reply::with_status(warp::reply::json(&report), status_code)
			}
		},
	);

	let (bound, server) =
		warp::serve(route).bind_with_graceful_shutdown((address, port), async move {
			let _ = shutdown.changed().await;
		});
	tracing::info!("health endpoint listening on {bound}");
	server.await;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn all_passing_checks_is_healthy() {
		let monitor = HealthMonitor::new();
		monitor.register_check("rpc-1", true, || async { true });
		monitor.register_check("cache", false, || async { true });

		let report = monitor.report().await;
		assert_eq!(report.status, HealthStatus::Healthy);
		assert_eq!(report.components.len(), 2);
	}

	#[tokio::test]
	async fn failing_critical_check_is_unhealthy() {
		let monitor = HealthMonitor::new();
		monitor.register_check("rpc-1", true, || async { false });
		monitor.register_check("cache", false, || async { true });

		assert_eq!(monitor.report().await.status, HealthStatus::Unhealthy);
	}

	#[tokio::test]
	async fn failing_noncritical_check_is_degraded() {
		let monitor = HealthMonitor::new();
		monitor.register_check("rpc-1", true, || async { true });
		monitor.register_check("subscriptions", false, || async { false });

		assert_eq!(monitor.report().await.status, HealthStatus::Degraded);
	}

	#[tokio::test]
	async fn wedged_check_counts_as_failed() {
		let monitor = HealthMonitor::new();
		monitor.register_check("stuck", false, || async {
			tokio::time::sleep(Duration::from_secs(3600)).await;
			true
		});

		let report = monitor.report().await;
		assert_eq!(report.status, HealthStatus::Degraded);
		assert!(!report.components[0].healthy);
	}

	#[tokio::test]
	async fn health_endpoint_serves_the_report() {
		let monitor = Arc::new(HealthMonitor::new());
		monitor.register_check("rpc-1", true, || async { true });

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		// Port 0: the OS picks a free port; rebuild the server by hand to learn it.
		let address: IpAddr = "127.0.0.1".parse().unwrap();
		let monitor_for_route = monitor.clone();
		let route = warp::get().and(warp::path("health")).and(warp::path::end()).then(
			move || {
				let monitor = monitor_for_route.clone();
				async move { warp::reply::json(&monitor.report().await) }
			},
		);
		let mut shutdown = shutdown_rx;
		let (bound, server) =
			warp::serve(route).bind_with_graceful_shutdown((address, 0), async move {
				let _ = shutdown.changed().await;
			});
		let handle = tokio::spawn(server);

		let body = reqwest::get(format!("http://{bound}/health"))
			.await
			.unwrap()
			.text()
			.await
			.unwrap();
		assert!(body.contains("HEALTHY"));

		shutdown_tx.send(true).unwrap();
		let _ = handle.await;
	}
}
