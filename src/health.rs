//! Upstream health tracking
//!
//! A periodic probe loop lists tools on every enabled upstream under a
//! deadline and feeds the verdicts to the circuit breaker with the same
//! classification as regular calls. The resulting snapshot backs
//! `list_providers` and the health metrics. The loop honors a stop signal
//! between iterations and never interrupts an in-flight probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::config::TransportKind;
use crate::metrics;
use crate::reload::ConfigHandle;
use crate::upstream::manager::UpstreamManager;
use crate::upstream::operation_ok;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn label(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone)]
struct HealthEntry {
    status: HealthStatus,
    last_ok_at: Option<DateTime<Utc>>,
    last_error_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Default for HealthEntry {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_ok_at: None,
            last_error_at: None,
            last_error: None,
        }
    }
}

/// Health state as reported by `list_providers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: String,
    pub last_ok_at: Option<String>,
    pub last_error_at: Option<String>,
    pub last_error: Option<String>,
}

fn rfc3339(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Shared per-upstream health map. Clone-cheap.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    entries: Arc<RwLock<HashMap<String, HealthEntry>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_healthy(&self, upstream: &str) {
        let mut entries = self.entries.write();
        let entry = entries.entry(upstream.to_string()).or_default();
        entry.status = HealthStatus::Healthy;
        entry.last_ok_at = Some(Utc::now());
        metrics::set_health_status(upstream, HealthStatus::Healthy.label());
    }

    pub fn mark_unhealthy(&self, upstream: &str, message: &str) {
        let mut entries = self.entries.write();
        let entry = entries.entry(upstream.to_string()).or_default();
        entry.status = HealthStatus::Unhealthy;
        entry.last_error_at = Some(Utc::now());
        entry.last_error = Some(message.to_string());
        metrics::set_health_status(upstream, HealthStatus::Unhealthy.label());
    }

    pub fn snapshot(&self, upstream: &str) -> HealthSnapshot {
        let entries = self.entries.read();
        match entries.get(upstream) {
            None => HealthSnapshot {
                status: HealthStatus::Unknown.label().to_string(),
                last_ok_at: None,
                last_error_at: None,
                last_error: None,
            },
            Some(entry) => HealthSnapshot {
                status: entry.status.label().to_string(),
                last_ok_at: rfc3339(entry.last_ok_at),
                last_error_at: rfc3339(entry.last_error_at),
                last_error: entry.last_error.clone(),
            },
        }
    }
}

/// Running probe loop. Cancelling waits for the current iteration; an
/// in-flight probe is never interrupted.
pub struct HealthHandle {
    ct: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl HealthHandle {
    pub async fn stop(self) {
        self.ct.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the probe loop with its own stop token.
pub fn start_health_checker(
    config: ConfigHandle,
    manager: Arc<UpstreamManager>,
    breaker: CircuitBreaker,
    registry: HealthRegistry,
) -> HealthHandle {
    let ct = CancellationToken::new();
    let checker = HealthChecker::new(config, manager, breaker, registry, ct.clone());
    HealthHandle {
        ct,
        task: checker.spawn(),
    }
}

/// The probe loop. Owns nothing; all state is shared.
pub struct HealthChecker {
    config: ConfigHandle,
    manager: Arc<UpstreamManager>,
    breaker: CircuitBreaker,
    registry: HealthRegistry,
    ct: CancellationToken,
}

impl HealthChecker {
    pub fn new(
        config: ConfigHandle,
        manager: Arc<UpstreamManager>,
        breaker: CircuitBreaker,
        registry: HealthRegistry,
        ct: CancellationToken,
    ) -> Self {
        Self {
            config,
            manager,
            breaker,
            registry,
            ct,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        tracing::info!("health checker started");
        loop {
            let interval = {
                let cfg = self.config.load();
                Duration::from_millis(cfg.routing.health_checks.interval_ms.max(100))
            };
            tokio::select! {
                _ = self.ct.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let cfg = self.config.load();
            if !cfg.routing.health_checks.enabled {
                continue;
            }
            self.sweep(&cfg).await;
        }
        tracing::info!("health checker stopped");
    }

    /// One probe round over the current snapshot.
    pub async fn sweep(&self, cfg: &crate::config::NormalizedConfig) {
        let checks = &cfg.routing.health_checks;
        for (name, upstream) in &cfg.upstreams {
            if !upstream.enabled {
                continue;
            }
            if upstream.transport == TransportKind::Pipe && !checks.include_stdio {
                continue;
            }

            let attempt = match self
                .breaker
                .begin_attempt(name, &cfg.routing.circuit_breaker)
            {
                Ok(attempt) => attempt,
                Err(rejection) => {
                    tracing::debug!(upstream = %name, %rejection, "health probe skipped");
                    continue;
                }
            };

            let client = match self.manager.get(name, cfg).await {
                Ok(client) => client,
                Err(err) => {
                    attempt.end(false);
                    self.registry.mark_unhealthy(name, &err.to_string());
                    metrics::record_health_check(name, false);
                    continue;
                }
            };

            let probe = tokio::time::timeout(
                Duration::from_millis(checks.timeout_ms.max(1)),
                client.list_tools(),
            )
            .await;

            let result = match probe {
                Err(_) => Err(crate::upstream::UpstreamError::Unavailable(format!(
                    "health probe timed out after {}ms",
                    checks.timeout_ms
                ))),
                Ok(inner) => inner,
            };

            let ok = operation_ok(&result);
            attempt.end(ok);
            metrics::record_health_check(name, ok);
            match (ok, result) {
                (true, _) => {
                    self.registry.mark_healthy(name);
                }
                (false, Err(err)) => {
                    tracing::warn!(upstream = %name, error = %err, "health probe failed");
                    self.registry.mark_unhealthy(name, &err.to_string());
                }
                // unreachable: ok=false implies Err
                (false, Ok(_)) => {}
            }
        }
    }
}
