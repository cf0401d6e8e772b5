//! Front-end transports
//!
//! Two independent listeners over the same shared control plane: a pipe
//! front-end bound to the process's own stdio, and a sessioned
//! streamable-HTTP front-end with the legacy SSE pair. Shutdown order is
//! fixed: sessions first, then the upstream pool, then the health checker.

pub mod http;
pub mod stdio;

use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::config::NormalizedConfig;
use crate::health::HealthRegistry;
use crate::ratelimit::RateLimiter;
use crate::reload::ConfigHandle;
use crate::router::RouterDeps;
use crate::upstream::manager::UpstreamManager;

/// Build the shared control plane from an initial config.
pub fn build_deps(config: NormalizedConfig) -> RouterDeps {
    RouterDeps {
        config: ConfigHandle::new(config),
        manager: Arc::new(UpstreamManager::with_default_factory()),
        breaker: CircuitBreaker::new(),
        health: HealthRegistry::new(),
        rate_limiter: Arc::new(RateLimiter::new()),
    }
}
