//! Per-principal token bucket
//!
//! Buckets are keyed by the raw token value, created lazily, refilled on
//! access, and never persisted. Principals without a configured
//! requests-per-minute limit (including anonymous sessions) are exempt.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::auth::Principal;
use crate::error::{RouterError, RouterResult};

struct Bucket {
    tokens: f64,
    updated_at: Instant,
}

/// Shared token-bucket limiter. Cheap to clone via the caller's `Arc`.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token from the principal's bucket, refilling for elapsed
    /// time first. Capacity equals the configured requests-per-minute.
    pub fn consume(&self, principal: &Principal) -> RouterResult<()> {
        let Some((key, rpm)) = principal.rate_limit_key() else {
            return Ok(());
        };
        let capacity = f64::from(rpm.max(1));
        let refill_per_ms = capacity / 60_000.0;

        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            updated_at: now,
        });

        let elapsed_ms = now.duration_since(bucket.updated_at).as_millis() as f64;
        bucket.tokens = (bucket.tokens + elapsed_ms * refill_per_ms).min(capacity);
        bucket.updated_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / refill_per_ms / 1000.0).ceil() as u64;
            Err(RouterError::RateLimited { retry_after_secs })
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Allowlist, TokenPrincipal};

    fn principal(rpm: Option<u32>) -> Principal {
        Principal::Token(TokenPrincipal {
            token: "t".into(),
            fingerprint: "abc123def456".into(),
            project_id: None,
            allowed_upstreams: Allowlist::All,
            allowed_tags: Allowlist::All,
            rate_limit_rpm: rpm,
        })
    }

    #[test]
    fn anonymous_is_never_limited() {
        let limiter = RateLimiter::new();
        for _ in 0..1000 {
            limiter.consume(&Principal::Anonymous).unwrap();
        }
    }

    #[test]
    fn unset_rpm_is_never_limited() {
        let limiter = RateLimiter::new();
        let p = principal(None);
        for _ in 0..1000 {
            limiter.consume(&p).unwrap();
        }
    }

    #[test]
    fn second_call_at_rpm_one_is_limited() {
        let limiter = RateLimiter::new();
        let p = principal(Some(1));
        limiter.consume(&p).unwrap();
        let err = limiter.consume(&p).unwrap_err();
        let RouterError::RateLimited { retry_after_secs } = err else {
            panic!("expected RateLimited, got {err}");
        };
        assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
    }

    #[test]
    fn burst_up_to_capacity_then_limited() {
        let limiter = RateLimiter::new();
        let p = principal(Some(5));
        for _ in 0..5 {
            limiter.consume(&p).unwrap();
        }
        assert!(limiter.consume(&p).is_err());
    }

    #[test]
    fn buckets_are_per_token() {
        let limiter = RateLimiter::new();
        let a = principal(Some(1));
        let b = Principal::Token(TokenPrincipal {
            token: "other".into(),
            fingerprint: "fedcba987654".into(),
            project_id: None,
            allowed_upstreams: Allowlist::All,
            allowed_tags: Allowlist::All,
            rate_limit_rpm: Some(1),
        });
        limiter.consume(&a).unwrap();
        // a is drained, b still has its own bucket
        assert!(limiter.consume(&a).is_err());
        limiter.consume(&b).unwrap();
    }
}
