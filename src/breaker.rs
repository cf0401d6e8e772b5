//! Per-upstream circuit breaker
//!
//! Tracks consecutive transport failures per upstream and trips to OPEN at
//! the configured threshold. OPEN rejects attempts until `open_ms` elapses,
//! then a single HALF_OPEN probe decides between closing and re-opening.
//! Protocol-level errors are reported as successes by callers: the breaker
//! tracks availability, not tool correctness.
//!
//! Every admitted attempt is a lease that must be finished with a verdict;
//! a lease dropped without one counts as a failure so an abandoned
//! HALF_OPEN probe cannot wedge the state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CircuitBreakerConfig;
use crate::metrics;

/// Why an attempt was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerRejection {
    /// The circuit is OPEN and the open window has not elapsed.
    CircuitOpen,
    /// The circuit is HALF_OPEN and its single probe slot is taken.
    CircuitHalfOpenBusy,
}

impl std::fmt::Display for BreakerRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::CircuitHalfOpenBusy => write!(f, "circuit half-open probe in flight"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    fn label(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Entry {
    state: State,
    consecutive_failures: u32,
    /// Set while OPEN; instant for the logic, epoch millis for reporting.
    open_until: Option<(Instant, u64)>,
    half_open_in_flight: bool,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            open_until: None,
            half_open_in_flight: false,
        }
    }

    fn open_for(&mut self, open_ms: u64) {
        self.state = State::Open;
        self.consecutive_failures = 0;
        self.half_open_in_flight = false;
        let until = Instant::now() + Duration::from_millis(open_ms);
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64 + open_ms)
            .unwrap_or(0);
        self.open_until = Some((until, epoch_ms));
    }

    fn close(&mut self) {
        self.state = State::Closed;
        self.consecutive_failures = 0;
        self.open_until = None;
        self.half_open_in_flight = false;
    }
}

/// Reported breaker state for one upstream, as surfaced by
/// `list_providers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: String,
    pub failures: u32,
    pub open_until: Option<u64>,
    pub half_open_in_flight: bool,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Shared per-upstream breaker map. Clone-cheap.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request admission for one upstream operation. Settings come from the
    /// caller's config snapshot so an in-flight reload never changes the
    /// rules mid-attempt.
    pub fn begin_attempt(
        &self,
        upstream: &str,
        settings: &CircuitBreakerConfig,
    ) -> Result<Attempt, BreakerRejection> {
        if !settings.enabled {
            return Ok(Attempt {
                breaker: self.clone(),
                upstream: upstream.to_string(),
                open_ms: settings.open_ms,
                failure_threshold: settings.failure_threshold,
                enabled: false,
                finished: false,
            });
        }

        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(upstream.to_string()).or_insert_with(Entry::new);

        match entry.state {
            State::Closed => {}
            State::Open => {
                let (until, _) = entry.open_until.unwrap_or((Instant::now(), 0));
                if Instant::now() < until {
                    return Err(BreakerRejection::CircuitOpen);
                }
                entry.state = State::HalfOpen;
                entry.open_until = None;
                entry.half_open_in_flight = true;
                tracing::debug!(upstream, "circuit breaker: open -> half_open");
                metrics::set_circuit_state(upstream, State::HalfOpen.label());
            }
            State::HalfOpen => {
                if entry.half_open_in_flight {
                    return Err(BreakerRejection::CircuitHalfOpenBusy);
                }
                entry.half_open_in_flight = true;
            }
        }

        Ok(Attempt {
            breaker: self.clone(),
            upstream: upstream.to_string(),
            open_ms: settings.open_ms,
            failure_threshold: settings.failure_threshold,
            enabled: true,
            finished: false,
        })
    }

    /// Non-mutating admission check used when filtering selector
    /// candidates.
    pub fn can_attempt(&self, upstream: &str, settings: &CircuitBreakerConfig) -> bool {
        if !settings.enabled {
            return true;
        }
        let entries = self.inner.entries.lock();
        match entries.get(upstream) {
            None => true,
            Some(entry) => match entry.state {
                State::Closed => true,
                State::HalfOpen => !entry.half_open_in_flight,
                State::Open => entry
                    .open_until
                    .map(|(until, _)| Instant::now() >= until)
                    .unwrap_or(true),
            },
        }
    }

    /// Breaker state as reported by `list_providers`.
    pub fn snapshot(&self, upstream: &str) -> BreakerSnapshot {
        let entries = self.inner.entries.lock();
        match entries.get(upstream) {
            None => BreakerSnapshot {
                state: State::Closed.label().to_string(),
                failures: 0,
                open_until: None,
                half_open_in_flight: false,
            },
            Some(entry) => BreakerSnapshot {
                state: entry.state.label().to_string(),
                failures: entry.consecutive_failures,
                open_until: entry.open_until.map(|(_, epoch)| epoch),
                half_open_in_flight: entry.half_open_in_flight,
            },
        }
    }

    fn finish(&self, upstream: &str, ok: bool, threshold: u32, open_ms: u64) {
        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(upstream.to_string()).or_insert_with(Entry::new);

        match (entry.state, ok) {
            (State::HalfOpen, true) => {
                entry.close();
                tracing::info!(upstream, "circuit breaker: half_open -> closed");
                metrics::set_circuit_state(upstream, State::Closed.label());
            }
            (State::HalfOpen, false) => {
                entry.open_for(open_ms);
                tracing::warn!(upstream, "circuit breaker: half_open -> open");
                metrics::record_circuit_open(upstream);
                metrics::set_circuit_state(upstream, State::Open.label());
            }
            (State::Closed, true) => {
                entry.consecutive_failures = 0;
            }
            (State::Closed, false) => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= threshold.max(1) {
                    entry.open_for(open_ms);
                    tracing::warn!(upstream, threshold, "circuit breaker: closed -> open");
                    metrics::record_circuit_open(upstream);
                    metrics::set_circuit_state(upstream, State::Open.label());
                }
            }
            // A verdict for an attempt admitted before the trip; the open
            // window already governs recovery.
            (State::Open, _) => {}
        }
    }
}

/// A lease for one upstream operation. Must be closed with [`Attempt::end`].
#[derive(Debug)]
pub struct Attempt {
    breaker: CircuitBreaker,
    upstream: String,
    open_ms: u64,
    failure_threshold: u32,
    enabled: bool,
    finished: bool,
}

impl Attempt {
    /// Close the lease with a verdict. `ok` must be true for protocol-level
    /// errors; only transport failures and timeouts pass false.
    pub fn end(mut self, ok: bool) {
        self.finished = true;
        if !ok {
            metrics::record_upstream_failure(&self.upstream);
        }
        if self.enabled {
            self.breaker
                .finish(&self.upstream, ok, self.failure_threshold, self.open_ms);
        }
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.finished && self.enabled {
            // An abandoned lease counts as a failure; this also releases
            // the HALF_OPEN probe slot.
            self.breaker
                .finish(&self.upstream, false, self.failure_threshold, self.open_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, open_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            open_ms,
        }
    }

    // ============== Closed -> Open ==============

    #[test]
    fn opens_at_failure_threshold() {
        let breaker = CircuitBreaker::new();
        let cfg = settings(3, 60_000);

        for _ in 0..2 {
            breaker.begin_attempt("u", &cfg).unwrap().end(false);
            assert!(breaker.can_attempt("u", &cfg));
        }
        breaker.begin_attempt("u", &cfg).unwrap().end(false);

        let snap = breaker.snapshot("u");
        assert_eq!(snap.state, "open");
        // counter resets inside the same end() call that tripped
        assert_eq!(snap.failures, 0);
        assert!(snap.open_until.is_some());
        assert!(!breaker.can_attempt("u", &cfg));
        assert_eq!(
            breaker.begin_attempt("u", &cfg).unwrap_err(),
            BreakerRejection::CircuitOpen
        );
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new();
        let cfg = settings(3, 60_000);

        breaker.begin_attempt("u", &cfg).unwrap().end(false);
        breaker.begin_attempt("u", &cfg).unwrap().end(false);
        breaker.begin_attempt("u", &cfg).unwrap().end(true);
        breaker.begin_attempt("u", &cfg).unwrap().end(false);
        breaker.begin_attempt("u", &cfg).unwrap().end(false);

        assert_eq!(breaker.snapshot("u").state, "closed");
        assert_eq!(breaker.snapshot("u").failures, 2);
    }

    // ============== Half-Open ==============

    #[test]
    fn half_open_admits_exactly_one() {
        let breaker = CircuitBreaker::new();
        let cfg = settings(1, 10);

        breaker.begin_attempt("u", &cfg).unwrap().end(false);
        assert_eq!(breaker.snapshot("u").state, "open");

        std::thread::sleep(Duration::from_millis(20));

        let probe = breaker.begin_attempt("u", &cfg).unwrap();
        assert_eq!(breaker.snapshot("u").state, "half_open");
        assert!(breaker.snapshot("u").half_open_in_flight);
        assert_eq!(
            breaker.begin_attempt("u", &cfg).unwrap_err(),
            BreakerRejection::CircuitHalfOpenBusy
        );
        assert!(!breaker.can_attempt("u", &cfg));

        probe.end(true);
        assert_eq!(breaker.snapshot("u").state, "closed");
        assert_eq!(breaker.snapshot("u").failures, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new();
        let cfg = settings(1, 10);

        breaker.begin_attempt("u", &cfg).unwrap().end(false);
        std::thread::sleep(Duration::from_millis(20));

        let probe = breaker.begin_attempt("u", &cfg).unwrap();
        probe.end(false);

        let snap = breaker.snapshot("u");
        assert_eq!(snap.state, "open");
        assert!(snap.open_until.is_some());
    }

    #[test]
    fn half_open_admit_one_under_contention() {
        let breaker = CircuitBreaker::new();
        let cfg = settings(1, 10);
        breaker.begin_attempt("u", &cfg).unwrap().end(false);
        std::thread::sleep(Duration::from_millis(20));

        let mut admitted = Vec::new();
        let mut rejected = 0;
        for _ in 0..16 {
            match breaker.begin_attempt("u", &cfg) {
                Ok(attempt) => admitted.push(attempt),
                Err(BreakerRejection::CircuitHalfOpenBusy) => rejected += 1,
                Err(other) => panic!("unexpected rejection: {other}"),
            }
        }
        assert_eq!(admitted.len(), 1);
        assert_eq!(rejected, 15);
        for attempt in admitted {
            attempt.end(true);
        }
    }

    #[test]
    fn dropped_lease_releases_half_open_slot() {
        let breaker = CircuitBreaker::new();
        let cfg = settings(1, 10);
        breaker.begin_attempt("u", &cfg).unwrap().end(false);
        std::thread::sleep(Duration::from_millis(20));

        {
            let _probe = breaker.begin_attempt("u", &cfg).unwrap();
            // dropped without a verdict
        }
        // counted as a failed probe: breaker is open again, not wedged
        assert_eq!(breaker.snapshot("u").state, "open");
    }

    // ============== Disabled ==============

    #[test]
    fn disabled_breaker_always_admits() {
        let breaker = CircuitBreaker::new();
        let cfg = CircuitBreakerConfig {
            enabled: false,
            failure_threshold: 1,
            open_ms: 60_000,
        };
        for _ in 0..10 {
            breaker.begin_attempt("u", &cfg).unwrap().end(false);
        }
        assert!(breaker.can_attempt("u", &cfg));
        assert_eq!(breaker.snapshot("u").state, "closed");
    }

    #[test]
    fn upstreams_are_independent() {
        let breaker = CircuitBreaker::new();
        let cfg = settings(1, 60_000);
        breaker.begin_attempt("a", &cfg).unwrap().end(false);
        assert!(!breaker.can_attempt("a", &cfg));
        assert!(breaker.can_attempt("b", &cfg));
    }
}
