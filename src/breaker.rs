//! Circuit breakers for dependency-facing read paths.
//!
//! A breaker trips after too many dependency failures inside a sliding
//! window, short-circuits callers while open, and admits a single probe per
//! cool-down interval once half-open. Domain errors (not-found, validation,
//! gate rejections) never count against the breaker; only dependency
//! failures do, so a burst of 404s cannot take a healthy path offline.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{CoreError, CoreResult, ErrorKind},
    time::Clock,
};

/// Breaker tuning, shared by every breaker in a registry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window required to trip open.
    pub failure_threshold: u32,
    /// Width of the sliding failure window.
    pub window_secs: u64,
    /// Cool-down before a half-open probe is admitted.
    pub open_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            open_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admission check. Returns `CircuitOpen` while the breaker is open and
    /// the cool-down has not elapsed; transitions to half-open and admits
    /// exactly one probe once it has.
    pub fn check(&self) -> CoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            State::Closed => Ok(()),
            State::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                if now - opened_at >= Duration::seconds(self.config.open_secs as i64) {
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::debug!(breaker = %self.name, "admitting half-open probe");
                    Ok(())
                } else {
                    Err(CoreError::CircuitOpen(self.name.clone()))
                }
            }
            State::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CoreError::CircuitOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call; closes the breaker from half-open.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        if inner.state != State::Closed {
            tracing::info!(breaker = %self.name, "closing after successful probe");
        }
        inner.state = State::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Record a dependency failure; may trip the breaker open.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let window = Duration::seconds(self.config.window_secs as i64);
        let mut inner = self.inner.lock().expect("breaker poisoned");

        if inner.state == State::HalfOpen {
            inner.state = State::Open;
            inner.opened_at = Some(now);
            inner.probe_in_flight = false;
            tracing::warn!(breaker = %self.name, "probe failed, reopening");
            return;
        }

        inner.failures.push_back(now);
        while let Some(first) = inner.failures.front() {
            if now - *first > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
        if inner.state == State::Closed && inner.failures.len() as u32 >= self.config.failure_threshold
        {
            inner.state = State::Open;
            inner.opened_at = Some(now);
            tracing::warn!(
                breaker = %self.name,
                failures = inner.failures.len(),
                "tripping open"
            );
        }
    }

    /// Run an operation through the breaker.
    ///
    /// Only dependency failure kinds are counted against the breaker;
    /// everything else passes through without touching its state.
    pub async fn call<T, F, Fut>(&self, op: F) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.check()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if is_dependency_failure(err.kind()) {
                    self.record_failure();
                } else {
                    // A domain outcome still proves the dependency answered.
                    self.record_success();
                }
                Err(err)
            }
        }
    }
}

fn is_dependency_failure(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Database | ErrorKind::ExternalService | ErrorKind::Timeout
    )
}

/// Process-wide registry of named breakers.
#[derive(Clone)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Arc::new(DashMap::new()),
        }
    }

    /// Fetch (or lazily create) the breaker for `name`.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.config.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::time::ManualClock;

    fn tripped_breaker(clock: Arc<dyn Clock>) -> CircuitBreaker {
        let breaker = CircuitBreaker::new(
            "consent",
            BreakerConfig {
                failure_threshold: 3,
                window_secs: 60,
                open_secs: 30,
            },
            clock,
        );
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker
    }

    #[test]
    fn test_trips_after_threshold_in_window() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = tripped_breaker(Arc::clone(&clock) as Arc<dyn Clock>);

        let err = breaker.check().expect_err("open");
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn test_old_failures_fall_out_of_window() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = CircuitBreaker::new(
            "consent",
            BreakerConfig {
                failure_threshold: 3,
                window_secs: 60,
                open_secs: 30,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::seconds(120));
        breaker.record_failure();

        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_half_open_admits_one_probe() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = tripped_breaker(Arc::clone(&clock) as Arc<dyn Clock>);

        clock.advance(Duration::seconds(31));
        assert!(breaker.check().is_ok(), "first probe admitted");
        assert!(breaker.check().is_err(), "second caller rejected");

        breaker.record_success();
        assert!(breaker.check().is_ok(), "closed after probe success");
    }

    #[test]
    fn test_failed_probe_reopens() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = tripped_breaker(Arc::clone(&clock) as Arc<dyn Clock>);

        clock.advance(Duration::seconds(31));
        assert!(breaker.check().is_ok());
        breaker.record_failure();

        assert!(breaker.check().is_err(), "reopened");
        clock.advance(Duration::seconds(31));
        assert!(breaker.check().is_ok(), "next probe after cool-down");
    }

    #[tokio::test]
    async fn test_call_ignores_domain_errors() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = CircuitBreaker::new(
            "consent",
            BreakerConfig {
                failure_threshold: 2,
                window_secs: 60,
                open_secs: 30,
            },
            clock,
        );

        for _ in 0..5 {
            let result: CoreResult<()> = breaker
                .call(|| async {
                    Err(CoreError::NotFound {
                        entity: "consent",
                        id: "U1".to_string(),
                    })
                })
                .await;
            assert!(result.is_err());
        }
        assert!(breaker.check().is_ok(), "domain errors never trip");
    }
}
