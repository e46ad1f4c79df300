//! Per-detector circuit breakers.
//!
//! `Closed` detectors run normally. After `failure_threshold` consecutive
//! failures the breaker opens and the detector is skipped until the reset
//! window elapses; the next check then moves it to `HalfOpen`, which admits a
//! single probe. A successful probe closes the breaker, a failed one reopens it.
//! A probe that never reports back (its run was dropped) stops blocking new
//! probes after another reset window.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Start of the outstanding half-open probe
    probe_started: Option<Instant>,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_started: None,
        }
    }
}

/// Circuit breakers keyed by detector name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Breaker>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    /// Current state, moving `Open` to `HalfOpen` once the reset window elapsed.
    pub fn state(&self, detector: &str) -> CircuitState {
        match self.breakers.get_mut(detector) {
            Some(mut breaker) => {
                self.refresh(detector, &mut breaker);
                breaker.state
            }
            None => CircuitState::Closed,
        }
    }

    /// True unless the breaker is open.
    pub fn is_available(&self, detector: &str) -> bool {
        self.state(detector) != CircuitState::Open
    }

    /// Claim permission to execute. In `HalfOpen` only one probe is admitted
    /// per reset window.
    pub fn try_acquire(&self, detector: &str) -> bool {
        let Some(mut breaker) = self.breakers.get_mut(detector) else {
            return true;
        };
        self.refresh(detector, &mut breaker);
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let pending = breaker
                    .probe_started
                    .is_some_and(|at| at.elapsed() < self.reset_timeout);
                if pending {
                    return false;
                }
                if breaker.probe_started.is_some() {
                    warn!(detector = %detector, "Stale half-open probe, admitting another");
                }
                breaker.probe_started = Some(Instant::now());
                true
            }
        }
    }

    /// Record a successful run: close the breaker and reset the failure count.
    pub fn record_success(&self, detector: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(detector) {
            if breaker.state != CircuitState::Closed {
                info!(detector = %detector, "Circuit closed after successful probe");
            }
            *breaker = Breaker::default();
        }
    }

    /// Record a failed run and return the resulting state.
    pub fn record_failure(&self, detector: &str) -> CircuitState {
        let mut breaker = self.breakers.entry(detector.to_string()).or_default();
        breaker.probe_started = None;
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);

        let trip = match breaker.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => breaker.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
            warn!(
                detector = %detector,
                failures = breaker.consecutive_failures,
                reset_after_ms = self.reset_timeout.as_millis() as u64,
                "Circuit opened"
            );
        }
        breaker.state
    }

    pub fn failure_count(&self, detector: &str) -> u32 {
        self.breakers
            .get(detector)
            .map(|b| b.consecutive_failures)
            .unwrap_or(0)
    }

    /// Force a breaker back to `Closed`.
    pub fn reset(&self, detector: &str) {
        self.breakers.remove(detector);
    }

    fn refresh(&self, detector: &str, breaker: &mut Breaker) {
        if breaker.state != CircuitState::Open {
            return;
        }
        let elapsed = breaker
            .opened_at
            .map(|at| at.elapsed())
            .unwrap_or(self.reset_timeout);
        if elapsed >= self.reset_timeout {
            breaker.state = CircuitState::HalfOpen;
            breaker.probe_started = None;
            info!(detector = %detector, "Circuit half-open, admitting probe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_detector_is_closed() {
        let registry = CircuitBreakerRegistry::new(3, Duration::from_secs(30));
        assert_eq!(registry.state("ua"), CircuitState::Closed);
        assert!(registry.try_acquire("ua"));
    }

    #[tokio::test]
    async fn test_threshold_opens_breaker() {
        let registry = CircuitBreakerRegistry::new(3, Duration::from_secs(30));

        assert_eq!(registry.record_failure("ua"), CircuitState::Closed);
        assert_eq!(registry.record_failure("ua"), CircuitState::Closed);
        assert_eq!(registry.record_failure("ua"), CircuitState::Open);
        assert!(!registry.is_available("ua"));
        assert!(!registry.try_acquire("ua"));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let registry = CircuitBreakerRegistry::new(3, Duration::from_secs(30));
        registry.record_failure("ua");
        registry.record_failure("ua");
        registry.record_success("ua");

        assert_eq!(registry.failure_count("ua"), 0);
        assert_eq!(registry.record_failure("ua"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_closed() {
        let registry = CircuitBreakerRegistry::new(2, Duration::from_secs(10));
        registry.record_failure("dns");
        registry.record_failure("dns");
        assert_eq!(registry.state("dns"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(registry.state("dns"), CircuitState::HalfOpen);

        // One probe only
        assert!(registry.try_acquire("dns"));
        assert!(!registry.try_acquire("dns"));

        registry.record_success("dns");
        assert_eq!(registry.state("dns"), CircuitState::Closed);
        assert_eq!(registry.failure_count("dns"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreported_half_open_call_is_released() {
        let registry = CircuitBreakerRegistry::new(1, Duration::from_secs(10));
        registry.record_failure("dns");
        tokio::time::advance(Duration::from_secs(10)).await;

        // Probe admitted but its outcome is never recorded
        assert!(registry.try_acquire("dns"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!registry.try_acquire("dns"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(registry.state("dns"), CircuitState::HalfOpen);
        assert!(registry.try_acquire("dns"));
        assert!(!registry.try_acquire("dns"));

        registry.record_success("dns");
        assert_eq!(registry.state("dns"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let registry = CircuitBreakerRegistry::new(1, Duration::from_secs(10));
        registry.record_failure("dns");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(registry.try_acquire("dns"));
        assert_eq!(registry.record_failure("dns"), CircuitState::Open);

        // Fresh timestamp: still open shortly after
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(registry.state("dns"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(registry.state("dns"), CircuitState::HalfOpen);
    }
}
