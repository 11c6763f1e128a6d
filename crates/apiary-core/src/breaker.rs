//! Circuit breaker for fallible downstream operations.
//!
//! The breaker counts consecutive failures inside a sliding window. Once
//! the threshold is reached it opens and every call fails fast without
//! touching the protected resource. After the reset period one probe call
//! is let through (half-open); success closes the circuit, failure reopens
//! it.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Tunables for one circuit breaker instance.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Per-call timeout applied to the wrapped operation.
    pub call_timeout: Duration,
    /// How long the circuit stays open before allowing a probe.
    pub reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Build a config from the conventional `(threshold, timeout, reset)`
    /// triple.
    pub fn new(failure_threshold: u32, call_timeout: Duration, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            call_timeout,
            reset_timeout,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            call_timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(20),
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

impl BreakerState {
    /// Stable lowercase spelling for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// A named circuit breaker guarding one class of downstream calls.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Error returned by a breaker-wrapped call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    /// The circuit is open; the call was not attempted.
    #[error("circuit '{name}' is open, retry after {retry_after:?}")]
    Open {
        /// Breaker name.
        name: &'static str,
        /// Remaining time until a probe is allowed.
        retry_after: Duration,
    },
    /// The wrapped operation exceeded the per-call timeout.
    #[error("circuit '{name}' call timed out after {timeout:?}")]
    Timeout {
        /// Breaker name.
        name: &'static str,
        /// Configured per-call timeout.
        timeout: Duration,
    },
    /// The wrapped operation itself failed.
    #[error(transparent)]
    Inner(#[from] anyhow::Error),
}

impl CircuitBreaker {
    /// Create a breaker with the given name and tunables.
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state, advancing open → half-open when the reset period has
    /// elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::advance(&mut inner, &self.config);
        inner.state
    }

    /// Run `op` through the breaker. Fails fast with [`BreakerError::Open`]
    /// while the circuit is open, applies the per-call timeout, and feeds
    /// the outcome back into the breaker state.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Self::advance(&mut inner, &self.config);
            if inner.state == BreakerState::Open {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                let retry_after = self.config.reset_timeout.saturating_sub(elapsed);
                return Err(BreakerError::Open {
                    name: self.name,
                    retry_after,
                });
            }
        }

        match tokio::time::timeout(self.config.call_timeout, op()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.record_failure();
                Err(BreakerError::Timeout {
                    name: self.name,
                    timeout: self.config.call_timeout,
                })
            }
        }
    }

    /// Record a success observed outside `call`.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != BreakerState::Closed {
            debug!(breaker = self.name, "circuit closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failure observed outside `call`.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        let tripped = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };
        if tripped {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                breaker = self.name,
                failures = inner.consecutive_failures,
                "circuit opened"
            );
        }
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        self.record_success();
    }

    fn advance(inner: &mut BreakerInner, config: &CircuitBreakerConfig) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new(
                threshold,
                Duration::from_millis(50),
                Duration::from_millis(100),
            ),
        )
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = fast_breaker(2);
        for _ in 0..2 {
            let result: Result<(), _> = breaker
                .call(|| async { Err(anyhow::anyhow!("boom")) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let result: Result<(), _> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let breaker = fast_breaker(1);
        let _: Result<(), _> = breaker
            .call(|| async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let result = breaker.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_reopens_on_failure() {
        let breaker = fast_breaker(1);
        let _: Result<(), _> = breaker
            .call(|| async { Err(anyhow::anyhow!("boom")) })
            .await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        let _: Result<(), _> = breaker
            .call(|| async { Err(anyhow::anyhow!("still broken")) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let breaker = fast_breaker(1);
        let result: Result<(), _> = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = fast_breaker(2);
        let _: Result<(), _> = breaker
            .call(|| async { Err(anyhow::anyhow!("boom")) })
            .await;
        let _ = breaker.call(|| async { Ok(()) }).await;
        let _: Result<(), _> = breaker
            .call(|| async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
