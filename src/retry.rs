//! Backoff policies, transient-error retries and process health
//!
//! Backend clients are wrapped in [`retry_transient`]: an `Unavailable` error
//! is retried with exponential backoff, and once the attempt ceiling is hit the
//! shared [`BackendHealth`] flips to unhealthy. The role runtime watches that
//! flag and exits so the orchestrator restarts the process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, warn};

use crate::error::ErrorKind;

/// Bounded exponential backoff
///
/// `delay(n)` is `initial * multiplier^n`, capped at `max`. The sequence is
/// non-decreasing for every `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = u64::from(self.multiplier.max(1));
        let factor = multiplier.checked_pow(attempt).unwrap_or(u64::MAX);
        let initial_ms = u64::try_from(self.initial.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);

        Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 2)
    }
}

/// Retry budget for backend calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,

    /// Total attempts including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), 2),
            max_attempts: 8,
        }
    }
}

/// Errors that can be classified into the platform taxonomy
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

fn is_backend_outage(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TransportUnavailable | ErrorKind::CoordinationUnavailable
    )
}

/// Run `op`, retrying backend outages with backoff
///
/// Errors of any other kind are returned immediately. When the retry budget is
/// exhausted the health flag is marked unhealthy and the last error returned.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    health: &BackendHealth,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_backend_outage(e.kind()) => {
                attempt += 1;
                if attempt >= policy.max_attempts.max(1) {
                    error!("{what}: giving up after {attempt} attempts: {e}");
                    health.mark_unhealthy(format!("{what}: {e}"));
                    return Err(e);
                }

                let delay = policy.backoff.delay(attempt - 1);
                warn!("{what}: backend unavailable ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Process level health state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy { reason: String },
}

/// Shared health flag of one role process
///
/// Unhealthy is sticky: the only way back is a process restart.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    tx: Arc<watch::Sender<HealthState>>,
}

impl BackendHealth {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HealthState::Healthy);
        Self { tx: Arc::new(tx) }
    }

    pub fn mark_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|state| match state {
            HealthState::Healthy => {
                *state = HealthState::Unhealthy { reason };
                true
            }
            HealthState::Unhealthy { .. } => false,
        });
    }

    pub fn state(&self) -> HealthState {
        self.tx.borrow().clone()
    }

    pub fn is_healthy(&self) -> bool {
        matches!(*self.tx.borrow(), HealthState::Healthy)
    }

    /// Resolve once the process became unhealthy, yielding the reason
    pub async fn unhealthy(&self) -> String {
        let mut rx = self.tx.subscribe();
        loop {
            if let HealthState::Unhealthy { reason } = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                // Sender lives in self, so this cannot close while we wait.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(ErrorKind);

    impl Classify for TestError {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(200), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_zero_multiplier_is_constant() {
        let policy = BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(1), 0);
        assert_eq!(policy.delay(0), policy.delay(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_outage() {
        let calls = AtomicU32::new(0);
        let health = BackendHealth::new();

        let result: Result<u32, TestError> =
            retry_transient(&RetryPolicy::default(), &health, "test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TestError(ErrorKind::TransportUnavailable))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert!(health.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_marks_unhealthy() {
        let health = BackendHealth::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };

        let result: Result<(), TestError> = retry_transient(&policy, &health, "coord", || async {
            Err(TestError(ErrorKind::CoordinationUnavailable))
        })
        .await;

        assert!(result.is_err());
        assert!(!health.is_healthy());
        let reason = health.unhealthy().await;
        assert!(reason.starts_with("coord"));
    }

    #[tokio::test]
    async fn test_non_outage_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let health = BackendHealth::new();

        let result: Result<(), TestError> =
            retry_transient(&RetryPolicy::default(), &health, "op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorKind::OperationFailed))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(health.is_healthy());
    }
}
