// ===============================
// src/retry.rs
// ===============================
//
// Retry wrapper around store operations.
// - Transient failures: sleep a fixed delay and retry, up to `max_attempts`.
// - Anything else: log and hand the error back immediately.
// - Exhausted: exactly one operator alert, then `StoreError::Exhausted`.
//   Callers treat that as a silent no-op; an unreachable store must not
//   take the scheduler down.
//
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};

use crate::error::StoreError;
use crate::metrics::{STORE_DEGRADED, STORE_RETRIES};
use crate::notify::Notifier;

#[derive(Clone)]
pub struct Retry {
    pub max_attempts: u32,
    pub delay: Duration,
    notifier: Arc<dyn Notifier>,
}

impl Retry {
    pub fn new(max_attempts: u32, delay: Duration, notifier: Arc<dyn Notifier>) -> Self {
        Self { max_attempts: max_attempts.max(1), delay, notifier }
    }

    pub async fn run<T, F>(&self, op: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    if attempt >= self.max_attempts {
                        STORE_DEGRADED.inc();
                        error!(%op, attempts = attempt, error = %e, "store retries exhausted");
                        self.notifier
                            .notify(&format!(
                                "⚠️ Store operation <i>{op}</i> failed after {attempt} attempts: {e}"
                            ))
                            .await;
                        return Err(StoreError::Exhausted {
                            op: op.to_string(),
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    STORE_RETRIES.inc();
                    warn!(%op, attempt, max = self.max_attempts, error = %e, "store attempt failed");
                    sleep(self.delay).await;
                }
                Err(e) => {
                    error!(%op, error = %e, "store operation failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;

    fn retry(notifier: Arc<MemoryNotifier>) -> Retry {
        Retry::new(7, Duration::ZERO, notifier)
    }

    #[tokio::test]
    async fn succeeds_on_seventh_attempt_without_alert() {
        let notifier = Arc::new(MemoryNotifier::default());
        let mut calls = 0;
        let out = retry(notifier.clone())
            .run("create_entry", || {
                calls += 1;
                if calls < 7 {
                    Err(StoreError::Transient("connection refused".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls, 7);
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_alert_once_and_degrade() {
        let notifier = Arc::new(MemoryNotifier::default());
        let mut calls = 0;
        let out: Result<i64, StoreError> = retry(notifier.clone())
            .run("get_balance", || {
                calls += 1;
                Err(StoreError::Transient("connection refused".into()))
            })
            .await;
        assert!(matches!(out, Err(StoreError::Exhausted { attempts: 7, .. })));
        assert!(out.unwrap_err().is_exhausted());
        assert_eq!(calls, 7);
        let alerts = notifier.messages();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("get_balance"));
        assert!(alerts[0].contains("7 attempts"));
    }

    #[tokio::test]
    async fn permanent_errors_propagate_without_retry() {
        let notifier = Arc::new(MemoryNotifier::default());
        let mut calls = 0;
        let out: Result<(), StoreError> = retry(notifier.clone())
            .run("update_holding", || {
                calls += 1;
                Err(StoreError::Corrupt("bad row".into()))
            })
            .await;
        match out {
            Err(StoreError::Corrupt(msg)) => assert_eq!(msg, "bad row"),
            other => panic!("expected the corrupt-row error back, got {other:?}"),
        }
        assert_eq!(calls, 1);
        assert!(notifier.messages().is_empty());
    }
}
