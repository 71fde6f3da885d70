//! Polling waits for external readiness conditions.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ReadinessError;

/// How to poll a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    /// `None` waits until ready or cancelled.
    pub deadline: Option<Duration>,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            deadline: None,
        }
    }
}

impl ReadinessPolicy {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Poll `probe` until it returns `Ok(true)`.
///
/// Probe errors are logged and treated as not ready.
pub async fn wait_until<F, Fut>(
    what: &str,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<(), ReadinessError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ReadinessError::Cancelled {
                what: what.to_string(),
            });
        }

        attempts += 1;
        match probe().await {
            Ok(true) => {
                info!(what, attempts, elapsed = ?started.elapsed(), "Ready");
                return Ok(());
            }
            Ok(false) => debug!(what, attempts, "Not ready yet"),
            Err(e) => warn!(what, attempts, error = %e, "Readiness probe failed"),
        }

        let elapsed = started.elapsed();
        let mut pause = policy.interval;
        if let Some(deadline) = policy.deadline {
            if elapsed >= deadline {
                return Err(ReadinessError::Timeout {
                    what: what.to_string(),
                    elapsed,
                });
            }
            pause = pause.min(deadline - elapsed);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ReadinessError::Cancelled { what: what.to_string() });
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_millis(5),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_ready_after_errors_and_false() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        wait_until("topic", &fast(), &CancellationToken::new(), || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => anyhow::bail!("broker unreachable"),
                    1 => Ok(false),
                    _ => Ok(true),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let policy = fast().with_deadline(Duration::from_millis(30));
        let err = wait_until("dataset", &policy, &CancellationToken::new(), || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_unbounded_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = wait_until("dataset", &fast(), &cancel, || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::Cancelled { .. }));
    }
}
