//! Status Poller
//!
//! Repeatedly fetches a resource through a caller-supplied accessor until it
//! reaches an accepted status, turns error-like, disappears (when absence is
//! accepted) or the deadline passes.
//!
//! The deadline is enforced on the fetch itself: a fetch still in flight
//! when the deadline fires is dropped, not left running in the background.

use crate::convergence::classify::{accepts_deleted, classify_status, Observed, StatusClass};
use crate::convergence::metrics::ConvergenceMetrics;
use crate::domain::ports::ResourceRef;
use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default interval between two observations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed-interval status poller
#[derive(Debug, Clone)]
pub struct StatusPoller {
    interval: Duration,
    metrics: Arc<ConvergenceMetrics>,
}

impl StatusPoller {
    pub fn new(interval: Duration, metrics: Arc<ConvergenceMetrics>) -> Self {
        Self { interval, metrics }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until `fetch` reports a status in `accept`.
    ///
    /// Returns the last observed resource, or `None` when the resource is
    /// gone and `accept` contains [`DELETED`](super::classify::DELETED).
    pub async fn await_status<T, F, Fut>(
        &self,
        target: &ResourceRef,
        accept: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<Option<T>>
    where
        T: Observed + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let deadline = Instant::now() + timeout;
        self.await_status_until(target, accept, deadline, cancel, fetch)
            .await
    }

    /// Same as [`await_status`](Self::await_status) against an absolute deadline,
    /// so several waits can share one timer.
    pub async fn await_status_until<T, F, Fut>(
        &self,
        target: &ResourceRef,
        accept: &[&str],
        deadline: Instant,
        cancel: &CancellationToken,
        mut fetch: F,
    ) -> Result<Option<T>>
    where
        T: Observed + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let started = Instant::now();
        let timed_out = || {
            self.metrics.record_timeout(target.kind);
            Error::Timeout {
                resource: target.clone(),
                timeout: deadline.saturating_duration_since(started),
            }
        };

        loop {
            self.metrics.record_poll(target.kind);

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { resource: target.clone() });
                }
                fetched = timeout_at(deadline, fetch()) => match fetched {
                    Ok(fetched) => fetched,
                    Err(_) => return Err(timed_out()),
                },
            };

            match fetched {
                Ok(current) => {
                    let status = current.observed_status();
                    match classify_status(status, accept) {
                        StatusClass::Accepted => {
                            debug!(resource = %target, status, "resource reached accepted status");
                            return Ok(Some(current));
                        }
                        StatusClass::ErrorState => {
                            debug!(resource = %target, status, "resource reached error status");
                            return Err(Error::ErrorState {
                                resource: target.clone(),
                                status: status.to_string(),
                            });
                        }
                        StatusClass::Transient => {
                            trace!(resource = %target, status, "resource still transitioning");
                        }
                    }
                }
                Err(err) if err.is_not_found() && accepts_deleted(accept) => {
                    debug!(resource = %target, "resource is gone");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }

            let wake = (now + self.interval).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { resource: target.clone() });
                }
                _ = sleep_until(wake) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::classify::DELETED;
    use crate::domain::ports::{ManagedResource, ResourceKind};
    use assert_matches::assert_matches;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn poller(interval_secs: u64) -> StatusPoller {
        StatusPoller::new(
            Duration::from_secs(interval_secs),
            Arc::new(ConvergenceMetrics::new().unwrap()),
        )
    }

    fn target() -> ResourceRef {
        ResourceRef::new(ResourceKind::Volume, "vol-1")
    }

    fn resource(status: &str) -> ManagedResource {
        ManagedResource {
            id: "vol-1".into(),
            kind: ResourceKind::Volume,
            name: "vol".into(),
            status: status.into(),
            availability_zone: None,
            volume_type: None,
            metadata: Default::default(),
            source_id: None,
        }
    }

    /// Fetch closure replaying a status script; the last entry repeats
    fn scripted(statuses: &[&str]) -> (Arc<AtomicUsize>, impl FnMut() -> futures::future::Ready<Result<ManagedResource>> + Send) {
        let calls = Arc::new(AtomicUsize::new(0));
        let script: Mutex<VecDeque<String>> =
            Mutex::new(statuses.iter().map(|s| s.to_string()).collect());
        let counter = calls.clone();
        let fetch = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut script = script.lock().unwrap();
            let status = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            };
            futures::future::ready(Ok(resource(&status)))
        };
        (calls, fetch)
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_immediately_when_first_fetch_is_accepted() {
        let (calls, fetch) = scripted(&["available"]);
        let start = Instant::now();

        let found = poller(5)
            .await_status(
                &target(),
                &["available"],
                Duration::from_secs(20),
                &CancellationToken::new(),
                fetch,
            )
            .await
            .unwrap();

        assert_eq!(found.unwrap().status, "available");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_transition_to_available() {
        let (calls, fetch) = scripted(&["creating", "creating", "available"]);
        let start = Instant::now();

        let found = poller(5)
            .await_status(
                &target(),
                &["available"],
                Duration::from_secs(20),
                &CancellationToken::new(),
                fetch,
            )
            .await
            .unwrap();

        assert_eq!(found.unwrap().status, "available");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed <= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_fetch_per_interval() {
        let (calls, fetch) = scripted(&["creating", "creating", "available"]);
        let poller = poller(5);
        let target = target();
        let cancel = CancellationToken::new();
        let mut wait = tokio_test::task::spawn(poller.await_status(
            &target,
            &["available"],
            Duration::from_secs(60),
            &cancel,
            fetch,
        ));

        tokio_test::assert_pending!(wait.poll());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio_test::assert_pending!(wait.poll());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        let found = tokio_test::assert_ready_ok!(wait.poll());
        assert_eq!(found.unwrap().status, "available");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_not_before_deadline() {
        let (_, fetch) = scripted(&["creating"]);
        let start = Instant::now();

        let err = poller(3)
            .await_status(
                &target(),
                &["available"],
                Duration::from_secs(10),
                &CancellationToken::new(),
                fetch,
            )
            .await
            .unwrap_err();

        assert_matches!(err, Error::Timeout { timeout, .. } if timeout == Duration::from_secs(10));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_fast_on_error_status() {
        let (calls, fetch) = scripted(&["creating", "error"]);
        let start = Instant::now();

        let err = poller(2)
            .await_status(
                &target(),
                &["available"],
                Duration::from_secs(60),
                &CancellationToken::new(),
                fetch,
            )
            .await
            .unwrap_err();

        assert_matches!(err, Error::ErrorState { ref status, .. } if status == "error");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_success_when_deleted_is_accepted() {
        let found = poller(1)
            .await_status(
                &target(),
                &[DELETED],
                Duration::from_secs(10),
                &CancellationToken::new(),
                || async {
                    Err::<ManagedResource, _>(Error::NotFound {
                        kind: ResourceKind::Volume,
                        id: "vol-1".into(),
                    })
                },
            )
            .await
            .unwrap();

        assert!(found.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_fails_without_deleted_sentinel() {
        let err = poller(1)
            .await_status(
                &target(),
                &["available"],
                Duration::from_secs(10),
                &CancellationToken::new(),
                || async {
                    Err::<ManagedResource, _>(Error::NotFound {
                        kind: ResourceKind::Volume,
                        id: "vol-1".into(),
                    })
                },
            )
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_fetch_errors_pass_through() {
        let calls = AtomicUsize::new(0);
        let err = poller(1)
            .await_status(
                &target(),
                &["available"],
                Duration::from_secs(10),
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<ManagedResource, _>(Error::Api {
                            service: "cinder".into(),
                            reason: "internal server error".into(),
                        })
                    }
                },
            )
            .await
            .unwrap_err();

        assert_matches!(err, Error::Api { .. });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_fetch_is_abandoned_at_deadline() {
        let start = Instant::now();
        let err = poller(1)
            .await_status(
                &target(),
                &["available"],
                Duration::from_secs(30),
                &CancellationToken::new(),
                || futures::future::pending::<Result<ManagedResource>>(),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            trigger.cancel();
        });

        let (_, fetch) = scripted(&["creating"]);
        let err = poller(1)
            .await_status(&target(), &["available"], Duration::from_secs(60), &cancel, fetch)
            .await
            .unwrap_err();

        assert_matches!(err, Error::Cancelled { .. });
    }
}
