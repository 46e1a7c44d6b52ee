// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution lanes for fiber steps, long-running work and delayed work.
//!
//! | Lane | Bound | Used for |
//! |------|-------|----------|
//! | fiber | `fiber_pool_size` permits, blocking threads | one business-logic step |
//! | long-running | `long_running_pool_size` permits | work that must not starve fibers |
//! | scheduled | unbounded timers | delayed wakeups and mapper cleanups |
//!
//! Every task is tracked, so [`TaskManager::shutdown`] can cancel pending timers
//! and wait for in-flight work to drain.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::PipelineError;

/// Owner of the engine's execution lanes.
#[derive(Debug, Clone)]
pub struct TaskManager {
    fiber_permits: Arc<Semaphore>,
    long_running_permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskManager {
    /// Create the lanes sized from `config`.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            fiber_permits: Arc::new(Semaphore::new(config.fiber_pool_size.max(1))),
            long_running_permits: Arc::new(Semaphore::new(config.long_running_pool_size.max(1))),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of tracked tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Run a blocking step on the fiber lane.
    ///
    /// The result arrives on the returned channel. A panic that escapes `work`
    /// is reported as a transient error; callers that need panics as values
    /// catch them inside `work`.
    pub fn execute_fiber<F, T>(
        &self,
        name: &str,
        work: F,
    ) -> oneshot::Receiver<Result<T, PipelineError>>
    where
        F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let permits = self.fiber_permits.clone();
        let shutdown = self.shutdown.clone();
        let name = name.to_string();

        self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let _ = tx.send(Err(PipelineError::abort("engine shutting down")));
                    return;
                }
                permit = permits.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                let _ = tx.send(Err(PipelineError::transient("fiber lane closed")));
                return;
            };

            let result = match tokio::task::spawn_blocking(work).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(task = %name, error = %e, "Fiber lane task did not complete");
                    Err(PipelineError::transient(format!("fiber task {} failed: {}", name, e)))
                }
            };
            if tx.send(result).is_err() {
                debug!(task = %name, "Fiber result dropped, caller no longer waiting");
            }
        });
        rx
    }

    /// Run a future on the long-running lane.
    ///
    /// The future is dropped unfinished when shutdown begins.
    pub fn execute_long_running<F>(&self, name: &str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.long_running_permits.clone();
        let shutdown = self.shutdown.clone();
        let name = name.to_string();

        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(task = %name, "Long-running task cancelled by shutdown");
                }
                _ = work => {}
            }
        });
    }

    /// Run `work` no earlier than `deliver_at`.
    ///
    /// Pending timers are discarded on shutdown; the durable checkpoint carries
    /// enough to reschedule them on recovery.
    pub fn schedule<F>(&self, deliver_at: DateTime<Utc>, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = (deliver_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => work.await,
            }
        });
    }

    /// Cancel timers and wait for in-flight work to drain.
    ///
    /// Returns `false` if `timeout` elapsed before every task finished.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!(active = self.tracker.len(), "Task manager draining");
        self.shutdown.cancel();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("Task manager drained");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "Task manager drain timed out"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(fibers: usize) -> TaskManager {
        TaskManager::new(&EngineConfig {
            fiber_pool_size: fibers,
            long_running_pool_size: 1,
            ..EngineConfig::default()
        })
    }

    #[tokio::test]
    async fn test_fiber_lane_returns_result() {
        let tm = manager(2);
        let rx = tm.execute_fiber("add", || Ok(2 + 2));
        assert_eq!(rx.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_fiber_lane_reports_panics_as_transient() {
        let tm = manager(1);
        let rx = tm.execute_fiber::<_, ()>("boom", || panic!("boom"));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Transient(_)));
    }

    #[tokio::test]
    async fn test_fiber_lane_is_bounded() {
        let tm = manager(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            receivers.push(tm.execute_fiber("step", move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schedule_runs_after_delay() {
        let tm = manager(1);
        let (tx, rx) = oneshot::channel();
        tm.schedule(Utc::now() + chrono::Duration::milliseconds(20), async move {
            let _ = tx.send(Utc::now());
        });
        let fired = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(fired <= Utc::now());
    }

    #[tokio::test]
    async fn test_long_running_lane_runs_and_is_cancelled_by_shutdown() {
        let tm = manager(1);
        let (tx, rx) = oneshot::channel();
        tm.execute_long_running("quick", async move {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();

        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        tm.execute_long_running("endless", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let token = tm.shutdown_token();
        assert!(!tm.is_shutting_down());
        assert!(tm.shutdown(Duration::from_secs(2)).await);
        assert!(token.is_cancelled());
        assert!(tm.is_shutting_down());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_timers_and_drains() {
        let tm = manager(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        tm.schedule(Utc::now() + chrono::Duration::hours(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let rx = tm.execute_fiber("short", || Ok(()));

        assert!(tm.shutdown(Duration::from_secs(2)).await);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(tm.active_tasks(), 0);
        // The fiber either finished or was refused; it never hangs.
        let _ = rx.await;
    }
}
