//! Worker pool driving the delivery engine.
//!
//! Each worker loops: release abandoned claims, process due pending
//! deliveries, retry due failed ones, then sleep for the poll interval when
//! the cycle found nothing to do.
//! Workers coordinate only through storage claims, so their number is a
//! throughput knob rather than a correctness one.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use courier_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::DeliveryEngine,
    error::{DeliveryError, Result},
};

/// Pause after a cycle that failed on storage.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Read-only view of worker liveness for health reporting.
#[derive(Debug, Clone, Default)]
pub struct WorkerMonitor {
    active: Arc<AtomicUsize>,
    configured: usize,
}

impl WorkerMonitor {
    /// Workers currently running.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Workers the pool was configured with.
    pub fn configured_workers(&self) -> usize {
        self.configured
    }

    /// True when every configured worker is running.
    pub fn is_healthy(&self) -> bool {
        self.active_workers() >= self.configured
    }
}

/// Decrements the active count when a worker task ends, panics included.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Supervised set of delivery workers.
pub struct WorkerPool {
    engine: Arc<DeliveryEngine>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    monitor: WorkerMonitor,
}

impl WorkerPool {
    /// Creates a pool sized by the engine's configuration.
    pub fn new(engine: Arc<DeliveryEngine>, clock: Arc<dyn Clock>) -> Self {
        let configured = engine.config().worker_count;
        Self {
            engine,
            clock,
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
            monitor: WorkerMonitor { active: Arc::new(AtomicUsize::new(0)), configured },
        }
    }

    /// Liveness handle that outlives the pool.
    pub fn monitor(&self) -> WorkerMonitor {
        self.monitor.clone()
    }

    /// Spawns all configured workers. Returns immediately.
    pub fn spawn_workers(&mut self) {
        let worker_count = self.monitor.configured;
        info!(worker_count, "spawning delivery workers");

        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                engine: Arc::clone(&self.engine),
                clock: Arc::clone(&self.clock),
                cancellation_token: self.cancellation_token.clone(),
            };
            let active = Arc::clone(&self.monitor.active);

            self.worker_handles.push(tokio::spawn(async move {
                let _guard = ActiveGuard::enter(&active);
                worker.run().await;
            }));
        }
    }

    /// Check if any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Signals cancellation and waits for workers to finish their current
    /// delivery.
    ///
    /// In-flight HTTP calls are not interrupted. Workers still running when
    /// `timeout` elapses are aborted.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers had to be aborted.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );
        self.cancellation_token.cancel();

        let mut handles = std::mem::take(&mut self.worker_handles);
        let join_all = async {
            for (worker_id, handle) in handles.iter_mut().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "worker task panicked");
                }
            }
        };

        if tokio::time::timeout(timeout, join_all).await.is_ok() {
            info!("worker pool shutdown completed");
            Ok(())
        } else {
            for handle in &handles {
                handle.abort();
            }
            error!(timeout_seconds = timeout.as_secs(), "worker shutdown timed out, aborting");
            Err(DeliveryError::ShutdownTimeout { timeout })
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.cancellation_token.is_cancelled() {
            warn!("worker pool dropped without shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

struct Worker {
    id: usize,
    engine: Arc<DeliveryEngine>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl Worker {
    async fn run(&self) {
        info!(worker_id = self.id, "delivery worker starting");
        let config = self.engine.config().clone();

        while !self.cancellation_token.is_cancelled() {
            let pause = match self.cycle(config.pending_batch_size, config.retry_batch_size).await {
                Ok(0) => Some(config.poll_interval),
                Ok(processed) => {
                    debug!(worker_id = self.id, processed, "delivery cycle completed");
                    None
                },
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "delivery cycle failed");
                    Some(ERROR_BACKOFF)
                },
            };

            if let Some(pause) = pause {
                tokio::select! {
                    () = self.clock.sleep(pause) => {}
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
    }

    async fn cycle(&self, pending_batch: usize, retry_batch: usize) -> Result<usize> {
        let released = self.engine.recover_stale_claims(retry_batch).await?;
        let pending = self.engine.process_pending(pending_batch).await?;
        let retried = self.engine.retry_failed(retry_batch).await?;
        Ok(released + pending + retried)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{Delivery, DeliveryStatus, Endpoint, EventId, EventLog, RealClock, TenantId};
    use serde_json::json;

    use super::*;
    use crate::{
        engine::DeliveryConfig,
        storage::{mock::MockDeliveryStorage, DeliveryStorage},
    };

    fn pool_with(storage: Arc<MockDeliveryStorage>, worker_count: usize) -> WorkerPool {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let config = DeliveryConfig {
            worker_count,
            poll_interval: Duration::from_millis(20),
            ..DeliveryConfig::default()
        };
        let engine = DeliveryEngine::new(storage, config, Arc::clone(&clock)).unwrap();
        WorkerPool::new(Arc::new(engine), clock)
    }

    fn pool(worker_count: usize) -> WorkerPool {
        pool_with(Arc::new(MockDeliveryStorage::new()), worker_count)
    }

    #[tokio::test]
    async fn spawns_configured_number_of_workers() {
        let mut pool = pool(4);
        let monitor = pool.monitor();
        assert_eq!(monitor.active_workers(), 0);

        pool.spawn_workers();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(monitor.active_workers(), 4);
        assert!(monitor.is_healthy());
        assert!(pool.has_active_workers());

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
        assert_eq!(monitor.active_workers(), 0);
        assert!(!monitor.is_healthy());
    }

    #[tokio::test]
    async fn shutdown_without_workers_is_immediate() {
        let pool = pool(2);
        pool.shutdown_graceful(Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn idle_workers_stop_promptly() {
        let mut pool = pool(2);
        pool.spawn_workers();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = std::time::Instant::now();
        pool.shutdown_graceful(Duration::from_secs(3)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn workers_release_abandoned_claims() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let now = chrono::Utc::now();
        let endpoint = Endpoint::new(
            TenantId::new(),
            "abandoned",
            "http://127.0.0.1:9/hook",
            "whsec_worker",
            now,
        );
        storage.create_endpoint(endpoint.clone()).await.unwrap();
        let log =
            EventLog::new(EventId::new(), endpoint.tenant_id, "user.created", json!({}), None, now);
        let delivery =
            Delivery::new(&endpoint, &log, now).claimed(now - chrono::Duration::hours(1));
        storage.record_dispatch(log, vec![delivery.clone()], now).await.unwrap();

        let mut pool = pool_with(storage.clone(), 1);
        pool.spawn_workers();
        let mut released = None;
        for _ in 0..100 {
            let current = storage.find_delivery(delivery.id).await.unwrap().unwrap();
            if current.status != DeliveryStatus::Sending {
                released = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();

        let released = released.unwrap();
        assert!(released.attempt_number >= 2, "{released:?}");
    }
}
