//! Courier administrative HTTP API.
//!
//! Endpoint registry management, event publishing, delivery inspection and
//! manual retries, plus the service configuration loader.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use courier_core::Clock;
use courier_delivery::{DeliveryEngine, DeliveryStorage, Dispatcher, WorkerMonitor};

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{create_router, start_server};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Persistence seam shared with the engine.
    pub storage: Arc<dyn DeliveryStorage>,
    /// Fan-out for published events and endpoint tests.
    pub dispatcher: Dispatcher,
    /// Engine used for synchronous test deliveries and manual retries.
    pub engine: Arc<DeliveryEngine>,
    /// Worker liveness, absent when no pool runs in this process.
    pub workers: Option<WorkerMonitor>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Builds state around a storage backend and engine.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        engine: Arc<DeliveryEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher = Dispatcher::new(Arc::clone(&storage), Arc::clone(&clock));
        Self { storage, dispatcher, engine, workers: None, clock }
    }

    /// Reports worker liveness from `monitor` in health checks.
    #[must_use]
    pub fn with_workers(mut self, monitor: WorkerMonitor) -> Self {
        self.workers = Some(monitor);
        self
    }
}
