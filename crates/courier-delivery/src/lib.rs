//! Event dispatch and signed webhook delivery.
//!
//! A fired domain event flows through two stages:
//!
//! 1. **Dispatch** ([`Dispatcher`]) resolves the event type against the
//!    catalog, selects subscribed endpoints whose filters accept the payload,
//!    and records one pending [`Delivery`](courier_core::Delivery) per
//!    endpoint. No network I/O happens here.
//! 2. **Delivery** ([`DeliveryEngine`]) claims pending deliveries, signs the
//!    body with HMAC-SHA256, sends it, and records the outcome. Failures are
//!    retried with capped exponential backoff; endpoints that keep failing
//!    are suspended by a per-endpoint circuit breaker.
//!
//! A [`WorkerPool`] runs the engine on a poll interval. All coordination
//! between workers goes through atomic storage operations, so several
//! processes may share one database.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::Storage, RealClock, TenantId};
//! use courier_delivery::{
//!     DeliveryConfig, DeliveryEngine, Dispatcher, PostgresDeliveryStorage, WorkerPool,
//! };
//! use serde_json::json;
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> courier_delivery::Result<()> {
//! let storage = Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(pool))));
//! let clock = Arc::new(RealClock::new());
//!
//! let dispatcher = Dispatcher::new(storage.clone(), clock.clone());
//! dispatcher
//!     .dispatch_event("user.created", json!({"user_id": 7}), TenantId::new(), None)
//!     .await;
//!
//! let engine = Arc::new(DeliveryEngine::new(storage, DeliveryConfig::default(), clock.clone())?);
//! let mut workers = WorkerPool::new(engine, clock);
//! workers.spawn_workers();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod circuit;
pub mod client;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod retry;
pub mod signing;
pub mod storage;
pub mod worker_pool;

pub use catalog::{seed_catalog, TEST_EVENT_TYPE};
pub use circuit::{CircuitBreaker, CircuitConfig};
pub use client::{ClientConfig, DeliveryClient};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use worker_pool::{WorkerMonitor, WorkerPool};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;
