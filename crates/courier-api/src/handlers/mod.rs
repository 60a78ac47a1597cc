//! HTTP request handlers.
//!
//! Handlers validate input, call into storage, the dispatcher or the
//! engine, and map failures to [`ApiError`](crate::ApiError). Tenant
//! scoping is by path; authentication sits in front of this service.

pub mod deliveries;
pub mod endpoints;
pub mod event_logs;
pub mod event_types;
pub mod events;
pub mod health;

pub use health::{health_check, liveness_check, readiness_check};
