//! Core domain models and persistence for webhook event delivery.
//!
//! Provides the event catalog, endpoint registry, event log and delivery
//! record types together with their PostgreSQL repositories. The dispatcher,
//! delivery engine and administrative API all build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod filter;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryEvent, DeliveryFailedEvent, DeliverySucceededEvent, EndpointSuspendedEvent,
    EventHandler, MulticastEventHandler, NoOpEventHandler,
};
pub use filter::{FilterCondition, FilterConditions, FilterOperator};
pub use models::{
    Delivery, DeliveryId, DeliveryOutcome, DeliveryQuery, DeliveryStatus, Endpoint,
    EndpointAvailability, EndpointHealth, EndpointId, EndpointStatus, EventCategory,
    EventDefinition, EventId, EventLog, EventLogQuery, HttpMethod, SourceRef, TenantId,
};
pub use time::{Clock, RealClock, TestClock};
