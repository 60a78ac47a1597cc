//! Built-in event catalog, upserted at startup.

use courier_core::{EventCategory, EventDefinition};
use serde_json::json;
use tracing::info;

use crate::{error::Result, storage::DeliveryStorage};

/// Event type used by the endpoint connectivity test.
pub const TEST_EVENT_TYPE: &str = "system.test";

const BUILTIN: &[(&str, &str, EventCategory)] = &[
    ("user.created", "User created", EventCategory::User),
    ("user.updated", "User updated", EventCategory::User),
    ("user.deleted", "User deleted", EventCategory::User),
    ("inventory.low_stock", "Inventory low stock", EventCategory::Inventory),
    ("inventory.adjusted", "Inventory adjusted", EventCategory::Inventory),
    ("transaction.created", "Transaction created", EventCategory::Transaction),
    ("transaction.completed", "Transaction completed", EventCategory::Transaction),
    ("payment.received", "Payment received", EventCategory::Payment),
    ("payment.failed", "Payment failed", EventCategory::Payment),
    (TEST_EVENT_TYPE, "Webhook test", EventCategory::System),
    ("system.maintenance", "Scheduled maintenance", EventCategory::System),
];

/// The built-in event definitions.
///
/// # Errors
///
/// Returns `Storage` if an identifier is malformed.
pub fn builtin_definitions() -> Result<Vec<EventDefinition>> {
    BUILTIN
        .iter()
        .map(|&(event_type, name, category)| {
            let definition = EventDefinition::new(event_type, name, category)?;
            Ok(match event_type {
                TEST_EVENT_TYPE => definition.system().with_schema(json!({
                    "type": "object",
                    "properties": {
                        "message": {"type": "string"},
                        "endpoint_id": {"type": "string"}
                    }
                })),
                "inventory.low_stock" => definition.with_schema(json!({
                    "type": "object",
                    "properties": {
                        "item_code": {"type": "string"},
                        "quantity": {"type": "integer"}
                    },
                    "required": ["item_code", "quantity"]
                })),
                _ => definition,
            })
        })
        .collect()
}

/// Upserts the built-in catalog, keeping operator-set active flags.
///
/// # Errors
///
/// Returns `Storage` if any upsert fails.
pub async fn seed_catalog(storage: &dyn DeliveryStorage) -> Result<usize> {
    let definitions = builtin_definitions()?;
    let count = definitions.len();
    for definition in definitions {
        storage.upsert_event_definition(definition).await?;
    }
    info!(count, "event catalog seeded");
    Ok(count)
}
