//! Event model: outgoing messages, the stored row shape, and the
//! transport-neutral form handed to the registry during fanout.

use serde_json::Value;
use sqlx::FromRow;

/// An outgoing event, not yet written to the log.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub event_name: String,
    pub data: Value,
    /// Days before the event becomes eligible for deletion; `None` falls
    /// back to the bus default.
    pub retention_days: Option<i32>,
}

/// A committed event read back from the log during fanout.
///
/// Only rows with `pos > 0` are ever returned: position assignment is
/// deferred to commit time, so an unpositioned row is still in flight.
#[derive(Debug, Clone, FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub event_name: String,
    pub event_data: Value,
    pub pos: i64,
}

/// The transport-neutral event shape consumed by
/// [`crate::registry::TaskBoss::events_to_tasks`].
///
/// Database fanout builds it from [`StoredEvent`]; the webhook front-end
/// builds it straight from the request body. Ids are strings because remote
/// dispatchers assign their own.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub id: String,
    pub name: String,
    pub data: Value,
}

impl From<StoredEvent> for IncomingEvent {
    fn from(event: StoredEvent) -> Self {
        Self {
            id: event.id.to_string(),
            name: event.event_name,
            data: event.event_data,
        }
    }
}
