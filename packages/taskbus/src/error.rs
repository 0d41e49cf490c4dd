//! Error types for the bus.
//!
//! `BusError` is the pattern-matchable error surface of the library.
//! Configuration and validation variants are fatal at startup or publish
//! time; storage errors wrap the underlying driver error. Handler failures
//! never appear here: they are flattened to JSON and recorded on the task
//! itself (see [`crate::utils::flatten_error`]).

use thiserror::Error;

/// Errors surfaced by registration, validation, migration, and storage.
#[derive(Debug, Error)]
pub enum BusError {
    /// A task with this name is already registered on the registry.
    #[error("task {0} is already registered")]
    DuplicateTask(String),

    /// An event subscription for this `(event, task)` pair already exists.
    #[error("event {event} already has a subscription named {task}")]
    DuplicateSubscription {
        /// The event name.
        event: String,
        /// The subscribing task name.
        task: String,
    },

    /// A definition pins a queue that differs from the registry's queue.
    #[error("task {task} is defined for queue {definition_queue} but the registry serves {registry_queue}")]
    QueueMismatch {
        /// The task name.
        task: String,
        /// The queue pinned on the definition.
        definition_queue: String,
        /// The queue the registry was created for.
        registry_queue: String,
    },

    /// The queue name is reserved for internal use.
    #[error("queue name {0} is reserved")]
    ReservedQueue(String),

    /// The schema name is not a safe SQL identifier.
    #[error("schema name {0} is not a valid identifier")]
    InvalidSchema(String),

    /// A worker tuning knob is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A task payload failed validation against its definition.
    #[error("invalid input for task {name}: {reason}")]
    InvalidTaskInput {
        /// The task name.
        name: String,
        /// Why the payload was rejected.
        reason: String,
    },

    /// An event payload failed validation against its definition.
    #[error("invalid input for event {name}: {reason}")]
    InvalidEventInput {
        /// The event name.
        name: String,
        /// Why the payload was rejected.
        reason: String,
    },

    /// The SQL text of an already applied migration no longer matches the
    /// hash recorded at apply time.
    #[error("migration {name} changed after being applied (recorded {recorded}, computed {computed})")]
    MigrationChanged {
        /// The migration name.
        name: String,
        /// The hash stored in the migrations table.
        recorded: String,
        /// The hash of the current SQL text.
        computed: String,
    },

    /// The database reports a different migration at this position.
    #[error("migration {expected} expected at position {position}, found {found}")]
    MigrationOutOfOrder {
        /// Zero-based position in the migration list.
        position: usize,
        /// The name compiled into this build.
        expected: String,
        /// The name recorded in the database.
        found: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}
