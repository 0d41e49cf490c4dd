//! # taskbus
//!
//! A durable task and event bus on PostgreSQL.
//!
//! Worker processes share a logical *queue* and cooperatively execute
//! tasks addressed to it; events published by any participant are fanned
//! out into concrete tasks for every queue that subscribed a handler to
//! the event name, driven by a lockable per-queue cursor over an
//! append-only event log. All coordination is database-mediated: row
//! locks for claiming, a partial unique index for singletons, advisory
//! locks for migrations and event ordering.
//!
//! # Guarantees
//!
//! - **At-most-one concurrent execution** per task, via atomic
//!   fetch-and-start (`FOR UPDATE SKIP LOCKED`).
//! - **Singleton tasks**: at most one non-terminal task per
//!   `(queue, singleton_key)`.
//! - **Ordered fanout**: events project to tasks strictly in commit
//!   order per queue; the cursor only moves forward.
//! - **Bounded retries** with optional exponential backoff, and wall-clock
//!   expiry for runaway handlers.
//!
//! Handlers must be idempotent: delivery is at-least-once across crashes.
//!
//! # Example
//!
//! ```ignore
//! use serde::{Deserialize, Serialize};
//! use taskbus::{BusConfig, TaskBoss, TaskBus, TaskDefinition};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendWelcome { member_id: i64 }
//!
//! let mut boss = TaskBoss::new("emails")?;
//! let welcome: TaskDefinition<SendWelcome> = TaskDefinition::new("send_welcome");
//! boss.register_task(welcome.clone(), |input, _ctx| async move {
//!     // ... deliver the email ...
//!     Ok(serde_json::json!({"delivered": input.member_id}))
//! }, None)?;
//!
//! let bus = TaskBus::new(pool, boss, BusConfig::default())?;
//! bus.start().await?;
//! bus.send_one(welcome.from(&SendWelcome { member_id: 7 })?).await?;
//! ```

pub mod batcher;
pub mod bus;
pub mod config;
pub mod definitions;
pub mod error;
pub mod event;
pub mod fanout;
pub mod maintenance;
pub mod migrations;
pub mod plans;
pub mod registry;
pub mod task;
pub mod task_worker;
pub mod utils;
pub mod worker;

pub use bus::TaskBus;
pub use config::{BusConfig, WorkerConfig, MAINTENANCE_QUEUE};
pub use definitions::{EventDefinition, TaskBuilder, TaskClient, TaskDefinition};
pub use error::BusError;
pub use event::{EventMessage, IncomingEvent};
pub use registry::{
    RegistryState, SubscriptionConfig, TaskBoss, TaskContext, TaskResolution,
};
pub use task::{TaskConfig, TaskConfigPatch, TaskMessage, TaskState, Trigger};
