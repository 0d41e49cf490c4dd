//! Typed task and event definitions.
//!
//! A definition pairs a name with a payload type and a default config. The
//! payload type is the schema: building a message from untyped JSON
//! validates by deserialization and reports a precise "invalid input for
//! task X" error. `TaskBuilder`/`TaskClient` let a publisher-only process
//! import the definitions of a queue without owning its handlers.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::ensure_user_queue;
use crate::error::BusError;
use crate::event::EventMessage;
use crate::task::{TaskConfig, TaskConfigPatch, TaskMessage, Trigger};

/// A named task with payload type `T` and a default config.
pub struct TaskDefinition<T> {
    task_name: String,
    queue: Option<String>,
    config: TaskConfigPatch,
    _payload: PhantomData<fn(T) -> T>,
}

// Manual impls: the payload type is phantom, so no `T` bounds are needed.
impl<T> Clone for TaskDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            task_name: self.task_name.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for TaskDefinition<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("task_name", &self.task_name)
            .field("queue", &self.queue)
            .field("config", &self.config)
            .finish()
    }
}

impl<T> TaskDefinition<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            queue: None,
            config: TaskConfigPatch::default(),
            _payload: PhantomData,
        }
    }

    /// Pin the definition to a queue. A registry for another queue will
    /// refuse to register it.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_config(mut self, config: TaskConfigPatch) -> Self {
        self.config = config;
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn config(&self) -> &TaskConfigPatch {
        &self.config
    }

    /// Default config materialized against the bus defaults.
    pub fn materialized_config(&self) -> TaskConfig {
        self.config.apply_to(&TaskConfig::default())
    }

    /// Build an outgoing task from a typed payload.
    pub fn from(&self, input: &T) -> Result<TaskMessage, BusError> {
        self.from_with_config(input, &TaskConfigPatch::default())
    }

    /// Build an outgoing task, overlaying `override_config` on the
    /// definition's defaults.
    pub fn from_with_config(
        &self,
        input: &T,
        override_config: &TaskConfigPatch,
    ) -> Result<TaskMessage, BusError> {
        let data = serde_json::to_value(input).map_err(|e| BusError::InvalidTaskInput {
            name: self.task_name.clone(),
            reason: e.to_string(),
        })?;
        Ok(TaskMessage {
            task_name: self.task_name.clone(),
            queue: self.queue.clone(),
            data,
            config: self
                .config
                .merged_with(override_config)
                .apply_to(&TaskConfig::default()),
            trigger: Trigger::Direct,
        })
    }

    /// Build an outgoing task from untyped JSON, validating it against the
    /// payload type.
    pub fn from_value(
        &self,
        input: Value,
        override_config: &TaskConfigPatch,
    ) -> Result<TaskMessage, BusError> {
        let typed: T = serde_json::from_value(input).map_err(|e| BusError::InvalidTaskInput {
            name: self.task_name.clone(),
            reason: e.to_string(),
        })?;
        self.from_with_config(&typed, override_config)
    }
}

/// A named event with payload type `T`.
pub struct EventDefinition<T> {
    event_name: String,
    retention_days: Option<i32>,
    _payload: PhantomData<fn(T) -> T>,
}

impl<T> Clone for EventDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            event_name: self.event_name.clone(),
            retention_days: self.retention_days,
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for EventDefinition<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDefinition")
            .field("event_name", &self.event_name)
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

impl<T> EventDefinition<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            retention_days: None,
            _payload: PhantomData,
        }
    }

    /// Override the log retention for events of this definition.
    pub fn with_retention_days(mut self, days: i32) -> Self {
        self.retention_days = Some(days);
        self
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Build an outgoing event from a typed payload.
    pub fn from(&self, input: &T) -> Result<EventMessage, BusError> {
        let data = serde_json::to_value(input).map_err(|e| BusError::InvalidEventInput {
            name: self.event_name.clone(),
            reason: e.to_string(),
        })?;
        Ok(EventMessage {
            event_name: self.event_name.clone(),
            data,
            retention_days: self.retention_days,
        })
    }

    /// Build an outgoing event from untyped JSON, validating it against
    /// the payload type.
    pub fn from_value(&self, input: Value) -> Result<EventMessage, BusError> {
        let typed: T = serde_json::from_value(input).map_err(|e| BusError::InvalidEventInput {
            name: self.event_name.clone(),
            reason: e.to_string(),
        })?;
        self.from(&typed)
    }
}

/// Type-erased view of a task definition, used by [`TaskClient`].
pub trait ErasedTaskDefinition: Send + Sync {
    fn task_name(&self) -> &str;
    fn queue(&self) -> Option<&str>;
    fn config(&self) -> &TaskConfigPatch;
    /// Validate untyped JSON and build the outgoing task.
    fn message_from_value(
        &self,
        input: Value,
        override_config: &TaskConfigPatch,
    ) -> Result<TaskMessage, BusError>;
}

impl<T> ErasedTaskDefinition for TaskDefinition<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn task_name(&self) -> &str {
        self.task_name()
    }

    fn queue(&self) -> Option<&str> {
        self.queue()
    }

    fn config(&self) -> &TaskConfigPatch {
        self.config()
    }

    fn message_from_value(
        &self,
        input: Value,
        override_config: &TaskConfigPatch,
    ) -> Result<TaskMessage, BusError> {
        self.from_value(input, override_config)
    }
}

/// Accumulates the task definitions of one queue.
pub struct TaskBuilder {
    queue: String,
    definitions: Vec<Arc<dyn ErasedTaskDefinition>>,
}

impl TaskBuilder {
    pub fn new(queue: impl Into<String>) -> Result<Self, BusError> {
        let queue = queue.into();
        ensure_user_queue(&queue)?;
        Ok(Self {
            queue,
            definitions: Vec::new(),
        })
    }

    /// Add a definition, enforcing name uniqueness and queue consistency.
    pub fn define<T>(&mut self, definition: TaskDefinition<T>) -> Result<&mut Self, BusError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if let Some(queue) = definition.queue() {
            if queue != self.queue {
                return Err(BusError::QueueMismatch {
                    task: definition.task_name().to_string(),
                    definition_queue: queue.to_string(),
                    registry_queue: self.queue.clone(),
                });
            }
        }
        if self
            .definitions
            .iter()
            .any(|d| d.task_name() == definition.task_name())
        {
            return Err(BusError::DuplicateTask(definition.task_name().to_string()));
        }
        self.definitions.push(Arc::new(definition));
        Ok(self)
    }

    /// Freeze into an immutable [`TaskClient`].
    pub fn compile(self) -> TaskClient {
        let queue = self.queue;
        let definitions = self
            .definitions
            .into_iter()
            .map(|d| (d.task_name().to_string(), d))
            .collect();
        TaskClient { queue, definitions }
    }
}

/// An immutable name-to-definition mapping for one queue, importable by a
/// process that publishes tasks without owning the handlers.
#[derive(Clone)]
pub struct TaskClient {
    queue: String,
    definitions: HashMap<String, Arc<dyn ErasedTaskDefinition>>,
}

impl TaskClient {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn definition(&self, task_name: &str) -> Option<&Arc<dyn ErasedTaskDefinition>> {
        self.definitions.get(task_name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build an outgoing task addressed to this client's queue.
    pub fn message(&self, task_name: &str, input: Value) -> Result<TaskMessage, BusError> {
        let definition = self
            .definitions
            .get(task_name)
            .ok_or_else(|| BusError::InvalidTaskInput {
                name: task_name.to_string(),
                reason: "task is not part of this client".to_string(),
            })?;
        let mut message = definition.message_from_value(input, &TaskConfigPatch::default())?;
        message.queue.get_or_insert_with(|| self.queue.clone());
        Ok(message)
    }
}
