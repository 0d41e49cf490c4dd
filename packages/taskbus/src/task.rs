//! Task model: lifecycle states, retry/expiry policy, trigger descriptors,
//! and the row shapes exchanged with the storage layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;

/// Seconds in seven days, the default archive retention for completed tasks.
pub const DEFAULT_KEEP_IN_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Lifecycle states of a task.
///
/// The numeric order is semantic: SQL predicates compare against it
/// (`state < 2` selects claimable tasks, `state < 4` scopes singleton
/// uniqueness, `state > 2` marks terminal states). Do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum TaskState {
    Created = 0,
    Retry = 1,
    Active = 2,
    Completed = 3,
    Expired = 4,
    Cancelled = 5,
    Failed = 6,
}

impl TaskState {
    /// The smallint stored in the `state` column.
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(TaskState::Created),
            1 => Some(TaskState::Retry),
            2 => Some(TaskState::Active),
            3 => Some(TaskState::Completed),
            4 => Some(TaskState::Expired),
            5 => Some(TaskState::Cancelled),
            6 => Some(TaskState::Failed),
            _ => None,
        }
    }

    /// Terminal states move the row to the completed archive.
    pub fn is_terminal(self) -> bool {
        self > TaskState::Active
    }
}

/// How a task came to exist: scheduled directly by a producer, or
/// synthesized from an event during fanout.
///
/// Stored under the `trace` key of the task's `meta_data` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Direct,
    Event {
        event_id: String,
        event_name: String,
    },
}

impl Trigger {
    /// Convenience for handlers that only care which path ran them.
    pub fn is_direct(&self) -> bool {
        matches!(self, Trigger::Direct)
    }
}

/// Fully materialized behavior knobs attached to a task at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// How many retries are allowed after the initial attempt.
    pub retry_limit: i16,
    /// Base delay between attempts, in seconds.
    pub retry_delay: i32,
    /// Double the delay on every retry when set.
    pub retry_backoff: bool,
    /// Earliest start offset from creation, in seconds.
    pub start_after_seconds: i32,
    /// Wall-clock budget for one handler execution, in seconds.
    pub expire_in_seconds: i32,
    /// Archive retention override in seconds; `None` falls back to the bus
    /// default.
    pub keep_in_seconds: Option<i64>,
    /// Uniqueness scope within the queue across non-terminal states.
    pub singleton_key: Option<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay: 5,
            retry_backoff: false,
            start_after_seconds: 0,
            expire_in_seconds: 300,
            keep_in_seconds: None,
            singleton_key: None,
        }
    }
}

/// A partial [`TaskConfig`]: unset fields inherit from the base at merge
/// time. This is what definitions and event subscriptions carry around.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfigPatch {
    pub retry_limit: Option<i16>,
    pub retry_delay: Option<i32>,
    pub retry_backoff: Option<bool>,
    pub start_after_seconds: Option<i32>,
    pub expire_in_seconds: Option<i32>,
    pub keep_in_seconds: Option<i64>,
    pub singleton_key: Option<String>,
}

impl TaskConfigPatch {
    /// Overlay this patch on `base`, keeping `base` where the patch is
    /// unset.
    pub fn apply_to(&self, base: &TaskConfig) -> TaskConfig {
        TaskConfig {
            retry_limit: self.retry_limit.unwrap_or(base.retry_limit),
            retry_delay: self.retry_delay.unwrap_or(base.retry_delay),
            retry_backoff: self.retry_backoff.unwrap_or(base.retry_backoff),
            start_after_seconds: self
                .start_after_seconds
                .unwrap_or(base.start_after_seconds),
            expire_in_seconds: self.expire_in_seconds.unwrap_or(base.expire_in_seconds),
            keep_in_seconds: self.keep_in_seconds.or(base.keep_in_seconds),
            singleton_key: self
                .singleton_key
                .clone()
                .or_else(|| base.singleton_key.clone()),
        }
    }

    /// Overlay `other` on top of this patch (later writers win).
    pub fn merged_with(&self, other: &TaskConfigPatch) -> TaskConfigPatch {
        TaskConfigPatch {
            retry_limit: other.retry_limit.or(self.retry_limit),
            retry_delay: other.retry_delay.or(self.retry_delay),
            retry_backoff: other.retry_backoff.or(self.retry_backoff),
            start_after_seconds: other.start_after_seconds.or(self.start_after_seconds),
            expire_in_seconds: other.expire_in_seconds.or(self.expire_in_seconds),
            keep_in_seconds: other.keep_in_seconds.or(self.keep_in_seconds),
            singleton_key: other
                .singleton_key
                .clone()
                .or_else(|| self.singleton_key.clone()),
        }
    }
}

/// The retry/retention subset of [`TaskConfig`] persisted on the task row,
/// using the short storage codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTaskConfig {
    #[serde(rename = "r_l")]
    pub retry_limit: i16,
    #[serde(rename = "r_d")]
    pub retry_delay: i32,
    #[serde(rename = "r_b")]
    pub retry_backoff: bool,
    #[serde(rename = "ki_s", skip_serializing_if = "Option::is_none")]
    pub keep_in_seconds: Option<i64>,
}

impl Default for StoredTaskConfig {
    fn default() -> Self {
        StoredTaskConfig::from(&TaskConfig::default())
    }
}

impl From<&TaskConfig> for StoredTaskConfig {
    fn from(config: &TaskConfig) -> Self {
        Self {
            retry_limit: config.retry_limit,
            retry_delay: config.retry_delay,
            retry_backoff: config.retry_backoff,
            keep_in_seconds: config.keep_in_seconds,
        }
    }
}

impl StoredTaskConfig {
    /// Delay in seconds before the attempt following `retrycount` failures.
    pub fn retry_delay_for(&self, retrycount: i16) -> i32 {
        if self.retry_backoff {
            let exponent = u32::try_from(retrycount).unwrap_or(0).min(30);
            self.retry_delay.saturating_mul(1i32 << exponent)
        } else {
            self.retry_delay
        }
    }
}

/// The `meta_data` column: the task name plus its trigger descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetaData {
    /// Task name, used to route to a handler.
    pub tn: String,
    /// Trigger descriptor.
    pub trace: Trigger,
}

/// An outgoing task, produced by a definition or by event fanout, not yet
/// written to storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_name: String,
    /// Explicit target queue; `None` resolves to the sending bus's queue.
    pub queue: Option<String>,
    pub data: Value,
    pub config: TaskConfig,
    pub trigger: Trigger,
}

/// A task claimed for execution by `get_tasks`.
///
/// `retrycount` already reflects the increment applied when the row left
/// `retry`, so it numbers the current attempt starting at zero.
#[derive(Debug, Clone, FromRow)]
pub struct PoppedTask {
    pub id: i64,
    pub retrycount: i16,
    pub state: i16,
    pub data: Value,
    pub meta_data: Json<TaskMetaData>,
    pub config: Json<StoredTaskConfig>,
    pub expire_in_seconds: i32,
}

/// The settled outcome of one task attempt, queued for a batched
/// `resolve_tasks` round-trip.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub id: i64,
    /// `Completed`, `Failed`, `Expired`, or `Retry`.
    pub state: TaskState,
    pub output: Value,
    /// Delay before the next attempt; only meaningful for `Retry`.
    pub start_after_seconds: Option<i32>,
}
