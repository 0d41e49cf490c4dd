//! Bus configuration and validation.

use std::time::Duration;

use crate::error::BusError;

/// Queue reserved for internal maintenance scheduling; rejected for user
/// registries.
pub const MAINTENANCE_QUEUE: &str = "__maintenance__";

/// Tuning for the task worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum in-flight handlers per process.
    pub concurrency: usize,
    /// Poll interval when no work is flowing.
    pub interval: Duration,
    /// Refetch early once `active / concurrency` drops below this fraction.
    /// Must be in `(0, 1]`.
    pub refill_factor: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 25,
            interval: Duration::from_millis(1500),
            refill_factor: 0.33,
        }
    }
}

/// Configuration for a [`crate::bus::TaskBus`].
///
/// Changing `schema` is destructive: the bus will migrate and operate a
/// fresh set of tables under the new schema.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// SQL schema holding every bus table.
    pub schema: String,
    /// Default `expire_at` offset for inserted events, in days.
    pub retention_in_days: i32,
    /// Default archive retention for completed tasks, in seconds.
    pub keep_in_seconds: i64,
    pub worker: WorkerConfig,
    /// Fanout batch size.
    pub events_fetch_size: i64,
    /// Cadence of the stuck-task expiry loop.
    pub expire_interval: Duration,
    /// Cadence of the retention cleanup loop.
    pub cleanup_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            schema: "taskbus".to_string(),
            retention_in_days: 30,
            keep_in_seconds: crate::task::DEFAULT_KEEP_IN_SECONDS,
            worker: WorkerConfig::default(),
            events_fetch_size: 200,
            expire_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl BusConfig {
    /// Default configuration under a different schema.
    pub fn with_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Default::default()
        }
    }

    /// Reject configurations the SQL layer cannot safely honor.
    ///
    /// The schema name is interpolated into DDL and plan text, so it must
    /// be a plain lowercase identifier rather than a quoted one.
    pub fn validate(&self) -> Result<(), BusError> {
        if !is_valid_schema(&self.schema) {
            return Err(BusError::InvalidSchema(self.schema.clone()));
        }
        if self.worker.concurrency == 0 {
            return Err(BusError::InvalidConfig(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if !(self.worker.refill_factor > 0.0 && self.worker.refill_factor <= 1.0) {
            return Err(BusError::InvalidConfig(
                "worker.refill_factor must be in (0, 1]".to_string(),
            ));
        }
        if self.events_fetch_size <= 0 {
            return Err(BusError::InvalidConfig(
                "events_fetch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reject queue names reserved for the bus itself.
pub fn ensure_user_queue(queue: &str) -> Result<(), BusError> {
    if queue == MAINTENANCE_QUEUE {
        return Err(BusError::ReservedQueue(queue.to_string()));
    }
    Ok(())
}

fn is_valid_schema(schema: &str) -> bool {
    let mut chars = schema.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
