//! Small shared utilities: handler deadlines, JSON-safe error flattening,
//! and a debounced notifier used to coalesce local worker wake-ups.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A handler outlived its wall-clock budget.
///
/// The message is load-bearing: callers and tests match on the exact
/// `handler execution exceeded <ms>ms` text, which also ends up in the
/// task's stored output. The worker maps this error to the `expired`
/// terminal state rather than `failed`.
#[derive(Debug, thiserror::Error)]
#[error("handler execution exceeded {ms}ms")]
pub struct DeadlineExceeded {
    pub ms: u128,
}

/// Race `fut` against a wall-clock deadline; a breach surfaces as
/// [`DeadlineExceeded`].
pub async fn with_deadline<F, T>(fut: F, deadline: Duration) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(DeadlineExceeded {
            ms: deadline.as_millis(),
        }
        .into()),
    }
}

/// Flatten a handler error into a plain JSON object suitable for the
/// archive's `output` column: the display message plus the debug-formatted
/// cause chain under `stack`.
pub fn flatten_error(err: &anyhow::Error) -> Value {
    json!({
        "message": err.to_string(),
        "stack": format!("{err:?}"),
    })
}

/// Normalize a handler's completion payload for storage: objects and null
/// pass through, anything else is wrapped as `{"value": x}`.
pub fn map_completion_data(value: Value) -> Value {
    match value {
        Value::Null | Value::Object(_) => value,
        other => json!({ "value": other }),
    }
}

/// Trailing-edge debouncer with a bounded total wait.
///
/// Every `call` re-arms the action `delay` in the future, but the action
/// never slips past `max_wait` from the first call of a burst. Used to
/// coalesce per-insert worker notifications.
pub struct Debounce {
    delay: Duration,
    max_wait: Duration,
    action: Arc<dyn Fn() + Send + Sync>,
    pending: Arc<Mutex<Option<Pending>>>,
}

struct Pending {
    handle: JoinHandle<()>,
    no_later_than: Instant,
}

impl Debounce {
    pub fn new(
        delay: Duration,
        max_wait: Duration,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            delay,
            max_wait,
            action: Arc::new(action),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedule (or reschedule) the action. Must be called from within a
    /// tokio runtime.
    pub fn call(&self) {
        let mut guard = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let no_later_than = match guard.as_ref() {
            Some(pending) if !pending.handle.is_finished() => pending.no_later_than,
            _ => now + self.max_wait,
        };
        if let Some(pending) = guard.take() {
            pending.handle.abort();
        }

        let deadline = no_later_than.min(now + self.delay);
        let action = Arc::clone(&self.action);
        let slot = Arc::clone(&self.pending);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Ok(mut guard) = slot.lock() {
                guard.take();
            }
            action();
        });

        *guard = Some(Pending {
            handle,
            no_later_than,
        });
    }
}

impl Drop for Debounce {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.pending.lock() {
            if let Some(pending) = guard.take() {
                pending.handle.abort();
            }
        }
    }
}
