//! Task worker: claims tasks in batches, dispatches handlers with bounded
//! concurrency, and feeds settled attempts into the resolve sink.
//!
//! The worker never blocks on handlers: each claimed task runs on its own
//! tokio task, and the poll step only fetches as much as free capacity
//! allows. When the previous claim returned a full batch and enough
//! handlers have settled, the worker wakes itself instead of waiting for
//! the next poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::BusError;
use crate::registry::TaskResolution;
use crate::task::{PoppedTask, ResolvedTask, StoredTaskConfig, TaskState};
use crate::worker::{IntervalWorker, StepFn};

/// Claims up to `n` ready tasks.
pub type PopFn =
    Arc<dyn Fn(i64) -> BoxFuture<'static, Result<Vec<PoppedTask>, BusError>> + Send + Sync>;

/// Runs one claimed task to a settled resolution. Deadlines and outcome
/// handling live behind this boundary (see `TaskBoss::handle_task`).
pub type DispatchFn = Arc<dyn Fn(PoppedTask) -> BoxFuture<'static, TaskResolution> + Send + Sync>;

/// Receives settled attempts; the bus backs this with a [`crate::batcher::Batcher`].
pub type ResolveSink = Arc<dyn Fn(ResolvedTask) + Send + Sync>;

/// Tuning knobs for one worker instance.
#[derive(Debug, Clone)]
pub struct TaskWorkerConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    /// Refetch early once `active / max_concurrency` drops below this.
    pub refill_threshold: f64,
    /// Identity of this instance in logs.
    pub worker_id: String,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 25,
            poll_interval: Duration::from_millis(1500),
            refill_threshold: 0.33,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

/// Map one settled attempt to its resolution row.
///
/// `retrycount` numbers the current attempt from zero, so a failure with
/// `retrycount >= retry_limit` has exhausted the initial attempt plus all
/// retries and goes terminal.
pub fn resolve_attempt(
    id: i64,
    retrycount: i16,
    config: &StoredTaskConfig,
    resolution: TaskResolution,
) -> ResolvedTask {
    match resolution {
        TaskResolution::Success(output) => ResolvedTask {
            id,
            state: TaskState::Completed,
            output,
            start_after_seconds: None,
        },
        TaskResolution::Failure(output) => {
            failure_resolution(id, retrycount, config, output, TaskState::Failed)
        }
        TaskResolution::Expired(output) => {
            failure_resolution(id, retrycount, config, output, TaskState::Expired)
        }
    }
}

fn failure_resolution(
    id: i64,
    retrycount: i16,
    config: &StoredTaskConfig,
    output: serde_json::Value,
    terminal: TaskState,
) -> ResolvedTask {
    if retrycount >= config.retry_limit {
        ResolvedTask {
            id,
            state: terminal,
            output,
            start_after_seconds: None,
        }
    } else {
        ResolvedTask {
            id,
            state: TaskState::Retry,
            output,
            start_after_seconds: Some(config.retry_delay_for(retrycount)),
        }
    }
}

/// A polling task worker bound to one queue.
pub struct TaskWorker {
    worker: IntervalWorker,
    active: Arc<DashMap<i64, ()>>,
}

impl TaskWorker {
    pub fn new(
        config: TaskWorkerConfig,
        pop: PopFn,
        dispatch: DispatchFn,
        resolve: ResolveSink,
    ) -> Self {
        let active: Arc<DashMap<i64, ()>> = Arc::new(DashMap::new());
        let has_more = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let step = make_step(
            config.clone(),
            pop,
            dispatch,
            resolve,
            Arc::clone(&active),
            Arc::clone(&has_more),
            Arc::clone(&notify),
        );
        let worker =
            IntervalWorker::with_notify("task-worker", config.poll_interval, notify, step);

        Self { worker, active }
    }

    pub async fn start(&self) {
        self.worker.start().await;
    }

    /// Wake the poll loop early (used by same-process `send`).
    pub fn notify(&self) {
        self.worker.notify();
    }

    /// Number of in-flight handlers.
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Stop polling, then wait for every in-flight handler to settle.
    pub async fn stop(&self) {
        self.worker.stop().await;
        while !self.active.is_empty() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn make_step(
    config: TaskWorkerConfig,
    pop: PopFn,
    dispatch: DispatchFn,
    resolve: ResolveSink,
    active: Arc<DashMap<i64, ()>>,
    has_more: Arc<AtomicBool>,
    notify: Arc<Notify>,
) -> StepFn {
    let max_concurrency = config.max_concurrency.max(1);
    let refill_threshold = config.refill_threshold;
    let worker_id = Arc::<str>::from(config.worker_id.as_str());

    Arc::new(move || {
        let worker_id = Arc::clone(&worker_id);
        let pop = Arc::clone(&pop);
        let dispatch = Arc::clone(&dispatch);
        let resolve = Arc::clone(&resolve);
        let active = Arc::clone(&active);
        let has_more = Arc::clone(&has_more);
        let notify = Arc::clone(&notify);

        Box::pin(async move {
            let in_flight = active.len();
            if in_flight >= max_concurrency {
                return Ok(false);
            }

            let amount = (max_concurrency - in_flight) as i64;
            let tasks = pop(amount).await?;
            let fetched = tasks.len() as i64;
            has_more.store(fetched == amount, Ordering::SeqCst);
            if fetched > 0 {
                debug!(worker_id = %worker_id, count = fetched, "claimed tasks");
            }

            for task in tasks {
                let id = task.id;
                let retrycount = task.retrycount;
                let task_config = task.config.0.clone();
                active.insert(id, ());

                let dispatch = Arc::clone(&dispatch);
                let resolve = Arc::clone(&resolve);
                let active = Arc::clone(&active);
                let has_more = Arc::clone(&has_more);
                let notify = Arc::clone(&notify);

                tokio::spawn(async move {
                    // A panicking handler must still settle, or stop()
                    // would wait on its in-flight entry forever.
                    let resolution = match std::panic::AssertUnwindSafe(dispatch(task))
                        .catch_unwind()
                        .await
                    {
                        Ok(resolution) => resolution,
                        Err(_) => {
                            error!(task_id = id, "handler panicked");
                            TaskResolution::Failure(json!({"message": "handler panicked"}))
                        }
                    };
                    resolve(resolve_attempt(id, retrycount, &task_config, resolution));
                    active.remove(&id);

                    let refill_at = refill_threshold * max_concurrency as f64;
                    if has_more.load(Ordering::SeqCst) && (active.len() as f64) < refill_at {
                        notify.notify_one();
                    }
                });
            }

            Ok(false)
        })
    })
}
