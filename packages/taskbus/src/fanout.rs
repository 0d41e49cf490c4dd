//! Fanout worker: projects committed events onto tasks for one queue.
//!
//! Each pass takes the queue's cursor lock in a single statement
//! (`FOR UPDATE SKIP LOCKED` plus a soft `locked` flag with a TTL), reads
//! the next slice of the event log strictly after the cursor, asks the
//! registry to synthesize tasks, and advances the cursor together with the
//! task inserts. Losing the lock race is not an error, just "no work".
//! A worker that dies mid-pass leaves the lock to expire; the maintenance
//! loop releases it.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::debug;

use crate::event::IncomingEvent;
use crate::plans::{task_insert_items, Plans};
use crate::registry::TaskBoss;
use crate::worker::{IntervalWorker, StepFn};

/// Tuning for one fanout worker.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Events read per pass.
    pub fetch_size: i64,
    pub poll_interval: Duration,
    /// How long a taken cursor lock survives a dead worker.
    pub lock_ttl: Duration,
    /// Default archive retention applied to synthesized tasks.
    pub default_keep_in_seconds: i64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            fetch_size: 200,
            poll_interval: Duration::from_millis(1500),
            lock_ttl: Duration::from_secs(60),
            default_keep_in_seconds: crate::task::DEFAULT_KEEP_IN_SECONDS,
        }
    }
}

/// Per-queue event-to-task projection worker.
pub struct FanoutWorker {
    worker: IntervalWorker,
}

impl FanoutWorker {
    pub fn new(
        pool: PgPool,
        plans: Arc<Plans>,
        registry: Arc<TaskBoss>,
        config: FanoutConfig,
    ) -> Self {
        let step = make_step(pool, plans, registry, config.clone());
        let worker = IntervalWorker::new("fanout-worker", config.poll_interval, step);
        Self { worker }
    }

    pub async fn start(&self) {
        self.worker.start().await;
    }

    /// Wake the loop early (used by same-process `publish`).
    pub fn notify(&self) {
        self.worker.notify();
    }

    pub async fn stop(&self) {
        self.worker.stop().await;
    }
}

fn make_step(
    pool: PgPool,
    plans: Arc<Plans>,
    registry: Arc<TaskBoss>,
    config: FanoutConfig,
) -> StepFn {
    let lock_ttl_seconds = config.lock_ttl.as_secs_f64();

    Arc::new(move || {
        let pool = pool.clone();
        let plans = Arc::clone(&plans);
        let registry = Arc::clone(&registry);
        let fetch_size = config.fetch_size;
        let default_keep = config.default_keep_in_seconds;

        Box::pin(async move {
            let queue = registry.queue();

            // Another worker holding the lock means the queue is covered.
            let Some(offset) = plans.lock_cursor(&pool, queue, lock_ttl_seconds).await? else {
                return Ok(false);
            };

            let events = plans.fetch_events_after(&pool, offset, fetch_size).await?;
            let Some(last) = events.last() else {
                plans.unlock_cursor(&pool, queue).await?;
                return Ok(false);
            };
            let last_position = last.pos;
            let fetched = events.len() as i64;

            let incoming: Vec<IncomingEvent> = events.into_iter().map(Into::into).collect();
            let tasks = registry.events_to_tasks(&incoming);
            let items = task_insert_items(&tasks, queue, default_keep);

            plans
                .advance_cursor(&pool, queue, last_position, &items)
                .await?;

            debug!(
                queue,
                events = fetched,
                tasks = tasks.len(),
                position = last_position,
                "fanned out events"
            );

            Ok(fetched == fetch_size)
        })
    })
}
