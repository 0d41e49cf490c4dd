//! Maintenance loops: expire stuck active tasks, release stale cursor
//! locks, and enforce retention on events and archived tasks.
//!
//! A task can get stuck in `active` when its worker dies between claiming
//! and resolving. The expire pass selects such rows under
//! `FOR UPDATE SKIP LOCKED` in its own transaction and pushes them through
//! the same `resolve_tasks` path the worker uses, so retry branching and
//! archival behave identically.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tracing::info;

use crate::plans::{resolution_items, Plans};
use crate::task::{ResolvedTask, TaskState};
use crate::worker::{IntervalWorker, StepFn};

/// Upper bound of stuck tasks handled per expire pass.
const EXPIRE_BATCH_SIZE: i64 = 300;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub expire_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            expire_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// The two background reconciliation loops of a bus instance.
pub struct MaintenanceWorker {
    expire: IntervalWorker,
    cleanup: IntervalWorker,
}

impl MaintenanceWorker {
    pub fn new(pool: PgPool, plans: Arc<Plans>, config: MaintenanceConfig) -> Self {
        let expire = IntervalWorker::new(
            "maintenance-expire",
            config.expire_interval,
            expire_step(pool.clone(), Arc::clone(&plans)),
        );
        let cleanup = IntervalWorker::new(
            "maintenance-cleanup",
            config.cleanup_interval,
            cleanup_step(pool, plans),
        );
        Self { expire, cleanup }
    }

    pub async fn start(&self) {
        self.expire.start().await;
        self.cleanup.start().await;
    }

    pub async fn stop(&self) {
        tokio::join!(self.expire.stop(), self.cleanup.stop());
    }
}

fn expire_step(pool: PgPool, plans: Arc<Plans>) -> StepFn {
    Arc::new(move || {
        let pool = pool.clone();
        let plans = Arc::clone(&plans);

        Box::pin(async move {
            let mut tx = pool.begin().await?;
            let candidates = plans.select_expired(&mut *tx, EXPIRE_BATCH_SIZE).await?;
            let expired = candidates.len();

            if expired > 0 {
                let resolutions: Vec<ResolvedTask> = candidates
                    .iter()
                    .map(|candidate| {
                        let config = &candidate.config.0;
                        if candidate.retrycount < config.retry_limit {
                            ResolvedTask {
                                id: candidate.id,
                                state: TaskState::Retry,
                                output: json!({"message": "task expired"}),
                                start_after_seconds: Some(
                                    config.retry_delay_for(candidate.retrycount),
                                ),
                            }
                        } else {
                            ResolvedTask {
                                id: candidate.id,
                                state: TaskState::Expired,
                                output: json!({"message": "task expired"}),
                                start_after_seconds: None,
                            }
                        }
                    })
                    .collect();
                plans
                    .resolve(&mut *tx, &resolution_items(&resolutions))
                    .await?;
            }
            tx.commit().await?;

            let released = plans.release_stale_cursor_locks(&pool).await?;
            if expired > 0 || released > 0 {
                info!(expired, released_locks = released, "expire pass finished");
            }

            Ok(expired as i64 == EXPIRE_BATCH_SIZE)
        })
    })
}

fn cleanup_step(pool: PgPool, plans: Arc<Plans>) -> StepFn {
    Arc::new(move || {
        let pool = pool.clone();
        let plans = Arc::clone(&plans);

        Box::pin(async move {
            let events = plans.delete_expired_events(&pool).await?;
            let tasks = plans.purge_archive(&pool).await?;
            if events > 0 || tasks > 0 {
                info!(
                    deleted_events = events,
                    purged_tasks = tasks,
                    "cleanup pass finished"
                );
            }
            Ok(false)
        })
    })
}
