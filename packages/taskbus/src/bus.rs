//! The bound bus: owns the pool and registry, applies migrations, and runs
//! the task, fanout, and maintenance workers for one queue.
//!
//! `send`/`publish` are plain inserts; when the target is the local queue
//! the corresponding worker is woken through a debouncer so bursts
//! coalesce into one early poll instead of one per insert.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::batcher::Batcher;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::event::EventMessage;
use crate::fanout::{FanoutConfig, FanoutWorker};
use crate::maintenance::{MaintenanceConfig, MaintenanceWorker};
use crate::migrations::apply_migrations;
use crate::plans::{event_insert_items, resolution_items, task_insert_items, Plans};
use crate::registry::{RegistryState, TaskBoss, TaskContext};
use crate::task::{PoppedTask, ResolvedTask, TaskMessage};
use crate::task_worker::{DispatchFn, PopFn, ResolveSink, TaskWorker, TaskWorkerConfig};
use crate::utils::Debounce;

/// Resolution batching: one `resolve_tasks` round-trip per group.
const RESOLVE_BATCH_SIZE: usize = 75;
const RESOLVE_BATCH_LATENCY: Duration = Duration::from_millis(30);

/// Debounce windows for local worker wake-ups.
const NOTIFY_DELAY: Duration = Duration::from_millis(75);
const TASK_NOTIFY_MAX_WAIT: Duration = Duration::from_millis(150);
const FANOUT_NOTIFY_MAX_WAIT: Duration = Duration::from_millis(300);

const CURSOR_LOCK_TTL: Duration = Duration::from_secs(60);

/// A queue-bound bus handle.
pub struct TaskBus {
    pool: RwLock<PgPool>,
    owned_url: Option<String>,
    registry: Arc<TaskBoss>,
    config: BusConfig,
    plans: Arc<Plans>,
    running: Mutex<Option<Running>>,
}

struct Running {
    task_worker: Arc<TaskWorker>,
    fanout: Arc<FanoutWorker>,
    maintenance: MaintenanceWorker,
    batcher: Arc<Batcher<ResolvedTask>>,
    task_debounce: Debounce,
    fanout_debounce: Debounce,
}

impl TaskBus {
    /// Bind a registry to an externally owned pool.
    pub fn new(pool: PgPool, registry: TaskBoss, config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let plans = Arc::new(Plans::new(&config.schema));
        Ok(Self {
            pool: RwLock::new(pool),
            owned_url: None,
            registry: Arc::new(registry),
            config,
            plans,
            running: Mutex::new(None),
        })
    }

    /// Bind a registry to a pool the bus constructs and owns. The owned
    /// pool is closed on `stop` and reopened on a later `start`.
    pub async fn connect(
        url: &str,
        registry: TaskBoss,
        config: BusConfig,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        let mut bus = Self::new(pool, registry, config)?;
        bus.owned_url = Some(url.to_string());
        Ok(bus)
    }

    pub fn pool(&self) -> PgPool {
        match self.pool.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn registry(&self) -> &TaskBoss {
        &self.registry
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Serializable description of the bound registry.
    pub fn registry_state(&self) -> RegistryState {
        self.registry.get_state()
    }

    /// Insert tasks. Tasks without an explicit queue land on this bus's
    /// queue; inserts targeting the local queue wake the task worker.
    pub async fn send(&self, tasks: Vec<TaskMessage>) -> Result<(), BusError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let own_queue = self.registry.queue();
        let targets_own_queue = tasks
            .iter()
            .any(|t| t.queue.as_deref().unwrap_or(own_queue) == own_queue);

        let items = task_insert_items(&tasks, own_queue, self.config.keep_in_seconds);
        self.plans.insert_tasks(&self.pool(), &items).await?;

        if targets_own_queue {
            if let Some(running) = self.running.lock().await.as_ref() {
                running.task_debounce.call();
            }
        }
        Ok(())
    }

    pub async fn send_one(&self, task: TaskMessage) -> Result<(), BusError> {
        self.send(vec![task]).await
    }

    /// Append events to the log; wakes the local fanout worker when this
    /// queue has subscriptions.
    pub async fn publish(&self, events: Vec<EventMessage>) -> Result<(), BusError> {
        if events.is_empty() {
            return Ok(());
        }
        let items = event_insert_items(&events, self.config.retention_in_days);
        self.plans.insert_events(&self.pool(), &items).await?;

        if self.registry.has_subscriptions() {
            if let Some(running) = self.running.lock().await.as_ref() {
                running.fanout_debounce.call();
            }
        }
        Ok(())
    }

    pub async fn publish_one(&self, event: EventMessage) -> Result<(), BusError> {
        self.publish(vec![event]).await
    }

    /// Migrate, position the cursor, and start the workers. Idempotent
    /// while running; allowed again after `stop`.
    ///
    /// A freshly created cursor starts at the current end of the event
    /// log, so a newly joined service does not replay history.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let pool = self.reopen_pool_if_needed().await?;

        apply_migrations(&pool, &self.config.schema).await?;

        let queue = self.registry.queue();
        let last_position = self.plans.last_event_position(&pool).await?;
        self.plans
            .ensure_cursor(&pool, queue, last_position)
            .await?;

        let batcher = self.build_resolve_batcher(pool.clone());
        let task_worker = Arc::new(self.build_task_worker(pool.clone(), Arc::clone(&batcher)));
        let fanout = Arc::new(FanoutWorker::new(
            pool.clone(),
            Arc::clone(&self.plans),
            Arc::clone(&self.registry),
            FanoutConfig {
                fetch_size: self.config.events_fetch_size,
                poll_interval: self.config.worker.interval,
                lock_ttl: CURSOR_LOCK_TTL,
                default_keep_in_seconds: self.config.keep_in_seconds,
            },
        ));
        let maintenance = MaintenanceWorker::new(
            pool,
            Arc::clone(&self.plans),
            MaintenanceConfig {
                expire_interval: self.config.expire_interval,
                cleanup_interval: self.config.cleanup_interval,
            },
        );

        maintenance.start().await;
        task_worker.start().await;
        fanout.start().await;

        let task_debounce = {
            let worker = Arc::clone(&task_worker);
            Debounce::new(NOTIFY_DELAY, TASK_NOTIFY_MAX_WAIT, move || worker.notify())
        };
        let fanout_debounce = {
            let fanout = Arc::clone(&fanout);
            Debounce::new(NOTIFY_DELAY, FANOUT_NOTIFY_MAX_WAIT, move || {
                fanout.notify()
            })
        };

        *running = Some(Running {
            task_worker,
            fanout,
            maintenance,
            batcher,
            task_debounce,
            fanout_debounce,
        });
        info!(queue, "task bus started");
        Ok(())
    }

    /// Stop all workers, drain in-flight handlers, flush pending
    /// resolutions, and close the pool when this bus owns it.
    pub async fn stop(&self) -> Result<(), BusError> {
        let running = { self.running.lock().await.take() };
        let Some(running) = running else {
            return Ok(());
        };

        tokio::join!(
            running.fanout.stop(),
            running.maintenance.stop(),
            running.task_worker.stop(),
        );
        running.batcher.close().await;

        if self.owned_url.is_some() {
            self.pool().close().await;
        }
        info!(queue = %self.registry.queue(), "task bus stopped");
        Ok(())
    }

    async fn reopen_pool_if_needed(&self) -> Result<PgPool, BusError> {
        let current = self.pool();
        if !current.is_closed() {
            return Ok(current);
        }
        let Some(url) = &self.owned_url else {
            return Ok(current);
        };
        let fresh = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        match self.pool.write() {
            Ok(mut guard) => *guard = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
        Ok(fresh)
    }

    fn build_resolve_batcher(&self, pool: PgPool) -> Arc<Batcher<ResolvedTask>> {
        let plans = Arc::clone(&self.plans);
        Arc::new(Batcher::new(
            RESOLVE_BATCH_SIZE,
            RESOLVE_BATCH_LATENCY,
            Box::new(move |group: Vec<ResolvedTask>| {
                let pool = pool.clone();
                let plans = Arc::clone(&plans);
                Box::pin(async move {
                    let items = resolution_items(&group);
                    if let Err(e) = plans.resolve(&pool, &items).await {
                        error!(error = %e, count = group.len(), "failed to flush task resolutions");
                    }
                })
            }),
        ))
    }

    fn build_task_worker(&self, pool: PgPool, batcher: Arc<Batcher<ResolvedTask>>) -> TaskWorker {
        let pop: PopFn = {
            let pool = pool.clone();
            let plans = Arc::clone(&self.plans);
            let queue = self.registry.queue().to_string();
            Arc::new(move |amount| {
                let pool = pool.clone();
                let plans = Arc::clone(&plans);
                let queue = queue.clone();
                Box::pin(async move { plans.pop_tasks(&pool, &queue, amount).await })
            })
        };

        let dispatch: DispatchFn = {
            let registry = Arc::clone(&self.registry);
            Arc::new(move |task: PoppedTask| {
                let registry = Arc::clone(&registry);
                Box::pin(async move {
                    let meta = task.meta_data.0;
                    let ctx = TaskContext::new(
                        task.id.to_string(),
                        meta.tn,
                        meta.trace,
                        task.retrycount,
                        task.expire_in_seconds,
                    );
                    registry.handle_task(task.data, ctx).await
                })
            })
        };

        let resolve: ResolveSink = {
            let batcher = Arc::clone(&batcher);
            Arc::new(move |resolved| batcher.push(resolved))
        };

        TaskWorker::new(
            TaskWorkerConfig {
                max_concurrency: self.config.worker.concurrency,
                poll_interval: self.config.worker.interval,
                refill_threshold: self.config.worker.refill_factor,
                ..TaskWorkerConfig::default()
            },
            pop,
            dispatch,
            resolve,
        )
    }
}
