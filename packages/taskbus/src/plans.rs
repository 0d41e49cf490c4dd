//! SQL plans: every statement the bus and its workers issue, rendered once
//! against the configured schema, plus the short-code JSON builders for
//! the wire payloads.
//!
//! Payload keys are deliberately terse and stable; they are part of the
//! storage contract:
//! - event insert items: `{e_n, d, rid?}`
//! - task insert items: `{q, d, md: {tn, trace}, cf: {r_l, r_d, r_b, ki_s},
//!   skey?, saf, eis}`
//! - resolutions: `{id, s, out, saf?}`

use serde_json::{json, Map, Value};
use sqlx::postgres::PgQueryResult;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres};

use crate::error::BusError;
use crate::event::{EventMessage, StoredEvent};
use crate::task::{PoppedTask, ResolvedTask, StoredTaskConfig, TaskMessage};

/// An active task that outlived its wall-clock budget, as seen by the
/// maintenance expire pass.
#[derive(Debug, FromRow)]
pub struct ExpiredCandidate {
    pub id: i64,
    pub retrycount: i16,
    pub config: Json<StoredTaskConfig>,
}

/// Pre-rendered statements for one schema.
#[derive(Debug, Clone)]
pub struct Plans {
    create_tasks: String,
    create_events: String,
    resolve_tasks: String,
    get_tasks: String,
    last_event_position: String,
    ensure_cursor: String,
    lock_cursor: String,
    unlock_cursor: String,
    fetch_events: String,
    advance_cursor: String,
    select_expired: String,
    release_cursor_locks: String,
    delete_expired_events: String,
    purge_archive: String,
}

impl Plans {
    pub fn new(schema: &str) -> Self {
        Self {
            create_tasks: format!("SELECT {schema}.create_bus_tasks($1)"),
            create_events: format!("SELECT {schema}.create_bus_events($1)"),
            resolve_tasks: format!("SELECT {schema}.resolve_tasks($1)"),
            get_tasks: format!(
                "SELECT id, retrycount, state, data, meta_data, config, expire_in_seconds \
                 FROM {schema}.get_tasks($1, $2)"
            ),
            last_event_position: format!(
                "SELECT coalesce(max(pos), 0) FROM {schema}.events WHERE pos > 0"
            ),
            ensure_cursor: format!(
                r#"INSERT INTO {schema}.cursors (queue, "offset") VALUES ($1, $2)
                   ON CONFLICT (queue) DO NOTHING"#
            ),
            lock_cursor: format!(
                r#"
                UPDATE {schema}.cursors c
                SET locked = true,
                    expire_lock_at = now() + make_interval(secs => $2)
                FROM (
                    SELECT id FROM {schema}.cursors
                    WHERE queue = $1 AND locked = false
                    FOR UPDATE SKIP LOCKED
                ) candidate
                WHERE c.id = candidate.id
                RETURNING c."offset"
                "#
            ),
            unlock_cursor: format!(
                "UPDATE {schema}.cursors SET locked = false, expire_lock_at = NULL WHERE queue = $1"
            ),
            fetch_events: format!(
                r#"
                SELECT id, event_name, event_data, pos
                FROM {schema}.events
                WHERE pos > $1 AND pos > 0
                ORDER BY pos ASC
                LIMIT $2
                "#
            ),
            advance_cursor: format!(
                r#"
                WITH advanced AS (
                    UPDATE {schema}.cursors
                    SET "offset" = $2, locked = false, expire_lock_at = NULL
                    WHERE queue = $1
                    RETURNING id
                )
                SELECT {schema}.create_bus_tasks($3)
                "#
            ),
            select_expired: format!(
                r#"
                SELECT id, retrycount, config
                FROM {schema}.tasks
                WHERE state = 2 AND started_on + expire_in < now()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
                "#
            ),
            release_cursor_locks: format!(
                r#"
                UPDATE {schema}.cursors
                SET locked = false, expire_lock_at = NULL
                WHERE locked = true AND expire_lock_at IS NOT NULL AND expire_lock_at < now()
                "#
            ),
            delete_expired_events: format!("DELETE FROM {schema}.events WHERE expire_at < now()"),
            purge_archive: format!(
                "DELETE FROM {schema}.tasks_completed WHERE keep_until < now()"
            ),
        }
    }

    /// Insert a batch of task items (`create_bus_tasks`). Singleton
    /// conflicts are swallowed by the function's `ON CONFLICT DO NOTHING`.
    pub async fn insert_tasks(&self, pool: &PgPool, items: &Value) -> Result<(), BusError> {
        sqlx::query(&self.create_tasks)
            .bind(items)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Append a batch of event items (`create_bus_events`).
    pub async fn insert_events(&self, pool: &PgPool, items: &Value) -> Result<(), BusError> {
        sqlx::query(&self.create_events)
            .bind(items)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Apply a batch of resolutions (`resolve_tasks`). Usable inside a
    /// transaction, which the expire pass relies on.
    pub async fn resolve<'e, E>(&self, executor: E, items: &Value) -> Result<(), BusError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(&self.resolve_tasks)
            .bind(items)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Fetch-and-start up to `amount` tasks for `queue`.
    pub async fn pop_tasks(
        &self,
        pool: &PgPool,
        queue: &str,
        amount: i64,
    ) -> Result<Vec<PoppedTask>, BusError> {
        let tasks = sqlx::query_as::<_, PoppedTask>(&self.get_tasks)
            .bind(queue)
            .bind(amount as i32)
            .fetch_all(pool)
            .await?;
        Ok(tasks)
    }

    /// Highest committed event position, 0 when the log is empty.
    pub async fn last_event_position(&self, pool: &PgPool) -> Result<i64, BusError> {
        let pos: i64 = sqlx::query_scalar(&self.last_event_position)
            .fetch_one(pool)
            .await?;
        Ok(pos)
    }

    /// Create the cursor row for `queue` at `offset` unless one exists.
    pub async fn ensure_cursor(
        &self,
        pool: &PgPool,
        queue: &str,
        offset: i64,
    ) -> Result<(), BusError> {
        sqlx::query(&self.ensure_cursor)
            .bind(queue)
            .bind(offset)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Try to take the fanout lock for `queue`. Returns the cursor offset
    /// on success, `None` when another worker holds it.
    pub async fn lock_cursor(
        &self,
        pool: &PgPool,
        queue: &str,
        lock_ttl_seconds: f64,
    ) -> Result<Option<i64>, BusError> {
        let offset = sqlx::query_scalar(&self.lock_cursor)
            .bind(queue)
            .bind(lock_ttl_seconds)
            .fetch_optional(pool)
            .await?;
        Ok(offset)
    }

    pub async fn unlock_cursor(&self, pool: &PgPool, queue: &str) -> Result<(), BusError> {
        sqlx::query(&self.unlock_cursor)
            .bind(queue)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Committed events strictly after `offset`, in position order.
    pub async fn fetch_events_after(
        &self,
        pool: &PgPool,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<StoredEvent>, BusError> {
        let events = sqlx::query_as::<_, StoredEvent>(&self.fetch_events)
            .bind(offset)
            .bind(limit)
            .fetch_all(pool)
            .await?;
        Ok(events)
    }

    /// Advance the cursor to `position`, release the lock, and insert the
    /// fanned-out tasks, all in one statement.
    pub async fn advance_cursor(
        &self,
        pool: &PgPool,
        queue: &str,
        position: i64,
        task_items: &Value,
    ) -> Result<(), BusError> {
        sqlx::query(&self.advance_cursor)
            .bind(queue)
            .bind(position)
            .bind(task_items)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Active tasks past their wall-clock budget, row-locked for the
    /// calling transaction.
    pub async fn select_expired<'e, E>(
        &self,
        executor: E,
        limit: i64,
    ) -> Result<Vec<ExpiredCandidate>, BusError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let candidates = sqlx::query_as::<_, ExpiredCandidate>(&self.select_expired)
            .bind(limit)
            .fetch_all(executor)
            .await?;
        Ok(candidates)
    }

    /// Release fanout locks whose TTL lapsed (worker died mid-fanout).
    pub async fn release_stale_cursor_locks(&self, pool: &PgPool) -> Result<u64, BusError> {
        let result: PgQueryResult = sqlx::query(&self.release_cursor_locks)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_expired_events(&self, pool: &PgPool) -> Result<u64, BusError> {
        let result = sqlx::query(&self.delete_expired_events)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn purge_archive(&self, pool: &PgPool) -> Result<u64, BusError> {
        let result = sqlx::query(&self.purge_archive).execute(pool).await?;
        Ok(result.rows_affected())
    }
}

/// Render outgoing tasks as `create_bus_tasks` items. Tasks without an
/// explicit queue land on `default_queue`; tasks without an explicit keep
/// window inherit `default_keep_in_seconds`.
pub fn task_insert_items(
    tasks: &[TaskMessage],
    default_queue: &str,
    default_keep_in_seconds: i64,
) -> Value {
    let items: Vec<Value> = tasks
        .iter()
        .map(|task| {
            let config = &task.config;
            let mut item = Map::new();
            item.insert(
                "q".to_string(),
                json!(task.queue.as_deref().unwrap_or(default_queue)),
            );
            item.insert("d".to_string(), task.data.clone());
            item.insert(
                "md".to_string(),
                json!({ "tn": task.task_name, "trace": task.trigger }),
            );
            item.insert(
                "cf".to_string(),
                json!({
                    "r_l": config.retry_limit,
                    "r_d": config.retry_delay,
                    "r_b": config.retry_backoff,
                    "ki_s": config.keep_in_seconds.unwrap_or(default_keep_in_seconds),
                }),
            );
            if let Some(key) = &config.singleton_key {
                item.insert("skey".to_string(), json!(key));
            }
            item.insert("saf".to_string(), json!(config.start_after_seconds));
            item.insert("eis".to_string(), json!(config.expire_in_seconds));
            Value::Object(item)
        })
        .collect();
    Value::Array(items)
}

/// Render outgoing events as `create_bus_events` items.
pub fn event_insert_items(events: &[EventMessage], default_retention_days: i32) -> Value {
    let items: Vec<Value> = events
        .iter()
        .map(|event| {
            json!({
                "e_n": event.event_name,
                "d": event.data,
                "rid": event.retention_days.unwrap_or(default_retention_days),
            })
        })
        .collect();
    Value::Array(items)
}

/// Render settled attempts as `resolve_tasks` items.
pub fn resolution_items(resolved: &[ResolvedTask]) -> Value {
    let items: Vec<Value> = resolved
        .iter()
        .map(|r| {
            let mut item = Map::new();
            item.insert("id".to_string(), json!(r.id));
            item.insert("s".to_string(), json!(r.state.as_i16()));
            item.insert("out".to_string(), r.output.clone());
            if let Some(saf) = r.start_after_seconds {
                item.insert("saf".to_string(), json!(saf));
            }
            Value::Object(item)
        })
        .collect();
    Value::Array(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskConfig, TaskState, Trigger};

    #[test]
    fn task_items_carry_the_short_codes() {
        let task = TaskMessage {
            task_name: "send_welcome".to_string(),
            queue: None,
            data: json!({"member": 7}),
            config: TaskConfig {
                retry_limit: 2,
                retry_delay: 1,
                retry_backoff: true,
                start_after_seconds: 10,
                expire_in_seconds: 60,
                keep_in_seconds: None,
                singleton_key: Some("member-7".to_string()),
            },
            trigger: Trigger::Direct,
        };

        let items = task_insert_items(&[task], "emails", 3600);
        assert_eq!(
            items,
            json!([{
                "q": "emails",
                "d": {"member": 7},
                "md": {"tn": "send_welcome", "trace": {"type": "direct"}},
                "cf": {"r_l": 2, "r_d": 1, "r_b": true, "ki_s": 3600},
                "skey": "member-7",
                "saf": 10,
                "eis": 60,
            }])
        );
    }

    #[test]
    fn explicit_queue_and_keep_override_defaults() {
        let task = TaskMessage {
            task_name: "t".to_string(),
            queue: Some("other".to_string()),
            data: Value::Null,
            config: TaskConfig {
                keep_in_seconds: Some(120),
                ..Default::default()
            },
            trigger: Trigger::Direct,
        };

        let items = task_insert_items(&[task], "emails", 3600);
        assert_eq!(items[0]["q"], "other");
        assert_eq!(items[0]["cf"]["ki_s"], 120);
        assert!(items[0].get("skey").is_none());
    }

    #[test]
    fn event_items_carry_the_short_codes() {
        let event = EventMessage {
            event_name: "member_joined".to_string(),
            data: json!({"id": 1}),
            retention_days: None,
        };
        assert_eq!(
            event_insert_items(&[event], 30),
            json!([{"e_n": "member_joined", "d": {"id": 1}, "rid": 30}])
        );
    }

    #[test]
    fn resolution_items_omit_saf_unless_retrying() {
        let done = ResolvedTask {
            id: 4,
            state: TaskState::Completed,
            output: json!({"ok": true}),
            start_after_seconds: None,
        };
        let retry = ResolvedTask {
            id: 5,
            state: TaskState::Retry,
            output: json!({"message": "fail"}),
            start_after_seconds: Some(8),
        };

        let items = resolution_items(&[done, retry]);
        assert_eq!(
            items,
            json!([
                {"id": 4, "s": 3, "out": {"ok": true}},
                {"id": 5, "s": 1, "out": {"message": "fail"}, "saf": 8},
            ])
        );
    }
}
