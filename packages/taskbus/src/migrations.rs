//! Ordered, hash-stamped schema migrations.
//!
//! The migration list is compiled into the crate and rendered against the
//! configured schema. Application runs in one transaction holding a
//! per-schema advisory lock, so concurrent starters serialize instead of
//! racing DDL. Every previously applied migration is re-hashed on startup;
//! any drift in the SQL text is a fatal error rather than a silent skip.

use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};
use tracing::info;

use crate::error::BusError;

/// One schema migration, already rendered for a concrete schema.
#[derive(Debug, Clone)]
pub struct Migration {
    pub name: &'static str,
    pub sql: String,
}

#[derive(Debug, FromRow)]
struct AppliedMigration {
    #[allow(dead_code)]
    id: i32,
    name: String,
    hash: String,
}

/// Hex SHA-256 of the migration SQL text. Only ever compared against
/// hashes this same function produced.
pub fn migration_hash(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}

/// Advisory lock key scoping migration application to one
/// `(database, schema)` pair: the first eight bytes of
/// `md5(database || '.tb.' || schema)` as a big-endian i64.
pub fn advisory_lock_key(database: &str, schema: &str) -> i64 {
    let digest = md5::compute(format!("{database}.tb.{schema}"));
    let b = digest.0;
    i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Bootstrap DDL that must exist before the migration table can be read.
/// Idempotent and never recorded.
fn preamble(schema: &str) -> String {
    format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {schema};
CREATE TABLE IF NOT EXISTS {schema}.bus_migrations (
    id integer PRIMARY KEY,
    name text NOT NULL UNIQUE,
    hash text NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now()
);
"#
    )
}

/// The full, ordered migration list rendered for `schema`.
pub fn migration_set(schema: &str) -> Vec<Migration> {
    vec![
        Migration {
            name: "create-events",
            sql: format!(
                r#"
CREATE TABLE {schema}.events (
    id bigserial PRIMARY KEY,
    event_name text NOT NULL,
    event_data jsonb NOT NULL,
    pos bigint NOT NULL DEFAULT 0,
    created_at timestamptz NOT NULL DEFAULT now(),
    expire_at date NOT NULL DEFAULT (now() + interval '30 days')
);

CREATE SEQUENCE {schema}.event_order AS bigint;

CREATE INDEX idx_events_expire_at ON {schema}.events (expire_at);
CREATE UNIQUE INDEX idx_events_pos ON {schema}.events (pos) WHERE pos > 0;

-- Position assignment is deferred to commit and serialized by an advisory
-- transaction lock: an ascending scan over pos can therefore never observe
-- a committed row while an earlier position is still uncommitted.
CREATE FUNCTION {schema}.assign_event_position() RETURNS trigger AS $do$
BEGIN
    PERFORM pg_advisory_xact_lock(hashtext('{schema}.events'));
    UPDATE {schema}.events SET pos = nextval('{schema}.event_order') WHERE id = NEW.id;
    RETURN NULL;
END;
$do$ LANGUAGE plpgsql;

CREATE CONSTRAINT TRIGGER trg_assign_event_position
    AFTER INSERT ON {schema}.events
    DEFERRABLE INITIALLY DEFERRED
    FOR EACH ROW
    EXECUTE FUNCTION {schema}.assign_event_position();
"#
            ),
        },
        Migration {
            name: "create-tasks",
            sql: format!(
                r#"
CREATE TABLE {schema}.tasks (
    id bigserial PRIMARY KEY,
    queue text NOT NULL,
    state smallint NOT NULL DEFAULT 0,
    data jsonb,
    meta_data jsonb NOT NULL,
    config jsonb NOT NULL,
    retrycount smallint NOT NULL DEFAULT 0,
    started_on timestamptz,
    created_on timestamptz NOT NULL DEFAULT now(),
    start_after timestamptz NOT NULL DEFAULT now(),
    expire_in interval NOT NULL,
    singleton_key text,
    output jsonb
);

CREATE INDEX idx_tasks_pop ON {schema}.tasks (queue, start_after) WHERE state < 2;
CREATE INDEX idx_tasks_active ON {schema}.tasks (state) WHERE state = 2;

-- The sole mechanism behind singleton tasks: inserts rely on
-- ON CONFLICT DO NOTHING against this index.
CREATE UNIQUE INDEX idx_tasks_singleton
    ON {schema}.tasks (queue, singleton_key) WHERE state < 4;
"#
            ),
        },
        Migration {
            name: "create-tasks-completed",
            sql: format!(
                r#"
CREATE TABLE {schema}.tasks_completed (
    id bigint PRIMARY KEY,
    queue text NOT NULL,
    state smallint NOT NULL,
    data jsonb,
    meta_data jsonb NOT NULL,
    config jsonb NOT NULL,
    retrycount smallint NOT NULL DEFAULT 0,
    started_on timestamptz,
    created_on timestamptz NOT NULL,
    completed_on timestamptz NOT NULL DEFAULT now(),
    keep_until timestamptz NOT NULL DEFAULT (now() + interval '7 days'),
    singleton_key text,
    output jsonb
);

CREATE INDEX idx_tasks_completed_keep_until ON {schema}.tasks_completed (keep_until);
"#
            ),
        },
        Migration {
            name: "create-cursors",
            sql: format!(
                r#"
CREATE TABLE {schema}.cursors (
    id bigserial PRIMARY KEY,
    queue text NOT NULL UNIQUE,
    "offset" bigint NOT NULL DEFAULT 0,
    locked boolean NOT NULL DEFAULT false,
    expire_lock_at timestamptz,
    created_at timestamptz NOT NULL DEFAULT now()
);
"#
            ),
        },
        Migration {
            name: "create-bus-functions",
            sql: format!(
                r#"
CREATE FUNCTION {schema}.create_bus_events(events jsonb) RETURNS void AS $$
    INSERT INTO {schema}.events (event_name, event_data, expire_at)
    SELECT
        e->>'e_n',
        e->'d',
        (now() + make_interval(days => coalesce((e->>'rid')::int, 30)))::date
    FROM jsonb_array_elements(events) AS e
$$ LANGUAGE sql;

CREATE FUNCTION {schema}.create_bus_tasks(tasks jsonb) RETURNS void AS $$
    INSERT INTO {schema}.tasks
        (queue, state, data, meta_data, config, singleton_key, start_after, expire_in)
    SELECT
        t->>'q',
        coalesce((t->>'s')::smallint, 0),
        t->'d',
        t->'md',
        t->'cf',
        t->>'skey',
        now() + make_interval(secs => coalesce((t->>'saf')::float8, 0)),
        make_interval(secs => coalesce((t->>'eis')::float8, 300))
    FROM jsonb_array_elements(tasks) AS t
    ON CONFLICT DO NOTHING
$$ LANGUAGE sql;

-- Fetch-and-start: whoever wins the row lock is the sole executor.
-- retrycount is incremented only when the row leaves retry, so the
-- returned value numbers the attempt starting at zero.
CREATE FUNCTION {schema}.get_tasks(target_queue text, amount integer)
RETURNS TABLE (
    id bigint,
    retrycount smallint,
    state smallint,
    data jsonb,
    meta_data jsonb,
    config jsonb,
    expire_in_seconds integer
) AS $$
    WITH next_tasks AS (
        SELECT t.id
        FROM {schema}.tasks t
        WHERE t.queue = target_queue
          AND t.state < 2
          AND t.start_after <= now()
        ORDER BY t.created_on
        LIMIT amount
        FOR UPDATE SKIP LOCKED
    )
    UPDATE {schema}.tasks t
    SET state = 2,
        started_on = now(),
        retrycount = CASE WHEN t.state = 1 THEN t.retrycount + 1 ELSE t.retrycount END
    FROM next_tasks
    WHERE t.id = next_tasks.id
    RETURNING t.id, t.retrycount, t.state, t.data, t.meta_data, t.config,
              (extract(epoch FROM t.expire_in))::int
$$ LANGUAGE sql;

-- Resolutions: {{id, s, out, saf?}}. Retries update in place, terminal
-- states move the row to the archive. The state = 2 guard makes a second
-- resolve of the same attempt a no-op.
CREATE FUNCTION {schema}.resolve_tasks(resolutions jsonb) RETURNS void AS $$
    WITH items AS (
        SELECT (r->>'id')::bigint AS task_id,
               (r->>'s')::smallint AS new_state,
               r->'out' AS out_payload,
               (r->>'saf')::float8 AS saf
        FROM jsonb_array_elements(resolutions) AS r
    ),
    retried AS (
        UPDATE {schema}.tasks t
        SET state = 1,
            start_after = now() + make_interval(secs => coalesce(i.saf, 0)),
            output = i.out_payload
        FROM items i
        WHERE t.id = i.task_id AND i.new_state = 1 AND t.state = 2
        RETURNING t.id
    ),
    archived AS (
        DELETE FROM {schema}.tasks t
        USING items i
        WHERE t.id = i.task_id AND i.new_state > 2 AND t.state = 2
        RETURNING t.id, t.queue, i.new_state, t.data, t.meta_data, t.config,
                  t.retrycount, t.started_on, t.created_on, t.singleton_key,
                  i.out_payload
    )
    INSERT INTO {schema}.tasks_completed
        (id, queue, state, data, meta_data, config, retrycount, started_on,
         created_on, singleton_key, output, completed_on, keep_until)
    SELECT a.id, a.queue, a.new_state, a.data, a.meta_data, a.config,
           a.retrycount, a.started_on, a.created_on, a.singleton_key,
           a.out_payload,
           now(),
           now() + make_interval(secs => coalesce((a.config->>'ki_s')::float8, 604800))
    FROM archived a
$$ LANGUAGE sql;
"#
            ),
        },
    ]
}

async fn current_database(conn: &mut sqlx::PgConnection) -> Result<String, sqlx::Error> {
    sqlx::query_scalar("SELECT current_database()")
        .fetch_one(conn)
        .await
}

async fn take_advisory_lock(conn: &mut sqlx::PgConnection, key: i64) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

async fn exec_raw_sql(conn: &mut sqlx::PgConnection, sql: &str) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(sql).execute(conn).await?;
    Ok(())
}

async fn fetch_applied(
    conn: &mut sqlx::PgConnection,
    schema: &str,
) -> Result<Vec<AppliedMigration>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT id, name, hash FROM {schema}.bus_migrations ORDER BY id"
    ))
    .fetch_all(conn)
    .await
}

async fn record_migration(
    conn: &mut sqlx::PgConnection,
    schema: &str,
    position: i32,
    name: &str,
    hash: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {schema}.bus_migrations (id, name, hash) VALUES ($1, $2, $3)"
    ))
    .bind(position)
    .bind(name)
    .bind(hash)
    .execute(conn)
    .await?;
    Ok(())
}

/// Apply all pending migrations for `schema`, validating the already
/// applied prefix by hash.
///
/// Safe to run from any number of processes concurrently: appliers
/// serialize on the advisory lock, and a second run over an up-to-date
/// schema is a no-op.
pub async fn apply_migrations(pool: &PgPool, schema: &str) -> Result<(), BusError> {
    let target = migration_set(schema);

    let mut tx = pool.begin().await?;

    let database = current_database(&mut tx).await?;
    take_advisory_lock(&mut tx, advisory_lock_key(&database, schema)).await?;

    exec_raw_sql(&mut tx, &preamble(schema)).await?;

    let applied = fetch_applied(&mut tx, schema).await?;

    for (position, row) in applied.iter().enumerate() {
        let Some(migration) = target.get(position) else {
            // The database was migrated by a newer build; nothing to do.
            break;
        };
        if row.name != migration.name {
            return Err(BusError::MigrationOutOfOrder {
                position,
                expected: migration.name.to_string(),
                found: row.name.clone(),
            });
        }
        let computed = migration_hash(&migration.sql);
        if row.hash != computed {
            return Err(BusError::MigrationChanged {
                name: migration.name.to_string(),
                recorded: row.hash.clone(),
                computed,
            });
        }
    }

    let mut newly_applied = 0usize;
    for (position, migration) in target.iter().enumerate().skip(applied.len()) {
        exec_raw_sql(&mut tx, &migration.sql).await?;
        let hash = migration_hash(&migration.sql);
        record_migration(&mut tx, schema, position as i32, migration.name, &hash).await?;
        newly_applied += 1;
    }

    tx.commit().await?;

    info!(
        schema,
        applied = newly_applied,
        total = target.len(),
        "bus migrations up to date"
    );
    Ok(())
}
