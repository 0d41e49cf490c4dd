//! Shared test infrastructure: one Postgres container for the whole run.
//!
//! The container starts on first use and is reused by every test; each
//! test isolates itself in its own schema, so migrations and data never
//! collide. Run with `RUST_LOG=debug cargo test -- --nocapture` for
//! worker logs.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use taskbus::BusConfig;

struct SharedInfra {
    db_url: String,
    // Keeps the container alive for the entire test run.
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();
static SCHEMA_COUNTER: AtomicUsize = AtomicUsize::new(0);

async fn infra() -> &'static SharedInfra {
    SHARED_INFRA
        .get_or_init(|| async {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();

            let postgres = Postgres::default()
                .start()
                .await
                .expect("failed to start Postgres container");
            let host = postgres.get_host().await.expect("container host");
            let port = postgres
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");
            let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

            SharedInfra {
                db_url,
                _postgres: postgres,
            }
        })
        .await
}

pub async fn test_pool() -> PgPool {
    let infra = infra().await;
    PgPoolOptions::new()
        .max_connections(8)
        .connect(&infra.db_url)
        .await
        .expect("failed to connect to test database")
}

/// A schema name no other test uses.
pub fn unique_schema(prefix: &str) -> String {
    let n = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}_{n}")
}

/// Bus config tuned for fast test turnaround.
pub fn fast_config(schema: &str) -> BusConfig {
    let mut config = BusConfig::with_schema(schema);
    config.worker.interval = Duration::from_millis(100);
    config.expire_interval = Duration::from_secs(1);
    config.cleanup_interval = Duration::from_secs(2);
    config
}

/// Poll `check` until it passes or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
