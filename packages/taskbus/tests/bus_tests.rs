//! End-to-end bus scenarios against containerized Postgres.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::time::Instant;

use common::{fast_config, test_pool, unique_schema, wait_until};
use taskbus::migrations::apply_migrations;
use taskbus::{
    EventDefinition, EventMessage, SubscriptionConfig, TaskBoss, TaskBus, TaskConfigPatch,
    TaskDefinition,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Payload {
    works: String,
}

/// `(state, retrycount, output, task_name)` per archive row, id order.
async fn archive_rows(pool: &PgPool, schema: &str) -> Vec<(i16, i16, Value, String)> {
    sqlx::query_as(&format!(
        "SELECT state, retrycount, output, meta_data->>'tn' \
         FROM {schema}.tasks_completed ORDER BY id"
    ))
    .fetch_all(pool)
    .await
    .unwrap()
}

async fn active_task_count(pool: &PgPool, schema: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT count(*) FROM {schema}.tasks"))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn happy_task_completes_into_the_archive() {
    let pool = test_pool().await;
    let schema = unique_schema("happy");

    type Seen = Arc<Mutex<Vec<(String, String, bool, i32)>>>;
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));

    let mut boss = TaskBoss::new("q").unwrap();
    let def: TaskDefinition<Payload> = TaskDefinition::new("t").with_config(TaskConfigPatch {
        expire_in_seconds: Some(10),
        ..Default::default()
    });
    {
        let seen = Arc::clone(&seen);
        boss.register_task(
            def.clone(),
            move |input: Payload, ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push((
                        input.works,
                        ctx.task_name.clone(),
                        ctx.trigger.is_direct(),
                        ctx.expire_in_seconds,
                    ));
                    Ok(json!({"success": "with result"}))
                }
            },
            None,
        )
        .unwrap();
    }

    let bus = TaskBus::new(pool.clone(), boss, fast_config(&schema)).unwrap();
    bus.start().await.unwrap();
    bus.send_one(
        def.from(&Payload {
            works: "abcd".to_string(),
        })
        .unwrap(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(15), || {
            let pool = pool.clone();
            let schema = schema.clone();
            async move { !archive_rows(&pool, &schema).await.is_empty() }
        })
        .await,
        "task never reached the archive"
    );
    bus.stop().await.unwrap();

    let rows = archive_rows(&pool, &schema).await;
    assert_eq!(rows.len(), 1);
    let (state, retrycount, output, task_name) = &rows[0];
    assert_eq!(*state, 3);
    assert_eq!(*retrycount, 0);
    assert_eq!(output, &json!({"success": "with result"}));
    assert_eq!(task_name, "t");

    // Resolve atomicity: the active row is gone once the archive row exists.
    assert_eq!(active_task_count(&pool, &schema).await, 0);

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.as_slice(),
        &[("abcd".to_string(), "t".to_string(), true, 10)]
    );
}

#[tokio::test]
async fn failing_task_retries_then_lands_in_failed() {
    let pool = test_pool().await;
    let schema = unique_schema("retry");

    let attempts = Arc::new(AtomicUsize::new(0));
    let mut boss = TaskBoss::new("q").unwrap();
    let def: TaskDefinition<Payload> = TaskDefinition::new("t").with_config(TaskConfigPatch {
        retry_limit: Some(2),
        retry_delay: Some(1),
        retry_backoff: Some(false),
        ..Default::default()
    });
    {
        let attempts = Arc::clone(&attempts);
        boss.register_task(
            def.clone(),
            move |_input: Payload, _ctx| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("fail"))
                }
            },
            None,
        )
        .unwrap();
    }

    let bus = TaskBus::new(pool.clone(), boss, fast_config(&schema)).unwrap();
    bus.start().await.unwrap();
    bus.send_one(
        def.from(&Payload {
            works: "x".to_string(),
        })
        .unwrap(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(25), || {
            let pool = pool.clone();
            let schema = schema.clone();
            async move { !archive_rows(&pool, &schema).await.is_empty() }
        })
        .await,
        "task never went terminal"
    );
    bus.stop().await.unwrap();

    // Initial attempt plus two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let rows = archive_rows(&pool, &schema).await;
    let (state, retrycount, output, _) = &rows[0];
    assert_eq!(*state, 6);
    assert_eq!(*retrycount, 2);
    assert_eq!(output["message"], "fail");
    assert!(!output["stack"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn exponential_backoff_spaces_retries() {
    let pool = test_pool().await;
    let schema = unique_schema("backoff");

    let attempt_times: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let mut boss = TaskBoss::new("q").unwrap();
    let def: TaskDefinition<Payload> = TaskDefinition::new("t").with_config(TaskConfigPatch {
        retry_limit: Some(2),
        retry_delay: Some(1),
        retry_backoff: Some(true),
        ..Default::default()
    });
    {
        let attempt_times = Arc::clone(&attempt_times);
        boss.register_task(
            def.clone(),
            move |_input: Payload, _ctx| {
                let attempt_times = Arc::clone(&attempt_times);
                async move {
                    attempt_times.lock().unwrap().push(Instant::now());
                    Err(anyhow::anyhow!("fail"))
                }
            },
            None,
        )
        .unwrap();
    }

    let bus = TaskBus::new(pool.clone(), boss, fast_config(&schema)).unwrap();
    bus.start().await.unwrap();
    bus.send_one(
        def.from(&Payload {
            works: "x".to_string(),
        })
        .unwrap(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(30), || {
            let pool = pool.clone();
            let schema = schema.clone();
            async move { !archive_rows(&pool, &schema).await.is_empty() }
        })
        .await,
        "task never went terminal"
    );
    bus.stop().await.unwrap();

    let times = attempt_times.lock().unwrap();
    assert_eq!(times.len(), 3);
    // Delays double: >= 1s after the first failure, >= 2s after the second.
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_secs(1), "first gap {first_gap:?}");
    assert!(
        second_gap >= Duration::from_secs(2),
        "second gap {second_gap:?}"
    );
    assert!(second_gap > first_gap);
}

#[tokio::test]
async fn singleton_tasks_deduplicate_on_insert() {
    let pool = test_pool().await;
    let schema = unique_schema("singleton");
    apply_migrations(&pool, &schema).await.unwrap();

    let mut boss = TaskBoss::new("q").unwrap();
    let def: TaskDefinition<Payload> = TaskDefinition::new("t");
    boss.register_task(def.clone(), |_input: Payload, _ctx| async { Ok(Value::Null) }, None)
        .unwrap();

    // Not started: both inserts land before any worker claims.
    let bus = TaskBus::new(pool.clone(), boss, fast_config(&schema)).unwrap();

    let message = def
        .from_with_config(
            &Payload {
                works: "x".to_string(),
            },
            &TaskConfigPatch {
                singleton_key: Some("s".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    bus.send_one(message.clone()).await.unwrap();
    bus.send_one(message).await.unwrap();

    assert_eq!(active_task_count(&pool, &schema).await, 1);
}

#[tokio::test]
async fn events_fan_out_to_every_subscriber_in_order() {
    let pool = test_pool().await;
    let schema = unique_schema("fanout");

    let mut boss = TaskBoss::new("q").unwrap();
    let e1: EventDefinition<Payload> = EventDefinition::new("e1");
    let e2: EventDefinition<Payload> = EventDefinition::new("e2");
    for task_name in ["h1", "h2"] {
        boss.on(&e1, task_name, SubscriptionConfig::none(), |_p: Payload, _ctx| async {
            Ok(Value::Null)
        })
        .unwrap();
    }
    boss.on(&e2, "h3", SubscriptionConfig::none(), |_p: Payload, _ctx| async {
        Ok(Value::Null)
    })
    .unwrap();

    let bus = TaskBus::new(pool.clone(), boss, fast_config(&schema)).unwrap();
    bus.start().await.unwrap();

    bus.publish(vec![
        e1.from(&Payload {
            works: "a".to_string(),
        })
        .unwrap(),
        e2.from(&Payload {
            works: "b".to_string(),
        })
        .unwrap(),
        e1.from(&Payload {
            works: "c".to_string(),
        })
        .unwrap(),
    ])
    .await
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(20), || {
            let pool = pool.clone();
            let schema = schema.clone();
            async move { archive_rows(&pool, &schema).await.len() == 5 }
        })
        .await,
        "expected five fanned-out tasks to complete"
    );
    bus.stop().await.unwrap();

    let rows: Vec<(String, String, String)> = sqlx::query_as(&format!(
        "SELECT meta_data->>'tn', data->>'works', meta_data->'trace'->>'type' \
         FROM {schema}.tasks_completed ORDER BY id"
    ))
    .fetch_all(&pool)
    .await
    .unwrap();

    let shape: Vec<(&str, &str)> = rows
        .iter()
        .map(|(tn, works, _)| (tn.as_str(), works.as_str()))
        .collect();
    assert_eq!(
        shape,
        vec![
            ("h1", "a"),
            ("h2", "a"),
            ("h3", "b"),
            ("h1", "c"),
            ("h2", "c"),
        ]
    );
    assert!(rows.iter().all(|(_, _, trigger)| trigger == "event"));
}

#[tokio::test]
async fn late_joining_queue_skips_historical_events() {
    let pool = test_pool().await;
    let schema = unique_schema("joinlater");

    let joined: EventDefinition<Payload> = EventDefinition::new("joined");

    // Service A publishes two events before service B exists.
    let boss_a = TaskBoss::new("qa").unwrap();
    let bus_a = TaskBus::new(pool.clone(), boss_a, fast_config(&schema)).unwrap();
    bus_a.start().await.unwrap();
    bus_a
        .publish(vec![
            joined
                .from(&Payload {
                    works: "1".to_string(),
                })
                .unwrap(),
            joined
                .from(&Payload {
                    works: "2".to_string(),
                })
                .unwrap(),
        ])
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool.clone();
            let schema = schema.clone();
            async move {
                let positioned: i64 = sqlx::query_scalar(&format!(
                    "SELECT count(*) FROM {schema}.events WHERE pos > 0"
                ))
                .fetch_one(&pool)
                .await
                .unwrap();
                positioned == 2
            }
        })
        .await
    );

    // Service B joins with a subscription to the same event.
    let handled = Arc::new(AtomicUsize::new(0));
    let mut boss_b = TaskBoss::new("qb").unwrap();
    {
        let handled = Arc::clone(&handled);
        boss_b
            .on(&joined, "h", SubscriptionConfig::none(), move |_p: Payload, _ctx| {
                let handled = Arc::clone(&handled);
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }
    let bus_b = TaskBus::new(pool.clone(), boss_b, fast_config(&schema)).unwrap();
    bus_b.start().await.unwrap();

    // The fresh cursor starts at the current end of the log.
    let offset: i64 = sqlx::query_scalar(&format!(
        r#"SELECT "offset" FROM {schema}.cursors WHERE queue = 'qb'"#
    ))
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(offset, 2);

    // Give fanout a chance to misbehave before checking nothing happened.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 0);
    let qb_tasks: i64 = sqlx::query_scalar(&format!(
        "SELECT count(*) FROM {schema}.tasks WHERE queue = 'qb'"
    ))
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(qb_tasks, 0);

    bus_a.stop().await.unwrap();
    bus_b.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_publishes_produce_gapless_positions() {
    let pool = test_pool().await;
    let schema = unique_schema("ordering");
    apply_migrations(&pool, &schema).await.unwrap();

    let boss = TaskBoss::new("q").unwrap();
    let bus = Arc::new(TaskBus::new(pool.clone(), boss, fast_config(&schema)).unwrap());
    let event: EventDefinition<Payload> = EventDefinition::new("e");

    // 200 events across concurrent micro-batches.
    let mut handles = Vec::new();
    for batch in 0..20 {
        let bus = Arc::clone(&bus);
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            let events: Vec<EventMessage> = (0..10)
                .map(|i| {
                    event
                        .from(&Payload {
                            works: format!("{batch}-{i}"),
                        })
                        .unwrap()
                })
                .collect();
            bus.publish(events).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool.clone();
            let schema = schema.clone();
            async move {
                let positioned: i64 = sqlx::query_scalar(&format!(
                    "SELECT count(*) FROM {schema}.events WHERE pos > 0"
                ))
                .fetch_one(&pool)
                .await
                .unwrap();
                positioned == 200
            }
        })
        .await,
        "not all events received a position"
    );

    let positions: Vec<i64> = sqlx::query_scalar(&format!(
        "SELECT pos FROM {schema}.events WHERE pos > 0 ORDER BY pos ASC"
    ))
    .fetch_all(&pool)
    .await
    .unwrap();
    let expected: Vec<i64> = (1..=200).collect();
    assert_eq!(positions, expected);
}

#[tokio::test]
async fn deadline_breach_retries_then_expires() {
    let pool = test_pool().await;
    let schema = unique_schema("expiry");

    let mut boss = TaskBoss::new("q").unwrap();
    let def: TaskDefinition<Payload> = TaskDefinition::new("t").with_config(TaskConfigPatch {
        expire_in_seconds: Some(1),
        retry_limit: Some(1),
        retry_delay: Some(2),
        ..Default::default()
    });
    boss.register_task(
        def.clone(),
        |_input: Payload, _ctx| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(Value::Null)
        },
        None,
    )
    .unwrap();

    let bus = TaskBus::new(pool.clone(), boss, fast_config(&schema)).unwrap();
    bus.start().await.unwrap();
    bus.send_one(
        def.from(&Payload {
            works: "x".to_string(),
        })
        .unwrap(),
    )
    .await
    .unwrap();

    // First breach sends the row back to retry without touching retrycount.
    assert!(
        wait_until(Duration::from_secs(10), || {
            let pool = pool.clone();
            let schema = schema.clone();
            async move {
                let row: Option<(i16, i16)> = sqlx::query_as(&format!(
                    "SELECT state, retrycount FROM {schema}.tasks LIMIT 1"
                ))
                .fetch_optional(&pool)
                .await
                .unwrap();
                matches!(row, Some((1, 0)))
            }
        })
        .await,
        "first attempt never reached the retry state"
    );

    // Second breach exhausts retries and expires into the archive.
    assert!(
        wait_until(Duration::from_secs(20), || {
            let pool = pool.clone();
            let schema = schema.clone();
            async move { !archive_rows(&pool, &schema).await.is_empty() }
        })
        .await,
        "task never expired"
    );
    bus.stop().await.unwrap();

    let rows = archive_rows(&pool, &schema).await;
    let (state, retrycount, output, _) = &rows[0];
    assert_eq!(*state, 4);
    assert_eq!(*retrycount, 1);
    assert_eq!(output["message"], "handler execution exceeded 1000ms");
}

#[tokio::test]
async fn retention_cleanup_removes_expired_rows() {
    let pool = test_pool().await;
    let schema = unique_schema("retention");

    let mut boss = TaskBoss::new("q").unwrap();
    let def: TaskDefinition<Payload> = TaskDefinition::new("t").with_config(TaskConfigPatch {
        keep_in_seconds: Some(0),
        ..Default::default()
    });
    boss.register_task(def.clone(), |_input: Payload, _ctx| async { Ok(Value::Null) }, None)
        .unwrap();

    let mut config = fast_config(&schema);
    config.cleanup_interval = Duration::from_secs(1);
    let bus = TaskBus::new(pool.clone(), boss, config).unwrap();
    bus.start().await.unwrap();

    // An event already past its retention and a task archived with an
    // immediate keep_until.
    bus.publish_one(EventMessage {
        event_name: "stale".to_string(),
        data: json!({}),
        retention_days: Some(-1),
    })
    .await
    .unwrap();
    bus.send_one(
        def.from(&Payload {
            works: "x".to_string(),
        })
        .unwrap(),
    )
    .await
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(20), || {
            let pool = pool.clone();
            let schema = schema.clone();
            async move {
                let events: i64 =
                    sqlx::query_scalar(&format!("SELECT count(*) FROM {schema}.events"))
                        .fetch_one(&pool)
                        .await
                        .unwrap();
                let archived: i64 = sqlx::query_scalar(&format!(
                    "SELECT count(*) FROM {schema}.tasks_completed"
                ))
                .fetch_one(&pool)
                .await
                .unwrap();
                let active: i64 =
                    sqlx::query_scalar(&format!("SELECT count(*) FROM {schema}.tasks"))
                        .fetch_one(&pool)
                        .await
                        .unwrap();
                events == 0 && archived == 0 && active == 0
            }
        })
        .await,
        "cleanup never removed the expired rows"
    );
    bus.stop().await.unwrap();
}
