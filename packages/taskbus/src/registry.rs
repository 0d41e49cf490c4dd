//! Per-process, per-queue task registry.
//!
//! `TaskBoss` owns the task definitions and event subscriptions of one
//! queue, routes incoming task invocations to their handlers, and projects
//! committed events onto outgoing tasks during fanout. It is
//! storage-agnostic: the database worker and the webhook front-end drive
//! the same code paths.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ensure_user_queue;
use crate::definitions::{EventDefinition, TaskDefinition};
use crate::error::BusError;
use crate::event::IncomingEvent;
use crate::task::{TaskConfig, TaskConfigPatch, TaskMessage, Trigger};
use crate::utils::{flatten_error, map_completion_data, with_deadline, DeadlineExceeded};

/// Boxed handler over untyped JSON; typed handlers are wrapped at
/// registration time.
type TaskHandlerFn =
    Arc<dyn Fn(Value, TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// The settled outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResolution {
    /// Terminal success; the payload becomes the task's `output`.
    Success(Value),
    /// Failed attempt; retry policy decides between `retry` and `failed`.
    Failure(Value),
    /// The handler outlived its wall-clock budget; retry policy decides
    /// between `retry` and `expired`.
    Expired(Value),
}

impl TaskResolution {
    pub fn payload(&self) -> &Value {
        match self {
            TaskResolution::Success(v)
            | TaskResolution::Failure(v)
            | TaskResolution::Expired(v) => v,
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Completed(Value),
    Failed(Value),
}

/// Execution context handed to a task handler.
///
/// `resolve`/`fail` short-circuit the completion payload without
/// returning: the first writer wins and later writes (including the
/// handler's own return or error) cannot override it.
#[derive(Clone)]
pub struct TaskContext {
    pub id: String,
    pub task_name: String,
    pub trigger: Trigger,
    /// Retries consumed so far; 0 on the first attempt.
    pub retried: i16,
    pub expire_in_seconds: i32,
    outcome: Arc<Mutex<Option<Outcome>>>,
}

impl TaskContext {
    pub fn new(
        id: impl Into<String>,
        task_name: impl Into<String>,
        trigger: Trigger,
        retried: i16,
        expire_in_seconds: i32,
    ) -> Self {
        Self {
            id: id.into(),
            task_name: task_name.into(),
            trigger,
            retried,
            expire_in_seconds,
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    /// Complete the task with `payload`, even if the handler later throws.
    pub fn resolve(&self, payload: Value) {
        self.write(Outcome::Completed(payload));
    }

    /// Fail the task with `payload`, even if the handler later returns.
    pub fn fail(&self, payload: Value) {
        self.write(Outcome::Failed(payload));
    }

    fn write(&self, outcome: Outcome) {
        let mut guard = match self.outcome.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            *guard = Some(outcome);
        }
    }

    fn take_outcome(&self) -> Option<Outcome> {
        let mut guard = match self.outcome.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take()
    }
}

/// Config attached to an event subscription: fixed at registration, or
/// computed from the event payload at fanout time.
#[derive(Clone)]
pub enum SubscriptionConfig {
    Static(TaskConfigPatch),
    Dynamic(Arc<dyn Fn(&Value) -> TaskConfigPatch + Send + Sync>),
}

impl SubscriptionConfig {
    /// A subscription with no config overrides.
    pub fn none() -> Self {
        SubscriptionConfig::Static(TaskConfigPatch::default())
    }

    fn materialize(&self, payload: &Value) -> TaskConfigPatch {
        match self {
            SubscriptionConfig::Static(patch) => patch.clone(),
            SubscriptionConfig::Dynamic(f) => f(payload),
        }
    }
}

struct TaskEntry {
    config: TaskConfig,
    handler: TaskHandlerFn,
}

struct EventSubscription {
    event_name: String,
    task_name: String,
    config: SubscriptionConfig,
}

/// Serializable description of a registry, used by the webhook transport.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryState {
    pub queue: String,
    pub tasks: Vec<String>,
    pub events: Vec<EventBindingState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventBindingState {
    pub event_name: String,
    pub task_name: String,
}

/// The registry of one queue.
pub struct TaskBoss {
    queue: String,
    tasks: HashMap<String, TaskEntry>,
    subscriptions: Vec<EventSubscription>,
}

impl TaskBoss {
    pub fn new(queue: impl Into<String>) -> Result<Self, BusError> {
        let queue = queue.into();
        ensure_user_queue(&queue)?;
        Ok(Self {
            queue,
            tasks: HashMap::new(),
            subscriptions: Vec::new(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether any event subscription exists; without one the fanout
    /// worker has nothing to do.
    pub fn has_subscriptions(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// Default config of a registered task.
    pub fn task_config(&self, task_name: &str) -> Option<&TaskConfig> {
        self.tasks.get(task_name).map(|entry| &entry.config)
    }

    /// Register a directly invocable task.
    pub fn register_task<T, F, Fut>(
        &mut self,
        definition: TaskDefinition<T>,
        handler: F,
        override_config: Option<TaskConfigPatch>,
    ) -> Result<(), BusError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let task_name = definition.task_name().to_string();
        if let Some(queue) = definition.queue() {
            if queue != self.queue {
                return Err(BusError::QueueMismatch {
                    task: task_name,
                    definition_queue: queue.to_string(),
                    registry_queue: self.queue.clone(),
                });
            }
        }

        let config = definition
            .config()
            .merged_with(&override_config.unwrap_or_default())
            .apply_to(&TaskConfig::default());

        self.insert_entry(task_name, config, wrap_handler(definition, handler))
    }

    /// Subscribe a handler to an event. Fanout will synthesize one
    /// `task_name` task per committed matching event, with `config`
    /// materialized against the event payload at fanout time.
    pub fn on<E, F, Fut>(
        &mut self,
        event: &EventDefinition<E>,
        task_name: impl Into<String>,
        config: SubscriptionConfig,
        handler: F,
    ) -> Result<(), BusError>
    where
        E: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(E, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let task_name = task_name.into();
        let event_name = event.event_name().to_string();
        if self
            .subscriptions
            .iter()
            .any(|s| s.event_name == event_name && s.task_name == task_name)
        {
            return Err(BusError::DuplicateSubscription {
                event: event_name,
                task: task_name,
            });
        }

        // The synthesized task is an ordinary registered task; its payload
        // type is the event payload type.
        let definition: TaskDefinition<E> = TaskDefinition::new(task_name.clone());
        self.insert_entry(
            task_name.clone(),
            TaskConfig::default(),
            wrap_handler(definition, handler),
        )?;
        self.subscriptions.push(EventSubscription {
            event_name,
            task_name,
            config,
        });
        Ok(())
    }

    fn insert_entry(
        &mut self,
        task_name: String,
        config: TaskConfig,
        handler: TaskHandlerFn,
    ) -> Result<(), BusError> {
        if self.tasks.contains_key(&task_name) {
            return Err(BusError::DuplicateTask(task_name));
        }
        self.tasks.insert(task_name, TaskEntry { config, handler });
        Ok(())
    }

    /// Project committed events onto outgoing tasks for this queue, in
    /// event order. Performs no payload validation: events in the log are
    /// already committed facts.
    pub fn events_to_tasks(&self, events: &[IncomingEvent]) -> Vec<TaskMessage> {
        let mut out = Vec::new();
        for event in events {
            for subscription in self
                .subscriptions
                .iter()
                .filter(|s| s.event_name == event.name)
            {
                let Some(entry) = self.tasks.get(&subscription.task_name) else {
                    continue;
                };
                let patch = subscription.config.materialize(&event.data);
                out.push(TaskMessage {
                    task_name: subscription.task_name.clone(),
                    queue: Some(self.queue.clone()),
                    data: event.data.clone(),
                    config: patch.apply_to(&entry.config),
                    trigger: Trigger::Event {
                        event_id: event.id.clone(),
                        event_name: event.name.clone(),
                    },
                });
            }
        }
        out
    }

    /// Route one task invocation to its handler, enforcing the wall-clock
    /// deadline and the one-shot `resolve`/`fail` outcome semantics.
    pub async fn handle_task(&self, data: Value, ctx: TaskContext) -> TaskResolution {
        let Some(entry) = self.tasks.get(&ctx.task_name) else {
            return TaskResolution::Failure(json!({
                "message": format!("task {} is not registered on queue {}", ctx.task_name, self.queue),
            }));
        };

        debug!(queue = %self.queue, task = %ctx.task_name, id = %ctx.id, "handling task");

        let deadline = Duration::from_secs(ctx.expire_in_seconds.max(0) as u64);
        let result = with_deadline((entry.handler)(data, ctx.clone()), deadline).await;

        match (ctx.take_outcome(), result) {
            (Some(Outcome::Completed(payload)), _) => {
                TaskResolution::Success(map_completion_data(payload))
            }
            (Some(Outcome::Failed(payload)), _) => TaskResolution::Failure(payload),
            (None, Ok(value)) => TaskResolution::Success(map_completion_data(value)),
            (None, Err(e)) => {
                if e.downcast_ref::<DeadlineExceeded>().is_some() {
                    TaskResolution::Expired(flatten_error(&e))
                } else {
                    TaskResolution::Failure(flatten_error(&e))
                }
            }
        }
    }

    /// Serializable description of this registry.
    pub fn get_state(&self) -> RegistryState {
        let mut tasks: Vec<String> = self.tasks.keys().cloned().collect();
        tasks.sort_unstable();
        let events = self
            .subscriptions
            .iter()
            .map(|s| EventBindingState {
                event_name: s.event_name.clone(),
                task_name: s.task_name.clone(),
            })
            .collect();
        RegistryState {
            queue: self.queue.clone(),
            tasks,
            events,
        }
    }
}

/// Wrap a typed handler into the untyped form stored in the registry. A
/// payload that fails to deserialize fails the attempt with the same
/// precise message the publish-side validation uses.
fn wrap_handler<T, F, Fut>(definition: TaskDefinition<T>, handler: F) -> TaskHandlerFn
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(T, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    let task_name = definition.task_name().to_string();
    let handler = Arc::new(handler);
    Arc::new(move |data, ctx| {
        let handler = Arc::clone(&handler);
        let task_name = task_name.clone();
        Box::pin(async move {
            let typed: T = serde_json::from_value(data)
                .map_err(|e| anyhow::anyhow!("invalid input for task {task_name}: {e}"))?;
            handler(typed, ctx).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Payload {
        works: String,
    }

    fn noop_handler(
        _payload: Payload,
        _ctx: TaskContext,
    ) -> impl Future<Output = anyhow::Result<Value>> {
        async { Ok(Value::Null) }
    }

    fn ctx_for(task_name: &str) -> TaskContext {
        TaskContext::new("1", task_name, Trigger::Direct, 0, 30)
    }

    #[test]
    fn duplicate_task_names_are_rejected() {
        let mut boss = TaskBoss::new("emails").unwrap();
        boss.register_task(TaskDefinition::<Payload>::new("t"), noop_handler, None)
            .unwrap();
        let err = boss
            .register_task(TaskDefinition::<Payload>::new("t"), noop_handler, None)
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateTask(_)));
    }

    #[test]
    fn foreign_queue_definitions_are_rejected() {
        let mut boss = TaskBoss::new("emails").unwrap();
        let err = boss
            .register_task(
                TaskDefinition::<Payload>::new("t").on_queue("sms"),
                noop_handler,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, BusError::QueueMismatch { .. }));
    }

    #[test]
    fn reserved_queue_is_rejected() {
        assert!(matches!(
            TaskBoss::new(crate::config::MAINTENANCE_QUEUE),
            Err(BusError::ReservedQueue(_))
        ));
    }

    #[test]
    fn duplicate_subscriptions_are_rejected() {
        let mut boss = TaskBoss::new("emails").unwrap();
        let event: EventDefinition<Payload> = EventDefinition::new("joined");
        boss.on(&event, "h1", SubscriptionConfig::none(), noop_handler)
            .unwrap();
        let err = boss
            .on(&event, "h1", SubscriptionConfig::none(), noop_handler)
            .unwrap_err();
        // The duplicate task name trips first; both are registration errors.
        assert!(matches!(
            err,
            BusError::DuplicateTask(_) | BusError::DuplicateSubscription { .. }
        ));
    }

    #[test]
    fn fanout_emits_one_task_per_matching_binding_in_event_order() {
        let mut boss = TaskBoss::new("q").unwrap();
        let e1: EventDefinition<Payload> = EventDefinition::new("e1");
        let e2: EventDefinition<Payload> = EventDefinition::new("e2");
        boss.on(&e1, "h1", SubscriptionConfig::none(), noop_handler)
            .unwrap();
        boss.on(&e1, "h2", SubscriptionConfig::none(), noop_handler)
            .unwrap();
        boss.on(&e2, "h3", SubscriptionConfig::none(), noop_handler)
            .unwrap();

        let events = vec![
            IncomingEvent {
                id: "1".to_string(),
                name: "e1".to_string(),
                data: json!({"works": "a"}),
            },
            IncomingEvent {
                id: "2".to_string(),
                name: "e2".to_string(),
                data: json!({"works": "b"}),
            },
            IncomingEvent {
                id: "3".to_string(),
                name: "e1".to_string(),
                data: json!({"works": "c"}),
            },
        ];

        let tasks = boss.events_to_tasks(&events);
        let shape: Vec<(&str, &Value)> = tasks
            .iter()
            .map(|t| (t.task_name.as_str(), &t.data))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("h1", &json!({"works": "a"})),
                ("h2", &json!({"works": "a"})),
                ("h3", &json!({"works": "b"})),
                ("h1", &json!({"works": "c"})),
                ("h2", &json!({"works": "c"})),
            ]
        );
        assert!(tasks.iter().all(|t| t.queue.as_deref() == Some("q")));
        assert_eq!(
            tasks[0].trigger,
            Trigger::Event {
                event_id: "1".to_string(),
                event_name: "e1".to_string(),
            }
        );
    }

    #[test]
    fn dynamic_subscription_config_sees_the_event_payload() {
        let mut boss = TaskBoss::new("q").unwrap();
        let event: EventDefinition<Payload> = EventDefinition::new("joined");
        boss.on(
            &event,
            "h",
            SubscriptionConfig::Dynamic(Arc::new(|payload| TaskConfigPatch {
                singleton_key: payload
                    .get("works")
                    .and_then(Value::as_str)
                    .map(String::from),
                ..Default::default()
            })),
            noop_handler,
        )
        .unwrap();

        let tasks = boss.events_to_tasks(&[IncomingEvent {
            id: "9".to_string(),
            name: "joined".to_string(),
            data: json!({"works": "abc"}),
        }]);
        assert_eq!(tasks[0].config.singleton_key.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn handler_return_value_is_normalized() {
        let mut boss = TaskBoss::new("q").unwrap();
        boss.register_task(
            TaskDefinition::<Payload>::new("t"),
            |_p, _ctx| async { Ok(json!("with result")) },
            None,
        )
        .unwrap();

        let resolution = boss
            .handle_task(json!({"works": "x"}), ctx_for("t"))
            .await;
        assert_eq!(
            resolution,
            TaskResolution::Success(json!({"value": "with result"}))
        );
    }

    #[tokio::test]
    async fn handler_error_is_flattened_with_a_stack() {
        let mut boss = TaskBoss::new("q").unwrap();
        boss.register_task(
            TaskDefinition::<Payload>::new("t"),
            |_p, _ctx| async { Err(anyhow::anyhow!("fail")) },
            None,
        )
        .unwrap();

        let resolution = boss
            .handle_task(json!({"works": "x"}), ctx_for("t"))
            .await;
        let TaskResolution::Failure(output) = resolution else {
            panic!("expected failure");
        };
        assert_eq!(output["message"], "fail");
        assert!(!output["stack"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_wins_over_a_later_error() {
        let mut boss = TaskBoss::new("q").unwrap();
        boss.register_task(
            TaskDefinition::<Payload>::new("t"),
            |_p, ctx: TaskContext| async move {
                ctx.resolve(json!({"kept": true}));
                anyhow::bail!("ignored")
            },
            None,
        )
        .unwrap();

        let resolution = boss
            .handle_task(json!({"works": "x"}), ctx_for("t"))
            .await;
        assert_eq!(resolution, TaskResolution::Success(json!({"kept": true})));
    }

    #[tokio::test]
    async fn fail_wins_over_a_later_return() {
        let mut boss = TaskBoss::new("q").unwrap();
        boss.register_task(
            TaskDefinition::<Payload>::new("t"),
            |_p, ctx: TaskContext| async move {
                ctx.fail(json!({"custom": "failure"}));
                Ok(json!({"ignored": true}))
            },
            None,
        )
        .unwrap();

        let resolution = boss
            .handle_task(json!({"works": "x"}), ctx_for("t"))
            .await;
        assert_eq!(
            resolution,
            TaskResolution::Failure(json!({"custom": "failure"}))
        );
    }

    #[tokio::test]
    async fn first_outcome_writer_wins() {
        let ctx = ctx_for("t");
        ctx.resolve(json!(1));
        ctx.fail(json!(2));
        ctx.resolve(json!(3));
        match ctx.take_outcome() {
            Some(Outcome::Completed(v)) => assert_eq!(v, json!(1)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_task_fails_without_panicking() {
        let boss = TaskBoss::new("q").unwrap();
        let resolution = boss.handle_task(Value::Null, ctx_for("ghost")).await;
        let TaskResolution::Failure(output) = resolution else {
            panic!("expected failure");
        };
        assert!(output["message"]
            .as_str()
            .unwrap()
            .contains("not registered"));
    }

    #[tokio::test]
    async fn deadline_breach_fails_with_the_literal_message() {
        let mut boss = TaskBoss::new("q").unwrap();
        boss.register_task(
            TaskDefinition::<Payload>::new("t"),
            |_p, _ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            },
            None,
        )
        .unwrap();

        let ctx = TaskContext::new("1", "t", Trigger::Direct, 0, 1);
        let resolution = boss.handle_task(json!({"works": "x"}), ctx).await;
        let TaskResolution::Expired(output) = resolution else {
            panic!("expected an expired resolution");
        };
        assert_eq!(output["message"], "handler execution exceeded 1000ms");
    }

    #[tokio::test]
    async fn invalid_payload_fails_the_attempt_with_a_precise_message() {
        let mut boss = TaskBoss::new("q").unwrap();
        boss.register_task(TaskDefinition::<Payload>::new("t"), noop_handler, None)
            .unwrap();

        let resolution = boss.handle_task(json!({"works": 1}), ctx_for("t")).await;
        let TaskResolution::Failure(output) = resolution else {
            panic!("expected failure");
        };
        assert!(output["message"]
            .as_str()
            .unwrap()
            .starts_with("invalid input for task t:"));
    }

    #[test]
    fn state_lists_tasks_and_bindings() {
        let mut boss = TaskBoss::new("q").unwrap();
        boss.register_task(TaskDefinition::<Payload>::new("direct"), noop_handler, None)
            .unwrap();
        let event: EventDefinition<Payload> = EventDefinition::new("joined");
        boss.on(&event, "projector", SubscriptionConfig::none(), noop_handler)
            .unwrap();

        let state = boss.get_state();
        assert_eq!(state.queue, "q");
        assert_eq!(state.tasks, vec!["direct", "projector"]);
        assert_eq!(state.events.len(), 1);
        assert_eq!(state.events[0].event_name, "joined");
        assert_eq!(state.events[0].task_name, "projector");
    }
}
