//! HTTP front-end for a [`taskbus`] registry.
//!
//! Instead of polling PostgreSQL, an external dispatcher POSTs incoming
//! work to this handler: task bodies are routed through
//! `TaskBoss::handle_task`, event bodies are projected with
//! `TaskBoss::events_to_tasks` and the synthesized tasks are submitted
//! back to the dispatcher. `send`/`publish` become outbound HTTP through
//! [`WebhookService`]. The registry code path is identical to the
//! database-backed bus.
//!
//! Request bodies are `{"t": true, "b": <task>}` or `{"e": true,
//! "b": <event>}`. When a signing secret is configured, the raw body must
//! carry a hex HMAC-SHA-256 in the `x-body-signature` header; verification
//! is constant-time.

use std::sync::Arc;

use anyhow::{bail, Context};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use taskbus::plans::{event_insert_items, task_insert_items};
use taskbus::registry::RegistryState;
use taskbus::{EventMessage, IncomingEvent, TaskBoss, TaskContext, TaskMessage, Trigger};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA-256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-body-signature";

/// A task pushed in by the external dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingRemoteTask {
    pub id: String,
    /// Task name.
    pub tn: String,
    /// Payload.
    pub d: Value,
    /// Wall-clock budget in seconds.
    pub es: i32,
    /// Retries consumed so far.
    pub r: i16,
    /// Trigger descriptor.
    pub tr: Trigger,
}

/// An event pushed in by the external dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingRemoteEvent {
    pub id: String,
    /// Event name.
    pub n: String,
    /// Payload.
    pub d: Value,
}

#[derive(Debug, Deserialize)]
struct IncomingBody {
    #[serde(default)]
    t: bool,
    #[serde(default)]
    e: bool,
    b: Value,
}

/// Compute the hex HMAC-SHA-256 of `body`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check; malformed hex is simply invalid.
fn verify_signature(secret: &[u8], body: &[u8], provided_hex: &str) -> bool {
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Outbound client for the external dispatcher.
pub struct WebhookService {
    client: reqwest::Client,
    endpoint: String,
    /// Queue stamped on submitted tasks that carry no explicit queue.
    queue: String,
    secret: Option<String>,
    default_keep_in_seconds: i64,
    default_retention_days: i32,
}

impl WebhookService {
    pub fn new(endpoint: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            queue: queue.into(),
            secret: None,
            default_keep_in_seconds: 7 * 24 * 60 * 60,
            default_retention_days: 30,
        }
    }

    /// Sign outbound bodies with `secret`.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Submit outgoing events, wire-encoded as `{e_n, d, rid}` items.
    pub async fn submit_events(&self, events: &[EventMessage]) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let items = event_insert_items(events, self.default_retention_days);
        self.post("events", &items).await
    }

    /// Submit outgoing tasks, wire-encoded as `{q, d, md, cf, ...}` items.
    pub async fn submit_tasks(&self, tasks: &[TaskMessage]) -> anyhow::Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let items = task_insert_items(tasks, &self.queue, self.default_keep_in_seconds);
        self.post("tasks", &items).await
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<()> {
        let raw = serde_json::to_vec(body).context("failed to encode dispatcher body")?;
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), path);

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(raw.clone());
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_body(secret.as_bytes(), &raw));
        }

        let response = request.send().await.context("dispatcher request failed")?;
        if !response.status().is_success() {
            bail!("dispatcher returned {} for {url}", response.status());
        }
        Ok(())
    }
}

/// The registry bound to an external dispatcher instead of a database.
#[derive(Clone)]
pub struct WebhookBus {
    registry: Arc<TaskBoss>,
    service: Arc<WebhookService>,
    secret: Option<String>,
}

impl WebhookBus {
    pub fn new(
        registry: Arc<TaskBoss>,
        service: Arc<WebhookService>,
        secret: Option<String>,
    ) -> Self {
        Self {
            registry,
            service,
            secret,
        }
    }

    /// Submit tasks to the dispatcher (outbound `send`).
    pub async fn send(&self, tasks: Vec<TaskMessage>) -> anyhow::Result<()> {
        self.service.submit_tasks(&tasks).await
    }

    /// Submit events to the dispatcher (outbound `publish`).
    pub async fn publish(&self, events: Vec<EventMessage>) -> anyhow::Result<()> {
        self.service.submit_events(&events).await
    }

    /// Serializable description of the bound registry.
    pub fn state(&self) -> RegistryState {
        self.registry.get_state()
    }

    /// The inbound HTTP handler.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(handle_webhook))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }
}

async fn handle_webhook(
    State(bus): State<WebhookBus>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = &bus.secret {
        let Some(signature) = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            return (
                StatusCode::FORBIDDEN,
                "forbidden: missing x-body-signature",
            )
                .into_response();
        };
        if !verify_signature(secret.as_bytes(), &body, signature) {
            return (StatusCode::FORBIDDEN, "forbidden: invalid signature").into_response();
        }
    }

    let Ok(incoming) = serde_json::from_slice::<IncomingBody>(&body) else {
        return unknown_body();
    };

    if incoming.t {
        let Ok(task) = serde_json::from_value::<IncomingRemoteTask>(incoming.b) else {
            return unknown_body();
        };
        debug!(task = %task.tn, id = %task.id, "handling remote task");
        let ctx = TaskContext::new(task.id, task.tn, task.tr, task.r, task.es);
        let resolution = bus.registry.handle_task(task.d, ctx).await;
        return (StatusCode::OK, Json(resolution.payload().clone())).into_response();
    }

    if incoming.e {
        let Ok(event) = serde_json::from_value::<IncomingRemoteEvent>(incoming.b) else {
            return unknown_body();
        };
        debug!(event = %event.n, id = %event.id, "fanning out remote event");
        let tasks = bus.registry.events_to_tasks(&[IncomingEvent {
            id: event.id,
            name: event.n,
            data: event.d,
        }]);
        let submitted = tasks.len();
        if let Err(e) = bus.service.submit_tasks(&tasks).await {
            error!(error = %e, "failed to submit fanned-out tasks");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"message": "failed to submit tasks"})),
            )
                .into_response();
        }
        return (StatusCode::OK, Json(json!({"tasks": submitted}))).into_response();
    }

    unknown_body()
}

fn unknown_body() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"message": "unknown body"})),
    )
        .into_response()
}
