//! HTTP boundary: `POST /command` and `POST /query`.
//!
//! The adapter decodes the JSON envelope, stamps a fresh id and
//! timestamp (callers never set these), merges the transport's
//! additional context into the processing context, invokes the command
//! or query processor, and maps the outcome onto HTTP status codes via
//! the anomaly taxonomy.

use std::io;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router, extract::State};
use serde_json::{Map, Value, json};

use crate::anomaly::{Anomaly, Category};
use crate::command::{Command, CommandRegistry, process_command};
use crate::context::Context;
use crate::query::{Query, QueryRegistry, process_query};
use crate::store::EventStore;

/// Everything the HTTP handlers need, shared across requests.
#[derive(Clone)]
pub struct AppState {
    /// Registry consulted by `POST /command`.
    pub command_registry: Arc<CommandRegistry>,
    /// Registry consulted by `POST /query`.
    pub query_registry: Arc<QueryRegistry>,
    /// Store placed into every processing context.
    pub event_store: EventStore,
    /// Transport-layer context (e.g. auth identity) merged into every
    /// processing context's extension bag.
    pub additional_context: Map<String, Value>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish()
    }
}

/// Build the two-endpoint router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/command", post(handle_command))
        .route("/query", post(handle_query))
        .with_state(state)
}

/// Serve the router on `listener` until the connection loop errors.
///
/// # Errors
///
/// Returns `io::Error` if accepting connections fails.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "http boundary listening");
    axum::serve(listener, router(state)).await
}

impl IntoResponse for Anomaly {
    fn into_response(self) -> Response {
        let status = match self.category {
            Category::Incorrect => StatusCode::BAD_REQUEST,
            Category::Forbidden => StatusCode::FORBIDDEN,
            Category::NotFound => StatusCode::NOT_FOUND,
            Category::Conflict => StatusCode::CONFLICT,
            Category::Fault
            | Category::Unavailable
            | Category::Busy
            | Category::Interrupted => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut body = json!({ "message": self.message });
        if let Some(explain) = self.explain {
            body["explain"] = explain;
        }
        (status, Json(body)).into_response()
    }
}

/// Pull the inner envelope object out of `{"command": {...}}` /
/// `{"query": {...}}` and split it into a handler name and payload.
///
/// Any `<kind>/`-prefixed envelope fields the caller sent (id,
/// timestamp) are discarded: the transport stamps its own.
fn decode_envelope(body: &Value, kind: &str) -> Result<(String, Map<String, Value>), Anomaly> {
    let explain_missing = |field: &str| {
        let mut explain = Map::new();
        explain.insert(field.to_string(), json!("missing required field"));
        Anomaly::incorrect(format!("Invalid {kind}")).with_explain(Value::Object(explain))
    };

    let inner = body
        .get(kind)
        .and_then(Value::as_object)
        .ok_or_else(|| explain_missing(kind))?;

    let name_key = format!("{kind}/name");
    let name = inner
        .get(&name_key)
        .and_then(Value::as_str)
        .ok_or_else(|| explain_missing(&name_key))?
        .to_string();

    let envelope_prefix = format!("{kind}/");
    let payload: Map<String, Value> = inner
        .iter()
        .filter(|(k, _)| !k.starts_with(&envelope_prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok((name, payload))
}

async fn handle_command(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (name, payload) = match decode_envelope(&body, "command") {
        Ok(decoded) => decoded,
        Err(anomaly) => return anomaly.into_response(),
    };

    let ctx = Context::new()
        .with_command(Command::new(name, payload))
        .with_command_registry(state.command_registry.clone())
        .with_event_store(state.event_store.clone())
        .with_additional_map(state.additional_context.clone());

    match process_command(ctx).await {
        Ok(outcome) => match outcome.result {
            Some(result) => (StatusCode::OK, Json(result)).into_response(),
            None => (StatusCode::OK, Json(json!("OK"))).into_response(),
        },
        Err(anomaly) => anomaly.into_response(),
    }
}

async fn handle_query(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (name, payload) = match decode_envelope(&body, "query") {
        Ok(decoded) => decoded,
        Err(anomaly) => return anomaly.into_response(),
    };

    let ctx = Context::new()
        .with_query(Query::new(name, payload))
        .with_query_registry(state.query_registry.clone())
        .with_event_store(state.event_store.clone())
        .with_additional_map(state.additional_context.clone());

    match process_query(ctx).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome.result)).into_response(),
        Err(anomaly) => anomaly.into_response(),
    }
}
