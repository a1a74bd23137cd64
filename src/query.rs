//! Query envelope, handler registry, and the query processing pipeline.
//!
//! Mirrors the command side minus event emission: queries are pure with
//! respect to the event store, so the pipeline is look up, validate,
//! invoke inside an error boundary, and return the result.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::anomaly::Anomaly;
use crate::command::{HandlerFuture, PayloadValidator, panic_message};
use crate::context::Context;

/// A request for data. Transient, like [`Command`](crate::Command).
///
/// Envelope fields serialize under the `query/` namespace with the
/// payload flattened alongside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Namespaced handler name, e.g. `"example/get-counter"`.
    #[serde(rename = "query/name")]
    pub name: String,
    /// Transport-assigned UUID for tracing this invocation.
    #[serde(rename = "query/id")]
    pub id: Uuid,
    /// Wall-clock UTC time the query entered the system.
    #[serde(rename = "query/timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Free-form query fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Query {
    /// Build a query with a fresh id and the current UTC timestamp.
    pub fn new(name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// What a successful query handler produced.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// The caller-facing result value.
    pub result: Value,
}

impl QueryOutcome {
    /// Wrap a result value.
    pub fn new(result: Value) -> Self {
        Self { result }
    }
}

/// A query handler: takes the processing context, returns a result.
pub type QueryHandler = Arc<dyn Fn(Context) -> HandlerFuture<QueryOutcome> + Send + Sync>;

/// A registration: name, handler, and optional payload schema.
#[derive(Clone)]
pub struct QueryDef {
    /// Namespaced query name this definition answers to.
    pub name: String,
    /// The handler invoked for matching queries.
    pub handler: QueryHandler,
    /// Payload validator; `None` means no schema to enforce.
    pub validator: Option<PayloadValidator>,
}

impl QueryDef {
    /// Define a query handler under `name`.
    pub fn new(name: impl Into<String>, handler: QueryHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            validator: None,
        }
    }

    /// Attach a payload validator.
    pub fn with_validator(mut self, validator: PayloadValidator) -> Self {
        self.validator = Some(validator);
        self
    }
}

impl std::fmt::Debug for QueryDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDef")
            .field("name", &self.name)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// Name-keyed query registrations. Built at startup, read-only after.
#[derive(Default)]
pub struct QueryRegistry {
    by_name: HashMap<String, QueryDef>,
}

static GLOBAL_QUERIES: OnceLock<Arc<QueryRegistry>> = OnceLock::new();

impl QueryRegistry {
    /// Build a registry from definitions. Later definitions replace
    /// earlier ones with the same name.
    pub fn from_defs(defs: impl IntoIterator<Item = QueryDef>) -> Self {
        Self {
            by_name: defs.into_iter().map(|d| (d.name.clone(), d)).collect(),
        }
    }

    /// Look up a definition by query name.
    pub fn get(&self, name: &str) -> Option<&QueryDef> {
        self.by_name.get(name)
    }

    /// Install `registry` as the process-wide default. Returns `false`
    /// if a default was already installed (the existing one is kept).
    pub fn set_global(registry: Arc<QueryRegistry>) -> bool {
        GLOBAL_QUERIES.set(registry).is_ok()
    }

    /// The process-wide default registry, if one was installed.
    pub fn global() -> Option<Arc<QueryRegistry>> {
        GLOBAL_QUERIES.get().cloned()
    }
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn validate_envelope(query: &Query) -> Result<(), Anomaly> {
    if query.name.is_empty() {
        return Err(Anomaly::incorrect("Invalid query")
            .with_explain(json!({"name": "must be a non-empty namespaced name"})));
    }
    Ok(())
}

/// Process the query carried by `ctx`.
///
/// # Errors
///
/// - `not_found "Unknown Query"` if the name is not registered;
/// - `incorrect` (with `explain`) on envelope or payload validation
///   failure;
/// - `fault "Error executing query handler: …"` if the handler panics;
/// - any anomaly the handler itself returned, unchanged.
pub async fn process_query(ctx: Context) -> Result<QueryOutcome, Anomaly> {
    let query = ctx
        .query
        .clone()
        .ok_or_else(|| Anomaly::fault("no query in processing context"))?;
    let registry = ctx
        .query_registry
        .clone()
        .or_else(QueryRegistry::global)
        .ok_or_else(|| Anomaly::fault("no query registry in processing context"))?;

    let Some(def) = registry.get(&query.name) else {
        return Err(Anomaly::not_found("Unknown Query"));
    };

    validate_envelope(&query)?;
    if let Some(validator) = &def.validator {
        validator(&query.payload)
            .map_err(|explain| Anomaly::incorrect("Invalid query").with_explain(explain))?;
    }

    let handler = def.handler.clone();
    tracing::debug!(query = %query.name, id = %query.id, "dispatching query");

    match tokio::spawn(handler(ctx)).await {
        Ok(result) => result,
        Err(join_error) => {
            let message = panic_message(join_error);
            tracing::error!(query = %query.name, error = %message, "query handler panicked");
            Err(Anomaly::fault(format!(
                "Error executing query handler: {message}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventStore, EventStoreConfig};
    use crate::{Event, EventQuery};

    fn in_memory() -> EventStore {
        EventStore::start(EventStoreConfig::default()).expect("start should succeed")
    }

    /// Handler for `example/count-events`: counts domain events of the
    /// type given in the payload.
    fn count_events_handler() -> QueryHandler {
        Arc::new(|ctx: Context| {
            Box::pin(async move {
                let query = ctx
                    .query
                    .as_ref()
                    .ok_or_else(|| Anomaly::fault("no query in context"))?;
                let event_type = query.payload["type"]
                    .as_str()
                    .ok_or_else(|| Anomaly::incorrect("type must be a string"))?
                    .to_string();
                let store = ctx
                    .event_store
                    .as_ref()
                    .ok_or_else(|| Anomaly::fault("no event store in context"))?;
                let count = store
                    .read(&EventQuery::new().types([event_type]))
                    .await
                    .len();
                Ok(QueryOutcome::new(json!({ "count": count })))
            })
        })
    }

    fn registry() -> Arc<QueryRegistry> {
        let require_type: PayloadValidator = Arc::new(|payload: &Map<String, Value>| {
            if payload.get("type").is_some_and(Value::is_string) {
                Ok(())
            } else {
                Err(json!({"type": "missing required field"}))
            }
        });
        Arc::new(QueryRegistry::from_defs([QueryDef::new(
            "example/count-events",
            count_events_handler(),
        )
        .with_validator(require_type)]))
    }

    fn query(name: &str) -> Query {
        let mut payload = Map::new();
        payload.insert("type".to_string(), json!("t/e"));
        Query::new(name, payload)
    }

    #[tokio::test]
    async fn unknown_query_is_not_found() {
        let ctx = Context::new()
            .with_query(query("unknown/x"))
            .with_query_registry(registry());

        let anomaly = process_query(ctx).await.err().expect("should fail");
        assert_eq!(anomaly.category, crate::Category::NotFound);
        assert_eq!(anomaly.message, "Unknown Query");
    }

    #[tokio::test]
    async fn payload_validation_failure_is_incorrect_with_explain() {
        let mut query = query("example/count-events");
        query.payload.clear();

        let ctx = Context::new()
            .with_query(query)
            .with_query_registry(registry());

        let anomaly = process_query(ctx).await.err().expect("should fail");
        assert_eq!(anomaly.category, crate::Category::Incorrect);
        assert!(anomaly.explain.is_some());
    }

    #[tokio::test]
    async fn happy_path_returns_result() {
        let store = in_memory();
        store
            .append(vec![
                Event::new("t/e", json!(1)),
                Event::new("t/e", json!(2)),
                Event::new("t/other", json!(3)),
            ])
            .await
            .expect("append");

        let ctx = Context::new()
            .with_query(query("example/count-events"))
            .with_query_registry(registry())
            .with_event_store(store);

        let outcome = process_query(ctx).await.expect("should succeed");
        assert_eq!(outcome.result, json!({ "count": 2 }));
    }

    #[tokio::test]
    async fn handler_panic_becomes_fault() {
        let registry = Arc::new(QueryRegistry::from_defs([QueryDef::new(
            "example/explode",
            Arc::new(|_ctx: Context| {
                let fut: HandlerFuture<QueryOutcome> = Box::pin(async { panic!("kaput") });
                fut
            }),
        )]));
        let ctx = Context::new()
            .with_query(query("example/explode"))
            .with_query_registry(registry);

        let anomaly = process_query(ctx).await.err().expect("should fail");
        assert_eq!(anomaly.category, crate::Category::Fault);
        assert!(anomaly.message.starts_with("Error executing query handler:"));
        assert!(anomaly.message.contains("kaput"));
    }

    #[tokio::test]
    async fn handler_anomaly_is_forwarded_unchanged() {
        let registry = Arc::new(QueryRegistry::from_defs([QueryDef::new(
            "example/denied",
            Arc::new(|_ctx: Context| {
                Box::pin(async { Err(Anomaly::forbidden("not yours")) })
                    as HandlerFuture<QueryOutcome>
            }),
        )]));
        let ctx = Context::new()
            .with_query(query("example/denied"))
            .with_query_registry(registry);

        let anomaly = process_query(ctx).await.err().expect("should fail");
        assert_eq!(anomaly, Anomaly::forbidden("not yours"));
    }

    #[tokio::test]
    async fn query_wire_shape_namespaces_envelope() {
        let query = query("example/count-events");
        let value = serde_json::to_value(&query).expect("serialize");
        assert_eq!(value["query/name"], "example/count-events");
        assert!(value["query/id"].is_string());
        assert_eq!(value["type"], "t/e");
    }
}
