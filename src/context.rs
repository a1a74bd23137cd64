//! The processing context threaded through command, query, and reactor
//! handlers.
//!
//! Instead of a loosely-typed map, the context is a struct with typed
//! well-known fields plus one open bag (`additional`) for
//! application-specific extensions such as the transport's auth identity.
//! Registries resolve with per-call precedence: a registry set on the
//! context wins over the process-wide default.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::command::{Command, CommandRegistry};
use crate::event::Event;
use crate::query::{Query, QueryRegistry};
use crate::store::EventStore;

/// Everything a handler invocation may need, assembled by the caller.
///
/// `Clone` is cheap: shared collaborators are `Arc`-backed, and envelope
/// fields are small. Handlers receive the context by value so they can
/// re-thread it into nested processor calls (see
/// [`skip_event_storage`](Context::skip_event_storage)).
///
/// # Examples
///
/// ```no_run
/// use grain::{Context, Command};
/// use serde_json::{Map, json};
///
/// # fn with(store: grain::EventStore, registry: std::sync::Arc<grain::CommandRegistry>) {
/// let ctx = Context::new()
///     .with_command(Command::new("example/create-counter", Map::new()))
///     .with_command_registry(registry)
///     .with_event_store(store)
///     .with_additional("auth/subject", json!("user-42"));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// The command being processed, if any.
    pub command: Option<Command>,
    /// The query being processed, if any.
    pub query: Option<Query>,
    /// The event being reacted to (set by the todo processor).
    pub event: Option<Event>,
    /// The store emitted events are appended to.
    pub event_store: Option<EventStore>,
    /// Per-call command registry override.
    pub command_registry: Option<Arc<CommandRegistry>>,
    /// Per-call query registry override.
    pub query_registry: Option<Arc<QueryRegistry>>,
    /// When `true`, the command processor returns emitted events without
    /// appending them, so a parent handler can aggregate them into its
    /// own single atomic append.
    pub skip_event_storage: bool,
    /// Open extension bag for application-specific values.
    pub additional: Map<String, Value>,
}

impl Context {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command under processing.
    pub fn with_command(mut self, command: Command) -> Self {
        self.command = Some(command);
        self
    }

    /// Set the query under processing.
    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    /// Set the event being reacted to.
    pub fn with_event(mut self, event: Event) -> Self {
        self.event = Some(event);
        self
    }

    /// Set the event store.
    pub fn with_event_store(mut self, store: EventStore) -> Self {
        self.event_store = Some(store);
        self
    }

    /// Override the command registry for this call.
    pub fn with_command_registry(mut self, registry: Arc<CommandRegistry>) -> Self {
        self.command_registry = Some(registry);
        self
    }

    /// Override the query registry for this call.
    pub fn with_query_registry(mut self, registry: Arc<QueryRegistry>) -> Self {
        self.query_registry = Some(registry);
        self
    }

    /// Control whether emitted events are appended (see the field docs).
    pub fn with_skip_event_storage(mut self, skip: bool) -> Self {
        self.skip_event_storage = skip;
        self
    }

    /// Add a value to the open extension bag.
    pub fn with_additional(mut self, key: impl Into<String>, value: Value) -> Self {
        self.additional.insert(key.into(), value);
        self
    }

    /// Merge a whole map into the extension bag; later keys win.
    pub fn with_additional_map(mut self, extra: Map<String, Value>) -> Self {
        self.additional.extend(extra);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_context_is_empty() {
        let ctx = Context::new();
        assert!(ctx.command.is_none());
        assert!(ctx.query.is_none());
        assert!(ctx.event.is_none());
        assert!(ctx.event_store.is_none());
        assert!(!ctx.skip_event_storage);
        assert!(ctx.additional.is_empty());
    }

    #[test]
    fn builder_sets_flags_and_bag() {
        let ctx = Context::new()
            .with_skip_event_storage(true)
            .with_additional("auth/subject", json!("user-1"))
            .with_additional("trace", json!({"id": "t-1"}));

        assert!(ctx.skip_event_storage);
        assert_eq!(ctx.additional["auth/subject"], json!("user-1"));
        assert_eq!(ctx.additional["trace"]["id"], "t-1");
    }

    #[test]
    fn additional_map_merge_overwrites() {
        let mut extra = Map::new();
        extra.insert("k".to_string(), json!(2));

        let ctx = Context::new()
            .with_additional("k", json!(1))
            .with_additional_map(extra);
        assert_eq!(ctx.additional["k"], json!(2));
    }

    #[test]
    fn clone_is_independent() {
        let original = Context::new().with_additional("k", json!(1));
        let mut cloned = original.clone();
        cloned.additional.insert("k".to_string(), json!(2));
        assert_eq!(original.additional["k"], json!(1));
    }
}
