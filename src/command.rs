//! Command envelope, handler registry, and the command processing
//! pipeline: look up, validate, invoke inside an error boundary, persist
//! emitted events atomically.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::anomaly::Anomaly;
use crate::context::Context;

/// An intent to change state. Transient: commands exist only for the
/// duration of processing and are never persisted.
///
/// Envelope fields serialize under the `command/` namespace and the
/// payload is flattened, so the wire shape is
/// `{command/name, command/id, command/timestamp, ...payload}` and
/// envelope keys can never collide with payload keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Namespaced handler name, e.g. `"example/create-counter"`.
    #[serde(rename = "command/name")]
    pub name: String,
    /// Transport-assigned UUID for tracing this invocation.
    #[serde(rename = "command/id")]
    pub id: Uuid,
    /// Wall-clock UTC time the command entered the system.
    #[serde(rename = "command/timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Free-form command fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Command {
    /// Build a command with a fresh id and the current UTC timestamp.
    pub fn new(name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// What a successful command handler produced.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    /// Events the handler decided to emit. Appended by the processor
    /// unless the context says [`skip_event_storage`](Context::skip_event_storage);
    /// after a successful append each carries its assigned identifier.
    pub emitted_events: Vec<crate::Event>,
    /// Caller-facing result value, if any.
    pub result: Option<Value>,
    /// Identifiers assigned by the append, in emission order. Empty when
    /// nothing was appended.
    pub appended: Vec<Uuid>,
}

impl CommandOutcome {
    /// An outcome with no events and no result.
    pub fn new() -> Self {
        Self::default()
    }

    /// An outcome carrying only a result value.
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Add emitted events to the outcome.
    pub fn with_events(mut self, events: Vec<crate::Event>) -> Self {
        self.emitted_events.extend(events);
        self
    }
}

/// Boxed handler future, so registries can hold heterogeneous handlers
/// behind one type.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = Result<T, Anomaly>> + Send>>;

/// A command handler: takes the processing context, returns events to
/// emit and/or a result value.
pub type CommandHandler = Arc<dyn Fn(Context) -> HandlerFuture<CommandOutcome> + Send + Sync>;

/// Validates a command payload. `Err` carries the explain payload for
/// the resulting `incorrect` anomaly.
pub type PayloadValidator = Arc<dyn Fn(&Map<String, Value>) -> Result<(), Value> + Send + Sync>;

/// A registration: name, handler, and optional payload schema.
#[derive(Clone)]
pub struct CommandDef {
    /// Namespaced command name this definition answers to.
    pub name: String,
    /// The handler invoked for matching commands.
    pub handler: CommandHandler,
    /// Payload validator; `None` means no schema to enforce.
    pub validator: Option<PayloadValidator>,
}

impl CommandDef {
    /// Define a command handler under `name`.
    pub fn new(name: impl Into<String>, handler: CommandHandler) -> Self {
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

impl std::fmt::Debug for CommandDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDef")
            .field("name", &self.name)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// Name-keyed command registrations.
///
/// Built once at startup from a declarative list of definitions and read
/// concurrently afterwards; there is no post-startup mutation. A
/// process-wide default can be installed with
/// [`set_global`](CommandRegistry::set_global), but a registry on the
/// [`Context`] always takes precedence.
#[derive(Default)]
pub struct CommandRegistry {
    by_name: HashMap<String, CommandDef>,
}

static GLOBAL_COMMANDS: OnceLock<Arc<CommandRegistry>> = OnceLock::new();

impl CommandRegistry {
    /// Build a registry from definitions. Later definitions replace
    /// earlier ones with the same name.
    pub fn from_defs(defs: impl IntoIterator<Item = CommandDef>) -> Self {
        Self {
            by_name: defs.into_iter().map(|d| (d.name.clone(), d)).collect(),
        }
    }

    /// Look up a definition by command name.
    pub fn get(&self, name: &str) -> Option<&CommandDef> {
        self.by_name.get(name)
    }

    /// Install `registry` as the process-wide default. Returns `false`
    /// if a default was already installed (the existing one is kept).
    pub fn set_global(registry: Arc<CommandRegistry>) -> bool {
        GLOBAL_COMMANDS.set(registry).is_ok()
    }

    /// The process-wide default registry, if one was installed.
    pub fn global() -> Option<Arc<CommandRegistry>> {
        GLOBAL_COMMANDS.get().cloned()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Check the generic command envelope: a namespaced, non-empty name.
///
/// `id` and `timestamp` presence/typing is enforced by the [`Command`]
/// type itself at the decoding boundary.
fn validate_envelope(command: &Command) -> Result<(), Anomaly> {
    if command.name.is_empty() {
        return Err(Anomaly::incorrect("Invalid command")
            .with_explain(json!({"name": "must be a non-empty namespaced name"})));
    }
    Ok(())
}

/// Extract a readable message from a panicked handler task.
pub(crate) fn panic_message(error: tokio::task::JoinError) -> String {
    if error.is_panic() {
        let payload = error.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        }
    } else {
        "handler task was cancelled".to_string()
    }
}

/// Process the command carried by `ctx`.
///
/// Pipeline: registry lookup, envelope and payload validation, guarded
/// handler invocation, then one atomic append of the emitted events. The
/// handler runs in its own task so a panic is contained and reported as
/// a `fault` rather than taking down the caller.
///
/// With `ctx.skip_event_storage` set, emitted events are returned without
/// being appended; the parent invocation owns the single atomic append.
///
/// # Errors
///
/// - `not_found "Unknown Command"` if the name is not registered;
/// - `incorrect` (with `explain`) on envelope or payload validation
///   failure;
/// - `fault "Error executing command handler: …"` if the handler panics;
/// - `fault "Error storing events"` if the append fails;
/// - any anomaly the handler itself returned, unchanged.
pub async fn process_command(ctx: Context) -> Result<CommandOutcome, Anomaly> {
    let command = ctx
        .command
        .clone()
        .ok_or_else(|| Anomaly::fault("no command in processing context"))?;
    let registry = ctx
        .command_registry
        .clone()
        .or_else(CommandRegistry::global)
        .ok_or_else(|| Anomaly::fault("no command registry in processing context"))?;

    let Some(def) = registry.get(&command.name) else {
        return Err(Anomaly::not_found("Unknown Command"));
    };

    validate_envelope(&command)?;
    if let Some(validator) = &def.validator {
        validator(&command.payload)
            .map_err(|explain| Anomaly::incorrect("Invalid command").with_explain(explain))?;
    }

    let handler = def.handler.clone();
    let skip_storage = ctx.skip_event_storage;
    let store = ctx.event_store.clone();

    tracing::debug!(command = %command.name, id = %command.id, "dispatching command");

    let mut outcome = match tokio::spawn(handler(ctx)).await {
        Ok(result) => result?,
        Err(join_error) => {
            let message = panic_message(join_error);
            tracing::error!(command = %command.name, error = %message, "command handler panicked");
            return Err(Anomaly::fault(format!(
                "Error executing command handler: {message}"
            )));
        }
    };

    if !outcome.emitted_events.is_empty() && !skip_storage {
        let store =
            store.ok_or_else(|| Anomaly::fault("no event store in processing context"))?;
        match store.append(outcome.emitted_events.clone()).await {
            Ok(ids) => {
                for (event, id) in outcome.emitted_events.iter_mut().zip(&ids) {
                    event.id = Some(*id);
                }
                outcome.appended = ids;
            }
            Err(anomaly) => {
                tracing::error!(command = %command.name, error = %anomaly, "failed to store emitted events");
                return Err(Anomaly::fault("Error storing events"));
            }
        }
    }

    Ok(outcome)
}
