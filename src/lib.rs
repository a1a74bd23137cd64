//! In-process CQRS + event sourcing runtime.
//!
//! `grain` gives application code a disciplined way to mutate domain
//! state exclusively through validated commands that emit events, append
//! those events to an ordered log, broadcast them to asynchronous
//! reactors with backpressure, project them into cached read models, and
//! serve queries against those projections.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`EventStore`] | Ordered append-only log with tag index and publication hook |
//! | [`PubSub`] | Topic fan-out with bounded per-subscriber queues |
//! | [`CommandRegistry`] / [`process_command`] | Validated command dispatch, atomic event persistence |
//! | [`QueryRegistry`] / [`process_query`] | Validated query dispatch |
//! | [`TodoProcessor`] | Reactor: one worker handling subscribed events sequentially |
//! | [`Projector`] / [`ReadModel`] | Watermark-cached event folds |
//! | [`SnapshotStore`] | Byte-keyed snapshot cache ([`MemoryKv`], [`FileKv`]) |
//! | [`Anomaly`] | Uniform error taxonomy, mapped to HTTP status at the boundary |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use grain::{
//!     Anomaly, AppState, CommandDef, CommandOutcome, CommandRegistry, Context,
//!     Event, EventStore, EventStoreConfig, QueryRegistry,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Define a command handler.
//! let create_counter = CommandDef::new(
//!     "example/create-counter",
//!     Arc::new(|ctx: Context| {
//!         Box::pin(async move {
//!             let command = ctx.command.as_ref().ok_or_else(|| Anomaly::fault("no command"))?;
//!             let event = Event::new(
//!                 "example/counter-created",
//!                 json!({ "name": command.payload["name"] }),
//!             );
//!             Ok(CommandOutcome::new().with_events(vec![event]))
//!         })
//!     }),
//! );
//!
//! // 2. Assemble the runtime and serve it.
//! let store = EventStore::start(EventStoreConfig::default())?;
//! let state = AppState {
//!     command_registry: Arc::new(CommandRegistry::from_defs([create_counter])),
//!     query_registry: Arc::new(QueryRegistry::from_defs([])),
//!     event_store: store,
//!     additional_context: Default::default(),
//! };
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! grain::serve(listener, state).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Commands can also be processed directly, without the HTTP layer, by
//! building a [`Context`] and calling [`process_command`].

mod anomaly;
pub use anomaly::{Anomaly, Category};
mod event;
pub use event::{Event, EventQuery, TX_MARKER_TYPE, Tag};
mod pubsub;
pub use pubsub::{DEFAULT_BUFFER, PubSub, PubSubConfig, Subscription, TopicFn};
mod store;
pub use store::{ConnConfig, EventStore, EventStoreConfig, EventValidator, SchemaValidators};
mod context;
pub use context::Context;
mod command;
pub use command::{
    Command, CommandDef, CommandHandler, CommandOutcome, CommandRegistry, HandlerFuture,
    PayloadValidator, process_command,
};
mod query;
pub use query::{Query, QueryDef, QueryHandler, QueryOutcome, QueryRegistry, process_query};
mod todo;
pub use todo::{TodoHandler, TodoOutcome, TodoProcessor, TodoProcessorConfig};
mod projector;
pub use projector::{Projector, ReadModel, WRITEBACK_THRESHOLD};
mod kv;
pub use kv::{FileKv, KvConfig, MemoryKv, SnapshotStore};
mod http;
pub use http::{AppState, router, serve};
