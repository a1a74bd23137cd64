//! Todo processors: asynchronous reactors that subscribe to event topics
//! and run a handler for every delivered event.
//!
//! Each processor owns one worker task and handles its events strictly
//! sequentially, giving it a linear view of its subscribed topics.
//! Failures never stop the worker: anomalies and panics are logged and
//! the next event is processed. Delivery is at-least-once end to end, so
//! handlers are expected to be idempotent.
//!
//! Parallelism comes from running multiple processors, each with
//! independent progress; nothing orders side-effects across processors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tokio_stream::{StreamExt, StreamMap, wrappers::ReceiverStream};

use crate::command::{HandlerFuture, panic_message};
use crate::context::Context;
use crate::event::Event;
use crate::pubsub::PubSub;
use crate::store::EventStore;

/// What a todo handler produced: zero or more events to append.
#[derive(Debug, Clone, Default)]
pub struct TodoOutcome {
    /// Events to append to the store. A reactor emitting events can
    /// trigger further reactors; convergence is the application's
    /// responsibility.
    pub result_events: Vec<Event>,
}

impl TodoOutcome {
    /// No side effects beyond having handled the event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `events` as a single batch.
    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.result_events.extend(events);
        self
    }
}

/// A todo handler: reacts to the event in the context, optionally
/// returning events to append.
pub type TodoHandler = Arc<dyn Fn(Context) -> HandlerFuture<TodoOutcome> + Send + Sync>;

/// Configuration for [`TodoProcessor::start`].
#[derive(Clone)]
pub struct TodoProcessorConfig {
    /// Name used in log output and metrics.
    pub name: String,
    /// The bus to subscribe on, usually the store's
    /// ([`EventStore::pubsub`]).
    pub pubsub: PubSub,
    /// Topics to subscribe to (one subscription each).
    pub topics: Vec<String>,
    /// The handler invoked per delivered event.
    pub handler: TodoHandler,
    /// Store that handler-emitted events are appended to; also placed
    /// into every handler context.
    pub event_store: EventStore,
    /// Base context merged into every handler invocation.
    pub context: Context,
}

impl std::fmt::Debug for TodoProcessorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TodoProcessorConfig")
            .field("name", &self.name)
            .field("topics", &self.topics)
            .finish()
    }
}

/// Handle to a running todo processor.
///
/// `Clone` is cheap: all fields are shared. Call
/// [`stop`](TodoProcessor::stop) for a graceful shutdown that waits for
/// the in-flight handler invocation; dropping every handle also shuts
/// the worker down, but without waiting.
#[derive(Clone)]
pub struct TodoProcessor {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    events_processed: Arc<AtomicU64>,
    /// The worker task. Wrapped in `Option` so it can be taken and
    /// awaited exactly once by [`stop`](TodoProcessor::stop).
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for TodoProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TodoProcessor")
            .field("name", &self.name)
            .finish()
    }
}

impl TodoProcessor {
    /// Subscribe to the configured topics and spawn the worker.
    ///
    /// Subscriptions are established before this returns, so events
    /// appended afterwards are guaranteed to reach the processor.
    pub async fn start(config: TodoProcessorConfig) -> Self {
        let mut streams = StreamMap::new();
        for topic in &config.topics {
            let sub = config.pubsub.subscribe(topic.clone()).await;
            let (topic, rx) = sub.into_parts();
            streams.insert(topic, ReceiverStream::new(rx));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events_processed = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            name: config.name.clone(),
            handler: config.handler,
            event_store: config.event_store,
            context: config.context,
            events_processed: events_processed.clone(),
        };
        let task = tokio::spawn(worker.run(streams, shutdown_rx));

        Self {
            name: config.name,
            shutdown_tx,
            events_processed,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Number of events this processor has handled so far.
    ///
    /// This is the per-processor event rate surface: watch it to spot a
    /// reactor that has stalled or one stuck in an emit-consume loop.
    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    /// Signal the worker to stop, wait for the in-flight handler
    /// invocation to complete, and join the task.
    ///
    /// Unconsumed queued events are discarded with the subscriptions.
    /// Calling `stop` more than once is safe; later calls return
    /// immediately.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(processor = %self.name, error = %e, "todo worker task failed to join");
            }
        }
    }
}

/// The worker half: everything the spawned task owns.
struct Worker {
    name: String,
    handler: TodoHandler,
    event_store: EventStore,
    context: Context,
    events_processed: Arc<AtomicU64>,
}

impl Worker {
    async fn run(
        self,
        mut streams: StreamMap<String, ReceiverStream<Event>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::debug!(processor = %self.name, "todo processor started");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                next = streams.next() => match next {
                    Some((_topic, event)) => {
                        // The handler runs to completion before the next
                        // event is pulled; shutdown cancels the queue
                        // wait, never an in-flight invocation.
                        self.handle_one(event).await;
                        self.events_processed.fetch_add(1, Ordering::Relaxed);
                    }
                    // All subscriptions reached end-of-stream (bus stopped).
                    None => break,
                },
            }
        }
        tracing::debug!(
            processor = %self.name,
            events = self.events_processed.load(Ordering::Relaxed),
            "todo processor stopped"
        );
    }

    async fn handle_one(&self, event: Event) {
        let event_type = event.event_type.clone();
        let ctx = self
            .context
            .clone()
            .with_event(event)
            .with_event_store(self.event_store.clone());

        match tokio::spawn((self.handler)(ctx)).await {
            Ok(Ok(outcome)) => {
                if outcome.result_events.is_empty() {
                    tracing::debug!(processor = %self.name, event = %event_type, "event handled");
                } else if let Err(anomaly) =
                    self.event_store.append(outcome.result_events).await
                {
                    tracing::error!(
                        processor = %self.name,
                        event = %event_type,
                        error = %anomaly,
                        "Error storing events."
                    );
                }
            }
            Ok(Err(anomaly)) => {
                tracing::error!(
                    processor = %self.name,
                    event = %event_type,
                    error = %anomaly,
                    "todo handler returned an anomaly"
                );
            }
            Err(join_error) => {
                let message = panic_message(join_error);
                tracing::error!(
                    processor = %self.name,
                    event = %event_type,
                    error = %message,
                    "todo handler panicked"
                );
            }
        }
    }
}
