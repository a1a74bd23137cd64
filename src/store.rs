//! The event store: an ordered, typed, append-only log with a tag index
//! and a publication hook into the pub/sub bus.
//!
//! Appends are batched and atomic: all events of a batch (plus one
//! trailing transaction marker) become visible together, and each is
//! published to the bus while the store lock is still held. A subscriber
//! that observes an event may therefore assume it is durable in the log.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use uuid::{ContextV7, Timestamp, Uuid};

use crate::anomaly::Anomaly;
use crate::event::{Event, EventQuery, TX_MARKER_TYPE, Tag};
use crate::pubsub::{PubSub, PubSubConfig};

/// Validates an event body against the schema registered for its type.
///
/// `Err` carries the machine-readable explain payload that ends up in the
/// resulting `incorrect` anomaly.
pub type EventValidator = Arc<dyn Fn(&Value) -> Result<(), Value> + Send + Sync>;

/// Per-event-type schema validators, populated at startup.
///
/// An event type without a registered validator is accepted as-is:
/// schema registration lives outside the core, and absence of a schema
/// means there is nothing to enforce.
#[derive(Clone, Default)]
pub struct SchemaValidators {
    by_type: HashMap<String, EventValidator>,
}

impl SchemaValidators {
    /// An empty validator set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `validator` for events of type `event_type`, replacing
    /// any previous one.
    pub fn register(mut self, event_type: impl Into<String>, validator: EventValidator) -> Self {
        self.by_type.insert(event_type.into(), validator);
        self
    }

    fn get(&self, event_type: &str) -> Option<&EventValidator> {
        self.by_type.get(event_type)
    }
}

impl std::fmt::Debug for SchemaValidators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidators")
            .field("types", &self.by_type.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Which backend holds the log.
///
/// The in-memory backend is the reference implementation. Persistent
/// backends live outside this crate; their config variant is accepted
/// here so deployment configuration stays uniform, but
/// [`EventStore::start`] reports them as unavailable.
#[derive(Debug, Clone)]
pub enum ConnConfig {
    /// Volatile in-process log.
    InMemory,
    /// External PostgreSQL backend (not provided by this crate).
    Postgres {
        /// Connection string for the external backend.
        url: String,
    },
}

/// Configuration for [`EventStore::start`].
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Backend selection.
    pub conn: ConnConfig,
    /// Configuration for the bus the store publishes into.
    pub pubsub: PubSubConfig,
    /// Schema validators applied on append.
    pub validators: SchemaValidators,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            conn: ConnConfig::InMemory,
            pubsub: PubSubConfig::default(),
            validators: SchemaValidators::new(),
        }
    }
}

/// Mutable store state, guarded by one async lock.
///
/// The lock spans validation, append, and bus fan-out, which is what
/// makes batches atomically visible and makes "published" imply
/// "durable".
struct StoreInner {
    /// The log, ascending by identifier.
    log: Vec<Event>,
    /// Identifier → position in `log`, for tag-index joins.
    positions: HashMap<Uuid, usize>,
    /// Posting lists: tag → identifiers in append order.
    tag_index: HashMap<Tag, Vec<Uuid>>,
    /// UUIDv7 generation context; monotonic within this process.
    id_context: ContextV7,
    /// Set by [`EventStore::stop`]; rejects further appends.
    closed: bool,
}

impl StoreInner {
    /// Identifier of the newest entry in the log, markers included.
    fn head(&self) -> Option<Uuid> {
        self.log.last().and_then(|e| e.id)
    }

    fn next_id(&self) -> Uuid {
        Uuid::new_v7(Timestamp::now(&self.id_context))
    }
}

/// Handle to an open event store. `Clone` is cheap and shares the log,
/// the tag index, and the bus.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Mutex<StoreInner>>,
    pubsub: PubSub,
    validators: Arc<SchemaValidators>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish()
    }
}

impl EventStore {
    /// Open a store per `config`, with an empty log and an empty
    /// subscriber set.
    ///
    /// # Errors
    ///
    /// Returns `unavailable` if `config.conn` selects a backend this
    /// crate does not provide.
    pub fn start(config: EventStoreConfig) -> Result<Self, Anomaly> {
        match config.conn {
            ConnConfig::InMemory => {}
            ConnConfig::Postgres { .. } => {
                return Err(Anomaly::unavailable(
                    "postgres event-store backend is not available in this build",
                ));
            }
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                log: Vec::new(),
                positions: HashMap::new(),
                tag_index: HashMap::new(),
                id_context: ContextV7::new(),
                closed: false,
            })),
            pubsub: PubSub::start(config.pubsub),
            validators: Arc::new(config.validators),
        })
    }

    /// The bus this store publishes appended events into. Subscribe here
    /// to react to new events.
    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    /// Stop the store: outstanding subscribers receive end-of-stream and
    /// later appends fail with `unavailable`. The log remains readable.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
        }
        self.pubsub.stop().await;
    }

    /// Append `events` as one atomic batch.
    ///
    /// Each event is validated against the schema registered for its
    /// type; identifiers are assigned (UUIDv7) where absent. On success
    /// the batch plus one trailing `grain/tx` marker becomes visible to
    /// readers at once, every appended event (marker included) is
    /// published to the bus, and the identifiers assigned to the domain
    /// events are returned.
    ///
    /// # Errors
    ///
    /// - `incorrect` if any event fails schema validation or carries an
    ///   identifier that is not greater than the current head;
    /// - `conflict` if an event carries an identifier already in the log;
    /// - `unavailable` after [`EventStore::stop`].
    ///
    /// On error the store is unchanged and nothing is published.
    pub async fn append(&self, events: Vec<Event>) -> Result<Vec<Uuid>, Anomaly> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Anomaly::unavailable("event store is stopped"));
        }

        // Validate and stage the whole batch before touching the log, so
        // a failure anywhere leaves no partial append behind.
        let mut staged = Vec::with_capacity(events.len() + 1);
        let mut head = inner.head();
        for mut event in events {
            if let Some(validator) = self.validators.get(&event.event_type)
                && let Err(explain) = validator(&event.body)
            {
                return Err(Anomaly::incorrect(format!(
                    "Invalid event '{}'",
                    event.event_type
                ))
                .with_explain(explain));
            }
            match event.id {
                Some(id) => {
                    if inner.positions.contains_key(&id)
                        || staged.iter().any(|e: &Event| e.id == Some(id))
                    {
                        return Err(Anomaly::conflict(format!(
                            "Event identifier {id} already appended"
                        )));
                    }
                    if let Some(head) = head
                        && id <= head
                    {
                        return Err(Anomaly::incorrect(format!(
                            "Event identifier {id} is not greater than the log head"
                        )));
                    }
                }
                None => {
                    let id = inner.next_id();
                    if let Some(head) = head
                        && id <= head
                    {
                        // Only reachable when a caller-supplied id ran
                        // ahead of the wall clock.
                        return Err(Anomaly::fault(
                            "generated identifier is behind the log head",
                        ));
                    }
                    event.id = Some(id);
                }
            }
            head = event.id;
            staged.push(event);
        }

        let assigned: Vec<Uuid> = staged
            .iter()
            .map(|e| e.id.expect("staged events always carry an id"))
            .collect();

        // Trailing transaction marker closes the batch.
        let marker_id = inner.next_id();
        if let Some(head) = head
            && marker_id <= head
        {
            return Err(Anomaly::fault(
                "generated identifier is behind the log head",
            ));
        }
        let mut marker = Event::new(TX_MARKER_TYPE, Value::Null);
        marker.id = Some(marker_id);
        staged.push(marker);

        for event in &staged {
            let id = event.id.expect("staged events always carry an id");
            let position = inner.log.len();
            inner.positions.insert(id, position);
            for tag in &event.tags {
                inner.tag_index.entry(tag.clone()).or_default().push(id);
            }
            inner.log.push(event.clone());
        }

        tracing::debug!(count = assigned.len(), "appended event batch");

        // Fan out under the store lock: anything a subscriber observes is
        // already in the log.
        for event in &staged {
            self.pubsub.publish(event).await;
        }

        Ok(assigned)
    }

    /// Read events matching `query`, ascending by identifier.
    ///
    /// An empty query returns the whole log, transaction markers
    /// included; callers that want only domain events filter
    /// [`TX_MARKER_TYPE`] themselves or use a `types` filter.
    pub async fn read(&self, query: &EventQuery) -> Vec<Event> {
        let inner = self.inner.lock().await;

        // Tag-filtered reads go through the index: intersect the posting
        // lists, then join back to the log and apply the remaining
        // filters.
        if let Some(tags) = &query.tags
            && !tags.is_empty()
        {
            let mut lists: Vec<&Vec<Uuid>> = Vec::with_capacity(tags.len());
            for tag in tags {
                match inner.tag_index.get(tag) {
                    Some(list) => lists.push(list),
                    None => return Vec::new(),
                }
            }
            // Intersect starting from the shortest posting list.
            lists.sort_by_key(|l| l.len());
            let (first, rest) = lists.split_first().expect("at least one tag");
            let mut positions: Vec<usize> = first
                .iter()
                .filter(|id| rest.iter().all(|l| l.contains(*id)))
                .map(|id| inner.positions[id])
                .collect();
            positions.sort_unstable();

            let mut out = Vec::new();
            for position in positions {
                let event = &inner.log[position];
                if query.matches(event) {
                    out.push(event.clone());
                    if let Some(limit) = query.limit
                        && out.len() >= limit
                    {
                        break;
                    }
                }
            }
            return out;
        }

        // Plain scan: start past `after` via binary search (the log is
        // ascending by id), stop at `before`/`limit`.
        let start = match query.after {
            Some(after) => inner
                .log
                .partition_point(|e| e.id.expect("logged events always carry an id") <= after),
            None => 0,
        };

        let mut out = Vec::new();
        for event in &inner.log[start..] {
            let id = event.id.expect("logged events always carry an id");
            if let Some(before) = query.before
                && id > before
            {
                break;
            }
            if let Some(types) = &query.types
                && !types.contains(&event.event_type)
            {
                continue;
            }
            out.push(event.clone());
            if let Some(limit) = query.limit
                && out.len() >= limit
            {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn in_memory() -> EventStore {
        EventStore::start(EventStoreConfig::default()).expect("start should succeed")
    }

    fn domain_events(log: &[Event]) -> Vec<&Event> {
        log.iter().filter(|e| !e.is_tx_marker()).collect()
    }

    #[test]
    fn postgres_backend_is_unavailable() {
        let result = EventStore::start(EventStoreConfig {
            conn: ConnConfig::Postgres {
                url: "postgres://localhost/grain".to_string(),
            },
            ..EventStoreConfig::default()
        });
        let anomaly = result.err().expect("postgres should be rejected");
        assert_eq!(anomaly.category, crate::Category::Unavailable);
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_v7_ids() {
        let store = in_memory();
        for i in 0..5 {
            store
                .append(vec![Event::new("t/e", json!({ "i": i }))])
                .await
                .expect("append should succeed");
        }

        let all = store.read(&EventQuery::new()).await;
        let ids: Vec<Uuid> = all.iter().map(|e| e.id.expect("id")).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "ids must be strictly increasing");
        }
        for id in &ids {
            assert_eq!(id.get_version(), Some(uuid::Version::SortRand));
        }
    }

    #[tokio::test]
    async fn each_batch_ends_with_a_tx_marker() {
        let store = in_memory();
        store
            .append(vec![
                Event::new("t/a", json!(1)),
                Event::new("t/b", json!(2)),
            ])
            .await
            .expect("append");
        store
            .append(vec![Event::new("t/c", json!(3))])
            .await
            .expect("append");

        let all = store.read(&EventQuery::new()).await;
        let types: Vec<&str> = all.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["t/a", "t/b", TX_MARKER_TYPE, "t/c", TX_MARKER_TYPE]
        );
    }

    #[tokio::test]
    async fn returns_ids_of_domain_events_only() {
        let store = in_memory();
        let ids = store
            .append(vec![
                Event::new("t/a", json!(null)),
                Event::new("t/b", json!(null)),
            ])
            .await
            .expect("append");
        assert_eq!(ids.len(), 2);

        let all = store.read(&EventQuery::new()).await;
        let domain = domain_events(&all);
        assert_eq!(domain.len(), 2);
        assert_eq!(domain[0].id, Some(ids[0]));
        assert_eq!(domain[1].id, Some(ids[1]));
    }

    #[tokio::test]
    async fn schema_validation_failure_rejects_whole_batch() {
        let validators = SchemaValidators::new().register(
            "t/strict",
            Arc::new(|body: &Value| {
                if body.get("name").is_some_and(Value::is_string) {
                    Ok(())
                } else {
                    Err(json!({"name": "missing required field"}))
                }
            }),
        );
        let store = EventStore::start(EventStoreConfig {
            validators,
            ..EventStoreConfig::default()
        })
        .expect("start");

        let result = store
            .append(vec![
                Event::new("t/other", json!(null)),
                Event::new("t/strict", json!({})),
            ])
            .await;

        let anomaly = result.err().expect("append should fail");
        assert_eq!(anomaly.category, crate::Category::Incorrect);
        assert!(anomaly.explain.is_some());
        // Nothing appended, not even the passing first event.
        assert!(store.read(&EventQuery::new()).await.is_empty());
    }

    #[tokio::test]
    async fn valid_events_pass_their_schema() {
        let validators = SchemaValidators::new().register(
            "t/strict",
            Arc::new(|body: &Value| {
                if body.get("name").is_some_and(Value::is_string) {
                    Ok(())
                } else {
                    Err(json!({"name": "missing required field"}))
                }
            }),
        );
        let store = EventStore::start(EventStoreConfig {
            validators,
            ..EventStoreConfig::default()
        })
        .expect("start");

        store
            .append(vec![Event::new("t/strict", json!({"name": "n"}))])
            .await
            .expect("valid event should append");
    }

    #[tokio::test]
    async fn duplicate_supplied_id_is_a_conflict() {
        let store = in_memory();
        let ids = store
            .append(vec![Event::new("t/a", json!(null))])
            .await
            .expect("append");

        let mut dup = Event::new("t/b", json!(null));
        dup.id = Some(ids[0]);
        let anomaly = store.append(vec![dup]).await.err().expect("should fail");
        assert_eq!(anomaly.category, crate::Category::Conflict);
    }

    #[tokio::test]
    async fn stale_supplied_id_is_incorrect() {
        let store = in_memory();
        let stale = Uuid::now_v7();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store
            .append(vec![Event::new("t/a", json!(null))])
            .await
            .expect("append");

        let mut event = Event::new("t/b", json!(null));
        event.id = Some(stale);
        let anomaly = store.append(vec![event]).await.err().expect("should fail");
        assert_eq!(anomaly.category, crate::Category::Incorrect);
    }

    #[tokio::test]
    async fn append_after_stop_is_unavailable() {
        let store = in_memory();
        store.stop().await;
        let anomaly = store
            .append(vec![Event::new("t/a", json!(null))])
            .await
            .err()
            .expect("should fail");
        assert_eq!(anomaly.category, crate::Category::Unavailable);
    }

    #[tokio::test]
    async fn type_filter_excludes_markers_and_other_types() {
        let store = in_memory();
        store
            .append(vec![
                Event::new("t/keep", json!(1)),
                Event::new("t/drop", json!(2)),
            ])
            .await
            .expect("append");

        let got = store.read(&EventQuery::new().types(["t/keep"])).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event_type, "t/keep");
    }

    #[tokio::test]
    async fn after_and_limit_bound_the_scan() {
        let store = in_memory();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.extend(
                store
                    .append(vec![Event::new("t/e", json!({ "i": i }))])
                    .await
                    .expect("append"),
            );
        }

        let got = store
            .read(&EventQuery::new().types(["t/e"]).after(ids[1]).limit(2))
            .await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].body["i"], 2);
        assert_eq!(got[1].body["i"], 3);
    }

    #[tokio::test]
    async fn before_is_inclusive() {
        let store = in_memory();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.extend(
                store
                    .append(vec![Event::new("t/e", json!({ "i": i }))])
                    .await
                    .expect("append"),
            );
        }

        let got = store
            .read(&EventQuery::new().types(["t/e"]).before(ids[1]))
            .await;
        assert_eq!(got.len(), 2);
        assert_eq!(got.last().expect("last").id, Some(ids[1]));
    }

    #[tokio::test]
    async fn tag_read_intersects_posting_lists() {
        let store = in_memory();
        let both = Event::new("t/e", json!(1))
            .with_tag(Tag::new("a", "1"))
            .with_tag(Tag::new("b", "2"));
        let only_a = Event::new("t/e", json!(2)).with_tag(Tag::new("a", "1"));
        let only_b = Event::new("t/e", json!(3)).with_tag(Tag::new("b", "2"));
        store
            .append(vec![both, only_a, only_b])
            .await
            .expect("append");

        let got = store
            .read(
                &EventQuery::new()
                    .tag(Tag::new("a", "1"))
                    .tag(Tag::new("b", "2")),
            )
            .await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, json!(1));
    }

    #[tokio::test]
    async fn tag_read_with_unknown_tag_is_empty() {
        let store = in_memory();
        store
            .append(vec![
                Event::new("t/e", json!(null)).with_tag(Tag::new("a", "1")),
            ])
            .await
            .expect("append");

        let got = store.read(&EventQuery::new().tag(Tag::new("a", "2"))).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn tag_read_respects_after_watermark() {
        let store = in_memory();
        let tag = Tag::new("stream", "s-1");
        let first = store
            .append(vec![Event::new("t/e", json!(1)).with_tag(tag.clone())])
            .await
            .expect("append");
        store
            .append(vec![Event::new("t/e", json!(2)).with_tag(tag.clone())])
            .await
            .expect("append");

        let got = store
            .read(&EventQuery::new().tag(tag).after(first[0]))
            .await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, json!(2));
    }

    #[tokio::test]
    async fn observed_events_are_durable() {
        let store = in_memory();
        let mut sub = store.pubsub().subscribe("t/e").await;

        let appender = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append(vec![Event::new("t/e", json!(null))])
                    .await
                    .expect("append");
            })
        };

        let observed = sub.recv().await.expect("event should be published");
        // Anything a subscriber sees must already be readable.
        let read_back = store.read(&EventQuery::new().types(["t/e"])).await;
        assert!(read_back.iter().any(|e| e.id == observed.id));
        appender.await.expect("appender");
    }

    #[tokio::test]
    async fn tx_markers_are_published_under_their_own_topic() {
        let store = in_memory();
        let mut sub = store.pubsub().subscribe(TX_MARKER_TYPE).await;

        store
            .append(vec![Event::new("t/e", json!(null))])
            .await
            .expect("append");

        let marker = sub.recv().await.expect("marker should be published");
        assert!(marker.is_tx_marker());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_see_whole_batches_or_nothing() {
        let store = in_memory();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let seen = store.read(&EventQuery::new().types(["t/e"])).await;
                    assert_eq!(
                        seen.len() % 3,
                        0,
                        "reads must observe whole batches, saw {}",
                        seen.len()
                    );
                }
            })
        };

        for i in 0..50 {
            store
                .append(vec![
                    Event::new("t/e", json!({ "i": i, "k": 0 })),
                    Event::new("t/e", json!({ "i": i, "k": 1 })),
                    Event::new("t/e", json!({ "i": i, "k": 2 })),
                ])
                .await
                .expect("append");
        }

        reader.await.expect("reader");
    }
}
