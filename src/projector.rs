//! Read-model projection with incremental, watermark-based snapshot
//! caching.
//!
//! A [`ReadModel`] folds events matching its query into state. The
//! [`Projector`] consults the snapshot cache for a `(state, watermark)`
//! pair, reads only events newer than the watermark, folds them in, and
//! opportunistically writes the snapshot back. The cache is transparent:
//! deleting a snapshot changes latency, never the result.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anomaly::Anomaly;
use crate::event::{Event, EventQuery};
use crate::kv::SnapshotStore;
use crate::store::EventStore;

/// On a cache hit, the snapshot is only rewritten when at least this
/// many events were folded, amortising serialization cost against
/// projection frequency. A cache miss always writes back.
pub const WRITEBACK_THRESHOLD: usize = 10;

/// A read model built by folding events into state.
///
/// # Contract
///
/// - [`apply`](ReadModel::apply) must be deterministic: the same event
///   sequence must produce the same state.
/// - Unknown event types should be silently ignored for forward
///   compatibility.
/// - Changing the fold requires bumping [`VERSION`](ReadModel::VERSION):
///   the snapshot key changes and the model is rebuilt from scratch.
///
/// # Examples
///
/// ```
/// use grain::{Event, EventQuery, ReadModel};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct IncrementCount {
///     count: u64,
/// }
///
/// impl ReadModel for IncrementCount {
///     const NAME: &'static str = "increment-count";
///     const VERSION: u32 = 1;
///
///     fn query() -> EventQuery {
///         EventQuery::new().types(["t/inc"])
///     }
///
///     fn apply(&mut self, _event: &Event) {
///         self.count += 1;
///     }
/// }
/// ```
pub trait ReadModel:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this model; part of the snapshot key.
    const NAME: &'static str;

    /// Fold version; bumping it forces a full rebuild.
    const VERSION: u32;

    /// The slice of the log this model folds over.
    fn query() -> EventQuery;

    /// Fold one event into the state.
    fn apply(&mut self, event: &Event);
}

/// A cached `(state, watermark)` pair.
///
/// The invariant: `state` is the fold of every event matching the
/// model's query with identifier `≤ watermark`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "P: Serialize", deserialize = "P: DeserializeOwned"))]
pub(crate) struct Snapshot<P> {
    /// The folded state.
    pub state: P,
    /// Identifier of the last event folded in; `None` when the fold has
    /// seen no events yet.
    pub watermark: Option<Uuid>,
}

/// Folds events into read models, caching snapshots in a
/// [`SnapshotStore`].
///
/// The projector owns no state of its own; everything durable lives in
/// the event store and the snapshot cache, so projectors can be created
/// freely wherever a query handler needs one.
#[derive(Clone)]
pub struct Projector {
    event_store: EventStore,
    cache: Arc<dyn SnapshotStore>,
}

impl std::fmt::Debug for Projector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector").finish()
    }
}

impl Projector {
    /// Build a projector over `event_store` with `cache` as the snapshot
    /// store.
    pub fn new(event_store: EventStore, cache: Arc<dyn SnapshotStore>) -> Self {
        Self { event_store, cache }
    }

    /// The snapshot key for model `P`.
    fn key<P: ReadModel>() -> Vec<u8> {
        format!("{}/v{}", P::NAME, P::VERSION).into_bytes()
    }

    /// Project the current state of read model `P`.
    ///
    /// Equivalent to folding `P::apply` over every event matching
    /// `P::query()` at the time of the call, in ascending identifier
    /// order; the snapshot cache only short-circuits the prefix already
    /// folded. Transaction markers never reach the fold.
    ///
    /// # Errors
    ///
    /// Returns `fault` if the snapshot cache fails or a snapshot cannot
    /// be serialized. A corrupt cached snapshot is not an error: it is
    /// logged and the model is rebuilt from scratch.
    pub async fn project<P: ReadModel>(&self) -> Result<P, Anomaly> {
        let key = Self::key::<P>();

        let cached: Option<Snapshot<P>> = match self.cache.get(&key) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    tracing::warn!(
                        model = P::NAME,
                        version = P::VERSION,
                        error = %e,
                        "corrupt snapshot, rebuilding from scratch"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                return Err(Anomaly::fault(format!("snapshot cache read failed: {e}")));
            }
        };

        let cache_hit = cached.is_some();
        let (mut state, watermark) = match cached {
            Some(snapshot) => (snapshot.state, snapshot.watermark),
            None => (P::default(), None),
        };

        let mut query = P::query();
        if let Some(watermark) = watermark {
            query = query.after(watermark);
        }
        let events = self.event_store.read(&query).await;

        let mut new_watermark = watermark;
        let mut folded = 0usize;
        for event in &events {
            // The watermark advances over markers too, but they are
            // never folded.
            new_watermark = event.id;
            if event.is_tx_marker() {
                continue;
            }
            state.apply(event);
            folded += 1;
        }

        if !cache_hit || folded >= WRITEBACK_THRESHOLD {
            let snapshot = Snapshot {
                state: state.clone(),
                watermark: new_watermark,
            };
            let bytes = serde_json::to_vec(&snapshot)
                .map_err(|e| Anomaly::fault(format!("snapshot serialization failed: {e}")))?;
            self.cache
                .put(&key, &bytes)
                .map_err(|e| Anomaly::fault(format!("snapshot cache write failed: {e}")))?;
            tracing::debug!(
                model = P::NAME,
                version = P::VERSION,
                folded,
                "snapshot written"
            );
        }

        Ok(state)
    }
}
