//! The event envelope and the read-side query filter.
//!
//! Events are the only durable facts in the runtime. An [`Event`] carries a
//! store-assigned time-ordered identifier, a namespaced type, a timestamp,
//! an opaque JSON body, and a set of [`Tag`]s used as a secondary index.
//! [`EventQuery`] describes a filtered, ordered read over the log.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type of the synthetic transaction marker appended after every
/// batch. Readers that only want domain events filter this type out.
pub const TX_MARKER_TYPE: &str = "grain/tx";

/// A `(kind, value)` pair attached to an event for secondary-index lookup.
///
/// Tags are how read models and reactors scope themselves to a slice of
/// the log without knowing every event type in it, e.g.
/// `("counter-id", "c-1")`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    /// The index dimension, e.g. `"counter-id"`.
    pub kind: String,
    /// The indexed value, e.g. `"c-1"`.
    pub value: String,
}

impl Tag {
    /// Build a tag from anything string-like.
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

// Tags serialize as `[kind, value]` pairs, matching the persisted
// envelope contract rather than a `{kind, value}` map.
impl Serialize for Tag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.kind, &self.value).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (kind, value) = <(String, String)>::deserialize(deserializer)?;
        Ok(Self { kind, value })
    }
}

/// An immutable fact recorded in the event store.
///
/// `id` is `None` until the store assigns a UUIDv7 during append; every
/// event read back from the store carries `Some`. Identifiers are
/// time-ordered, so sorting by id equals sorting by append time, even
/// across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned time-ordered identifier (UUIDv7).
    #[serde(rename = "event/id", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<Uuid>,
    /// Namespaced type name, e.g. `"example/counter-created"`.
    #[serde(rename = "event/type")]
    pub event_type: String,
    /// Wall-clock UTC time the event was created.
    #[serde(rename = "event/timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Opaque structured payload.
    #[serde(rename = "event/body")]
    pub body: Value,
    /// Secondary-index tags. A `BTreeSet` keeps serialization stable.
    #[serde(rename = "event/tags", skip_serializing_if = "BTreeSet::is_empty", default)]
    pub tags: BTreeSet<Tag>,
}

impl Event {
    /// Build a new, not-yet-appended event with the current UTC timestamp.
    ///
    /// # Arguments
    ///
    /// * `event_type` - Namespaced type name.
    /// * `body` - Opaque JSON payload.
    pub fn new(event_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            timestamp: Utc::now(),
            body,
            tags: BTreeSet::new(),
        }
    }

    /// Attach a tag, consuming and returning the event for chaining.
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.insert(tag);
        self
    }

    /// Returns `true` if this is a transaction marker rather than a
    /// domain event.
    pub fn is_tx_marker(&self) -> bool {
        self.event_type == TX_MARKER_TYPE
    }
}

/// A filtered read over the event log. All fields are optional; an empty
/// query matches everything, transaction markers included.
///
/// `after`/`before` bound the half-open identifier range `(after, before]`.
/// `types` matches any listed type; `tags` requires the event to carry
/// every listed tag.
///
/// # Examples
///
/// ```
/// use grain::{EventQuery, Tag};
///
/// let query = EventQuery::new()
///     .types(["t/inc"])
///     .tag(Tag::new("counter-id", "c-1"))
///     .limit(100);
/// assert_eq!(query.limit, Some(100));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    /// Match events whose type is any of these.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub types: Option<HashSet<String>>,
    /// Match events carrying all of these tags.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tags: Option<HashSet<Tag>>,
    /// Only events with identifier strictly greater than this.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub after: Option<Uuid>,
    /// Only events with identifier less than or equal to this.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub before: Option<Uuid>,
    /// Stop after this many events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<usize>,
}

impl EventQuery {
    /// An empty query matching every event in the log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to events whose type is any of `types`.
    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Require the event to carry `tag` (in addition to any previously
    /// required tags).
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.get_or_insert_with(HashSet::new).insert(tag);
        self
    }

    /// Only events with identifier strictly greater than `id`.
    pub fn after(mut self, id: Uuid) -> Self {
        self.after = Some(id);
        self
    }

    /// Only events with identifier less than or equal to `id`.
    pub fn before(mut self, id: Uuid) -> Self {
        self.before = Some(id);
        self
    }

    /// Stop after `n` events.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Does `event` satisfy the type, tag, and range filters?
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(tags) = &self.tags
            && !tags.iter().all(|t| event.tags.contains(t))
        {
            return false;
        }
        match event.id {
            Some(id) => {
                if let Some(after) = self.after
                    && id <= after
                {
                    return false;
                }
                if let Some(before) = self.before
                    && id > before
                {
                    return false;
                }
                true
            }
            // An event without an identifier is not in the log yet and
            // can only match an unbounded query.
            None => self.after.is_none() && self.before.is_none(),
        }
    }
}
