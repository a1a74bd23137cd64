//! The anomaly taxonomy: a structured error value shared by every subsystem.
//!
//! Any operation in the runtime may return an [`Anomaly`] in place of a
//! success value. Callers either propagate it unchanged (the command and
//! query processors do this for handler-returned anomalies) or map it at a
//! boundary (the HTTP layer maps [`Category`] to a status code).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classifies an [`Anomaly`] by what went wrong, not where.
///
/// The category is the only part of an anomaly that boundaries dispatch
/// on; everything else is for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// The caller's input is invalid (schema violation, malformed envelope).
    Incorrect,
    /// The named thing (command, query, resource) does not exist.
    NotFound,
    /// The caller is not allowed to do this.
    Forbidden,
    /// The operation conflicts with existing state (e.g. duplicate id).
    Conflict,
    /// An internal failure: bug, panic, storage error.
    Fault,
    /// A required collaborator is not available (stopped store, missing backend).
    Unavailable,
    /// The system is overloaded; retry later.
    Busy,
    /// The operation was interrupted before completion.
    Interrupted,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::Incorrect => "incorrect",
            Category::NotFound => "not_found",
            Category::Forbidden => "forbidden",
            Category::Conflict => "conflict",
            Category::Fault => "fault",
            Category::Unavailable => "unavailable",
            Category::Busy => "busy",
            Category::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// A structured error value with a category, a human-readable message, and
/// an optional machine-readable `explain` payload.
///
/// Anomalies are plain data: they serialize, clone, and cross the wire.
/// Validation anomalies always carry `explain` describing which fields
/// failed.
///
/// # Examples
///
/// ```
/// use grain::{Anomaly, Category};
/// use serde_json::json;
///
/// let anomaly = Anomaly::incorrect("Invalid command")
///     .with_explain(json!({"name": "missing required field"}));
/// assert_eq!(anomaly.category, Category::Incorrect);
/// assert!(anomaly.explain.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{category}: {message}")]
pub struct Anomaly {
    /// What went wrong, for dispatch at boundaries.
    pub category: Category,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail, e.g. per-field validation failures.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub explain: Option<Value>,
}

impl Anomaly {
    /// Build an anomaly with an arbitrary category.
    pub fn new(category: Category, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            explain: None,
        }
    }

    /// Invalid input from the caller.
    pub fn incorrect(message: impl Into<String>) -> Self {
        Self::new(Category::Incorrect, message)
    }

    /// The named thing does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Category::NotFound, message)
    }

    /// The caller is not allowed to do this.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Category::Forbidden, message)
    }

    /// The operation conflicts with existing state.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Category::Conflict, message)
    }

    /// Internal failure: bug, panic, or storage error.
    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(Category::Fault, message)
    }

    /// A required collaborator is not available.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Category::Unavailable, message)
    }

    /// The system is overloaded.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(Category::Busy, message)
    }

    /// The operation was interrupted.
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(Category::Interrupted, message)
    }

    /// Attach a structured `explain` payload.
    pub fn with_explain(mut self, explain: Value) -> Self {
        self.explain = Some(explain);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_includes_category_and_message() {
        let anomaly = Anomaly::not_found("Unknown Command");
        assert_eq!(anomaly.to_string(), "not_found: Unknown Command");
    }

    #[test]
    fn constructors_set_expected_categories() {
        assert_eq!(Anomaly::incorrect("x").category, Category::Incorrect);
        assert_eq!(Anomaly::not_found("x").category, Category::NotFound);
        assert_eq!(Anomaly::forbidden("x").category, Category::Forbidden);
        assert_eq!(Anomaly::conflict("x").category, Category::Conflict);
        assert_eq!(Anomaly::fault("x").category, Category::Fault);
        assert_eq!(Anomaly::unavailable("x").category, Category::Unavailable);
        assert_eq!(Anomaly::busy("x").category, Category::Busy);
        assert_eq!(Anomaly::interrupted("x").category, Category::Interrupted);
    }

    #[test]
    fn explain_omitted_from_json_when_none() {
        let json = serde_json::to_string(&Anomaly::fault("boom")).expect("serialize");
        assert!(!json.contains("explain"), "got: {json}");
    }

    #[test]
    fn serde_roundtrip_preserves_explain() {
        let anomaly = Anomaly::incorrect("Invalid command")
            .with_explain(json!({"name": "missing required field"}));
        let json = serde_json::to_string(&anomaly).expect("serialize");
        let back: Anomaly = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, anomaly);
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_value(Category::NotFound).expect("serialize");
        assert_eq!(json, json!("not_found"));
    }

    // Anomalies cross task boundaries inside the todo processor, which
    // requires `Send + Sync`.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<Anomaly>();
        }
    };
}
