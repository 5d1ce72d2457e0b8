//! # Domain Types for FoldDB
//!
//! This module defines the core types of the event log: versions, events,
//! child-event requests, and reductions.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! The event version is wrapped in a newtype ([`Version`]) instead of being a
//! bare `u64`. A version is not a count and not a row id; giving it its own
//! type keeps it from being mixed up with either, and gives us a place to
//! hang the sentinel constants.
//!
//! ## Invariants
//!
//! - [`Version`]: dense and strictly increasing — persisted events are
//!   numbered `1, 2, …, N` with no gaps. Zero is the "nothing applied yet"
//!   sentinel, never a real version.
//! - [`Event`]: `event_type` is never empty; a handled event has `result`
//!   set and `error` unset; child events inherit the root's `v` and `ts` and
//!   appear in `events` in depth-first dispatch order.
//! - [`Reduction`]: describes writes, it never performs them. Absent keys
//!   mean "no change".

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

// =============================================================================
// Version
// =============================================================================

/// A position in the event log.
///
/// Assigned by the queue at enqueue time, starting at 1. A failed event
/// still consumes its version, so the sequence of persisted versions has no
/// gaps regardless of outcomes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Sentinel meaning "no version" / "nothing applied yet".
    pub const NONE: Version = Version(0);

    /// The first real version (1, not 0).
    pub const FIRST: Version = Version(1);

    /// Creates a Version from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value for database storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true if this is the [`Version::NONE`] sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// A persisted unit of change in the event log.
///
/// The same struct serves as root event and child event: a root event is
/// dispatched externally and advances the applied version; a child event is
/// dispatched from inside a handler, inherits its parent's `v` and `ts`, and
/// nests in the parent's `events` list.
///
/// # Lifecycle
///
/// `QUEUED` (no `result`, no `error`) → `PROCESSING` (transient, inside the
/// write transaction) → `HANDLED` (`result` set) or `FAILED` (`error` set).
/// Terminal states are written back to the queue row; replaying via
/// `queue_set` is the only way back to `QUEUED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the event log. Children carry their root's `v`.
    pub v: Version,

    /// The event type. Never empty; handlers key their behavior off it.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Unix timestamp in milliseconds, caller-supplied or defaulted at
    /// enqueue time. Children inherit the parent's `ts`.
    pub ts: i64,

    /// The event payload. Any JSON value; `Null` means "no payload".
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,

    /// Per-model reduction output, populated after a successful apply.
    ///
    /// Contains exactly the models whose reducer returned a reduction for
    /// this event (plus a synthesized entry for direct-write events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, JsonValue>>,

    /// Child events produced while processing this event, in depth-first
    /// dispatch order. Each child carries its own `result`/`events`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,

    /// Failure causes keyed by phase and model (`_preprocess_<model>`,
    /// `_reduce_<model>`, `_apply_<model>`, `_derive_<model>`, `_handle`).
    /// Only set on failed events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Map<String, JsonValue>>,
}

impl Event {
    /// Creates a fresh, unprocessed event.
    pub fn new(v: Version, event_type: impl Into<String>, data: JsonValue, ts: i64) -> Self {
        Self {
            v,
            event_type: event_type.into(),
            ts,
            data,
            result: None,
            events: Vec::new(),
            error: None,
        }
    }

    /// Creates a child event inheriting a parent's `v` and `ts`.
    pub fn child(spec: ChildSpec, v: Version, ts: i64) -> Self {
        Self::new(v, spec.event_type, spec.data, ts)
    }

    /// True if this event reached the terminal-success state.
    pub fn is_handled(&self) -> bool {
        self.result.is_some() && self.error.is_none()
    }

    /// True if this event reached the terminal-failure state.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// The error keys joined for log and Display output.
    pub fn error_summary(&self) -> String {
        match &self.error {
            Some(map) => map.keys().cloned().collect::<Vec<_>>().join(", "),
            None => String::new(),
        }
    }
}

// =============================================================================
// Child Event Requests
// =============================================================================

/// A request for a child event, as produced by a handler's `dispatch` or a
/// reduction's `events` list.
///
/// Only the type and payload are specified; the engine fills in the
/// inherited `v`/`ts` when it turns the spec into an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Type of the child event.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Payload of the child event.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,
}

impl ChildSpec {
    /// Creates a child-event request.
    pub fn new(event_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

// =============================================================================
// Reductions
// =============================================================================

/// What a reducer returns: a description of writes, applied by the engine
/// inside the event's transaction.
///
/// Within one model the apply order is fixed: `rm`, then `ins`, then `set`,
/// then `upd`. Across models the registry's insertion order is authoritative.
/// The `events` list appends further children to the current event, after
/// any children the reducer dispatched while running.
///
/// # Example
///
/// ```rust
/// use folddb::Reduction;
/// use serde_json::json;
///
/// let reduction = Reduction::new()
///     .upsert(json!({"id": "greeting", "text": "hello"}))
///     .remove("stale");
/// assert!(!reduction.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reduction {
    /// Whole rows to upsert. Columns missing from a row become NULL.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<JsonValue>,

    /// Rows to insert; an id collision fails the apply phase.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ins: Vec<JsonValue>,

    /// Partial updates; each must carry the id of an existing row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upd: Vec<JsonValue>,

    /// Ids to delete. Deleting an absent id is a no-op.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rm: Vec<String>,

    /// Child events to append after the reducer's dispatched children.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ChildSpec>,
}

impl Reduction {
    /// Creates an empty reduction (a no-op).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a whole row to upsert.
    pub fn upsert(mut self, row: JsonValue) -> Self {
        self.set.push(row);
        self
    }

    /// Adds a row to insert (fails on id collision).
    pub fn insert(mut self, row: JsonValue) -> Self {
        self.ins.push(row);
        self
    }

    /// Adds a partial update.
    pub fn update(mut self, patch: JsonValue) -> Self {
        self.upd.push(patch);
        self
    }

    /// Adds an id to delete.
    pub fn remove(mut self, id: impl Into<String>) -> Self {
        self.rm.push(id.into());
        self
    }

    /// Appends a child event to the current event.
    pub fn emit(mut self, child: ChildSpec) -> Self {
        self.events.push(child);
        self
    }

    /// True if the reduction describes no writes and no child events.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.ins.is_empty()
            && self.upd.is_empty()
            && self.rm.is_empty()
            && self.events.is_empty()
    }
}

// =============================================================================
// Direct Writes
// =============================================================================

/// Event type reserved for writes made through `rw_store` outside a dispatch.
///
/// Such writes are logged as an event whose `data` is a [`DirectWrite`];
/// the engine's reduce phase recognises the type and synthesises the
/// corresponding reduction, so replaying the log reproduces the write.
pub const DIRECT_WRITE_EVENT: &str = "$write";

/// Payload of a [`DIRECT_WRITE_EVENT`]: the target model plus the reduction
/// fields describing the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectWrite {
    /// The model whose table the write targets.
    pub model: String,

    /// The change, flattened into the payload (`set`/`ins`/`upd`/`rm`).
    #[serde(flatten)]
    pub reduction: Reduction,
}

// =============================================================================
// Time
// =============================================================================

/// Current unix time in milliseconds, used as the default event `ts`.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_ordering() {
        let v1 = Version::from_raw(1);
        let v2 = Version::from_raw(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
    }

    #[test]
    fn test_version_none() {
        assert!(Version::NONE.is_none());
        assert!(!Version::FIRST.is_none());
        assert_eq!(Version::NONE.to_string(), "none");
        assert_eq!(Version::FIRST.to_string(), "1");
    }

    #[test]
    fn test_event_lifecycle_flags() {
        let mut event = Event::new(Version::FIRST, "hi", JsonValue::Null, 0);
        assert!(!event.is_handled());
        assert!(!event.is_failed());

        event.result = Some(Map::new());
        assert!(event.is_handled());

        let mut map = Map::new();
        map.insert("_handle".to_string(), json!("bad"));
        event.error = Some(map);
        assert!(event.is_failed());
        assert!(!event.is_handled());
        assert_eq!(event.error_summary(), "_handle");
    }

    /// The wire format uses `"type"`, not `"event_type"`, and omits unset
    /// optional fields so stored rows stay compact.
    #[test]
    fn test_event_serde_round_trip() {
        let mut event = Event::new(Version::from_raw(7), "hi", json!({"k": 1}), 1234);
        event.events.push(Event::child(
            ChildSpec::new("ho", JsonValue::Null),
            event.v,
            event.ts,
        ));

        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"type\":\"hi\""));
        assert!(!text.contains("result"));
        assert!(!text.contains("error"));

        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.events[0].v, event.v);
        assert_eq!(back.events[0].ts, event.ts);
    }

    #[test]
    fn test_reduction_builder_and_serde() {
        let reduction = Reduction::new()
            .upsert(json!({"id": "a"}))
            .remove("b")
            .emit(ChildSpec::new("kid", JsonValue::Null));
        assert!(!reduction.is_empty());

        let value = serde_json::to_value(&reduction).unwrap();
        assert_eq!(value["set"][0]["id"], "a");
        assert_eq!(value["rm"][0], "b");
        assert_eq!(value["events"][0]["type"], "kid");
        // Empty keys are skipped entirely.
        assert!(value.get("ins").is_none());
        assert!(value.get("upd").is_none());
    }

    #[test]
    fn test_empty_reduction_serializes_to_empty_object() {
        let value = serde_json::to_value(Reduction::new()).unwrap();
        assert_eq!(value, json!({}));
        assert!(Reduction::new().is_empty());
    }

    #[test]
    fn test_direct_write_payload_flattens_reduction() {
        let dw = DirectWrite {
            model: "foo".to_string(),
            reduction: Reduction::new().upsert(json!({"id": "x"})),
        };
        let value = serde_json::to_value(&dw).unwrap();
        assert_eq!(value["model"], "foo");
        assert_eq!(value["set"][0]["id"], "x");

        let back: DirectWrite = serde_json::from_value(value).unwrap();
        assert_eq!(back.model, "foo");
        assert_eq!(back.reduction.set.len(), 1);
    }

    #[test]
    fn test_now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
