//! # The Event Queue
//!
//! The append-only event log, backed by the `history` table. Every mutation
//! in the database is derived from this log; rebuilding all model tables
//! from it yields the same state.
//!
//! ## Invariants
//!
//! - `v` is strictly monotonic and dense, starting at 1. Allocation is
//!   `max(v) + 1` inside the writer's transaction, so concurrent enqueues
//!   are serialised by the transaction discipline.
//! - A row with a non-NULL `result` and NULL `error` is handled and is
//!   never picked up again. [`Queue::next_unhandled`] only ever returns
//!   rows where both are NULL.
//! - [`Queue::set`] stores exactly what it is given; requeue semantics
//!   (clearing terminal state for replay) live one layer up, in the engine.

use std::rc::Rc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::sql;
use crate::types::{Event, Version};

/// Columns selected for every event read, in [`row_to_event`] order.
const EVENT_COLUMNS: &str = "v, type, ts, data, result, events, error";

// =============================================================================
// Queue
// =============================================================================

/// Handle to the `history` table over the writer connection.
pub struct Queue {
    conn: Rc<Connection>,
}

impl Queue {
    /// Creates a queue handle.
    pub fn new(conn: Rc<Connection>) -> Self {
        Self { conn }
    }

    /// Appends a fresh event, allocating `v = max(v) + 1`.
    ///
    /// The returned event is in the `QUEUED` state (no result, no error).
    ///
    /// # Errors
    ///
    /// `Error::Schema` if `event_type` is empty - no event with an empty
    /// type ever enters the log.
    pub fn add(&self, event_type: &str, data: JsonValue, ts: i64) -> Result<Event> {
        if event_type.is_empty() {
            return Err(Error::Schema(
                "event type must be a non-empty string".to_string(),
            ));
        }

        let v = self.max_v()?.next();
        let data_text = match &data {
            JsonValue::Null => SqlValue::Null,
            value => SqlValue::Text(sql::json_text(value)),
        };
        self.conn.execute(
            "INSERT INTO history (v, type, ts, data) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![v.as_raw() as i64, event_type, ts, data_text],
        )?;

        Ok(Event::new(v, event_type, data, ts))
    }

    /// Upserts a full event row at the event's `v`, verbatim.
    ///
    /// Used by the engine both to write back terminal state after
    /// processing and to store replayed rows.
    pub fn set(&self, event: &Event) -> Result<()> {
        let json_col = |value: Option<String>| match value {
            Some(text) => SqlValue::Text(text),
            None => SqlValue::Null,
        };

        let data = match &event.data {
            JsonValue::Null => None,
            value => Some(sql::json_text(value)),
        };
        let result = event
            .result
            .as_ref()
            .map(|m| sql::json_text(&JsonValue::Object(m.clone())));
        let events = if event.events.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&event.events).map_err(|e| {
                Error::Schema(format!("failed to serialize events of v={}: {e}", event.v))
            })?)
        };
        let error = event
            .error
            .as_ref()
            .map(|m| sql::json_text(&JsonValue::Object(m.clone())));

        self.conn.execute(
            "INSERT OR REPLACE INTO history (v, type, ts, data, result, events, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                event.v.as_raw() as i64,
                event.event_type,
                event.ts,
                json_col(data),
                json_col(result),
                json_col(events),
                json_col(error),
            ],
        )?;
        Ok(())
    }

    /// Fetches the event at `v`, if any.
    pub fn get(&self, v: Version) -> Result<Option<Event>> {
        let stmt = format!("SELECT {EVENT_COLUMNS} FROM history WHERE v = ?");
        let raw = self
            .conn
            .query_row(&stmt, [v.as_raw() as i64], row_to_raw)
            .optional()?;
        raw.map(raw_to_event).transpose()
    }

    /// The event with the smallest `v > after`, if any.
    pub fn get_next(&self, after: Version) -> Result<Option<Event>> {
        let stmt =
            format!("SELECT {EVENT_COLUMNS} FROM history WHERE v > ? ORDER BY v LIMIT 1");
        let raw = self
            .conn
            .query_row(&stmt, [after.as_raw() as i64], row_to_raw)
            .optional()?;
        raw.map(raw_to_event).transpose()
    }

    /// The unprocessed event with the smallest `v`, if any.
    pub fn next_unhandled(&self) -> Result<Option<Event>> {
        let stmt = format!(
            "SELECT {EVENT_COLUMNS} FROM history
             WHERE result IS NULL AND error IS NULL
             ORDER BY v LIMIT 1"
        );
        let raw = self.conn.query_row(&stmt, [], row_to_raw).optional()?;
        raw.map(raw_to_event).transpose()
    }

    /// The highest allocated version, or [`Version::NONE`] on an empty log.
    pub fn max_v(&self) -> Result<Version> {
        let v: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(v), 0) FROM history", [], |row| {
                row.get(0)
            })?;
        Ok(Version::from_raw(v as u64))
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

/// The raw TEXT columns of a history row, before JSON decoding.
struct RawEventRow {
    v: i64,
    event_type: String,
    ts: i64,
    data: Option<String>,
    result: Option<String>,
    events: Option<String>,
    error: Option<String>,
}

fn row_to_raw(row: &Row) -> rusqlite::Result<RawEventRow> {
    Ok(RawEventRow {
        v: row.get(0)?,
        event_type: row.get(1)?,
        ts: row.get(2)?,
        data: row.get(3)?,
        result: row.get(4)?,
        events: row.get(5)?,
        error: row.get(6)?,
    })
}

/// Decodes the JSON columns. Corrupt JSON is a schema error naming the row.
fn raw_to_event(raw: RawEventRow) -> Result<Event> {
    let context = |col: &str| format!("history row v={} column '{col}'", raw.v);

    let data = match raw.data {
        Some(text) => sql::parse_json(&text, &context("data"))?,
        None => JsonValue::Null,
    };
    let result = raw
        .result
        .map(|text| -> Result<_> {
            match sql::parse_json(&text, &context("result"))? {
                JsonValue::Object(map) => Ok(map),
                _ => Err(Error::Schema(format!(
                    "history row v={}: result must be an object",
                    raw.v
                ))),
            }
        })
        .transpose()?;
    let events = raw
        .events
        .map(|text| {
            serde_json::from_str::<Vec<Event>>(&text).map_err(|e| {
                Error::Schema(format!("corrupt JSON in {}: {e}", context("events")))
            })
        })
        .transpose()?
        .unwrap_or_default();
    let error = raw
        .error
        .map(|text| -> Result<_> {
            match sql::parse_json(&text, &context("error"))? {
                JsonValue::Object(map) => Ok(map),
                _ => Err(Error::Schema(format!(
                    "history row v={}: error must be an object",
                    raw.v
                ))),
            }
        })
        .transpose()?;

    Ok(Event {
        v: Version::from_raw(raw.v as u64),
        event_type: raw.event_type,
        ts: raw.ts,
        data,
        result,
        events,
        error,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRegistry;
    use crate::schema::Database;
    use serde_json::{json, Map};

    fn test_queue() -> Queue {
        let registry = ModelRegistry::new();
        let db = Database::open_in_memory(&registry).unwrap();
        Queue::new(Rc::new(db.into_connection()))
    }

    #[test]
    fn test_add_allocates_dense_versions() {
        let queue = test_queue();
        assert_eq!(queue.max_v().unwrap(), Version::NONE);

        let e1 = queue.add("a", JsonValue::Null, 10).unwrap();
        let e2 = queue.add("b", json!({"k": 1}), 20).unwrap();

        assert_eq!(e1.v, Version::from_raw(1));
        assert_eq!(e2.v, Version::from_raw(2));
        assert_eq!(queue.max_v().unwrap(), Version::from_raw(2));
    }

    #[test]
    fn test_add_rejects_empty_type() {
        let queue = test_queue();
        let err = queue.add("", JsonValue::Null, 0).unwrap_err();
        assert!(err.to_string().contains("non-empty"));
    }

    #[test]
    fn test_get_and_get_next() {
        let queue = test_queue();
        queue.add("a", JsonValue::Null, 0).unwrap();
        queue.add("b", JsonValue::Null, 0).unwrap();

        let got = queue.get(Version::from_raw(2)).unwrap().unwrap();
        assert_eq!(got.event_type, "b");
        assert!(queue.get(Version::from_raw(3)).unwrap().is_none());

        let next = queue.get_next(Version::from_raw(1)).unwrap().unwrap();
        assert_eq!(next.v, Version::from_raw(2));
        assert!(queue.get_next(Version::from_raw(2)).unwrap().is_none());
    }

    #[test]
    fn test_set_upserts_full_row() {
        let queue = test_queue();
        let mut event = queue.add("a", json!({"k": 1}), 5).unwrap();

        let mut result = Map::new();
        result.insert("foo".to_string(), json!({"set": [{"id": "x"}]}));
        event.result = Some(result);
        event.events = vec![Event::new(event.v, "kid", JsonValue::Null, 5)];
        queue.set(&event).unwrap();

        let back = queue.get(event.v).unwrap().unwrap();
        assert_eq!(back, event);
        assert!(back.is_handled());
    }

    #[test]
    fn test_set_at_future_version_leaves_gap_visible() {
        let queue = test_queue();
        let seeded = Event::new(Version::from_raw(5), "hi", JsonValue::Null, 0);
        queue.set(&seeded).unwrap();

        assert_eq!(queue.max_v().unwrap(), Version::from_raw(5));
        // The next allocation continues from the seeded maximum.
        let next = queue.add("after", JsonValue::Null, 0).unwrap();
        assert_eq!(next.v, Version::from_raw(6));
    }

    #[test]
    fn test_next_unhandled_skips_terminal_rows() {
        let queue = test_queue();
        let mut e1 = queue.add("a", JsonValue::Null, 0).unwrap();
        let e2 = queue.add("b", JsonValue::Null, 0).unwrap();
        let mut e3 = queue.add("c", JsonValue::Null, 0).unwrap();

        e1.result = Some(Map::new());
        queue.set(&e1).unwrap();

        let mut error = Map::new();
        error.insert("_handle".to_string(), json!("bad"));
        e3.error = Some(error);
        queue.set(&e3).unwrap();

        let next = queue.next_unhandled().unwrap().unwrap();
        assert_eq!(next.v, e2.v);

        let mut e2_done = e2;
        e2_done.result = Some(Map::new());
        queue.set(&e2_done).unwrap();
        assert!(queue.next_unhandled().unwrap().is_none());
    }
}
