//! # Error Handling for FoldDB
//!
//! This module defines the error types used throughout FoldDB. We use a single
//! error enum ([`Error`]) to represent all failure modes, which keeps function
//! signatures simple and lets callers handle errors uniformly.
//!
//! ## Two Kinds of Failure
//!
//! FoldDB distinguishes *engine* failures from *event* failures:
//!
//! - **Engine failures** (SQLite errors, schema mismatches, a closed engine)
//!   are ordinary `Error` variants and propagate with `?`.
//! - **Event failures** are data. When the dispatch pipeline aborts, the
//!   causes are recorded as a JSON map keyed by phase and model
//!   (`_preprocess_<model>`, `_reduce_<model>`, `_apply_<model>`,
//!   `_derive_<model>`, `_handle`) on the event row itself, so the failure
//!   is durable and replayable. The only way such a failure crosses the API
//!   boundary is [`Error::EventFailed`], which carries the full event.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Contention | `Busy` | Raise retry budget, check other writers |
//! | Usage | `UnknownModel`, `MissingRow`, `ReadOnly` | Fix the call site |
//! | Pipeline | `EventFailed` | Inspect `event.error`, fix the handler |
//! | Internal | `Sqlite`, `Schema` | Log and investigate |

use thiserror::Error;

use crate::types::Event;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in FoldDB operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate: a locked database file, a
    /// full disk, corruption, or a bad statement (which indicates a bug in
    /// FoldDB itself). The `#[from]` attribute lets `?` convert these
    /// automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch, corrupt stored JSON, or invalid input shape.
    ///
    /// Opening a database created by a newer FoldDB version, a history row
    /// whose JSON columns no longer parse, or a row document without a
    /// string `id` all land here.
    #[error("schema error: {0}")]
    Schema(String),

    /// The write connection was opened read-only.
    ///
    /// The dispatch engine requires a writable connection; this is checked
    /// once at startup rather than on every transaction.
    #[error("connection is read-only")]
    ReadOnly,

    /// `BEGIN IMMEDIATE` kept failing with `SQLITE_BUSY` after the bounded
    /// retry budget was spent.
    ///
    /// Busy contention is normally absorbed by jittered backoff; seeing this
    /// error means another process held the write lock for the whole budget.
    #[error("database is busy: gave up after {attempts} attempts")]
    Busy {
        /// How many `BEGIN IMMEDIATE` attempts were made.
        attempts: u32,
    },

    /// A model name was used that is not in the registry.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// A partial update (`upd`) targeted a row that does not exist.
    ///
    /// `upd` patches an existing document; creating documents is what `set`
    /// and `ins` are for.
    #[error("row '{id}' not found in model '{model}'")]
    MissingRow {
        /// The model whose table was targeted.
        model: String,
        /// The id that did not match any row.
        id: String,
    },

    /// The event's pipeline aborted; the boxed event carries the populated
    /// `error` map.
    ///
    /// This is the rejection value of [`dispatch`](crate::FoldDb::dispatch)
    /// and [`handled_version`](crate::FoldDb::handled_version) futures. The
    /// same event row is durably persisted in the queue with its error map.
    #[error("event v={} failed: {}", .0.v, .0.error_summary())]
    EventFailed(Box<Event>),

    /// The engine has shut down; the request channel is closed.
    #[error("engine is shut down")]
    Closed,
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Version;

    /// Error messages appear in logs; keep them readable and informative.
    #[test]
    fn test_error_display() {
        let busy = Error::Busy { attempts: 11 };
        assert_eq!(busy.to_string(), "database is busy: gave up after 11 attempts");

        let missing = Error::MissingRow {
            model: "foo".to_string(),
            id: "bar".to_string(),
        };
        assert_eq!(missing.to_string(), "row 'bar' not found in model 'foo'");

        let unknown = Error::UnknownModel("nope".to_string());
        assert_eq!(unknown.to_string(), "unknown model 'nope'");
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }

    #[test]
    fn test_event_failed_display_lists_error_keys() {
        let mut event = Event::new(Version::from_raw(3), "boom", serde_json::Value::Null, 0);
        let mut map = serde_json::Map::new();
        map.insert("_reduce_foo".to_string(), serde_json::json!("exploded"));
        event.error = Some(map);

        let err = Error::EventFailed(Box::new(event));
        let text = err.to_string();
        assert!(text.contains("v=3"));
        assert!(text.contains("_reduce_foo"));
    }
}
