//! # The Metadata Model
//!
//! Bookkeeping state in the reserved `metadata` key/value table, updated in
//! the same transaction as the user models it describes:
//!
//! - `version`: the highest `v` of any fully-applied root event. Advances
//!   exactly once per root event, success *or* failure - a failed event
//!   still consumes its version, which keeps the log dense.
//! - `handled_count` / `failed_count`: running totals for observability.
//!
//! The `schema_version` key in the same table belongs to
//! [`Database`](crate::schema::Database) initialization, not to this handle.

use std::rc::Rc;

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;
use crate::types::Version;

/// Key of the applied-version pointer.
pub const KEY_VERSION: &str = "version";

/// Key of the handled-events counter.
pub const KEY_HANDLED: &str = "handled_count";

/// Key of the failed-events counter.
pub const KEY_FAILED: &str = "failed_count";

// =============================================================================
// Metadata
// =============================================================================

/// Handle to the `metadata` table over the writer connection.
pub struct Metadata {
    conn: Rc<Connection>,
}

impl Metadata {
    /// Creates a metadata handle.
    pub fn new(conn: Rc<Connection>) -> Self {
        Self { conn }
    }

    /// The applied version, [`Version::NONE`] before any root event ran.
    pub fn version(&self) -> Result<Version> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?",
                [KEY_VERSION],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value
            .and_then(|s| s.parse().ok())
            .map(Version::from_raw)
            .unwrap_or(Version::NONE))
    }

    /// Advances the applied version to `v`.
    pub fn set_version(&self, v: Version) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            rusqlite::params![KEY_VERSION, v.as_raw().to_string()],
        )?;
        Ok(())
    }

    /// Increments a counter key by one.
    pub fn bump(&self, key: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, '1')
             ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1",
            [key],
        )?;
        Ok(())
    }

    /// Reads a counter key, defaulting to zero.
    pub fn counter(&self, key: &str) -> Result<u64> {
        let value: Option<String> = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.and_then(|s| s.parse().ok()).unwrap_or(0))
    }
}

// =============================================================================
// Tests
// =============================================================================
