//! # SQLite Schema for FoldDB
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Schema Overview                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  history (event queue)          metadata                             │
//! │  ┌──────────────────┐           ┌──────────────────┐                 │
//! │  │ v (PK)           │           │ key (PK)         │                 │
//! │  │ type, ts         │           │ value            │                 │
//! │  │ data JSON        │           └──────────────────┘                 │
//! │  │ result JSON      │            schema_version, version,            │
//! │  │ events JSON      │            handled_count, failed_count         │
//! │  │ error JSON       │                                                │
//! │  └──────────────────┘                                                │
//! │                                                                      │
//! │  one table per registered model, derived from its Columns:           │
//! │  ┌──────────────────┐                                                │
//! │  │ id TEXT (PK)     │                                                │
//! │  │ <col> TEXT JSON  │  ...                                           │
//! │  └──────────────────┘                                                │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why TEXT for JSON columns?
//!
//! Model documents and event payloads are stored as compact JSON text.
//! SQLite's JSON functions operate on TEXT directly, the values round-trip
//! through `serde_json` without a binary codec, and a rebuilt database is
//! byte-comparable against the original.
//!
//! ### Why one table per model?
//!
//! Each model's `Columns` declaration becomes a real table, so the read
//! surface (`get`, `search_one`) is plain indexed SQL instead of scanning a
//! single blob store. The event log stays the source of truth; model tables
//! are derived state and can always be rebuilt from `history`.

use rusqlite::Connection;

use crate::model::ModelRegistry;
use crate::sql;
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// For v1 there are no migrations - a version mismatch is an error.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `history` table is the append-only event queue.
///
/// # Columns
///
/// - `v`: Event version, dense and strictly increasing from 1 (PK)
/// - `type`: Event type string, never empty
/// - `ts`: Unix timestamp in milliseconds
/// - `data`: Event payload as compact JSON text (NULL = no payload)
/// - `result`: Per-model reduction output, set once handled
/// - `events`: Child-event subtree, set once handled
/// - `error`: Failure map keyed by phase/model, set once failed
///
/// # Invariants
///
/// - `v` values form `1, 2, …, N` with no gaps, failures included
/// - A row with non-NULL `result` and NULL `error` is handled and is never
///   re-processed
const CREATE_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS history (
    v      INTEGER PRIMARY KEY,
    type   TEXT NOT NULL,
    ts     INTEGER NOT NULL,
    data   TEXT,
    result TEXT,
    events TEXT,
    error  TEXT
)
"#;

/// Metadata table for the applied-version pointer and bookkeeping.
///
/// # Keys
///
/// - `schema_version`: for open-time verification
/// - `version`: highest `v` of any fully-applied root event (success or
///   failure), advanced in the same transaction as the apply
/// - `handled_count` / `failed_count`: running totals
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Builds the DDL for one model table from its column declaration.
///
/// Every model table has a TEXT `id` primary key plus one TEXT column of
/// compact JSON per declared column. Identifiers are quoted because model
/// and column names are user-supplied.
pub(crate) fn model_table_sql(name: &str, columns: &[String]) -> String {
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    id TEXT PRIMARY KEY",
        sql::ident(name)
    );
    for col in columns {
        ddl.push_str(",\n    ");
        ddl.push_str(&sql::ident(col));
        ddl.push_str(" TEXT");
    }
    ddl.push_str("\n)");
    ddl
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A wrapper around a SQLite connection with the FoldDB schema applied.
///
/// `Database` owns its `Connection`; dropping it closes the connection.
/// The engine consumes it via [`Database::into_connection`] after
/// initialization.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// Applies the pragmas, creates `history`, `metadata` and one table per
    /// registered model, and verifies the schema version.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>, registry: &ModelRegistry) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize(registry)?;
        Ok(db)
    }

    /// Creates an in-memory database.
    ///
    /// In-memory databases vanish when the connection closes; they exist for
    /// unit tests of the storage layer. The public [`FoldDb`](crate::FoldDb)
    /// API is file-backed because readers open their own connections.
    pub fn open_in_memory(registry: &ModelRegistry) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(registry)?;
        Ok(db)
    }

    /// Initializes pragmas and schema. Idempotent - safe to call on an
    /// already-initialized database.
    fn initialize(&mut self, registry: &ModelRegistry) -> Result<()> {
        // =====================================================================
        // SQLite Pragmas
        // =====================================================================
        // These must be set before any other operations.

        // WAL mode: readers see a consistent snapshot while the single
        // writer commits; the read pool depends on this.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;

        // Sync the WAL on commit but not on every write. A lost OS-crash
        // transaction re-runs from the caller's retry.
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        // Derivers may install triggers on model tables; recursive firing
        // must behave the same on replay as on first run.
        self.conn.execute_batch("PRAGMA recursive_triggers = ON")?;

        // Statement-level busy waits. BEGIN IMMEDIATE contention is handled
        // separately with jittered retries in the connection layer.
        self.conn.execute_batch("PRAGMA busy_timeout = 5000")?;

        // Only takes effect on freshly created files; a no-op afterwards.
        self.conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL")?;

        // =====================================================================
        // Create Tables
        // =====================================================================

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_HISTORY)?;

        for model in registry.iter() {
            let ddl = model_table_sql(model.name(), model.columns().names());
            self.conn.execute_batch(&ddl)?;
        }

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this FoldDB version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper, returning the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Returns a reference to the underlying SQLite connection.
    ///
    /// Test-only; normal access goes through the queue, metadata and store
    /// layers.
    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
