//! # FoldDB - Event-Sourced Document Database on SQLite
//!
//! FoldDB is an embedded NoSQL-hybrid database: user data lives in
//! document-like rows in SQLite tables, but every mutation is derived from
//! an append-only, totally-ordered stream of **events**. Rebuilding the
//! database from the event log always yields the same state.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Async API (FoldDb)                        │
//! │        dispatch, handled_version, store/rw_store, replay        │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Dispatch Engine                           │
//! │           (single thread, owns the write connection)            │
//! │                                                                 │
//! │   ┌───────────┐   ┌──────────────────────┐   ┌──────────────┐   │
//! │   │   Event   │   │ preprocess → reduce  │   │   Metadata   │   │
//! │   │   Queue   │   │ → apply → derive     │   │ (version V)  │   │
//! │   │ (history) │   │ → recurse (children) │   │              │   │
//! │   └───────────┘   └──────────────────────┘   └──────────────┘   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite (WAL)                            │
//! │            history, metadata, one table per model               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! These invariants hold for every sequence of dispatches:
//!
//! 1. **Dense versions**: persisted events are numbered `1, 2, …, N` with no
//!    gaps; a failed event still consumes its version.
//! 2. **Strict ordering**: root events apply in version order, one at a
//!    time, each under a single write transaction.
//! 3. **Depth-first children**: an event's `events` list is the pre-order
//!    traversal of its dispatch tree.
//! 4. **Determinism**: the same events against the same models produce
//!    byte-identical model tables, and replaying a handled event re-derives
//!    the same result and children.
//! 5. **Terminal states are durable**: handled results commit with their
//!    applies; failures are marked in their own micro-transaction.
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum
//! - [`types`]: versions, events, reductions
//! - [`sql`]: identifier quoting and JSON column helpers
//! - [`schema`]: DDL and database initialization
//! - [`connection`]: the write connection and transaction discipline
//! - [`queue`]: the append-only event log (`history` table)
//! - [`metadata`]: applied version and counters
//! - [`model`]: models, handlers, the registry
//! - [`store`]: document read/write views over model tables
//! - [`emitter`]: result/error/transaction pub/sub
//! - [`db`]: the public async handle ([`FoldDb`])

// =============================================================================
// Module Declarations
// =============================================================================

/// The write connection: `BEGIN IMMEDIATE` discipline, busy retries,
/// transaction signals.
pub mod connection;

/// The public async handle and its store/dispatch futures.
pub mod db;

/// In-process pub/sub for engine signals.
pub mod emitter;

/// Error types for FoldDB operations.
pub mod error;

/// The applied-version pointer and bookkeeping counters.
pub mod metadata;

/// Models, handler slots and the registry.
pub mod model;

/// The append-only event queue.
pub mod queue;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// SQL templating utilities.
pub mod sql;

/// Document stores over model tables.
pub mod store;

/// Domain types: versions, events, reductions.
pub mod types;

/// The dispatch engine: request loop and the four-phase pipeline.
mod engine;

// =============================================================================
// Re-exports
// =============================================================================

pub use db::{Config, DispatchFuture, FoldDb, RwStoreHandle, StoreHandle, QUIET_ENV};
pub use emitter::{Emitter, TxSignal};
pub use error::{Error, Result};
pub use model::{Columns, DeriveCtx, Model, ModelRegistry, PhaseCtx, Preprocessed};
pub use schema::Database;
pub use store::{RwStores, Stores};
pub use types::{ChildSpec, DirectWrite, Event, Reduction, Version, DIRECT_WRITE_EVENT};
