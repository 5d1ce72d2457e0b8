//! # The Async FoldDB Handle
//!
//! The public entry point. `FoldDb` wraps the dispatch engine with Tokio
//! channels so any async task can dispatch events and read models without
//! touching the engine thread directly.
//!
//! ## The SQLite Challenge
//!
//! The writer connection cannot be shared across threads, and the dispatch
//! pipeline must hold it across awaits (handlers are async). The solution
//! is a dedicated OS thread that owns the connection and drives a
//! current-thread runtime; callers talk to it over channels:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Async Tasks (callers)                  │
//! │   dispatch ─┐                              ┌─ store reads   │
//! │   replay  ──┼── unbounded mpsc ──┐   ┌─────┼── mpsc ──┐     │
//! │   rw writes─┘                    │   │     └──────────┼──   │
//! └──────────────────────────────────┼───┼────────────────┼─────┘
//!                                    ▼   │                ▼
//!                        ┌───────────────┴──┐   ┌─────────────────┐
//!                        │   Engine Thread  │   │   Reader Pool   │
//!                        │  (write conn,    │   │  (1-4 threads,  │
//!                        │   event loop)    │   │  read-only conns│
//!                        └────────┬─────────┘   └────────┬────────┘
//!                                 │                      │
//!                                 ▼                      ▼
//!                              ┌─────────────────────────────┐
//!                              │        SQLite (WAL)         │
//!                              └─────────────────────────────┘
//! ```
//!
//! Dispatch requests ride an **unbounded** channel: the send is synchronous,
//! so calling `dispatch` twice without awaiting still assigns the two events
//! consecutive versions in call order.
//!
//! Reads never touch the engine: each reader thread owns a read-only
//! connection and sees committed state only, which WAL guarantees without
//! blocking the writer.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, available_parallelism, JoinHandle};
use std::time::Duration;

use rusqlite::Connection;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use crate::connection::{self, TxConfig};
use crate::emitter::{Emitter, TxSignal, DEFAULT_EMITTER_CAPACITY};
use crate::engine::{self, EngineConfig, EngineRequest, EngineState};
use crate::error::{Error, Result};
use crate::metadata::{KEY_FAILED, KEY_HANDLED};
use crate::model::ModelRegistry;
use crate::schema::Database;
use crate::store::{self, ModelInfo};
use crate::types::{Event, Reduction, Version};

// =============================================================================
// Configuration
// =============================================================================

/// Environment variable enabling quiet error mode (`1`, `true` or `yes`).
///
/// Embedding test harnesses set this to keep expected event failures out of
/// the logs; the failures stay durable and still reject their futures.
pub const QUIET_ENV: &str = "FOLDDB_QUIET";

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 1024;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 4;

/// Tunables for a FoldDB instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// `BEGIN IMMEDIATE` retries before giving up on a busy database.
    pub busy_retries: u32,

    /// Initial backoff delay for busy retries; doubles per attempt.
    pub busy_base_delay: Duration,

    /// Cap on the busy backoff delay.
    pub busy_max_delay: Duration,

    /// Maximum dispatch depth before the recursion guard fails the event.
    pub max_dispatch_depth: u32,

    /// Suppress error logging for failed events.
    pub quiet_errors: bool,

    /// Buffer capacity of each emitter channel.
    pub emitter_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            busy_retries: 10,
            busy_base_delay: Duration::from_millis(2),
            busy_max_delay: Duration::from_millis(250),
            max_dispatch_depth: 100,
            quiet_errors: false,
            emitter_capacity: DEFAULT_EMITTER_CAPACITY,
        }
    }
}

impl Config {
    /// Defaults overlaid with the environment (currently [`QUIET_ENV`]).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(value) = std::env::var(QUIET_ENV) {
            cfg.quiet_errors = matches!(value.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        cfg
    }

    fn tx_config(&self) -> TxConfig {
        TxConfig {
            busy_retries: self.busy_retries,
            busy_base_delay: self.busy_base_delay,
            busy_max_delay: self.busy_max_delay,
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_dispatch_depth: self.max_dispatch_depth,
            quiet_errors: self.quiet_errors,
        }
    }
}

// =============================================================================
// Read Requests
// =============================================================================

/// Requests served by the reader pool.
enum ReadRequest {
    Get {
        model: String,
        id: String,
        reply: oneshot::Sender<Result<Option<JsonValue>>>,
    },
    SearchOne {
        model: String,
        query: Option<JsonValue>,
        reply: oneshot::Sender<Result<Option<JsonValue>>>,
    },
    Search {
        model: String,
        query: Option<JsonValue>,
        reply: oneshot::Sender<Result<Vec<JsonValue>>>,
    },
    Shutdown,
}

// =============================================================================
// FoldDb
// =============================================================================

/// The main async handle.
///
/// `FoldDb` is `Clone`, `Send` and `Sync`; clones share the same engine and
/// reader pool.
///
/// # Example
///
/// ```rust,ignore
/// use folddb::{Columns, FoldDb, Model, ModelRegistry, Reduction};
/// use serde_json::{json, Value};
///
/// #[tokio::main]
/// async fn main() -> folddb::Result<()> {
///     let mut registry = ModelRegistry::new();
///     registry.register(Model::new("notes", Columns::new(["text"]))
///         .with_reducer(|ctx| Box::pin(async move {
///             Ok(Some(Reduction::new().upsert(json!({
///                 "id": ctx.event.event_type,
///                 "text": ctx.event.data,
///             }))))
///         })))?;
///
///     let db = FoldDb::open("notes.db", registry).await?;
///     let event = db.dispatch("hello", json!("world")).await?;
///     assert_eq!(event.v.as_raw(), 1);
///
///     let note = db.store("notes").get("hello").await?;
///     assert!(note.is_some());
///
///     db.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct FoldDb {
    engine_tx: mpsc::UnboundedSender<EngineRequest>,
    read_tx: mpsc::Sender<ReadRequest>,
    emitter: Emitter,
    writer_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    reader_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    reader_count: usize,
}

impl FoldDb {
    /// Opens or creates a FoldDB database at the given path.
    ///
    /// Environment-sensitive configuration ([`Config::from_env`]) applies;
    /// use [`FoldDb::open_with`] for explicit control.
    pub async fn open<P: AsRef<Path>>(path: P, registry: ModelRegistry) -> Result<Self> {
        Self::open_with(path, registry, Config::from_env()).await
    }

    /// Opens or creates a FoldDB database with an explicit [`Config`].
    ///
    /// Initializes the schema (including one table per registered model) on
    /// the calling thread so open errors surface here, then spawns the
    /// engine thread and the reader pool.
    pub async fn open_with<P: AsRef<Path>>(
        path: P,
        registry: ModelRegistry,
        config: Config,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Create the file and schema up front; the engine thread reopens it.
        {
            let _db = Database::open(&path, &registry)?;
        }

        let info = Arc::new(ModelInfo::from_registry(&registry));
        let emitter = Emitter::new(config.emitter_capacity);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);

        // Engine thread: owns the writer connection, drives the dispatch
        // loop on a current-thread runtime (handler futures are !Send).
        let writer_handle = {
            let path = path.clone();
            let emitter = emitter.clone();
            let info = Arc::clone(&info);
            let tx_cfg = config.tx_config();
            let engine_cfg = config.engine_config();
            thread::Builder::new()
                .name("folddb-engine".to_string())
                .spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to create engine runtime");
                    rt.block_on(async move {
                        let db =
                            Database::open(&path, &registry).expect("failed to open database");
                        let state = EngineState::new(
                            db.into_connection(),
                            registry,
                            info,
                            emitter,
                            tx_cfg,
                            engine_cfg,
                        )
                        .expect("failed to initialize engine");
                        engine::run(state, engine_rx).await;
                    });
                })
                .map_err(|e| Error::Schema(format!("failed to spawn engine thread: {e}")))?
        };

        // Reader pool: each thread opens its own read-only connection and
        // competes for requests on the shared channel.
        let reader_count = available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_READ_THREADS)
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);
        let read_rx = Arc::new(std::sync::Mutex::new(read_rx));
        let mut reader_handles = Vec::with_capacity(reader_count);

        for i in 0..reader_count {
            let rx = Arc::clone(&read_rx);
            let path = path.clone();
            let info = Arc::clone(&info);
            let handle = thread::Builder::new()
                .name(format!("folddb-reader-{i}"))
                .spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to create reader runtime");
                    rt.block_on(async move {
                        let conn = connection::open_read_only(&path)
                            .expect("failed to open read-only connection");
                        run_reader_pooled(conn, rx, info).await;
                    });
                })
                .map_err(|e| Error::Schema(format!("failed to spawn reader thread: {e}")))?;
            reader_handles.push(handle);
        }

        Ok(Self {
            engine_tx,
            read_tx,
            emitter,
            writer_handle: Arc::new(Mutex::new(Some(writer_handle))),
            reader_handles: Arc::new(Mutex::new(reader_handles)),
            reader_count,
        })
    }

    /// Returns the number of reader threads in the pool.
    pub fn reader_count(&self) -> usize {
        self.reader_count
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatches an event with the current time as its `ts`.
    ///
    /// The event is enqueued eagerly - the send happens before this method
    /// returns - so calling `dispatch` twice without awaiting assigns the
    /// two events consecutive versions in call order. The returned future
    /// resolves with the handled event, or rejects with
    /// [`Error::EventFailed`] carrying the full failed event.
    pub fn dispatch(&self, event_type: impl Into<String>, data: JsonValue) -> DispatchFuture {
        self.dispatch_inner(event_type.into(), data, None)
    }

    /// Dispatches an event with a caller-supplied timestamp.
    pub fn dispatch_at(
        &self,
        event_type: impl Into<String>,
        data: JsonValue,
        ts: i64,
    ) -> DispatchFuture {
        self.dispatch_inner(event_type.into(), data, Some(ts))
    }

    fn dispatch_inner(&self, event_type: String, data: JsonValue, ts: Option<i64>) -> DispatchFuture {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .engine_tx
            .send(EngineRequest::Dispatch {
                event_type,
                data,
                ts,
                reply,
            })
            .is_ok();
        DispatchFuture {
            rx: sent.then_some(rx),
        }
    }

    /// Resolves when the event at `v` is handled; rejects with
    /// [`Error::EventFailed`] if it failed. The version does not need to be
    /// enqueued yet.
    pub async fn handled_version(&self, v: Version) -> Result<Event> {
        let (reply, rx) = oneshot::channel();
        self.engine_tx
            .send(EngineRequest::HandledVersion { v, reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    // =========================================================================
    // Queue Access
    // =========================================================================

    /// Stores an event row for (re)processing at its `v`.
    ///
    /// Terminal state (`result`/`error`) is cleared first, so setting an
    /// already-handled row replays it; its previous child subtree is
    /// re-derived, not preserved. Await [`FoldDb::handled_version`] for the
    /// outcome.
    pub async fn queue_set(&self, event: Event) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.engine_tx
            .send(EngineRequest::QueueSet { event, reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Fetches the event row at `v`.
    pub async fn queue_get(&self, v: Version) -> Result<Option<Event>> {
        let (reply, rx) = oneshot::channel();
        self.engine_tx
            .send(EngineRequest::QueueGet { v, reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// The highest applied version (advances once per root event, success
    /// or failure).
    pub async fn version(&self) -> Result<Version> {
        let (reply, rx) = oneshot::channel();
        self.engine_tx
            .send(EngineRequest::AppliedVersion { reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// The highest allocated queue version.
    pub async fn max_version(&self) -> Result<Version> {
        let (reply, rx) = oneshot::channel();
        self.engine_tx
            .send(EngineRequest::MaxVersion { reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Running total of successfully handled root events.
    ///
    /// Maintained in the metadata table, in the same transaction as each
    /// event's applies.
    pub async fn handled_count(&self) -> Result<u64> {
        self.counter(KEY_HANDLED).await
    }

    /// Running total of failed root events.
    pub async fn failed_count(&self) -> Result<u64> {
        self.counter(KEY_FAILED).await
    }

    async fn counter(&self, key: &'static str) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.engine_tx
            .send(EngineRequest::Counter { key, reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    // =========================================================================
    // Stores
    // =========================================================================

    /// Read-only view of a model, served by the reader pool from committed
    /// state.
    pub fn store(&self, model: impl Into<String>) -> StoreHandle {
        StoreHandle {
            model: model.into(),
            read_tx: self.read_tx.clone(),
        }
    }

    /// Writable view of a model. Writes outside a dispatch are logged as
    /// system events so the log stays the single source of truth.
    pub fn rw_store(&self, model: impl Into<String>) -> RwStoreHandle {
        RwStoreHandle {
            model: model.into(),
            engine_tx: self.engine_tx.clone(),
        }
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Subscribes to handled root events (fires after commit).
    pub fn subscribe_results(&self) -> broadcast::Receiver<Event> {
        self.emitter.subscribe_results()
    }

    /// Subscribes to failed root events (fires after the fail-mark).
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Event> {
        self.emitter.subscribe_errors()
    }

    /// Subscribes to transaction lifecycle signals.
    pub fn subscribe_tx(&self) -> broadcast::Receiver<TxSignal> {
        self.emitter.subscribe_tx()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Shuts down gracefully: the engine finishes all queued events first,
    /// then the reader pool drains.
    pub async fn shutdown(self) {
        let _ = self.engine_tx.send(EngineRequest::Shutdown);
        for _ in 0..self.reader_count {
            let _ = self.read_tx.send(ReadRequest::Shutdown).await;
        }

        if let Some(handle) = self.writer_handle.lock().await.take() {
            let _ = handle.join();
        }
        let handles = std::mem::take(&mut *self.reader_handles.lock().await);
        for handle in handles {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Dispatch Future
// =============================================================================

/// Future returned by [`FoldDb::dispatch`]: resolves once the event is
/// handled, rejects with [`Error::EventFailed`] when it fails.
///
/// The enqueue already happened when this future is created; dropping it
/// does not cancel processing.
pub struct DispatchFuture {
    /// `None` when the engine was already closed at dispatch time.
    rx: Option<oneshot::Receiver<Result<Event>>>,
}

impl Future for DispatchFuture {
    type Output = Result<Event>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.rx.as_mut() {
            None => Poll::Ready(Err(Error::Closed)),
            Some(rx) => Pin::new(rx).poll(cx).map(|received| match received {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Closed),
            }),
        }
    }
}

// =============================================================================
// Store Handles
// =============================================================================

/// Read-only view of one model, backed by the reader pool.
///
/// Sees committed state only: reads issued during a dispatch observe the
/// database as of the last commit, never the in-progress transaction.
#[derive(Clone)]
pub struct StoreHandle {
    model: String,
    read_tx: mpsc::Sender<ReadRequest>,
}

impl StoreHandle {
    /// Fetches one document by id.
    pub async fn get(&self, id: impl Into<String>) -> Result<Option<JsonValue>> {
        let (reply, rx) = oneshot::channel();
        self.read_tx
            .send(ReadRequest::Get {
                model: self.model.clone(),
                id: id.into(),
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Returns the first document matching the equality query, in id order.
    pub async fn search_one(&self, query: Option<JsonValue>) -> Result<Option<JsonValue>> {
        let (reply, rx) = oneshot::channel();
        self.read_tx
            .send(ReadRequest::SearchOne {
                model: self.model.clone(),
                query,
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Returns all documents matching the equality query, in id order.
    pub async fn search(&self, query: Option<JsonValue>) -> Result<Vec<JsonValue>> {
        let (reply, rx) = oneshot::channel();
        self.read_tx
            .send(ReadRequest::Search {
                model: self.model.clone(),
                query,
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

/// Writable view of one model for use outside a dispatch.
///
/// Every write synthesises a system event
/// ([`DIRECT_WRITE_EVENT`](crate::DIRECT_WRITE_EVENT)) describing the
/// change, which then runs the normal pipeline. The resolved value is that
/// handled event.
#[derive(Clone)]
pub struct RwStoreHandle {
    model: String,
    engine_tx: mpsc::UnboundedSender<EngineRequest>,
}

impl RwStoreHandle {
    /// Logs and applies a full reduction against this model.
    pub async fn apply(&self, reduction: Reduction) -> Result<Event> {
        let (reply, rx) = oneshot::channel();
        self.engine_tx
            .send(EngineRequest::Write {
                model: self.model.clone(),
                reduction,
                reply,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Upserts a whole row.
    pub async fn set(&self, row: JsonValue) -> Result<Event> {
        self.apply(Reduction::new().upsert(row)).await
    }

    /// Inserts a row, failing on id collision.
    pub async fn insert(&self, row: JsonValue) -> Result<Event> {
        self.apply(Reduction::new().insert(row)).await
    }

    /// Patches an existing row.
    pub async fn update(&self, patch: JsonValue) -> Result<Event> {
        self.apply(Reduction::new().update(patch)).await
    }

    /// Deletes a row by id.
    pub async fn remove(&self, id: impl Into<String>) -> Result<Event> {
        self.apply(Reduction::new().remove(id)).await
    }
}

// =============================================================================
// Reader Pool
// =============================================================================

/// One reader thread's loop: compete for requests, serve them from a
/// read-only connection.
///
/// Threads share the channel behind a mutex; whichever thread is free picks
/// up the next request.
async fn run_reader_pooled(
    conn: Connection,
    rx: Arc<std::sync::Mutex<mpsc::Receiver<ReadRequest>>>,
    info: Arc<ModelInfo>,
) {
    loop {
        let request = {
            let mut guard = rx.lock().expect("receiver mutex poisoned");
            guard.recv().await
        };

        match request {
            Some(ReadRequest::Get { model, id, reply }) => {
                let result = info
                    .columns(&model)
                    .and_then(|cols| store::get_row(&conn, &model, cols, &id));
                let _ = reply.send(result);
            }
            Some(ReadRequest::SearchOne {
                model,
                query,
                reply,
            }) => {
                let result = info.columns(&model).and_then(|cols| {
                    Ok(store::search_rows(&conn, &model, cols, query.as_ref(), Some(1))?.pop())
                });
                let _ = reply.send(result);
            }
            Some(ReadRequest::Search {
                model,
                query,
                reply,
            }) => {
                let result = info
                    .columns(&model)
                    .and_then(|cols| store::search_rows(&conn, &model, cols, query.as_ref(), None));
                let _ = reply.send(result);
            }
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.busy_retries, 10);
        assert_eq!(cfg.max_dispatch_depth, 100);
        assert!(!cfg.quiet_errors);
    }

    #[test]
    fn test_config_from_env_reads_quiet_flag() {
        std::env::set_var(QUIET_ENV, "1");
        assert!(Config::from_env().quiet_errors);

        std::env::set_var(QUIET_ENV, "no");
        assert!(!Config::from_env().quiet_errors);

        std::env::remove_var(QUIET_ENV);
        assert!(!Config::from_env().quiet_errors);
    }
}
