//! # The Write Connection
//!
//! One writer connection, owned by the engine thread, wrapped with the
//! transaction discipline the dispatch engine relies on:
//!
//! - `BEGIN IMMEDIATE` takes the write lock up front, so conflicts surface
//!   at begin time instead of mid-transaction.
//! - Busy contention at begin is absorbed by jittered exponential backoff,
//!   bounded by a retry budget; exhausting the budget surfaces
//!   [`Error::Busy`].
//! - Transaction lifecycle is observable: `Begin`, then `End` (commit) or
//!   `Rollback`, then `Finally` on the [`Emitter`]'s tx channel.
//!
//! Serialisation of writers is by construction: the engine is a single
//! cooperative task and the sole caller of [`WriteConn::with_transaction`].
//! Readers use their own connections and proceed concurrently under WAL.
//!
//! The transaction body is a future, because the dispatch pipeline awaits
//! user handlers while the transaction is open. Everything runs on the
//! engine thread's current-thread runtime, so holding the connection across
//! await points is safe - nothing else can touch it.

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;
use rusqlite::{Connection, DatabaseName, ErrorCode, OpenFlags};

use crate::emitter::{Emitter, TxSignal};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Retry policy for `BEGIN IMMEDIATE` under busy contention.
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// Maximum number of retries after the initial attempt.
    pub busy_retries: u32,

    /// Delay before the first retry; doubles each attempt.
    pub busy_base_delay: Duration,

    /// Cap on the backoff delay.
    pub busy_max_delay: Duration,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            busy_retries: 10,
            busy_base_delay: Duration::from_millis(2),
            busy_max_delay: Duration::from_millis(250),
        }
    }
}

// =============================================================================
// WriteConn
// =============================================================================

/// The writer connection plus transaction discipline.
#[derive(Debug)]
pub struct WriteConn {
    conn: Rc<Connection>,
    emitter: Emitter,
    cfg: TxConfig,
}

impl WriteConn {
    /// Wraps an initialized connection.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnly`] if the connection cannot write - the dispatch
    /// engine is meaningless without a writable log.
    pub fn new(conn: Rc<Connection>, emitter: Emitter, cfg: TxConfig) -> Result<Self> {
        if conn.is_readonly(DatabaseName::Main)? {
            return Err(Error::ReadOnly);
        }
        Ok(Self { conn, emitter, cfg })
    }

    /// The shared connection handle, for the queue/metadata/store layers.
    pub fn connection(&self) -> Rc<Connection> {
        Rc::clone(&self.conn)
    }

    /// Runs a transaction body inside a write transaction.
    ///
    /// The body is a lazy future: nothing in it runs until after
    /// `BEGIN IMMEDIATE` succeeded. Emits `Begin` once the lock is held.
    /// If the body resolves `Ok`, commits and emits `End` then `Finally`,
    /// returning the value. If it resolves `Err` (or the commit itself
    /// fails), rolls back and emits `Rollback` then `Finally`, returning
    /// the error.
    ///
    /// Generic over the error type so callers can thread their own failure
    /// enum through the transaction; infrastructure errors convert via
    /// `From<Error>`.
    pub async fn with_transaction<T, E, Fut>(&self, body: Fut) -> std::result::Result<T, E>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.begin_immediate().await.map_err(E::from)?;
        self.emitter.tx(TxSignal::Begin);

        match body.await {
            Ok(value) => match self.conn.execute_batch("COMMIT") {
                Ok(()) => {
                    self.emitter.tx(TxSignal::End);
                    self.emitter.tx(TxSignal::Finally);
                    Ok(value)
                }
                Err(e) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    self.emitter.tx(TxSignal::Rollback);
                    self.emitter.tx(TxSignal::Finally);
                    Err(E::from(Error::Sqlite(e)))
                }
            },
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                self.emitter.tx(TxSignal::Rollback);
                self.emitter.tx(TxSignal::Finally);
                Err(err)
            }
        }
    }

    /// `BEGIN IMMEDIATE` with bounded, jittered retries on busy.
    async fn begin_immediate(&self) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => return Ok(()),
                Err(e) if is_busy(&e) => {
                    attempt += 1;
                    if attempt > self.cfg.busy_retries {
                        return Err(Error::Busy { attempts: attempt });
                    }
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_retries = self.cfg.busy_retries,
                        delay_ms = delay.as_millis() as u64,
                        "database busy, retrying BEGIN IMMEDIATE"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Exponential backoff with half-width jitter, capped at the configured
    /// maximum.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.cfg.busy_base_delay.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
        let capped = base.min(self.cfg.busy_max_delay.as_secs_f64());
        let jittered = capped / 2.0 + rand::thread_rng().gen_range(0.0..=capped / 2.0);
        Duration::from_secs_f64(jittered)
    }
}

/// True for the SQLite error codes that mean "another writer holds the lock".
fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

// =============================================================================
// Read-Only Connections
// =============================================================================

/// Opens a read-only connection to a database file.
///
/// Used by the reader pool; WAL mode guarantees these see the latest
/// committed state without blocking the writer.
pub fn open_read_only(path: impl AsRef<std::path::Path>) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch("PRAGMA busy_timeout = 5000")?;
    Ok(conn)
}

// =============================================================================
// Tests
// =============================================================================
