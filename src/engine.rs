//! # The Dispatch Engine
//!
//! The heart of FoldDB: a single cooperative task, running on a dedicated
//! thread that owns the writer connection, driving every event through the
//! deterministic pipeline
//!
//! ```text
//!   preprocess → reduce → apply → derive → recurse into children
//! ```
//!
//! ## Topology
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Async Callers                         │
//! │   dispatch() / handled_version() / queue_set() / rw writes   │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │ unbounded mpsc (send is sync,
//!                                 │ so dispatch order = call order)
//!                                 ▼
//!                   ┌─────────────────────────────┐
//!                   │        Engine Loop          │
//!                   │  1. drain requests          │
//!                   │     (enqueue + waiters)     │
//!                   │  2. process next unhandled  │
//!                   │     event, one transaction  │
//!                   │  3. repeat                  │
//!                   └─────────────────────────────┘
//! ```
//!
//! ## The Event Tree Is Data
//!
//! Child events dispatched by handlers nest in their parent's `events` list
//! and are processed depth-first, pre-order: each child runs all phases
//! before the next sibling starts. The traversal carries an explicit depth
//! counter (recursion guard) and a type-path string (error reporting), and
//! the finished tree serialises straight into the `events` column.
//!
//! ## Failure Is Data Too
//!
//! Any phase error aborts the event and rolls the transaction back. The
//! failure is then made durable in a separate micro-transaction: the event
//! row is rewritten with its `error` map, the applied version advances (a
//! failed event still consumes its `v`), and the failure counter bumps.
//! Waiters reject with the full event.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use rusqlite::Connection;
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::{mpsc, oneshot};

use crate::connection::{TxConfig, WriteConn};
use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::metadata::{Metadata, KEY_FAILED, KEY_HANDLED};
use crate::model::{DeriveCtx, ModelRegistry, PhaseCtx, Preprocessed};
use crate::queue::Queue;
use crate::store::{ModelInfo, RwStores, Stores};
use crate::types::{now_ms, ChildSpec, DirectWrite, Event, Reduction, Version, DIRECT_WRITE_EVENT};

// =============================================================================
// Configuration
// =============================================================================

/// Engine-level knobs, split out of the public `Config` in `db`.
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    /// Maximum dispatch depth before a `_handle` abort; guards against a
    /// handler dispatching its own type forever.
    pub max_dispatch_depth: u32,

    /// Suppress the `error!` log line for failed events (the failure is
    /// still durable and still rejects waiters).
    pub quiet_errors: bool,
}

// =============================================================================
// Requests
// =============================================================================

/// Requests from the public handle to the engine task.
pub(crate) enum EngineRequest {
    /// Enqueue an event; the reply resolves once the event is handled.
    Dispatch {
        event_type: String,
        data: JsonValue,
        ts: Option<i64>,
        reply: oneshot::Sender<Result<Event>>,
    },

    /// Resolve when the event at `v` is handled, or reject if it failed.
    HandledVersion {
        v: Version,
        reply: oneshot::Sender<Result<Event>>,
    },

    /// Requeue an event row for (re)processing: terminal state is cleared.
    QueueSet {
        event: Event,
        reply: oneshot::Sender<Result<()>>,
    },

    /// Fetch an event row.
    QueueGet {
        v: Version,
        reply: oneshot::Sender<Result<Option<Event>>>,
    },

    /// Highest allocated queue version.
    MaxVersion {
        reply: oneshot::Sender<Result<Version>>,
    },

    /// Highest applied version.
    AppliedVersion {
        reply: oneshot::Sender<Result<Version>>,
    },

    /// Read a bookkeeping counter from the metadata table.
    Counter {
        key: &'static str,
        reply: oneshot::Sender<Result<u64>>,
    },

    /// A direct write outside any dispatch: logged as a system event.
    Write {
        model: String,
        reduction: Reduction,
        reply: oneshot::Sender<Result<Event>>,
    },

    /// Finish queued work, then exit the loop.
    Shutdown,
}

// =============================================================================
// Pipeline Failure Types
// =============================================================================

/// A pipeline abort: one `error`-map entry, key already phase- and
/// path-qualified.
struct Abort {
    key: String,
    value: JsonValue,
}

impl Abort {
    /// A phase error. Root-level errors keep the bare `_<phase>_<model>`
    /// key; child errors are qualified with the dispatch path.
    fn phase(depth: u32, path: &str, phase: &str, model: &str, value: JsonValue) -> Self {
        let base = format!("_{phase}_{model}");
        let key = if depth == 0 {
            base
        } else {
            format!("{path}:{base}")
        };
        Self { key, value }
    }

    /// An engine-level error under the `_handle` key.
    fn handle(value: JsonValue) -> Self {
        Self {
            key: "_handle".to_string(),
            value,
        }
    }

    /// An engine-level error, path-qualified when it happened in a child.
    fn handle_at(depth: u32, path: &str, value: JsonValue) -> Self {
        let key = if depth == 0 {
            "_handle".to_string()
        } else {
            format!("{path}:_handle")
        };
        Self { key, value }
    }
}

/// Errors inside a processing transaction: a pipeline abort (becomes the
/// event's error map) or an infrastructure failure (surfaces as `_handle`).
enum PipelineError {
    Abort(Abort),
    Db(Error),
}

impl From<Error> for PipelineError {
    fn from(e: Error) -> Self {
        Self::Db(e)
    }
}

// =============================================================================
// Engine State
// =============================================================================

/// Everything the engine task owns. Lives on the engine thread; holds the
/// only writer connection.
pub(crate) struct EngineState {
    conn: Rc<Connection>,
    write: WriteConn,
    queue: Queue,
    meta: Metadata,
    registry: ModelRegistry,
    info: Arc<ModelInfo>,
    emitter: Emitter,
    cfg: EngineConfig,

    /// Handled-version waiters, keyed by raw version. Resolved (or
    /// rejected) when the event at that version reaches a terminal state.
    waiters: HashMap<u64, Vec<oneshot::Sender<Result<Event>>>>,
}

impl EngineState {
    pub(crate) fn new(
        conn: Connection,
        registry: ModelRegistry,
        info: Arc<ModelInfo>,
        emitter: Emitter,
        tx_cfg: TxConfig,
        cfg: EngineConfig,
    ) -> Result<Self> {
        let conn = Rc::new(conn);
        let write = WriteConn::new(Rc::clone(&conn), emitter.clone(), tx_cfg)?;
        Ok(Self {
            queue: Queue::new(Rc::clone(&conn)),
            meta: Metadata::new(Rc::clone(&conn)),
            conn,
            write,
            registry,
            info,
            emitter,
            cfg,
            waiters: HashMap::new(),
        })
    }

    fn stores(&self) -> Stores {
        Stores::new(Rc::clone(&self.conn), Arc::clone(&self.info))
    }

    fn rw_stores(&self) -> RwStores {
        RwStores::new(Rc::clone(&self.conn), Arc::clone(&self.info))
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Handles one request. Returns `false` when the loop should wind down.
    async fn handle_request(&mut self, request: EngineRequest) -> bool {
        match request {
            EngineRequest::Dispatch {
                event_type,
                data,
                ts,
                reply,
            } => {
                match self.enqueue(event_type, data, ts).await {
                    Ok(event) => self.register_waiter(event.v, reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                true
            }
            EngineRequest::HandledVersion { v, reply } => {
                match self.queue.get(v) {
                    Ok(Some(event)) if event.is_handled() => {
                        let _ = reply.send(Ok(event));
                    }
                    Ok(Some(event)) if event.is_failed() => {
                        let _ = reply.send(Err(Error::EventFailed(Box::new(event))));
                    }
                    // Not yet terminal (or not yet enqueued): wait for it.
                    Ok(_) => self.register_waiter(v, reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                true
            }
            EngineRequest::QueueSet { mut event, reply } => {
                // Requeue semantics: HANDLED|FAILED → QUEUED. The engine's
                // own write-backs store rows verbatim via the queue layer.
                event.result = None;
                event.error = None;
                let queue = &self.queue;
                let stored: Result<()> = self
                    .write
                    .with_transaction(async move { queue.set(&event) })
                    .await;
                let _ = reply.send(stored);
                true
            }
            EngineRequest::QueueGet { v, reply } => {
                let _ = reply.send(self.queue.get(v));
                true
            }
            EngineRequest::MaxVersion { reply } => {
                let _ = reply.send(self.queue.max_v());
                true
            }
            EngineRequest::AppliedVersion { reply } => {
                let _ = reply.send(self.meta.version());
                true
            }
            EngineRequest::Counter { key, reply } => {
                let _ = reply.send(self.meta.counter(key));
                true
            }
            EngineRequest::Write {
                model,
                reduction,
                reply,
            } => {
                if !self.registry.contains(&model) {
                    let _ = reply.send(Err(Error::UnknownModel(model)));
                    return true;
                }
                let payload = match serde_json::to_value(DirectWrite { model, reduction }) {
                    Ok(value) => value,
                    Err(e) => {
                        let _ = reply.send(Err(Error::Schema(format!(
                            "failed to encode direct write: {e}"
                        ))));
                        return true;
                    }
                };
                match self
                    .enqueue(DIRECT_WRITE_EVENT.to_string(), payload, None)
                    .await
                {
                    Ok(event) => self.register_waiter(event.v, reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                true
            }
            EngineRequest::Shutdown => false,
        }
    }

    fn register_waiter(&mut self, v: Version, reply: oneshot::Sender<Result<Event>>) {
        self.waiters.entry(v.as_raw()).or_default().push(reply);
    }

    /// Appends a fresh event in its own micro-transaction.
    ///
    /// Requests are handled in arrival order, so concurrent dispatchers get
    /// sequential versions in call order.
    async fn enqueue(&self, event_type: String, data: JsonValue, ts: Option<i64>) -> Result<Event> {
        let ts = ts.unwrap_or_else(now_ms);
        let queue = &self.queue;
        self.write
            .with_transaction(async move { queue.add(&event_type, data, ts) })
            .await
    }

    fn next_unhandled(&self) -> Result<Option<Event>> {
        self.queue.next_unhandled()
    }

    // =========================================================================
    // Root Event Processing
    // =========================================================================

    /// Processes one root event to a terminal state.
    ///
    /// Returns `Err` only if the terminal state could not be persisted - at
    /// that point the loop must stop rather than spin on the same row.
    async fn process_root(&mut self, seed: Event) -> Result<()> {
        let mut event = seed;
        // Replay determinism: a requeued row may carry the previous run's
        // subtree; children are re-derived, never preserved.
        event.events.clear();
        event.result = None;
        event.error = None;

        let v = event.v;
        let root_path = format!(".{}", event.event_type);
        tracing::debug!(v = v.as_raw(), event_type = %event.event_type, "processing event");

        let outcome: std::result::Result<(), PipelineError> = self
            .write
            .with_transaction(async {
                self.run_node(&mut event, 0, root_path.clone(), true)
                    .await
                    .map_err(PipelineError::Abort)?;
                // Terminal success state is written inside the same
                // transaction as the applies it describes.
                self.queue.set(&event)?;
                self.meta.bump(KEY_HANDLED)?;
                Ok(())
            })
            .await;

        match outcome {
            Ok(()) => {
                self.resolve_waiters(v, &event, true);
                self.emitter.result(&event);
                Ok(())
            }
            Err(failure) => {
                let (key, value) = match failure {
                    PipelineError::Abort(abort) => (abort.key, abort.value),
                    PipelineError::Db(e) => ("_handle".to_string(), json!(e.to_string())),
                };
                let mut map = Map::new();
                map.insert(key, value);
                event.result = None;
                event.error = Some(map);
                // The transaction rolled back, so the partial subtree
                // describes applies that never happened; children are
                // re-derived on replay anyway.
                event.events.clear();

                // Durable fail-mark: the row, the consumed version, the
                // counter - in one micro-transaction.
                let mark: Result<()> = self
                    .write
                    .with_transaction(async {
                        self.queue.set(&event)?;
                        self.meta.set_version(event.v)?;
                        self.meta.bump(KEY_FAILED)?;
                        Ok(())
                    })
                    .await;

                if !self.cfg.quiet_errors {
                    tracing::error!(
                        v = v.as_raw(),
                        event_type = %event.event_type,
                        errors = %event.error_summary(),
                        "event failed"
                    );
                }
                self.resolve_waiters(v, &event, false);
                self.emitter.error(&event);
                mark
            }
        }
    }

    fn resolve_waiters(&mut self, v: Version, event: &Event, handled: bool) {
        if let Some(waiters) = self.waiters.remove(&v.as_raw()) {
            for waiter in waiters {
                let outcome = if handled {
                    Ok(event.clone())
                } else {
                    Err(Error::EventFailed(Box::new(event.clone())))
                };
                let _ = waiter.send(outcome);
            }
        }
    }

    // =========================================================================
    // The Pipeline
    // =========================================================================

    /// Runs all four phases for one node, then recurses into its children.
    ///
    /// Boxed because the traversal is recursive; local because it holds the
    /// connection across awaits on the engine thread.
    fn run_node<'a>(
        &'a self,
        node: &'a mut Event,
        depth: u32,
        path: String,
        is_main: bool,
    ) -> LocalBoxFuture<'a, std::result::Result<(), Abort>> {
        Box::pin(async move {
            if depth > self.cfg.max_dispatch_depth {
                return Err(Abort::handle(json!(format!(
                    "{path}:dispatch recursion too deep"
                ))));
            }

            // Children dispatched by handlers collect here and are drained
            // onto the node after every handler call, preserving call order.
            let pending: Rc<RefCell<Vec<ChildSpec>>> = Rc::new(RefCell::new(Vec::new()));

            // ----- Phase 1: preprocess --------------------------------------
            for model in self.registry.iter() {
                let Some(pre) = model.preprocessor() else {
                    continue;
                };
                let ctx = PhaseCtx::new(
                    node.clone(),
                    model.name().to_string(),
                    self.stores(),
                    is_main,
                    Rc::clone(&pending),
                );
                let outcome = pre(ctx).await.map_err(|e| {
                    Abort::phase(depth, &path, "preprocess", model.name(), json!(e.to_string()))
                })?;
                drain_children(node, &pending);
                match outcome {
                    Preprocessed::Keep => {}
                    Preprocessed::Replace(replacement) => {
                        if replacement.v != node.v {
                            return Err(Abort::phase(
                                depth,
                                &path,
                                "preprocess",
                                model.name(),
                                json!("preprocessor changed the event version"),
                            ));
                        }
                        if replacement.event_type.is_empty() {
                            return Err(Abort::phase(
                                depth,
                                &path,
                                "preprocess",
                                model.name(),
                                json!("preprocessor removed the event type"),
                            ));
                        }
                        node.event_type = replacement.event_type;
                        node.data = replacement.data;
                        node.ts = replacement.ts;
                    }
                    Preprocessed::Reject(value) => {
                        return Err(Abort::phase(
                            depth,
                            &path,
                            "preprocess",
                            model.name(),
                            value,
                        ));
                    }
                }
            }

            // ----- Phase 2: reduce ------------------------------------------
            let mut result: Map<String, JsonValue> = Map::new();
            let mut reductions: Vec<(String, Reduction)> = Vec::new();

            // A direct-write event carries its reduction in the payload; the
            // engine synthesises it so the write is replayable like any
            // reducer output.
            if node.event_type == DIRECT_WRITE_EVENT {
                let dw: DirectWrite = serde_json::from_value(node.data.clone()).map_err(|e| {
                    Abort::handle_at(
                        depth,
                        &path,
                        json!(format!("invalid direct-write payload: {e}")),
                    )
                })?;
                if !self.registry.contains(&dw.model) {
                    return Err(Abort::handle_at(
                        depth,
                        &path,
                        json!(format!("unknown model '{}'", dw.model)),
                    ));
                }
                for spec in &dw.reduction.events {
                    node.events.push(Event::child(spec.clone(), node.v, node.ts));
                }
                let value = serde_json::to_value(&dw.reduction).map_err(|e| {
                    Abort::handle_at(depth, &path, json!(format!("unencodable reduction: {e}")))
                })?;
                result.insert(dw.model.clone(), value);
                reductions.push((dw.model, dw.reduction));
            }

            for model in self.registry.iter() {
                let Some(red) = model.reducer() else {
                    continue;
                };
                let ctx = PhaseCtx::new(
                    node.clone(),
                    model.name().to_string(),
                    self.stores(),
                    is_main,
                    Rc::clone(&pending),
                );
                let outcome = red(ctx).await.map_err(|e| {
                    Abort::phase(depth, &path, "reduce", model.name(), json!(e.to_string()))
                })?;
                // Children dispatched while the reducer ran come first,
                // then the reduction's own `events` list.
                drain_children(node, &pending);
                if let Some(reduction) = outcome {
                    for spec in &reduction.events {
                        node.events.push(Event::child(spec.clone(), node.v, node.ts));
                    }
                    let value = serde_json::to_value(&reduction).map_err(|e| {
                        Abort::phase(
                            depth,
                            &path,
                            "reduce",
                            model.name(),
                            json!(format!("unencodable reduction: {e}")),
                        )
                    })?;
                    result.insert(model.name().to_string(), value);
                    reductions.push((model.name().to_string(), reduction));
                }
            }

            // ----- Phase 3: apply -------------------------------------------
            for (name, reduction) in &reductions {
                self.apply_reduction(name, reduction).map_err(|e| {
                    Abort::phase(depth, &path, "apply", name, json!(e.to_string()))
                })?;
            }
            if is_main {
                // Only root events advance the applied version.
                self.meta
                    .set_version(node.v)
                    .map_err(|e| Abort::handle_at(depth, &path, json!(e.to_string())))?;
            }
            node.result = Some(result);

            // ----- Phase 4: derive ------------------------------------------
            for model in self.registry.iter() {
                let Some(der) = model.deriver() else {
                    continue;
                };
                let ctx = DeriveCtx::new(
                    node.clone(),
                    model.name().to_string(),
                    self.stores(),
                    self.rw_stores(),
                    is_main,
                    Rc::clone(&pending),
                );
                der(ctx).await.map_err(|e| {
                    Abort::phase(depth, &path, "derive", model.name(), json!(e.to_string()))
                })?;
                drain_children(node, &pending);
            }

            // ----- Phase 5: recurse -----------------------------------------
            // Depth-first: each child runs all phases (and its own
            // recursion) before the next sibling.
            for i in 0..node.events.len() {
                let child_path = format!("{path}.{}", node.events[i].event_type);
                self.run_node(&mut node.events[i], depth + 1, child_path, false)
                    .await?;
            }

            Ok(())
        })
    }

    /// Applies one model's reduction in the fixed order `rm`, `ins`, `set`,
    /// `upd`. The `events` key was already turned into children.
    fn apply_reduction(&self, model: &str, reduction: &Reduction) -> Result<()> {
        let rw = self.rw_stores();
        for id in &reduction.rm {
            rw.remove(model, id)?;
        }
        for row in &reduction.ins {
            rw.insert(model, row)?;
        }
        for row in &reduction.set {
            rw.set(model, row)?;
        }
        for patch in &reduction.upd {
            rw.update(model, patch)?;
        }
        Ok(())
    }
}

/// Moves pending child specs onto the node as child events inheriting the
/// node's `v` and `ts`.
fn drain_children(node: &mut Event, pending: &Rc<RefCell<Vec<ChildSpec>>>) {
    for spec in pending.borrow_mut().drain(..) {
        node.events.push(Event::child(spec, node.v, node.ts));
    }
}

// =============================================================================
// Engine Loop
// =============================================================================

/// The engine task: drain requests, process queued events, repeat.
///
/// Requests are drained before each processing step so every pending
/// dispatch has its version allocated in arrival order. After a shutdown
/// request (or all handles dropping), queued work is finished before the
/// loop exits.
pub(crate) async fn run(mut state: EngineState, mut rx: mpsc::UnboundedReceiver<EngineRequest>) {
    let mut open = true;
    loop {
        while open {
            match rx.try_recv() {
                Ok(request) => {
                    if !state.handle_request(request).await {
                        open = false;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => open = false,
            }
        }

        match state.next_unhandled() {
            Ok(Some(event)) => {
                if let Err(e) = state.process_root(event).await {
                    tracing::error!(error = %e, "failed to persist event outcome; stopping engine");
                    break;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "failed to read next unhandled event; stopping engine");
                break;
            }
        }

        if !open {
            break;
        }

        match rx.recv().await {
            Some(request) => {
                if !state.handle_request(request).await {
                    open = false;
                }
            }
            None => open = false,
        }
    }
    tracing::debug!("engine loop exited");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_key_qualification() {
        let root = Abort::phase(0, ".hi", "reduce", "foo", json!("boom"));
        assert_eq!(root.key, "_reduce_foo");

        let child = Abort::phase(2, ".hi.kid", "derive", "foo", json!("boom"));
        assert_eq!(child.key, ".hi.kid:_derive_foo");

        let handle = Abort::handle(json!(".hi.hi:dispatch recursion too deep"));
        assert_eq!(handle.key, "_handle");

        let child_handle = Abort::handle_at(1, ".hi.kid", json!("oops"));
        assert_eq!(child_handle.key, ".hi.kid:_handle");
    }

    #[test]
    fn test_drain_children_inherits_v_and_ts() {
        let mut node = Event::new(Version::from_raw(4), "hi", JsonValue::Null, 77);
        let pending = Rc::new(RefCell::new(vec![
            ChildSpec::new("a", JsonValue::Null),
            ChildSpec::new("b", json!({"k": 1})),
        ]));

        drain_children(&mut node, &pending);

        assert!(pending.borrow().is_empty());
        assert_eq!(node.events.len(), 2);
        assert_eq!(node.events[0].event_type, "a");
        assert_eq!(node.events[1].v, node.v);
        assert_eq!(node.events[1].ts, node.ts);
    }
}
