//! # Models and the Model Registry
//!
//! A *model* is a named collection of documents with up to three optional
//! pipeline handlers. Models are records of optional capability slots, not a
//! class hierarchy: a model may have any combination of preprocessor,
//! reducer and deriver, and always has a column schema.
//!
//! ## The Three Handlers
//!
//! | Handler | Runs | May | Must not |
//! |--------------|--------|--------------------------------------|---------------------|
//! | preprocessor | first  | rewrite the event, dispatch children, reject | change `v`, drop the type |
//! | reducer | second | describe writes, dispatch children | perform writes |
//! | deriver | after apply | read all models, write directly, dispatch | - |
//!
//! Handlers are async: they return a [`LocalBoxFuture`] that the engine
//! awaits on its current-thread runtime. The closures themselves must be
//! `Send` (the registry moves onto the engine thread once at startup), but
//! the futures they produce never leave that thread.
//!
//! ## Registry Order Is Contract
//!
//! Within every phase the engine visits models in registry insertion order,
//! and the apply phase writes reductions in that same order. Registering the
//! same name twice, or shadowing a reserved table name, is an error.

use std::cell::RefCell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::store::{RwStores, Stores};
use crate::types::{ChildSpec, Event, Reduction};

/// Table names the engine reserves for itself; model names must not collide.
pub(crate) const RESERVED_TABLES: &[&str] = &["history", "metadata"];

// =============================================================================
// Columns
// =============================================================================

/// A model's document schema: an implicit TEXT `id` primary key plus named
/// JSON-valued columns.
///
/// # Example
///
/// ```rust
/// use folddb::Columns;
///
/// let columns = Columns::new(["name", "count"]);
/// assert_eq!(columns.names(), ["name", "count"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Columns {
    names: Vec<String>,
}

impl Columns {
    /// Declares the JSON columns of a model (the `id` column is implicit).
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// The declared column names, in declaration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// True if a column with this name was declared.
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|c| c == name)
    }
}

// =============================================================================
// Handler Contexts
// =============================================================================

/// Context passed to preprocessors and reducers.
///
/// Carries a snapshot of the event being processed, read access to every
/// model's current (post-apply-so-far) state through the transaction
/// connection, and the `dispatch` hook for appending child events.
pub struct PhaseCtx {
    /// Snapshot of the event this handler is running for.
    pub event: Event,

    /// Name of the model this handler belongs to.
    pub model: String,

    /// Read views over all models, served inside the open transaction.
    pub store: Stores,

    /// True iff the event is the root (depth 0) of the current dispatch tree.
    pub is_main_event: bool,

    children: Rc<RefCell<Vec<ChildSpec>>>,
}

impl PhaseCtx {
    pub(crate) fn new(
        event: Event,
        model: String,
        store: Stores,
        is_main_event: bool,
        children: Rc<RefCell<Vec<ChildSpec>>>,
    ) -> Self {
        Self {
            event,
            model,
            store,
            is_main_event,
            children,
        }
    }

    /// Appends a child event to the current node.
    ///
    /// The child is processed (all phases) after this event's own phases,
    /// before any later sibling; it inherits the root's `v`. Dispatch
    /// returns nothing - the child's outcome surfaces through the root.
    pub fn dispatch(&self, event_type: impl Into<String>, data: JsonValue) {
        self.children
            .borrow_mut()
            .push(ChildSpec::new(event_type, data));
    }

    /// Reads a document of this handler's own model.
    pub fn get(&self, id: &str) -> Result<Option<JsonValue>> {
        self.store.get(&self.model, id)
    }
}

/// Context passed to derivers.
///
/// In addition to everything a [`PhaseCtx`] offers, a deriver sees the
/// post-apply state of every model and holds the writable view, so it can
/// maintain derived documents directly inside the event's transaction.
pub struct DeriveCtx {
    /// Snapshot of the event this handler is running for.
    pub event: Event,

    /// Name of the model this handler belongs to.
    pub model: String,

    /// Read views over all models, post-apply.
    pub store: Stores,

    /// Writable views over all models, inside the event's transaction.
    pub rw: RwStores,

    /// True iff the event is the root of the current dispatch tree.
    pub is_main_event: bool,

    children: Rc<RefCell<Vec<ChildSpec>>>,
}

impl DeriveCtx {
    pub(crate) fn new(
        event: Event,
        model: String,
        store: Stores,
        rw: RwStores,
        is_main_event: bool,
        children: Rc<RefCell<Vec<ChildSpec>>>,
    ) -> Self {
        Self {
            event,
            model,
            store,
            rw,
            is_main_event,
            children,
        }
    }

    /// Appends a child event to the current node. See [`PhaseCtx::dispatch`].
    pub fn dispatch(&self, event_type: impl Into<String>, data: JsonValue) {
        self.children
            .borrow_mut()
            .push(ChildSpec::new(event_type, data));
    }

    /// Reads a document of this handler's own model.
    pub fn get(&self, id: &str) -> Result<Option<JsonValue>> {
        self.store.get(&self.model, id)
    }
}

// =============================================================================
// Handler Outcomes and Types
// =============================================================================

/// What a preprocessor returns.
pub enum Preprocessed {
    /// Leave the event as it is.
    Keep,

    /// Replace the event. The engine verifies the replacement kept its `v`
    /// and still has a non-empty type; violating either fails the event
    /// with a `_preprocess_<model>` error.
    Replace(Event),

    /// Abort this event, recording the value under `_preprocess_<model>`.
    Reject(JsonValue),
}

/// Future type returned by handlers.
///
/// Local (non-`Send`) because handler futures are created and awaited on the
/// engine thread only; contexts hold `Rc` handles to the transaction
/// connection.
pub type HandlerFuture<T> = LocalBoxFuture<'static, Result<T>>;

/// A preprocessor handler slot.
pub type Preprocessor = Box<dyn Fn(PhaseCtx) -> HandlerFuture<Preprocessed> + Send>;

/// A reducer handler slot. Returning `None` is a no-op.
pub type Reducer = Box<dyn Fn(PhaseCtx) -> HandlerFuture<Option<Reduction>> + Send>;

/// A deriver handler slot.
pub type Deriver = Box<dyn Fn(DeriveCtx) -> HandlerFuture<()> + Send>;

// =============================================================================
// Model
// =============================================================================

/// A named user entity: a column schema plus optional pipeline handlers.
///
/// # Example
///
/// ```rust,ignore
/// use folddb::{Columns, Model, Reduction};
/// use serde_json::json;
///
/// let model = Model::new("greetings", Columns::new(["text"]))
///     .with_reducer(|ctx| Box::pin(async move {
///         Ok(Some(Reduction::new().upsert(json!({
///             "id": ctx.event.event_type,
///             "text": ctx.event.data,
///         }))))
///     }));
/// ```
pub struct Model {
    name: String,
    columns: Columns,
    preprocessor: Option<Preprocessor>,
    reducer: Option<Reducer>,
    deriver: Option<Deriver>,
}

impl Model {
    /// Creates a model with a column schema and no handlers.
    pub fn new(name: impl Into<String>, columns: Columns) -> Self {
        Self {
            name: name.into(),
            columns,
            preprocessor: None,
            reducer: None,
            deriver: None,
        }
    }

    /// Installs the preprocessor handler.
    pub fn with_preprocessor<F>(mut self, f: F) -> Self
    where
        F: Fn(PhaseCtx) -> HandlerFuture<Preprocessed> + Send + 'static,
    {
        self.preprocessor = Some(Box::new(f));
        self
    }

    /// Installs the reducer handler.
    pub fn with_reducer<F>(mut self, f: F) -> Self
    where
        F: Fn(PhaseCtx) -> HandlerFuture<Option<Reduction>> + Send + 'static,
    {
        self.reducer = Some(Box::new(f));
        self
    }

    /// Installs the deriver handler.
    pub fn with_deriver<F>(mut self, f: F) -> Self
    where
        F: Fn(DeriveCtx) -> HandlerFuture<()> + Send + 'static,
    {
        self.deriver = Some(Box::new(f));
        self
    }

    /// The model's name, which is also its table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The model's column schema.
    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub(crate) fn preprocessor(&self) -> Option<&Preprocessor> {
        self.preprocessor.as_ref()
    }

    pub(crate) fn reducer(&self) -> Option<&Reducer> {
        self.reducer.as_ref()
    }

    pub(crate) fn deriver(&self) -> Option<&Deriver> {
        self.deriver.as_ref()
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("preprocessor", &self.preprocessor.is_some())
            .field("reducer", &self.reducer.is_some())
            .field("deriver", &self.deriver.is_some())
            .finish()
    }
}

// =============================================================================
// Model Registry
// =============================================================================

/// The name → [`Model`] mapping, in insertion order.
///
/// Insertion order is authoritative: every pipeline phase visits models in
/// this order, and so does the apply phase.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: Vec<Model>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model.
    ///
    /// # Errors
    ///
    /// `Error::Schema` if the name is empty, already registered, or one of
    /// the reserved table names (`history`, `metadata`).
    pub fn register(&mut self, model: Model) -> Result<()> {
        if model.name().is_empty() {
            return Err(Error::Schema("model name must not be empty".to_string()));
        }
        if RESERVED_TABLES.contains(&model.name()) {
            return Err(Error::Schema(format!(
                "model name '{}' is reserved",
                model.name()
            )));
        }
        if self.get(model.name()).is_some() {
            return Err(Error::Schema(format!(
                "model '{}' is already registered",
                model.name()
            )));
        }
        self.models.push(model);
        Ok(())
    }

    /// Looks a model up by name.
    pub fn get(&self, name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name() == name)
    }

    /// True if a model with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates models in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Model> {
        self.models.iter()
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// True if no models are registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
