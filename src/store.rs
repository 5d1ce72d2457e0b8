//! # Document Stores
//!
//! Row-level access to model tables. Two views exist:
//!
//! - [`Stores`] - the read view handed to handlers. Inside a dispatch it is
//!   served from the transaction connection, so handlers observe the
//!   post-apply state of earlier phases and earlier models of the current
//!   phase.
//! - [`RwStores`] - the writable view. The apply phase uses it to execute
//!   reductions; derivers hold it for direct writes inside the same
//!   transaction.
//!
//! The row primitives at the bottom are plain functions over a borrowed
//! connection; the reader pool reuses them against read-only connections,
//! where they only ever observe committed state (WAL isolation).
//!
//! ## Documents
//!
//! A row travels as a JSON object: a string `id` plus one entry per non-NULL
//! column. Columns persist as compact JSON text; a column absent from the
//! object is NULL in the table. Queries are equality matches on `id` and/or
//! columns; result order is always `ORDER BY id` so reads are deterministic.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::model::ModelRegistry;
use crate::sql;

// =============================================================================
// Model Info
// =============================================================================

/// The table layout of every registered model, detached from the handler
/// slots so it can be shared with the reader threads.
#[derive(Debug)]
pub(crate) struct ModelInfo {
    tables: HashMap<String, Vec<String>>,
}

impl ModelInfo {
    /// Captures table names and columns from a registry.
    pub fn from_registry(registry: &ModelRegistry) -> Self {
        let tables = registry
            .iter()
            .map(|m| (m.name().to_string(), m.columns().names().to_vec()))
            .collect();
        Self { tables }
    }

    /// The columns of a model, or `Error::UnknownModel`.
    pub fn columns(&self, model: &str) -> Result<&[String]> {
        self.tables
            .get(model)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::UnknownModel(model.to_string()))
    }

    /// True if the model is registered.
    pub fn contains(&self, model: &str) -> bool {
        self.tables.contains_key(model)
    }
}

// =============================================================================
// Read View
// =============================================================================

/// Read-only access to every model, bound to one connection.
///
/// Cheap to clone; handler contexts each carry one.
#[derive(Clone)]
pub struct Stores {
    conn: Rc<Connection>,
    info: Arc<ModelInfo>,
}

impl Stores {
    pub(crate) fn new(conn: Rc<Connection>, info: Arc<ModelInfo>) -> Self {
        Self { conn, info }
    }

    /// Fetches one document by id. `None` if absent.
    pub fn get(&self, model: &str, id: &str) -> Result<Option<JsonValue>> {
        let cols = self.info.columns(model)?;
        get_row(&self.conn, model, cols, id)
    }

    /// Returns the first document matching the query, in id order.
    ///
    /// The query is an object of equality conditions on `id` and/or columns;
    /// `None` matches everything.
    pub fn search_one(&self, model: &str, query: Option<&JsonValue>) -> Result<Option<JsonValue>> {
        let cols = self.info.columns(model)?;
        Ok(search_rows(&self.conn, model, cols, query, Some(1))?.pop())
    }

    /// Returns all documents matching the query, in id order.
    pub fn search(&self, model: &str, query: Option<&JsonValue>) -> Result<Vec<JsonValue>> {
        let cols = self.info.columns(model)?;
        search_rows(&self.conn, model, cols, query, None)
    }
}

// =============================================================================
// Write View
// =============================================================================

/// Writable access to every model, bound to the transaction connection.
///
/// Only the engine constructs these, and only inside an open write
/// transaction: for the apply phase, and for deriver contexts.
#[derive(Clone)]
pub struct RwStores {
    conn: Rc<Connection>,
    info: Arc<ModelInfo>,
}

impl RwStores {
    pub(crate) fn new(conn: Rc<Connection>, info: Arc<ModelInfo>) -> Self {
        Self { conn, info }
    }

    /// Upserts a whole row. Columns missing from the document become NULL.
    pub fn set(&self, model: &str, row: &JsonValue) -> Result<()> {
        let cols = self.info.columns(model)?;
        upsert_row(&self.conn, model, cols, row)
    }

    /// Inserts a row; an existing id fails with a constraint error.
    pub fn insert(&self, model: &str, row: &JsonValue) -> Result<()> {
        let cols = self.info.columns(model)?;
        insert_row(&self.conn, model, cols, row)
    }

    /// Patches an existing row. Only the columns present in the patch
    /// change; a missing row is `Error::MissingRow`.
    pub fn update(&self, model: &str, patch: &JsonValue) -> Result<()> {
        let cols = self.info.columns(model)?;
        update_row(&self.conn, model, cols, patch)
    }

    /// Deletes a row by id. Absent ids are a no-op.
    pub fn remove(&self, model: &str, id: &str) -> Result<()> {
        self.info.columns(model)?;
        delete_row(&self.conn, model, id)
    }
}

// =============================================================================
// Row Primitives
// =============================================================================

fn row_id(obj: &Map<String, JsonValue>) -> Result<&str> {
    obj.get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| Error::Schema("row document is missing a string 'id'".to_string()))
}

fn as_object(doc: &JsonValue) -> Result<&Map<String, JsonValue>> {
    doc.as_object()
        .ok_or_else(|| Error::Schema("row document must be a JSON object".to_string()))
}

/// Checks that every key of a document is `id` or a declared column.
fn check_columns(table: &str, cols: &[String], obj: &Map<String, JsonValue>) -> Result<()> {
    for key in obj.keys() {
        if key != "id" && !cols.iter().any(|c| c == key) {
            return Err(Error::Schema(format!(
                "unknown column '{key}' in model '{table}'"
            )));
        }
    }
    Ok(())
}

/// The stored TEXT for one column of a document: compact JSON, or NULL when
/// the column is absent or null.
fn column_value(obj: &Map<String, JsonValue>, col: &str) -> SqlValue {
    match obj.get(col) {
        Some(v) if !v.is_null() => SqlValue::Text(sql::json_text(v)),
        _ => SqlValue::Null,
    }
}

/// Reassembles a document from an id and the raw column texts.
fn assemble_doc(table: &str, cols: &[String], id: String, raw: Vec<Option<String>>) -> Result<JsonValue> {
    let mut obj = Map::new();
    obj.insert("id".to_string(), JsonValue::String(id));
    for (col, text) in cols.iter().zip(raw) {
        if let Some(text) = text {
            let context = format!("model '{table}' column '{col}'");
            obj.insert(col.clone(), sql::parse_json(&text, &context)?);
        }
    }
    Ok(JsonValue::Object(obj))
}

fn select_list(cols: &[String]) -> String {
    let mut list = String::from("id");
    for col in cols {
        list.push_str(", ");
        list.push_str(&sql::ident(col));
    }
    list
}

pub(crate) fn get_row(
    conn: &Connection,
    table: &str,
    cols: &[String],
    id: &str,
) -> Result<Option<JsonValue>> {
    let stmt = format!(
        "SELECT {} FROM {} WHERE id = ?",
        select_list(cols),
        sql::ident(table)
    );
    let raw = conn
        .query_row(&stmt, [id], |row| {
            let id: String = row.get(0)?;
            let mut texts = Vec::with_capacity(cols.len());
            for i in 0..cols.len() {
                texts.push(row.get::<_, Option<String>>(i + 1)?);
            }
            Ok((id, texts))
        })
        .optional()?;

    match raw {
        Some((id, texts)) => Ok(Some(assemble_doc(table, cols, id, texts)?)),
        None => Ok(None),
    }
}

pub(crate) fn search_rows(
    conn: &Connection,
    table: &str,
    cols: &[String],
    query: Option<&JsonValue>,
    limit: Option<usize>,
) -> Result<Vec<JsonValue>> {
    let mut stmt = format!("SELECT {} FROM {}", select_list(cols), sql::ident(table));
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(query) = query {
        let obj = query
            .as_object()
            .ok_or_else(|| Error::Schema("query must be a JSON object".to_string()))?;
        let mut clauses = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            if key == "id" {
                let id = value.as_str().ok_or_else(|| {
                    Error::Schema("query value for 'id' must be a string".to_string())
                })?;
                clauses.push("id = ?".to_string());
                params.push(SqlValue::Text(id.to_string()));
            } else if cols.iter().any(|c| c == key) {
                if value.is_null() {
                    clauses.push(format!("{} IS NULL", sql::ident(key)));
                } else {
                    clauses.push(format!("{} = ?", sql::ident(key)));
                    params.push(SqlValue::Text(sql::json_text(value)));
                }
            } else {
                return Err(Error::Schema(format!(
                    "unknown column '{key}' in model '{table}'"
                )));
            }
        }
        if !clauses.is_empty() {
            stmt.push_str(" WHERE ");
            stmt.push_str(&clauses.join(" AND "));
        }
    }

    stmt.push_str(" ORDER BY id");
    if let Some(limit) = limit {
        stmt.push_str(&format!(" LIMIT {limit}"));
    }

    let mut prepared = conn.prepare(&stmt)?;
    let raw: Vec<(String, Vec<Option<String>>)> = prepared
        .query_map(rusqlite::params_from_iter(params), |row| {
            let id: String = row.get(0)?;
            let mut texts = Vec::with_capacity(cols.len());
            for i in 0..cols.len() {
                texts.push(row.get::<_, Option<String>>(i + 1)?);
            }
            Ok((id, texts))
        })?
        .collect::<std::result::Result<_, _>>()?;

    raw.into_iter()
        .map(|(id, texts)| assemble_doc(table, cols, id, texts))
        .collect()
}

pub(crate) fn upsert_row(
    conn: &Connection,
    table: &str,
    cols: &[String],
    row: &JsonValue,
) -> Result<()> {
    let obj = as_object(row)?;
    check_columns(table, cols, obj)?;
    let id = row_id(obj)?;

    let mut placeholders = String::from("?");
    let mut params: Vec<SqlValue> = vec![SqlValue::Text(id.to_string())];
    for col in cols {
        placeholders.push_str(", ?");
        params.push(column_value(obj, col));
    }

    // Whole-row semantics: on conflict every declared column is replaced,
    // so columns missing from the document end up NULL.
    let conflict = if cols.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let assignments: Vec<String> = cols
            .iter()
            .map(|c| format!("{col} = excluded.{col}", col = sql::ident(c)))
            .collect();
        format!("DO UPDATE SET {}", assignments.join(", "))
    };

    let stmt = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) {}",
        sql::ident(table),
        select_list(cols),
        placeholders,
        conflict
    );
    conn.execute(&stmt, rusqlite::params_from_iter(params))?;
    Ok(())
}

pub(crate) fn insert_row(
    conn: &Connection,
    table: &str,
    cols: &[String],
    row: &JsonValue,
) -> Result<()> {
    let obj = as_object(row)?;
    check_columns(table, cols, obj)?;
    let id = row_id(obj)?;

    let mut placeholders = String::from("?");
    let mut params: Vec<SqlValue> = vec![SqlValue::Text(id.to_string())];
    for col in cols {
        placeholders.push_str(", ?");
        params.push(column_value(obj, col));
    }

    let stmt = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        sql::ident(table),
        select_list(cols),
        placeholders
    );
    conn.execute(&stmt, rusqlite::params_from_iter(params))?;
    Ok(())
}

pub(crate) fn update_row(
    conn: &Connection,
    table: &str,
    cols: &[String],
    patch: &JsonValue,
) -> Result<()> {
    let obj = as_object(patch)?;
    check_columns(table, cols, obj)?;
    let id = row_id(obj)?;

    let mut assignments = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    for col in cols {
        if let Some(value) = obj.get(col) {
            assignments.push(format!("{} = ?", sql::ident(col)));
            params.push(match value {
                v if v.is_null() => SqlValue::Null,
                v => SqlValue::Text(sql::json_text(v)),
            });
        }
    }
    if assignments.is_empty() {
        // A patch with only an id changes nothing.
        return Ok(());
    }
    params.push(SqlValue::Text(id.to_string()));

    let stmt = format!(
        "UPDATE {} SET {} WHERE id = ?",
        sql::ident(table),
        assignments.join(", ")
    );
    let changed = conn.execute(&stmt, rusqlite::params_from_iter(params))?;
    if changed == 0 {
        return Err(Error::MissingRow {
            model: table.to_string(),
            id: id.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn delete_row(conn: &Connection, table: &str, id: &str) -> Result<()> {
    let stmt = format!("DELETE FROM {} WHERE id = ?", sql::ident(table));
    conn.execute(&stmt, [id])?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
