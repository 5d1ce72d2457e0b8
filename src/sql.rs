//! # SQL Templating Utilities
//!
//! Small, pure helpers for building SQL against model tables whose names and
//! columns come from user-supplied schemas: identifier quoting for the
//! generated DDL and statements, and the compact-JSON text encoding used by
//! every JSON column. Values themselves always travel as parameters, never
//! as interpolated literals.
//!
//! None of this is part of the dispatch engine's contract — the engine and
//! the stores consume these helpers the way they would any formatting
//! utility.

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

// =============================================================================
// Identifiers
// =============================================================================

/// Quotes an identifier (table or column name) for safe interpolation.
///
/// SQLite identifier quoting uses double quotes, with embedded double quotes
/// doubled. Model and column names are user-supplied, so every identifier
/// that reaches a statement goes through here.
pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// =============================================================================
// JSON Columns
// =============================================================================

/// Encodes a JSON value as the compact text stored in a JSON column.
pub fn json_text(value: &JsonValue) -> String {
    value.to_string()
}

/// Parses the text of a JSON column back into a value.
///
/// `context` names the row being decoded so corruption errors point at the
/// offending data.
pub fn parse_json(text: &str, context: &str) -> Result<JsonValue> {
    serde_json::from_str(text)
        .map_err(|e| Error::Schema(format!("corrupt JSON in {context}: {e}")))
}

// =============================================================================
// Tests
// =============================================================================
