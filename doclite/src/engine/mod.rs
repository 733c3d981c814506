// Storage engine adapter seam.
//
// The rest of the crate never touches raw statement handles: it hands SQL
// text plus positional bindings to an `EngineHandle` and gets rows back.
// `SqliteEngine` is the production implementation; tests wrap it to inject
// runtime faults.

mod sqlite;

pub use sqlite::SqliteEngine;
pub(crate) use sqlite::backing_files;

use crate::error::{DocError, Result};
use std::path::Path;

/// A positional binding or a column value.
pub use rusqlite::types::Value as SqlValue;

/// Opens handles onto a backing file.
pub trait StorageEngine: Send {
    /// Open the backing file, creating it when missing.
    fn open(&mut self, path: &Path) -> Result<Box<dyn EngineHandle>>;

    /// Delete the backing file (and any sidecar journal) so the next open
    /// starts from an empty store.
    fn remove_backing_file(&mut self, path: &Path) -> Result<()>;

    /// Drop any state cached across handles. Called after a crash, before
    /// the engine is asked to open again.
    fn reset(&mut self) {}
}

/// One open connection.
pub trait EngineHandle: Send {
    /// Execute one or more statements, binding `bindings` positionally to
    /// every statement that declares parameters. Rows from all statements are
    /// concatenated.
    fn run(&mut self, sql: &str, bindings: &[SqlValue]) -> Result<Vec<Row>>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// A SQL statement with its bindings, as queued for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub bindings: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, bindings: Vec<SqlValue>) -> Self {
        Statement {
            sql: sql.into(),
            bindings,
        }
    }
}

/// A result row: column names paired with values, in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Row { columns }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, value)| value)
    }

    pub fn text(&self, name: &str) -> Result<&str> {
        match self.get(name) {
            Some(SqlValue::Text(s)) => Ok(s),
            other => Err(column_type_error(name, "text", other)),
        }
    }

    pub fn integer(&self, name: &str) -> Result<i64> {
        match self.get(name) {
            Some(SqlValue::Integer(n)) => Ok(*n),
            other => Err(column_type_error(name, "integer", other)),
        }
    }

    pub fn blob(&self, name: &str) -> Result<&[u8]> {
        match self.get(name) {
            Some(SqlValue::Blob(b)) => Ok(b),
            Some(SqlValue::Null) => Ok(&[]),
            other => Err(column_type_error(name, "blob", other)),
        }
    }
}

fn column_type_error(name: &str, expected: &str, found: Option<&SqlValue>) -> DocError {
    match found {
        None => DocError::Other(format!("Column '{name}' missing from result row")),
        Some(v) => DocError::Other(format!(
            "Column '{name}' expected {expected}, got {:?}",
            v.data_type()
        )),
    }
}

/// Convert a JSON scalar into a binding, the way the engine's JSON functions
/// present the same value (`true` extracts as 1, objects as JSON text).
pub fn json_to_sql(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
