//! SQL statement construction for range scans and rewrites.
//!
//! Identifiers are always double-quoted with embedded quotes doubled, and
//! every value (cursor keys, original values, replacements) is bound as a
//! parameter. Statements are built with [`sqlx::QueryBuilder`] so callers get
//! back something they can execute directly on a transaction.

use crate::error::{AnonymiseError, Result};
use sqlx::{QueryBuilder, Row, Sqlite, sqlite::SqliteRow};
use std::borrow::Cow;
use zeroize::Zeroize;

/// Quotes an identifier for SQLite.
///
/// # Example
/// ```rust
/// use dbanon_core::sql::quote_ident;
///
/// assert_eq!(quote_ident("scenes"), "\"scenes\"");
/// assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A scalar read back from the store: cursor keys, shared values and the
/// originals of obfuscated columns.
///
/// SQLite is dynamically typed; a key or fingerprint column can hold integers
/// in some rows and text in others, and a text column can hold BLOB or REAL
/// values written by other clients. The original storage class is kept and
/// bound back unchanged when matching rows.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// INTEGER storage class
    Integer(i64),
    /// REAL storage class
    Real(f64),
    /// TEXT storage class
    Text(String),
    /// BLOB storage class
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Reads `column` from `row`. NULL yields `None`.
    ///
    /// # Errors
    /// Returns a query error when the column is missing from `row`.
    pub fn decode(row: &SqliteRow, column: &str) -> Result<Option<Self>> {
        if let Ok(v) = row.try_get::<Option<i64>, _>(column) {
            return Ok(v.map(Self::Integer));
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(column) {
            return Ok(v.map(Self::Text));
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(column) {
            return Ok(v.map(Self::Real));
        }
        row.try_get::<Option<Vec<u8>>, _>(column)
            .map(|v| v.map(Self::Blob))
            .map_err(|e| AnonymiseError::query_failed(format!("reading column '{}'", column), e))
    }

    /// Text form used as obfuscation input. BLOB bytes are read as UTF-8,
    /// with invalid sequences replaced.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Integer(v) => Cow::Owned(v.to_string()),
            Self::Real(v) => Cow::Owned(v.to_string()),
            Self::Text(s) => Cow::Borrowed(s),
            Self::Blob(b) => String::from_utf8_lossy(b),
        }
    }

    fn push_bind(&self, qb: &mut QueryBuilder<'static, Sqlite>) {
        match self {
            Self::Integer(v) => {
                qb.push_bind(*v);
            }
            Self::Real(v) => {
                qb.push_bind(*v);
            }
            Self::Text(s) => {
                qb.push_bind(s.clone());
            }
            Self::Blob(b) => {
                qb.push_bind(b.clone());
            }
        }
    }
}

impl Zeroize for SqlValue {
    fn zeroize(&mut self) {
        match self {
            Self::Integer(v) => v.zeroize(),
            Self::Real(v) => v.zeroize(),
            Self::Text(s) => s.zeroize(),
            Self::Blob(b) => b.zeroize(),
        }
    }
}

/// Builds one page select: rows whose key is strictly after `after`, in key
/// order, at most `limit` rows.
///
/// Composite keys use a row-value comparison, which SQLite evaluates as a
/// lexicographic tuple comparison.
pub fn select_page(
    table: &str,
    key_columns: &[&str],
    columns: &[&str],
    after: Option<&[SqlValue]>,
    limit: u32,
) -> QueryBuilder<'static, Sqlite> {
    let mut selected: Vec<&str> = key_columns.to_vec();
    for column in columns {
        if !selected.contains(column) {
            selected.push(column);
        }
    }

    let mut qb = QueryBuilder::new("SELECT ");
    qb.push(column_list(&selected));
    qb.push(" FROM ");
    qb.push(quote_ident(table));

    if let Some(keys) = after {
        qb.push(" WHERE ");
        if key_columns.len() == 1 {
            qb.push(quote_ident(key_columns[0]));
            qb.push(" > ");
        } else {
            qb.push("(");
            qb.push(column_list(key_columns));
            qb.push(") > ");
        }
        if keys.len() == 1 {
            keys[0].push_bind(&mut qb);
        } else {
            qb.push("(");
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                key.push_bind(&mut qb);
            }
            qb.push(")");
        }
    }

    qb.push(" ORDER BY ");
    qb.push(column_list(key_columns));
    qb.push(" LIMIT ");
    qb.push_bind(i64::from(limit));
    qb
}

/// `UPDATE t SET column = replacement WHERE column = original`
pub fn replace_value(
    table: &str,
    column: &str,
    replacement: String,
    original: &SqlValue,
) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new("UPDATE ");
    qb.push(quote_ident(table));
    qb.push(" SET ");
    qb.push(quote_ident(column));
    qb.push(" = ");
    qb.push_bind(replacement);
    qb.push(" WHERE ");
    qb.push(quote_ident(column));
    qb.push(" = ");
    original.push_bind(&mut qb);
    qb
}

/// `SELECT EXISTS(SELECT 1 FROM t WHERE column = value)`
pub fn value_exists(table: &str, column: &str, value: &SqlValue) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new("SELECT EXISTS(SELECT 1 FROM ");
    qb.push(quote_ident(table));
    qb.push(" WHERE ");
    qb.push(quote_ident(column));
    qb.push(" = ");
    value.push_bind(&mut qb);
    qb.push(")");
    qb
}

/// `UPDATE t SET column = NULL`
pub fn null_column(table: &str, column: &str) -> String {
    format!(
        "UPDATE {} SET {} = NULL",
        quote_ident(table),
        quote_ident(column)
    )
}

/// `DELETE FROM t`
pub fn delete_all(table: &str) -> String {
    format!("DELETE FROM {}", quote_ident(table))
}

/// `UPDATE t SET column = CAST(id AS TEXT)`, optionally restricted by a raw
/// predicate.
pub fn set_to_id_text(table: &str, column: &str, id_column: &str, predicate: Option<&str>) -> String {
    let mut sql = format!(
        "UPDATE {} SET {} = CAST({} AS TEXT)",
        quote_ident(table),
        quote_ident(column),
        quote_ident(id_column)
    );
    if let Some(predicate) = predicate {
        sql.push_str(" WHERE ");
        sql.push_str(predicate);
    }
    sql
}

/// Column Set Patch: new values for some columns of one row.
///
/// Columns are written in insertion order. An empty patch builds no
/// statement.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ColumnPatch {
    entries: Vec<(String, String)>,
}

impl ColumnPatch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `column` to `value`, replacing any earlier value for it.
    pub fn set(&mut self, column: &str, value: String) {
        if let Some(entry) = self.entries.iter_mut().find(|(c, _)| c == column) {
            entry.1 = value;
        } else {
            self.entries.push((column.to_string(), value));
        }
    }

    /// Value queued for `column`, if any.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    /// Number of columns in the patch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no column is set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds `UPDATE t SET a = ?, b = ? WHERE k1 = ? AND k2 = ?`.
    ///
    /// Returns `None` for an empty patch so that no write is ever issued.
    pub fn update_statement(
        &self,
        table: &str,
        filter: &[(&str, &SqlValue)],
    ) -> Option<QueryBuilder<'static, Sqlite>> {
        if self.entries.is_empty() {
            return None;
        }

        let mut qb = QueryBuilder::new("UPDATE ");
        qb.push(quote_ident(table));
        qb.push(" SET ");
        for (i, (column, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(quote_ident(column));
            qb.push(" = ");
            qb.push_bind(value.clone());
        }
        for (i, (column, value)) in filter.iter().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            qb.push(quote_ident(column));
            qb.push(" = ");
            value.push_bind(&mut qb);
        }
        Some(qb)
    }
}
