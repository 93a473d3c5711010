//! Keyset-paginated table walks.
//!
//! [`scan`] visits every row of a table in key order, one page per
//! transaction. The cursor is the key of the last row seen; each page selects
//! rows strictly after it, so the walk terminates and never hands a row to
//! the visitor twice even though the visitor may rewrite the rows it sees.
//!
//! Composite keys such as `(file_id, type)` are compared as tuples, which
//! covers tables without a single-column key.

use crate::error::{AnonymiseError, Result};
use crate::sql::{self, SqlValue};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{SqliteConnection, SqlitePool};
use zeroize::Zeroize;

/// Which table to walk and which columns to read.
#[derive(Debug, Clone, Copy)]
pub struct ScanSpec<'a> {
    /// Table to walk
    pub table: &'a str,
    /// Ordered key columns; their values must be unique and non-NULL
    pub key_columns: &'a [&'a str],
    /// Extra columns handed to the visitor
    pub columns: &'a [&'a str],
}

/// Page sizing and progress reporting for a scan.
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    /// Rows per page transaction
    pub page_size: u32,
    /// Progress log interval in rows
    pub log_every: u64,
}

impl Paging {
    /// Paging settings taken from a run config.
    pub fn from_config(config: &crate::AnonymiserConfig) -> Self {
        Self {
            page_size: config.page_size,
            log_every: config.log_every,
        }
    }
}

/// Last key seen by a scan.
///
/// Empty before the first page. Key values may be original sensitive text
/// (aliases), so they are zeroed when replaced or dropped.
#[derive(Debug, Default)]
pub struct Cursor {
    keys: Option<Vec<SqlValue>>,
}

impl Cursor {
    /// Creates a cursor positioned before the first row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current key values; `None` before the first page.
    pub fn keys(&self) -> Option<&[SqlValue]> {
        self.keys.as_deref()
    }

    /// Moves the cursor to the key of `row`.
    pub fn advance(&mut self, row: &SqliteRow, key_columns: &[&str]) -> Result<()> {
        let mut keys = Vec::with_capacity(key_columns.len());
        for column in key_columns {
            match SqlValue::decode(row, column)? {
                Some(value) => keys.push(value),
                None => {
                    return Err(AnonymiseError::configuration(format!(
                        "key column '{}' contains NULL and cannot order a scan",
                        column
                    )));
                }
            }
        }
        if let Some(old) = self.keys.as_mut() {
            old.zeroize();
        }
        self.keys = Some(keys);
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(keys) = self.keys.as_mut() {
            keys.zeroize();
        }
    }
}

/// Per-row callback of a scan.
///
/// `conn` is the page's open transaction; everything the visitor writes
/// through it commits or rolls back together with the page.
#[async_trait]
pub trait RowVisitor: Send {
    /// Handles one row.
    async fn visit(&mut self, conn: &mut SqliteConnection, row: &SqliteRow) -> Result<()>;
}

/// Walks `spec.table` page by page and calls `visitor` for each row.
///
/// Returns the number of rows visited.
///
/// # Errors
/// A failing select, visitor or commit aborts the scan. The failing page's
/// transaction is rolled back; earlier pages stay committed.
pub async fn scan<V>(
    pool: &SqlitePool,
    spec: &ScanSpec<'_>,
    paging: Paging,
    visitor: &mut V,
) -> Result<u64>
where
    V: RowVisitor + ?Sized,
{
    if spec.key_columns.is_empty() {
        return Err(AnonymiseError::configuration(format!(
            "scan of '{}' needs at least one key column",
            spec.table
        )));
    }
    if paging.page_size == 0 {
        return Err(AnonymiseError::configuration("page_size must be greater than 0"));
    }
    let log_every = paging.log_every.max(1);

    let mut cursor = Cursor::new();
    let mut total: u64 = 0;
    let mut pages: u64 = 0;

    loop {
        let mut tx = pool.begin().await.map_err(|e| {
            AnonymiseError::query_failed(format!("starting transaction for {}", spec.table), e)
        })?;

        let rows = sql::select_page(
            spec.table,
            spec.key_columns,
            spec.columns,
            cursor.keys(),
            paging.page_size,
        )
        .build()
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| AnonymiseError::query_failed(format!("reading {}", spec.table), e))?;

        if rows.is_empty() {
            tx.commit().await.map_err(|e| {
                AnonymiseError::query_failed(format!("closing scan of {}", spec.table), e)
            })?;
            break;
        }

        for row in &rows {
            visitor.visit(&mut tx, row).await?;
            total += 1;
            if total % log_every == 0 {
                tracing::info!("Anonymised {} {}", total, spec.table);
            }
        }

        if let Some(last) = rows.last() {
            cursor.advance(last, spec.key_columns)?;
        }

        tx.commit().await.map_err(|e| {
            AnonymiseError::query_failed(format!("committing page of {}", spec.table), e)
        })?;

        pages += 1;
        tracing::debug!(table = spec.table, pages, rows = total, "Committed page");
    }

    Ok(total)
}
