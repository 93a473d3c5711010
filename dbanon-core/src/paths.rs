//! Folder path and file name rewriting.
//!
//! Every folder path is rebuilt from folder ids alone: a root becomes
//! `"<id>"`, a child `"<parent path><sep><id>"`. Depth and shape of the tree
//! are kept, every component becomes an opaque number. File base names become
//! the file's id.

use crate::error::{AnonymiseError, Result};
use crate::schema::{FileTable, FolderTable};
use crate::sql::{self, quote_ident};
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

/// Counts from a folder rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FolderRewrite {
    /// Folders without a parent
    pub roots: u64,
    /// Folders rewritten under a parent
    pub descendants: u64,
    /// Folders not reachable from any root, reset to their bare id
    pub unreachable: u64,
}

impl FolderRewrite {
    /// Total folders rewritten.
    pub fn total(&self) -> u64 {
        self.roots + self.descendants + self.unreachable
    }
}

/// Rewrites every folder path of `folders` inside one transaction.
///
/// The tree is walked with an explicit worklist of `(folder id, new path)`,
/// so depth is bounded by heap, not stack. All children of one parent are
/// rewritten by a single UPDATE.
pub async fn rewrite_folder_paths(
    pool: &SqlitePool,
    folders: &FolderTable,
    separator: &str,
) -> Result<FolderRewrite> {
    let context = || format!("anonymising {}", folders.table);
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| AnonymiseError::query_failed(context(), e))?;

    let mut counts = FolderRewrite::default();
    let root_filter = format!("{} IS NULL", quote_ident(folders.parent_column));

    counts.roots = sqlx::query(&sql::set_to_id_text(
        folders.table,
        folders.path_column,
        folders.id_column,
        Some(&root_filter),
    ))
    .execute(&mut *tx)
    .await
    .map_err(|e| AnonymiseError::query_failed(context(), e))?
    .rows_affected();

    let roots_query = format!(
        "SELECT {}, {} FROM {} WHERE {}",
        quote_ident(folders.id_column),
        quote_ident(folders.path_column),
        quote_ident(folders.table),
        root_filter
    );
    let mut worklist = fetch_folders(&mut tx, &roots_query, None, folders).await?;

    let update_children = format!(
        "UPDATE {} SET {} = ? || ? || {} WHERE {} = ?",
        quote_ident(folders.table),
        quote_ident(folders.path_column),
        quote_ident(folders.id_column),
        quote_ident(folders.parent_column)
    );
    let children_query = format!(
        "SELECT {}, {} FROM {} WHERE {} = ?",
        quote_ident(folders.id_column),
        quote_ident(folders.path_column),
        quote_ident(folders.table),
        quote_ident(folders.parent_column)
    );

    while let Some((parent_id, parent_path)) = worklist.pop() {
        let updated = sqlx::query(&update_children)
            .bind(&parent_path)
            .bind(separator)
            .bind(parent_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AnonymiseError::query_failed(context(), e))?
            .rows_affected();

        if updated > 0 {
            counts.descendants += updated;
            let children = fetch_folders(&mut tx, &children_query, Some(parent_id), folders).await?;
            worklist.extend(children);
        }
    }

    counts.unreachable = reset_unreachable(&mut tx, folders).await?;
    if counts.unreachable > 0 {
        warn!(
            "{} {} rows are not reachable from a root; paths reset to their ids",
            counts.unreachable, folders.table
        );
    }

    tx.commit()
        .await
        .map_err(|e| AnonymiseError::query_failed(context(), e))?;

    debug!(
        roots = counts.roots,
        descendants = counts.descendants,
        "Rewrote {} paths",
        folders.table
    );
    Ok(counts)
}

async fn fetch_folders(
    conn: &mut SqliteConnection,
    query: &str,
    parent_id: Option<i64>,
    folders: &FolderTable,
) -> Result<Vec<(i64, String)>> {
    let mut q = sqlx::query(query);
    if let Some(parent_id) = parent_id {
        q = q.bind(parent_id);
    }
    let rows = q
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AnonymiseError::query_failed(format!("reading {}", folders.table), e))?;

    rows.iter()
        .map(|row| {
            let id: i64 = row.try_get(folders.id_column).map_err(|e| {
                AnonymiseError::query_failed(format!("reading {}", folders.table), e)
            })?;
            let path: String = row.try_get(folders.path_column).map_err(|e| {
                AnonymiseError::query_failed(format!("reading {}", folders.table), e)
            })?;
            Ok((id, path))
        })
        .collect()
}

/// Resets the path of folders whose parent chain never reaches a root
/// (dangling parent ids), so no original path survives.
async fn reset_unreachable(conn: &mut SqliteConnection, folders: &FolderTable) -> Result<u64> {
    let table = quote_ident(folders.table);
    let id = quote_ident(folders.id_column);
    let parent = quote_ident(folders.parent_column);
    let path = quote_ident(folders.path_column);

    let statement = format!(
        "WITH RECURSIVE reachable(folder_id) AS (
            SELECT {id} FROM {table} WHERE {parent} IS NULL
            UNION
            SELECT f.{id} FROM {table} AS f JOIN reachable AS r ON f.{parent} = r.folder_id
        )
        UPDATE {table} SET {path} = CAST({id} AS TEXT)
        WHERE {id} NOT IN (SELECT folder_id FROM reachable)"
    );

    let result = sqlx::query(&statement)
        .execute(&mut *conn)
        .await
        .map_err(|e| AnonymiseError::query_failed(format!("anonymising {}", folders.table), e))?;
    Ok(result.rows_affected())
}

/// Sets every file's base name to its id.
pub async fn rewrite_file_basenames(pool: &SqlitePool, files: &FileTable) -> Result<u64> {
    let context = || format!("anonymising {}", files.table);
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| AnonymiseError::query_failed(context(), e))?;

    let updated = sqlx::query(&sql::set_to_id_text(
        files.table,
        files.name_column,
        files.id_column,
        None,
    ))
    .execute(&mut *tx)
    .await
    .map_err(|e| AnonymiseError::query_failed(context(), e))?
    .rows_affected();

    tx.commit()
        .await
        .map_err(|e| AnonymiseError::query_failed(context(), e))?;
    Ok(updated)
}
