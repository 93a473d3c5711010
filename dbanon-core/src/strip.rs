//! Bulk removal of values that cannot be anonymised.
//!
//! Binary payloads (cover images, thumbnails) and identifiers issued by
//! external services are nulled or deleted outright rather than randomised.

use crate::config::ColumnRef;
use crate::error::{AnonymiseError, Result};
use crate::sql;
use sqlx::SqlitePool;
use tracing::debug;

/// Sets every listed column to NULL and empties every listed payload table.
///
/// Runs as one transaction. Returns the number of rows touched.
pub async fn strip_blobs(
    pool: &SqlitePool,
    columns: &[ColumnRef],
    tables: &[String],
) -> Result<u64> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| AnonymiseError::query_failed("starting blob strip", e))?;
    let mut touched = 0;

    for column in columns {
        let result = sqlx::query(&sql::null_column(&column.table, &column.column))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AnonymiseError::query_failed(
                    format!("nulling {}.{}", column.table, column.column),
                    e,
                )
            })?;
        debug!(
            table = %column.table,
            column = %column.column,
            rows = result.rows_affected(),
            "Nulled blob column"
        );
        touched += result.rows_affected();
    }

    touched += delete_tables(&mut tx, tables).await?;

    tx.commit()
        .await
        .map_err(|e| AnonymiseError::query_failed("committing blob strip", e))?;
    Ok(touched)
}

/// Deletes all rows of the tables holding external-service identifiers.
pub async fn delete_external_ids(pool: &SqlitePool, tables: &[String]) -> Result<u64> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| AnonymiseError::query_failed("starting external id deletion", e))?;
    let deleted = delete_tables(&mut tx, tables).await?;
    tx.commit()
        .await
        .map_err(|e| AnonymiseError::query_failed("committing external id deletion", e))?;
    Ok(deleted)
}

async fn delete_tables(conn: &mut sqlx::SqliteConnection, tables: &[String]) -> Result<u64> {
    let mut deleted = 0;
    for table in tables {
        let result = sqlx::query(&sql::delete_all(table))
            .execute(&mut *conn)
            .await
            .map_err(|e| AnonymiseError::query_failed(format!("emptying {}", table), e))?;
        debug!(table = %table, rows = result.rows_affected(), "Emptied table");
        deleted += result.rows_affected();
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::raw_sql(
            "CREATE TABLE blobs (checksum TEXT PRIMARY KEY, blob BLOB);
             CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT, image_blob TEXT);
             CREATE TABLE scene_stash_ids (scene_id INTEGER, endpoint TEXT, stash_id TEXT);
             INSERT INTO blobs VALUES ('aa', x'0102'), ('bb', x'0304');
             INSERT INTO tags VALUES (1, 'one', 'aa'), (2, 'two', NULL), (3, 'three', 'bb');
             INSERT INTO scene_stash_ids VALUES (1, 'https://stashdb.org', 'abc');",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_strip_blobs_nulls_columns_and_empties_tables() {
        let pool = pool().await;
        let touched = strip_blobs(
            &pool,
            &[ColumnRef::new("tags", "image_blob")],
            &["blobs".to_string()],
        )
        .await
        .unwrap();
        // 3 tag rows updated, 2 blob rows deleted
        assert_eq!(touched, 5);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE image_blob IS NOT NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        let tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(tags, 3);
        let blobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(blobs, 0);
    }

    #[tokio::test]
    async fn test_delete_external_ids() {
        let pool = pool().await;
        let deleted = delete_external_ids(&pool, &["scene_stash_ids".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_missing_table_fails_atomically() {
        let pool = pool().await;
        let err = strip_blobs(
            &pool,
            &[ColumnRef::new("tags", "image_blob")],
            &["no_such_table".to_string()],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AnonymiseError::Query { .. }));

        let kept: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE image_blob IS NOT NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(kept, 2);
    }
}
