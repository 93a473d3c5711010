//! Working copies of the source store.
//!
//! The source is opened read-only and exported with `VACUUM INTO`, which
//! writes a consistent, defragmented copy in one statement. All rewriting
//! happens on the copy. A [`WorkingStore`] deletes its file unless
//! [`WorkingStore::persist`] is called, so a run that fails, panics or is
//! cancelled leaves nothing at the destination.

use crate::config::AnonymiserConfig;
use crate::error::{AnonymiseError, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Files SQLite may create next to a database file.
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// The mutable copy under transformation.
///
/// Owns a single-connection pool; every stage runs on that one connection,
/// so nothing else writes the file during a run.
#[derive(Debug)]
pub struct WorkingStore {
    pool: SqlitePool,
    path: PathBuf,
    armed: bool,
}

impl WorkingStore {
    /// Connection pool of the working copy.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Location of the working copy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the store and keeps the file. Returns its path.
    pub async fn persist(mut self) -> PathBuf {
        self.pool.close().await;
        self.armed = false;
        info!("Kept anonymised store at {}", self.path.display());
        self.path.clone()
    }

    /// Closes the store and deletes its file and side files.
    ///
    /// # Errors
    /// Returns an I/O error if a file exists but cannot be removed.
    pub async fn discard(mut self) -> Result<()> {
        self.pool.close().await;
        self.armed = false;
        remove_store_files(&self.path)?;
        info!("Discarded working copy {}", self.path.display());
        Ok(())
    }
}

impl Drop for WorkingStore {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            "Working copy {} dropped before completion; deleting it",
            self.path.display()
        );
        if let Err(e) = remove_store_files(&self.path) {
            warn!("Could not delete abandoned working copy: {}", e);
        }
    }
}

/// Copies `source` to `dest` and opens the copy for rewriting.
///
/// # Errors
/// - [`AnonymiseError::Io`] if `source` is missing or `dest` already exists
///   or its directory is missing
/// - [`AnonymiseError::Copy`] if the export or opening the copy fails; any
///   partial file is removed
pub async fn create_working_copy(
    source: &Path,
    dest: &Path,
    config: &AnonymiserConfig,
) -> Result<WorkingStore> {
    tokio::fs::metadata(source)
        .await
        .map_err(|e| AnonymiseError::io_at("reading source store", source, e))?;

    match tokio::fs::symlink_metadata(dest).await {
        Ok(_) => {
            return Err(AnonymiseError::io_at(
                "refusing to overwrite",
                dest,
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            ));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(AnonymiseError::io_at("checking destination", dest, e)),
    }

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        let metadata = tokio::fs::metadata(parent)
            .await
            .map_err(|e| AnonymiseError::io_at("checking destination directory", parent, e))?;
        if metadata.permissions().readonly() {
            return Err(AnonymiseError::io_at(
                "writing to",
                parent,
                std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            ));
        }
    }

    let dest_str = dest.to_str().ok_or_else(|| {
        AnonymiseError::configuration(format!(
            "destination path '{}' is not valid UTF-8",
            dest.display()
        ))
    })?;

    if let Err(e) = export(source, dest_str).await {
        discard_partial(dest);
        return Err(e);
    }

    match open_working_copy(dest, config.secure_delete).await {
        Ok(pool) => {
            debug!("Opened working copy {}", dest.display());
            Ok(WorkingStore {
                pool,
                path: dest.to_path_buf(),
                armed: true,
            })
        }
        Err(e) => {
            discard_partial(dest);
            Err(e)
        }
    }
}

async fn export(source: &Path, dest: &str) -> Result<()> {
    let options = SqliteConnectOptions::new()
        .filename(source)
        .read_only(true)
        .create_if_missing(false);

    let source_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| AnonymiseError::copy_failed("opening source store read-only", e))?;

    let result = sqlx::query("VACUUM INTO ?")
        .bind(dest)
        .execute(&source_pool)
        .await
        .map_err(|e| AnonymiseError::copy_failed("exporting source store", e));

    source_pool.close().await;
    result.map(|_| ())
}

async fn open_working_copy(dest: &Path, secure_delete: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(dest)
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Delete)
        .pragma("secure_delete", if secure_delete { "ON" } else { "OFF" });

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| AnonymiseError::copy_failed("opening working copy", e))
}

fn discard_partial(dest: &Path) {
    if let Err(e) = remove_store_files(dest) {
        warn!("Could not remove partial copy {}: {}", dest.display(), e);
    }
}

fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Removes `path` and its side files. Missing files are not an error.
fn remove_store_files(path: &Path) -> Result<()> {
    let candidates = std::iter::once(path.to_path_buf())
        .chain(SIDE_FILE_SUFFIXES.iter().map(|s| side_file(path, s)));

    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AnonymiseError::io_at("deleting", &candidate, e)),
        }
    }
    Ok(())
}
