//! Error types for anonymisation runs.
//!
//! Every error that can end a run lives here. Messages carry table and column
//! names for context but never the values being anonymised, so an error
//! report can be shared as freely as the anonymised store itself.

use std::path::Path;
use thiserror::Error;

/// Main error type for dbanon operations.
///
/// # Security
/// Error messages never include original column values. Only identifiers
/// (table, column, stage and file names) appear in the context strings.
#[derive(Debug, Error)]
pub enum AnonymiseError {
    /// Filesystem operation failed (destination exists, unwritable, cleanup)
    #[error("I/O operation failed: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Exporting the source store into the working copy failed
    #[error("Snapshot copy failed: {context}")]
    Copy {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    /// A select, update or delete statement failed
    #[error("Query failed: {context}")]
    Query {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    /// The secure random source could not be initialised
    #[error("Secure random source unavailable: {context}")]
    Randomness {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Configuration or validation error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A pipeline stage failed and the run was aborted
    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<AnonymiseError>,
    },
}

/// Convenience type alias for Results with AnonymiseError
pub type Result<T> = std::result::Result<T, AnonymiseError>;

impl AnonymiseError {
    /// Creates an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates an I/O error describing an operation on `path`
    pub fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("{} '{}'", action, path.display()), source)
    }

    /// Creates a snapshot copy error with context
    pub fn copy_failed(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Copy {
            context: context.into(),
            source,
        }
    }

    /// Creates a query error with context
    pub fn query_failed(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Query {
            context: context.into(),
            source,
        }
    }

    /// Creates a randomness error from the underlying OS error
    pub fn randomness<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Randomness {
            context: "failed to seed generator from the operating system".to_string(),
            source: Box::new(error),
        }
    }

    /// Creates a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wraps an error with the name of the stage it aborted
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// Returns the originating error, looking through stage wrappers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use dbanon_core::AnonymiseError;
    ///
    /// let err = AnonymiseError::configuration("bad").in_stage("scenes");
    /// assert!(matches!(err.root(), AnonymiseError::Configuration { .. }));
    /// ```
    pub fn root(&self) -> &Self {
        match self {
            Self::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Name of the stage that failed, if the error came from the pipeline
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// True if the underlying database error is a UNIQUE constraint violation
    pub fn is_unique_violation(&self) -> bool {
        match self.root() {
            Self::Query {
                source: sqlx::Error::Database(db_err),
                ..
            } => db_err.is_unique_violation(),
            _ => false,
        }
    }
}
