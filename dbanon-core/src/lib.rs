//! Anonymisation engine for SQLite media-library stores.
//!
//! Produces a redacted copy of a store that can be shared for debugging:
//! free text is replaced by random text of the same shape, binary payloads and
//! external identifiers are removed, folder paths are rebuilt from ids. Row
//! counts, keys, tree shape and value equality (shared fingerprints, codes,
//! marker titles) survive.
//!
//! # Guarantees
//! - The source store is opened read-only and never modified
//! - A failed run leaves no file at the destination
//! - Replacement text comes from an OS-seeded cryptographic generator; two
//!   runs over the same source produce unrelated output
//!
//! # Example
//! ```rust,no_run
//! use dbanon_core::{Anonymiser, AnonymiserConfig};
//! use std::path::Path;
//!
//! # async fn example() -> dbanon_core::Result<()> {
//! let anonymiser = Anonymiser::new(AnonymiserConfig::default())?;
//! anonymiser
//!     .anonymise(Path::new("library.sqlite"), Path::new("shareable.sqlite"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod anonymiser;
pub mod config;
pub mod error;
pub mod logging;
pub mod obfuscate;
pub mod paths;
pub mod pipeline;
pub mod scan;
pub mod schema;
pub mod snapshot;
pub mod sql;
pub mod strip;

pub use anonymiser::Anonymiser;
pub use config::{AliasTable, AnonymiserConfig, ColumnRef};
pub use error::{AnonymiseError, Result};
pub use pipeline::{Pipeline, RunReport, RunState, Stage, StageContext, StageRecord, StageState};
pub use snapshot::{WorkingStore, create_working_copy};
