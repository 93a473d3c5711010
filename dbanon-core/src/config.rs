//! Anonymisation run configuration.
//!
//! The engine knows the shape of the entity tables it rewrites (see
//! [`crate::schema`]). What varies between store versions is kept here: which
//! columns only reference binary payloads, which tables hold identifiers from
//! external services, and which alias tables hang off which entity table.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// A `(table, column)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Table name
    pub table: String,
    /// Column name
    pub column: String,
}

impl ColumnRef {
    /// Creates a new column reference.
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// A table of aliases owned by rows of an entity table.
///
/// Alias rows are keyed by `(owner_column, alias_column)`; several aliases may
/// share one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasTable {
    /// Alias table name
    pub table: String,
    /// Entity table whose stage also rewrites this alias table
    pub owner_table: String,
    /// Column referencing the owning entity
    pub owner_column: String,
    /// Column holding the alias text
    pub alias_column: String,
}

impl AliasTable {
    /// Creates an alias table description using the `alias` column.
    pub fn new(
        table: impl Into<String>,
        owner_table: impl Into<String>,
        owner_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_table: owner_table.into(),
            owner_column: owner_column.into(),
            alias_column: "alias".to_string(),
        }
    }
}

/// Configuration for an anonymisation run.
///
/// # Example
/// ```rust
/// use dbanon_core::AnonymiserConfig;
///
/// let config = AnonymiserConfig::new()
///     .with_page_size(500)
///     .with_path_separator("/");
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymiserConfig {
    /// Rows fetched per page transaction
    pub page_size: u32,
    /// Emit a progress log line every this many rows
    pub log_every: u64,
    /// Separator placed between identifiers in rewritten folder paths
    pub path_separator: String,
    /// Run ANALYZE and VACUUM after all stages
    pub compact: bool,
    /// Zero freed pages while rewriting (`PRAGMA secure_delete`)
    pub secure_delete: bool,
    /// Columns referencing binary payloads; set to NULL
    pub blob_columns: Vec<ColumnRef>,
    /// Tables storing binary payloads; emptied
    pub blob_tables: Vec<String>,
    /// Tables holding identifiers from external services; emptied
    pub external_id_tables: Vec<String>,
    /// Alias tables anonymised after their owning entity table
    pub alias_tables: Vec<AliasTable>,
}

impl Default for AnonymiserConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            log_every: 10_000,
            path_separator: std::path::MAIN_SEPARATOR_STR.to_string(),
            compact: true,
            secure_delete: true,
            blob_columns: vec![
                ColumnRef::new("tags", "image_blob"),
                ColumnRef::new("studios", "image_blob"),
                ColumnRef::new("performers", "image_blob"),
                ColumnRef::new("scenes", "cover_blob"),
                ColumnRef::new("movies", "front_image_blob"),
                ColumnRef::new("movies", "back_image_blob"),
            ],
            blob_tables: vec!["blobs".to_string()],
            external_id_tables: vec![
                "scene_stash_ids".to_string(),
                "studio_stash_ids".to_string(),
                "performer_stash_ids".to_string(),
            ],
            alias_tables: vec![
                AliasTable::new("performer_aliases", "performers", "performer_id"),
                AliasTable::new("studio_aliases", "studios", "studio_id"),
                AliasTable::new("tag_aliases", "tags", "tag_id"),
            ],
        }
    }
}

impl AnonymiserConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| crate::AnonymiseError::io_at("failed to read config", path, e))?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            crate::AnonymiseError::configuration(format!(
                "invalid config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values.
    ///
    /// # Errors
    /// Returns error if a size is zero, the separator is empty, or any
    /// table/column identifier is empty or contains a NUL character.
    pub fn validate(&self) -> crate::Result<()> {
        if self.page_size == 0 {
            return Err(crate::AnonymiseError::configuration(
                "page_size must be greater than 0",
            ));
        }

        if self.log_every == 0 {
            return Err(crate::AnonymiseError::configuration(
                "log_every must be greater than 0",
            ));
        }

        if self.path_separator.is_empty() {
            return Err(crate::AnonymiseError::configuration(
                "path_separator cannot be empty",
            ));
        }

        for column in &self.blob_columns {
            validate_identifier("blob_columns.table", &column.table)?;
            validate_identifier("blob_columns.column", &column.column)?;
        }
        for table in &self.blob_tables {
            validate_identifier("blob_tables", table)?;
        }
        for table in &self.external_id_tables {
            validate_identifier("external_id_tables", table)?;
        }
        for alias in &self.alias_tables {
            validate_identifier("alias_tables.table", &alias.table)?;
            validate_identifier("alias_tables.owner_table", &alias.owner_table)?;
            validate_identifier("alias_tables.owner_column", &alias.owner_column)?;
            validate_identifier("alias_tables.alias_column", &alias.alias_column)?;
        }

        Ok(())
    }

    /// Alias tables owned by `table`.
    pub fn aliases_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a AliasTable> + 'a {
        self.alias_tables
            .iter()
            .filter(move |alias| alias.owner_table == table)
    }

    /// Builder method to set the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Builder method to set the progress log interval.
    pub fn with_log_every(mut self, rows: u64) -> Self {
        self.log_every = rows;
        self
    }

    /// Builder method to set the folder path separator.
    pub fn with_path_separator(mut self, separator: impl Into<String>) -> Self {
        self.path_separator = separator.into();
        self
    }

    /// Builder method to enable/disable the final compaction stage.
    pub fn with_compaction(mut self, enabled: bool) -> Self {
        self.compact = enabled;
        self
    }

    /// Adds a blob-reference column to null out.
    pub fn add_blob_column(mut self, column: ColumnRef) -> Self {
        self.blob_columns.push(column);
        self
    }

    /// Adds an external-id table to empty.
    pub fn add_external_id_table(mut self, table: impl Into<String>) -> Self {
        self.external_id_tables.push(table.into());
        self
    }
}

fn validate_identifier(field: &str, name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::AnonymiseError::configuration(format!(
            "{} entries cannot be empty",
            field
        )));
    }
    if name.contains('\0') {
        return Err(crate::AnonymiseError::configuration(format!(
            "{} entries cannot contain NUL characters",
            field
        )));
    }
    Ok(())
}
