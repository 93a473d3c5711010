//! Built-in stages of the standard pipeline.

use super::{Stage, StageContext};
use crate::config::AliasTable;
use crate::error::{AnonymiseError, Result};
use crate::obfuscate::{Alphabet, Obfuscator};
use crate::paths;
use crate::scan::{self, Paging, RowVisitor, ScanSpec};
use crate::schema::{EntitySpec, FileTable, FolderTable};
use crate::sql::{ColumnPatch, SqlValue};
use crate::strip;
use async_trait::async_trait;
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteRow;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Attempts at an alias replacement that does not clash with another alias
/// of the same owner.
const MAX_ALIAS_ATTEMPTS: usize = 8;

/// Nulls binary payload columns and empties payload tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripBlobs;

#[async_trait]
impl Stage for StripBlobs {
    fn name(&self) -> &str {
        "blobs"
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<u64> {
        strip::strip_blobs(ctx.pool, &ctx.config.blob_columns, &ctx.config.blob_tables).await
    }
}

/// Empties the tables of identifiers issued by external services.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteExternalIds;

#[async_trait]
impl Stage for DeleteExternalIds {
    fn name(&self) -> &str {
        "external ids"
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<u64> {
        strip::delete_external_ids(ctx.pool, &ctx.config.external_id_tables).await
    }
}

/// Rebuilds folder paths from folder ids.
#[derive(Debug, Clone, Copy)]
pub struct Folders {
    table: FolderTable,
}

impl Folders {
    /// Stage over `table`.
    pub const fn new(table: FolderTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Stage for Folders {
    fn name(&self) -> &str {
        "folders"
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<u64> {
        let counts =
            paths::rewrite_folder_paths(ctx.pool, &self.table, &ctx.config.path_separator).await?;
        Ok(counts.total())
    }
}

/// Replaces file base names with file ids.
#[derive(Debug, Clone, Copy)]
pub struct Files {
    table: FileTable,
}

impl Files {
    /// Stage over `table`.
    pub const fn new(table: FileTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Stage for Files {
    fn name(&self) -> &str {
        "files"
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<u64> {
        paths::rewrite_file_basenames(ctx.pool, &self.table).await
    }
}

/// Scans one entity table, then each alias table it owns.
#[derive(Debug, Clone, Copy)]
pub struct EntityStage {
    entity: EntitySpec,
}

impl EntityStage {
    /// Stage over `entity`.
    pub const fn new(entity: EntitySpec) -> Self {
        Self { entity }
    }
}

#[async_trait]
impl Stage for EntityStage {
    fn name(&self) -> &str {
        self.entity.name
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<u64> {
        let paging = Paging::from_config(ctx.config);
        let columns = self.entity.read_columns();
        let spec = ScanSpec {
            table: self.entity.table,
            key_columns: self.entity.key_columns,
            columns: &columns,
        };

        let mut visitor = EntityVisitor {
            entity: &self.entity,
            obfuscator: &mut *ctx.obfuscator,
            produced: HashMap::new(),
        };
        let mut total = scan::scan(ctx.pool, &spec, paging, &mut visitor).await?;
        info!("Anonymised {} {}", total, self.entity.table);

        for alias in ctx.config.aliases_of(self.entity.table) {
            let rows = anonymise_aliases(ctx.pool, alias, paging, &mut *ctx.obfuscator).await?;
            info!("Anonymised {} {}", rows, alias.table);
            total += rows;
        }
        Ok(total)
    }
}

/// Visits entity rows: per-row columns get a fresh patch, shared columns are
/// replaced by value across the whole table.
struct EntityVisitor<'a> {
    entity: &'a EntitySpec,
    obfuscator: &'a mut Obfuscator,
    /// Replacements this stage wrote per shared column. A shared update
    /// rewrites rows the cursor has not reached yet; those rows must not be
    /// replaced a second time.
    produced: HashMap<&'static str, HashSet<String>>,
}

#[async_trait]
impl RowVisitor for EntityVisitor<'_> {
    async fn visit(&mut self, conn: &mut SqliteConnection, row: &SqliteRow) -> Result<()> {
        let mut key = Vec::with_capacity(self.entity.key_columns.len());
        for column in self.entity.key_columns {
            let value = SqlValue::decode(row, column)?.ok_or_else(|| {
                AnonymiseError::configuration(format!(
                    "{}.{} is NULL and cannot identify a row",
                    self.entity.table, column
                ))
            })?;
            key.push((*column, value));
        }
        let filter: Vec<(&str, &SqlValue)> = key.iter().map(|(c, v)| (*c, v)).collect();

        if !self.entity.row_columns.is_empty() {
            self.obfuscator
                .anonymise_row_columns(
                    conn,
                    self.entity.table,
                    &filter,
                    row,
                    self.entity.row_columns,
                )
                .await?;
        }

        for shared in self.entity.shared_columns {
            let Some(value) = SqlValue::decode(row, shared.column)? else {
                continue;
            };
            let value = Zeroizing::new(value);
            let produced = self.produced.entry(shared.column).or_default();
            if produced.contains(&*value.as_text()) {
                continue;
            }
            if let Some(replacement) = self
                .obfuscator
                .anonymise_shared_value(conn, self.entity.table, shared.column, &value, shared.alphabet)
                .await?
            {
                produced.insert(replacement);
            }
        }
        Ok(())
    }
}

/// Replaces every alias in `alias` one (owner, alias) row at a time.
///
/// Returns the number of aliases rewritten; re-visits of already rewritten
/// aliases are not counted.
async fn anonymise_aliases(
    pool: &sqlx::SqlitePool,
    alias: &AliasTable,
    paging: Paging,
    obfuscator: &mut Obfuscator,
) -> Result<u64> {
    let key_columns = [alias.owner_column.as_str(), alias.alias_column.as_str()];
    let spec = ScanSpec {
        table: &alias.table,
        key_columns: &key_columns,
        columns: &[],
    };
    let mut visitor = AliasVisitor {
        alias,
        obfuscator,
        owner: None,
        rewritten: HashSet::new(),
        rewrites: 0,
    };
    scan::scan(pool, &spec, paging, &mut visitor).await?;
    Ok(visitor.rewrites)
}

/// Visits alias rows ordered by (owner, alias).
///
/// A rewritten alias may sort after the cursor and come up again within the
/// same owner; those are remembered until the owner changes.
struct AliasVisitor<'a> {
    alias: &'a AliasTable,
    obfuscator: &'a mut Obfuscator,
    owner: Option<SqlValue>,
    rewritten: HashSet<String>,
    rewrites: u64,
}

#[async_trait]
impl RowVisitor for AliasVisitor<'_> {
    async fn visit(&mut self, conn: &mut SqliteConnection, row: &SqliteRow) -> Result<()> {
        let table = self.alias.table.as_str();
        let owner = SqlValue::decode(row, &self.alias.owner_column)?.ok_or_else(|| {
            AnonymiseError::configuration(format!(
                "{}.{} is NULL and cannot identify an alias",
                table, self.alias.owner_column
            ))
        })?;
        if self.owner.as_ref() != Some(&owner) {
            self.rewritten.clear();
            self.owner = Some(owner.clone());
        }

        let Some(original) = SqlValue::decode(row, &self.alias.alias_column)? else {
            return Ok(());
        };
        let original = Zeroizing::new(original);
        let text = Zeroizing::new(original.as_text().into_owned());
        if self.rewritten.contains(text.as_str()) {
            return Ok(());
        }

        let filter = [
            (self.alias.owner_column.as_str(), &owner),
            (self.alias.alias_column.as_str(), &*original),
        ];

        for attempt in 1..=MAX_ALIAS_ATTEMPTS {
            let mut patch = ColumnPatch::new();
            let replacement = self.obfuscator.obfuscate(&text, Alphabet::Alphanumeric);
            patch.set(&self.alias.alias_column, replacement.clone());
            let Some(mut stmt) = patch.update_statement(table, &filter) else {
                return Ok(());
            };

            match stmt
                .build()
                .execute(&mut *conn)
                .await
                .map_err(|e| AnonymiseError::query_failed(format!("anonymising {}", table), e))
            {
                Ok(_) => {
                    self.rewritten.insert(replacement);
                    self.rewrites += 1;
                    return Ok(());
                }
                Err(e) if e.is_unique_violation() && attempt < MAX_ALIAS_ATTEMPTS => {
                    debug!(table, attempt, "Alias replacement clashed, regenerating");
                }
                Err(e) => {
                    if e.is_unique_violation() {
                        warn!(table, "No free alias replacement after {} attempts", attempt);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Refreshes planner statistics and rebuilds the file so freed pages holding
/// original content are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compact;

#[async_trait]
impl Stage for Compact {
    fn name(&self) -> &str {
        "compaction"
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<u64> {
        sqlx::query("ANALYZE")
            .execute(ctx.pool)
            .await
            .map_err(|e| AnonymiseError::query_failed("analysing working copy", e))?;
        sqlx::query("VACUUM")
            .execute(ctx.pool)
            .await
            .map_err(|e| AnonymiseError::query_failed("compacting working copy", e))?;
        Ok(0)
    }
}
