//! Shape-preserving obfuscation of sensitive text.
//!
//! [`Obfuscator::obfuscate`] replaces every non-whitespace character with a
//! symbol drawn uniformly from an [`Alphabet`], keeping length and whitespace
//! layout. The database helpers on top of it apply replacements either per
//! row ([`Obfuscator::anonymise_row_columns`]) or per distinct value
//! ([`Obfuscator::anonymise_shared_value`]), the latter keeping rows that
//! shared an original value equal to each other afterwards.
//!
//! # Security
//! - The generator is a ChaCha-based `StdRng` seeded from the operating
//!   system; failure to seed is fatal
//! - Originals read from the store are held in `Zeroizing` buffers
//! - Two runs never share generator state, so outputs are unlinkable

use crate::error::{AnonymiseError, Result};
use crate::sql::{self, ColumnPatch, SqlValue};
use rand::{Rng, SeedableRng, rngs::StdRng};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteRow;
use zeroize::Zeroizing;

/// How many replacement candidates to try before accepting one that
/// already occurs in the column.
const MAX_REPLACEMENT_ATTEMPTS: usize = 8;

/// Symbol set used for replacement characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    /// `a-z`, `A-Z`, `0-9`; free text
    Alphanumeric,
    /// `0-9`, `a-f`; content-hash fingerprints
    Hexadecimal,
}

impl Alphabet {
    /// The symbols of this alphabet.
    pub const fn symbols(self) -> &'static [u8] {
        match self {
            Self::Alphanumeric => b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789",
            Self::Hexadecimal => b"0123456789abcdef",
        }
    }

    /// True if `c` belongs to this alphabet.
    pub fn contains(self, c: char) -> bool {
        c.is_ascii() && self.symbols().contains(&(c as u8))
    }
}

/// Random replacement generator.
pub struct Obfuscator {
    rng: StdRng,
}

impl std::fmt::Debug for Obfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Generator state is intentionally omitted
        f.debug_struct("Obfuscator").finish_non_exhaustive()
    }
}

impl Obfuscator {
    /// Creates an obfuscator seeded from the operating system.
    ///
    /// # Errors
    /// Returns [`AnonymiseError::Randomness`] if the OS random source is
    /// unavailable. This is never retried.
    pub fn from_os_rng() -> Result<Self> {
        let rng = StdRng::try_from_os_rng().map_err(AnonymiseError::randomness)?;
        Ok(Self { rng })
    }

    /// Deterministic generator for tests that need to predict replacements.
    #[cfg(test)]
    pub(crate) fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Returns `text` with every non-whitespace character replaced by a
    /// random symbol from `alphabet`.
    ///
    /// # Example
    /// ```rust
    /// use dbanon_core::obfuscate::{Alphabet, Obfuscator};
    ///
    /// let mut obfuscator = Obfuscator::from_os_rng().unwrap();
    /// let out = obfuscator.obfuscate("Jane Doe", Alphabet::Alphanumeric);
    ///
    /// assert_eq!(out.chars().count(), 8);
    /// assert_eq!(out.chars().nth(4), Some(' '));
    /// ```
    pub fn obfuscate(&mut self, text: &str, alphabet: Alphabet) -> String {
        let symbols = alphabet.symbols();
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if c.is_whitespace() {
                out.push(c);
            } else {
                let idx = self.rng.random_range(0..symbols.len());
                out.push(char::from(symbols[idx]));
            }
        }
        out
    }

    /// Obfuscates every non-NULL column of `row` named in `columns`.
    pub fn patch_for_row(&mut self, row: &SqliteRow, columns: &[&str]) -> Result<ColumnPatch> {
        let mut patch = ColumnPatch::new();
        for column in columns {
            if let Some(value) = SqlValue::decode(row, column)? {
                let value = Zeroizing::new(value);
                patch.set(column, self.obfuscate(&value.as_text(), Alphabet::Alphanumeric));
            }
        }
        Ok(patch)
    }

    /// Independently obfuscates each named column of one row and writes a
    /// single combined update filtered by `key`.
    ///
    /// A patch rejected by a UNIQUE constraint (short tag or studio names) is
    /// regenerated, up to the same attempt limit as shared values.
    ///
    /// Returns `false` when every named column was NULL and nothing was
    /// written.
    pub async fn anonymise_row_columns(
        &mut self,
        conn: &mut SqliteConnection,
        table: &str,
        key: &[(&str, &SqlValue)],
        row: &SqliteRow,
        columns: &[&str],
    ) -> Result<bool> {
        for attempt in 1..=MAX_REPLACEMENT_ATTEMPTS {
            let patch = self.patch_for_row(row, columns)?;
            let Some(mut stmt) = patch.update_statement(table, key) else {
                return Ok(false);
            };

            match stmt
                .build()
                .execute(&mut *conn)
                .await
                .map_err(|e| AnonymiseError::query_failed(format!("anonymising {}", table), e))
            {
                Ok(_) => return Ok(true),
                Err(e) if e.is_unique_violation() && attempt < MAX_REPLACEMENT_ATTEMPTS => {
                    tracing::debug!(table, attempt, "Row replacement clashed, regenerating");
                }
                Err(e) => {
                    if e.is_unique_violation() {
                        tracing::warn!(table, "No free row replacement after {} attempts", attempt);
                    }
                    return Err(e);
                }
            }
        }
        Ok(false)
    }

    /// Replaces `value` in `column` of every row of `table` with one freshly
    /// generated replacement, and returns that replacement.
    ///
    /// The replacement is regenerated while it already occurs in the column,
    /// so distinct originals stay distinct. Whitespace-only values have no
    /// replacement and are returned as they are.
    ///
    /// Returns `None` without generating anything when no row holds `value`
    /// any more, which is the case for rows of a page read before an earlier
    /// row's shared update rewrote them.
    pub async fn anonymise_shared_value(
        &mut self,
        conn: &mut SqliteConnection,
        table: &str,
        column: &str,
        value: &SqlValue,
        alphabet: Alphabet,
    ) -> Result<Option<String>> {
        let text = Zeroizing::new(value.as_text().into_owned());
        if text.chars().all(char::is_whitespace) {
            return Ok(Some(text.to_string()));
        }
        if !column_holds(conn, table, column, value).await? {
            return Ok(None);
        }

        let replacement = self
            .unused_replacement(conn, table, column, &text, alphabet)
            .await?;

        sql::replace_value(table, column, replacement.clone(), value)
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| AnonymiseError::query_failed(format!("anonymising {}", column), e))?;

        Ok(Some(replacement))
    }

    async fn unused_replacement(
        &mut self,
        conn: &mut SqliteConnection,
        table: &str,
        column: &str,
        text: &str,
        alphabet: Alphabet,
    ) -> Result<String> {
        let mut candidate = self.obfuscate(text, alphabet);
        for _ in 1..MAX_REPLACEMENT_ATTEMPTS {
            let taken = SqlValue::Text(candidate.clone());
            if !column_holds(conn, table, column, &taken).await? {
                return Ok(candidate);
            }
            candidate = self.obfuscate(text, alphabet);
        }

        tracing::warn!(
            table,
            column,
            "No unused replacement found after {} attempts; values may merge",
            MAX_REPLACEMENT_ATTEMPTS
        );
        Ok(candidate)
    }
}

/// True if some row of `table` has `value` in `column`.
async fn column_holds(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    value: &SqlValue,
) -> Result<bool> {
    let found: i64 = sql::value_exists(table, column, value)
        .build_query_scalar()
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AnonymiseError::query_failed(format!("looking up {}.{}", table, column), e))?;
    Ok(found != 0)
}
