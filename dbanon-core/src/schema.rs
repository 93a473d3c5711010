//! Tables of the media-library store and how each one is anonymised.
//!
//! Binary payload columns, external-id tables and alias tables vary between
//! store versions and live in [`crate::AnonymiserConfig`]; the entity tables
//! below are fixed.

use crate::obfuscate::Alphabet;

/// Tree-shaped folder table.
#[derive(Debug, Clone, Copy)]
pub struct FolderTable {
    /// Table name
    pub table: &'static str,
    /// Integer primary key
    pub id_column: &'static str,
    /// Parent reference, NULL for roots
    pub parent_column: &'static str,
    /// Full path, rewritten from ids
    pub path_column: &'static str,
}

/// File table whose base names are replaced by ids.
#[derive(Debug, Clone, Copy)]
pub struct FileTable {
    /// Table name
    pub table: &'static str,
    /// Integer primary key
    pub id_column: &'static str,
    /// Base name column
    pub name_column: &'static str,
}

/// A column whose values are replaced by value rather than by row.
#[derive(Debug, Clone, Copy)]
pub struct SharedColumn {
    /// Column name
    pub column: &'static str,
    /// Replacement alphabet
    pub alphabet: Alphabet,
}

impl SharedColumn {
    const fn text(column: &'static str) -> Self {
        Self {
            column,
            alphabet: Alphabet::Alphanumeric,
        }
    }
}

/// An entity table walked by the cursor scanner.
#[derive(Debug, Clone, Copy)]
pub struct EntitySpec {
    /// Stage name and log label
    pub name: &'static str,
    /// Table name
    pub table: &'static str,
    /// Ordered unique key
    pub key_columns: &'static [&'static str],
    /// Free-text columns obfuscated independently for each row
    pub row_columns: &'static [&'static str],
    /// Columns whose equal values must stay equal after anonymisation
    pub shared_columns: &'static [SharedColumn],
}

impl EntitySpec {
    /// Every column the scan must read besides the key.
    pub fn read_columns(&self) -> Vec<&'static str> {
        self.row_columns
            .iter()
            .copied()
            .chain(self.shared_columns.iter().map(|c| c.column))
            .collect()
    }
}

/// Folder hierarchy
pub const FOLDERS: FolderTable = FolderTable {
    table: "folders",
    id_column: "id",
    parent_column: "parent_folder_id",
    path_column: "path",
};

/// Files
pub const FILES: FileTable = FileTable {
    table: "files",
    id_column: "id",
    name_column: "basename",
};

/// Content fingerprints; one row per (file, fingerprint type), and the same
/// hash on many files when files are duplicates.
pub const FINGERPRINTS: EntitySpec = EntitySpec {
    name: "fingerprints",
    table: "files_fingerprints",
    key_columns: &["file_id", "type"],
    row_columns: &[],
    shared_columns: &[SharedColumn {
        column: "fingerprint",
        alphabet: Alphabet::Hexadecimal,
    }],
};

/// Scenes
pub const SCENES: EntitySpec = EntitySpec {
    name: "scenes",
    table: "scenes",
    key_columns: &["id"],
    row_columns: &["title", "details", "url"],
    shared_columns: &[SharedColumn::text("code"), SharedColumn::text("director")],
};

/// Scene markers; marker titles repeat across scenes
pub const SCENE_MARKERS: EntitySpec = EntitySpec {
    name: "scene markers",
    table: "scene_markers",
    key_columns: &["id"],
    row_columns: &[],
    shared_columns: &[SharedColumn::text("title")],
};

/// Images
pub const IMAGES: EntitySpec = EntitySpec {
    name: "images",
    table: "images",
    key_columns: &["id"],
    row_columns: &["title", "url"],
    shared_columns: &[],
};

/// Galleries
pub const GALLERIES: EntitySpec = EntitySpec {
    name: "galleries",
    table: "galleries",
    key_columns: &["id"],
    row_columns: &["title", "details"],
    shared_columns: &[],
};

/// Performers
pub const PERFORMERS: EntitySpec = EntitySpec {
    name: "performers",
    table: "performers",
    key_columns: &["id"],
    row_columns: &[
        "name",
        "details",
        "url",
        "twitter",
        "instagram",
        "tattoos",
        "piercings",
    ],
    shared_columns: &[],
};

/// Studios
pub const STUDIOS: EntitySpec = EntitySpec {
    name: "studios",
    table: "studios",
    key_columns: &["id"],
    row_columns: &["name", "url", "details"],
    shared_columns: &[],
};

/// Tags
pub const TAGS: EntitySpec = EntitySpec {
    name: "tags",
    table: "tags",
    key_columns: &["id"],
    row_columns: &["name", "description"],
    shared_columns: &[],
};

/// Movies
pub const MOVIES: EntitySpec = EntitySpec {
    name: "movies",
    table: "movies",
    key_columns: &["id"],
    row_columns: &["name", "aliases", "synopsis", "url", "director"],
    shared_columns: &[],
};

/// Entity tables in the order their stages run.
pub const ENTITIES: &[EntitySpec] = &[
    FINGERPRINTS,
    SCENES,
    SCENE_MARKERS,
    IMAGES,
    GALLERIES,
    PERFORMERS,
    STUDIOS,
    TAGS,
    MOVIES,
];
