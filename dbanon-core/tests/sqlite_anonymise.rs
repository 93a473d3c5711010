//! End-to-end anonymisation tests on SQLite library files.
//!
//! This test suite covers:
//! - A full run over a small but complete media library
//! - Folder path rebuilding and file renaming
//! - Shared values (fingerprints, codes, marker titles) staying shared
//! - Alias tables of performers, studios and tags
//! - Blob and external id removal
//! - Source immutability and cleanup after failures
//! - Unlinkability of two runs over the same source

use async_trait::async_trait;
use dbanon_core::pipeline::{EntityStage, StripBlobs};
use dbanon_core::{
    AnonymiseError, Anonymiser, AnonymiserConfig, ColumnRef, Pipeline, Result, RunState, Stage,
    StageContext, StageState, schema,
};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const LIBRARY_SCHEMA: &str = "
CREATE TABLE blobs (checksum TEXT PRIMARY KEY, blob BLOB);
CREATE TABLE folders (id INTEGER PRIMARY KEY, path TEXT NOT NULL UNIQUE, parent_folder_id INTEGER);
CREATE TABLE files (id INTEGER PRIMARY KEY, basename TEXT NOT NULL, parent_folder_id INTEGER NOT NULL);
CREATE TABLE files_fingerprints (file_id INTEGER NOT NULL, type TEXT NOT NULL,
    fingerprint BLOB NOT NULL, PRIMARY KEY (file_id, type));
CREATE TABLE scenes (id INTEGER PRIMARY KEY, title TEXT, details TEXT, url TEXT, code TEXT,
    director TEXT, cover_blob TEXT);
CREATE TABLE scene_markers (id INTEGER PRIMARY KEY, title TEXT NOT NULL, scene_id INTEGER NOT NULL);
CREATE TABLE images (id INTEGER PRIMARY KEY, title TEXT, url TEXT);
CREATE TABLE galleries (id INTEGER PRIMARY KEY, title TEXT, details TEXT);
CREATE TABLE performers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, details TEXT, url TEXT,
    twitter TEXT, instagram TEXT, tattoos TEXT, piercings TEXT, image_blob TEXT);
CREATE TABLE performer_aliases (performer_id INTEGER NOT NULL, alias TEXT NOT NULL,
    PRIMARY KEY (performer_id, alias));
CREATE TABLE studios (id INTEGER PRIMARY KEY, name TEXT NOT NULL, url TEXT, details TEXT,
    image_blob TEXT);
CREATE TABLE studio_aliases (studio_id INTEGER NOT NULL, alias TEXT NOT NULL,
    PRIMARY KEY (studio_id, alias));
CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL, description TEXT, image_blob TEXT);
CREATE TABLE tag_aliases (tag_id INTEGER NOT NULL, alias TEXT NOT NULL,
    PRIMARY KEY (tag_id, alias));
CREATE TABLE movies (id INTEGER PRIMARY KEY, name TEXT NOT NULL, aliases TEXT, synopsis TEXT,
    url TEXT, director TEXT, front_image_blob TEXT, back_image_blob TEXT);
CREATE TABLE scene_stash_ids (scene_id INTEGER, endpoint TEXT, stash_id TEXT);
CREATE TABLE studio_stash_ids (studio_id INTEGER, endpoint TEXT, stash_id TEXT);
CREATE TABLE performer_stash_ids (performer_id INTEGER, endpoint TEXT, stash_id TEXT);
";

const LIBRARY_DATA: &str = "
INSERT INTO blobs VALUES ('c0ffee', x'89504e47'), ('beef', x'ffd8ffe0');
INSERT INTO folders VALUES
    (5, '/home/wendy/library', NULL),
    (9, '/home/wendy/library/holidays', 5),
    (11, '/home/wendy/library/holidays/lanzarote', 9),
    (14, '/mnt/nas-secret', NULL);
INSERT INTO files VALUES
    (1, 'wendy-lanzarote-beach.mp4', 11),
    (2, 'wendy-lanzarote-beach copy.mp4', 11),
    (3, 'nas-private-clip.mkv', 14);
INSERT INTO files_fingerprints VALUES
    (1, 'md5', 'abcd1234ef567890abcd1234ef567890'),
    (1, 'phash', 8070450532247928832),
    (2, 'md5', 'abcd1234ef567890abcd1234ef567890'),
    (2, 'phash', 8070450532247928832),
    (3, 'md5', '0123456789abcdef0123456789abcdef');
INSERT INTO scenes VALUES
    (1, 'Wendy Lanzarote Beach', 'Filmed by Wendy in Lanzarote', 'https://example.com/wendy',
        'WND-001', 'Quentin Privatename', 'c0ffee'),
    (2, 'Wendy Lanzarote Beach', NULL, NULL, 'WND-001', 'Quentin Privatename', NULL),
    (3, 'NAS Private Clip', NULL, NULL, NULL, NULL, 'beef');
INSERT INTO scene_markers VALUES (1, 'Sunset Moment', 1), (2, 'Sunset Moment', 2), (3, 'Dinner', 3);
INSERT INTO images VALUES (1, 'Wendy Portrait', 'https://example.com/portrait');
INSERT INTO galleries VALUES (1, 'Lanzarote Trip Album', 'Summer with Wendy');
INSERT INTO performers VALUES
    (1, 'Wendy Secretname', 'Born in Leeds', 'https://wendy.example', '@wendy_s', 'wendy.s',
        'rose on ankle', NULL, 'c0ffee'),
    (2, 'Marcus Hiddenperson', NULL, NULL, NULL, NULL, NULL, 'left ear', NULL);
INSERT INTO performer_aliases VALUES (1, 'Wendy S'), (1, 'Wenders'), (2, 'Marky Mark');
INSERT INTO studios VALUES (1, 'Backyard Productions Ltd', 'https://backyard.example', NULL, 'beef');
INSERT INTO studio_aliases VALUES (1, 'Backyard Prod'), (1, 'BYP');
INSERT INTO tags VALUES (1, 'Lanzarote', 'Canary island trips', 'c0ffee'), (2, 'Beach', NULL, NULL);
INSERT INTO tag_aliases VALUES (1, 'Lanza'), (2, 'Seaside');
INSERT INTO movies VALUES (1, 'Wendy Summer Movie', 'WSM', 'A summer with Wendy',
    'https://movie.example', 'Quentin Privatename', 'c0ffee', 'beef');
INSERT INTO scene_stash_ids VALUES (1, 'https://stashdb.org/graphql', 'a1b2c3d4-secret');
INSERT INTO studio_stash_ids VALUES (1, 'https://stashdb.org/graphql', 'e5f6-secret');
INSERT INTO performer_stash_ids VALUES (1, 'https://stashdb.org/graphql', 'g7h8-secret');
";

/// Original strings that must not appear anywhere in an anonymised file.
const SECRETS: &[&str] = &[
    "Wendy",
    "wendy",
    "Lanzarote",
    "lanzarote",
    "Secretname",
    "Hiddenperson",
    "Privatename",
    "Backyard",
    "nas-secret",
    "a1b2c3d4-secret",
    "abcd1234ef567890",
    "Marky Mark",
    "Sunset Moment",
];

/// Tables whose row counts must survive anonymisation.
const KEPT_TABLES: &[&str] = &[
    "folders",
    "files",
    "files_fingerprints",
    "scenes",
    "scene_markers",
    "images",
    "galleries",
    "performers",
    "performer_aliases",
    "studios",
    "studio_aliases",
    "tags",
    "tag_aliases",
    "movies",
];

// =============================================================================
// Helpers
// =============================================================================

/// Creates the fixture library in `dir` and returns its path.
async fn create_library(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("library.sqlite");
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::raw_sql(LIBRARY_SCHEMA).execute(&pool).await.unwrap();
    sqlx::raw_sql(LIBRARY_DATA).execute(&pool).await.unwrap();
    pool.close().await;
    path
}

async fn open(path: &Path) -> SqlitePool {
    let options = SqliteConnectOptions::new().filename(path).read_only(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap()
}

async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn texts(pool: &SqlitePool, query: &str) -> Vec<Option<String>> {
    sqlx::query_scalar(query).fetch_all(pool).await.unwrap()
}

fn config() -> AnonymiserConfig {
    AnonymiserConfig::default()
        .with_path_separator("/")
        .with_page_size(2)
}

/// A stage that always fails.
struct Explode;

#[async_trait]
impl Stage for Explode {
    fn name(&self) -> &str {
        "explode"
    }

    async fn run(&self, _ctx: &mut StageContext<'_>) -> Result<u64> {
        Err(AnonymiseError::configuration("injected failure"))
    }
}

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test]
async fn test_sqlite_full_run_keeps_structure() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let dest = dir.path().join("anonymous.sqlite");
    let before = std::fs::read(&source).unwrap();

    let report = Anonymiser::new(config())?.anonymise(&source, &dest).await?;

    assert_eq!(report.state, RunState::Succeeded);
    assert!(report.finished_at.is_some());
    assert_eq!(report.stages.len(), 14);
    assert!(report.stages.iter().all(|s| s.state == StageState::Succeeded));
    assert_eq!(std::fs::read(&source).unwrap(), before);

    let original = open(&source).await;
    let anonymised = open(&dest).await;
    for table in KEPT_TABLES {
        assert_eq!(
            count(&original, table).await,
            count(&anonymised, table).await,
            "row count of {} changed",
            table
        );
    }
    for table in ["blobs", "scene_stash_ids", "studio_stash_ids", "performer_stash_ids"] {
        assert_eq!(count(&anonymised, table).await, 0, "{} not emptied", table);
    }

    let blob_refs: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM scenes WHERE cover_blob IS NOT NULL)
              + (SELECT COUNT(*) FROM performers WHERE image_blob IS NOT NULL)
              + (SELECT COUNT(*) FROM studios WHERE image_blob IS NOT NULL)
              + (SELECT COUNT(*) FROM tags WHERE image_blob IS NOT NULL)
              + (SELECT COUNT(*) FROM movies WHERE front_image_blob IS NOT NULL
                    OR back_image_blob IS NOT NULL)",
    )
    .fetch_one(&anonymised)
    .await
    .unwrap();
    assert_eq!(blob_refs, 0);

    original.close().await;
    anonymised.close().await;
    Ok(())
}

#[tokio::test]
async fn test_sqlite_folder_paths_and_file_names() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let dest = dir.path().join("anonymous.sqlite");

    Anonymiser::new(config())?.anonymise(&source, &dest).await?;

    let pool = open(&dest).await;
    let paths: HashMap<i64, String> = sqlx::query_as::<_, (i64, String)>("SELECT id, path FROM folders")
        .fetch_all(&pool)
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(paths[&5], "5");
    assert_eq!(paths[&9], "5/9");
    assert_eq!(paths[&11], "5/9/11");
    assert_eq!(paths[&14], "14");

    let names = texts(&pool, "SELECT basename FROM files ORDER BY id").await;
    assert_eq!(
        names,
        vec![Some("1".to_string()), Some("2".to_string()), Some("3".to_string())]
    );

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_sqlite_shared_values_stay_shared() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let dest = dir.path().join("anonymous.sqlite");

    Anonymiser::new(config())?.anonymise(&source, &dest).await?;
    let pool = open(&dest).await;

    let md5 = texts(
        &pool,
        "SELECT CAST(fingerprint AS TEXT) FROM files_fingerprints WHERE type = 'md5' ORDER BY file_id",
    )
    .await;
    let shared = md5[0].as_deref().unwrap();
    assert_eq!(md5[0], md5[1]);
    assert_ne!(md5[0], md5[2]);
    assert_ne!(shared, "abcd1234ef567890abcd1234ef567890");
    assert_eq!(shared.len(), 32);
    assert!(shared.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    let phash = texts(
        &pool,
        "SELECT CAST(fingerprint AS TEXT) FROM files_fingerprints WHERE type = 'phash' ORDER BY file_id",
    )
    .await;
    assert_eq!(phash[0], phash[1]);
    assert_ne!(phash[0].as_deref(), Some("8070450532247928832"));
    assert_eq!(phash[0].as_deref().unwrap().len(), 19);

    let codes = texts(&pool, "SELECT code FROM scenes ORDER BY id").await;
    assert_eq!(codes[0], codes[1]);
    assert_ne!(codes[0].as_deref(), Some("WND-001"));
    assert_eq!(codes[2], None);

    let markers = texts(&pool, "SELECT title FROM scene_markers ORDER BY id").await;
    assert_eq!(markers[0], markers[1]);
    assert_ne!(markers[0], markers[2]);
    assert_eq!(markers[0].as_deref().unwrap().len(), "Sunset Moment".len());
    assert_eq!(markers[0].as_deref().unwrap().chars().nth(6), Some(' '));

    // Free text is rewritten per row even where originals were equal
    let titles = texts(&pool, "SELECT title FROM scenes ORDER BY id").await;
    assert_ne!(titles[0], titles[1]);

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_sqlite_aliases_rewritten_for_every_owner_type() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let dest = dir.path().join("anonymous.sqlite");

    Anonymiser::new(config())?.anonymise(&source, &dest).await?;
    let pool = open(&dest).await;

    for (table, originals) in [
        ("performer_aliases", &["Wendy S", "Wenders", "Marky Mark"][..]),
        ("studio_aliases", &["Backyard Prod", "BYP"][..]),
        ("tag_aliases", &["Lanza", "Seaside"][..]),
    ] {
        let aliases = texts(&pool, &format!("SELECT alias FROM {}", table)).await;
        assert_eq!(aliases.len(), originals.len());
        for alias in aliases.iter().flatten() {
            assert!(
                !originals.contains(&alias.as_str()),
                "{} kept original alias",
                table
            );
        }
    }

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_sqlite_no_original_text_left_in_file() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let dest = dir.path().join("anonymous.sqlite");

    Anonymiser::new(config())?.anonymise(&source, &dest).await?;

    let bytes = std::fs::read(&dest).unwrap();
    let contents = String::from_utf8_lossy(&bytes);
    for secret in SECRETS {
        assert!(
            !contents.contains(secret),
            "'{}' survived anonymisation",
            secret
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_sqlite_two_runs_are_unlinkable() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let first = dir.path().join("first.sqlite");
    let second = dir.path().join("second.sqlite");

    let anonymiser = Anonymiser::new(config())?;
    anonymiser.anonymise(&source, &first).await?;
    anonymiser.anonymise(&source, &second).await?;

    let a = open(&first).await;
    let b = open(&second).await;
    let query = "SELECT title || '|' || COALESCE(details, '') FROM scenes WHERE id = 1";
    assert_ne!(texts(&a, query).await, texts(&b, query).await);

    let query = "SELECT name FROM performers ORDER BY id";
    assert_ne!(texts(&a, query).await, texts(&b, query).await);

    a.close().await;
    b.close().await;
    Ok(())
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_sqlite_existing_destination_untouched() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let dest = dir.path().join("already-here.sqlite");
    std::fs::write(&dest, b"do not overwrite").unwrap();

    let err = Anonymiser::new(config())?
        .anonymise(&source, &dest)
        .await
        .unwrap_err();

    assert!(matches!(err, AnonymiseError::Io { .. }));
    assert_eq!(std::fs::read(&dest).unwrap(), b"do not overwrite");
    Ok(())
}

#[tokio::test]
async fn test_sqlite_injected_stage_failure_leaves_nothing() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let dest = dir.path().join("anonymous.sqlite");
    let before = std::fs::read(&source).unwrap();

    let pipeline = Pipeline::new(vec![
        Box::new(StripBlobs),
        Box::new(EntityStage::new(schema::SCENES)),
        Box::new(Explode),
        Box::new(EntityStage::new(schema::PERFORMERS)),
    ]);
    let err = Anonymiser::new(config())?
        .run_pipeline(&source, &dest, &pipeline)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some("explode"));
    assert!(matches!(err.root(), AnonymiseError::Configuration { .. }));
    assert!(!dest.exists());
    assert!(!dir.path().join("anonymous.sqlite-journal").exists());
    assert_eq!(std::fs::read(&source).unwrap(), before);
    Ok(())
}

#[tokio::test]
async fn test_sqlite_query_failure_leaves_nothing() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let dest = dir.path().join("anonymous.sqlite");
    let before = std::fs::read(&source).unwrap();

    let config = config().add_blob_column(ColumnRef::new("scenes", "no_such_column"));
    let err = Anonymiser::new(config)?
        .anonymise(&source, &dest)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some("blobs"));
    assert!(matches!(err.root(), AnonymiseError::Query { .. }));
    assert!(!dest.exists());
    assert_eq!(std::fs::read(&source).unwrap(), before);
    Ok(())
}

#[tokio::test]
async fn test_sqlite_missing_alias_table_aborts_in_owner_stage() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let source = create_library(&dir).await;
    let dest = dir.path().join("anonymous.sqlite");

    let mut config = config();
    config.alias_tables.push(dbanon_core::AliasTable::new(
        "movie_aliases",
        "movies",
        "movie_id",
    ));
    let err = Anonymiser::new(config)?
        .anonymise(&source, &dest)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some("movies"));
    assert!(!dest.exists());
    Ok(())
}
