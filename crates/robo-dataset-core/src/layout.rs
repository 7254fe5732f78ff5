//! On-disk layout helpers for a dataset root.
//!
//! This module centralizes all *relative* path conventions under a dataset
//! root:
//! - the manifest (`ro_dataset.json`),
//! - the metadata database (`meta.sqlite3` / `meta.duckdb`),
//! - frame shards (`data/frames-NNNNN.parquet`).
//!
//! The functions here return relative [`std::path::PathBuf`] values. Callers
//! join them with a [`crate::storage::StorageLocation`] before doing IO.

use std::path::PathBuf;

use crate::meta::DatabaseDriver;

/// File name of the dataset manifest.
pub const MANIFEST_FILE_NAME: &str = "ro_dataset.json";

/// Conventional directory where frame shards are stored.
pub const DATA_DIR_NAME: &str = "data";

/// File name prefix of frame shards.
pub const SHARD_FILE_PREFIX: &str = "frames-";

/// Number of digits used in zero-padded shard file names.
pub const SHARD_FILENAME_DIGITS: usize = 5;

/// Stem of the metadata database file; the extension depends on the engine.
pub const META_DB_STEM: &str = "meta";

/// Relative path: `ro_dataset.json`
pub fn manifest_rel_path() -> PathBuf {
    PathBuf::from(MANIFEST_FILE_NAME)
}

/// Relative path: `data/`
pub fn data_rel_dir() -> PathBuf {
    PathBuf::from(DATA_DIR_NAME)
}

/// Relative path: `data/frames-<zero-padded>.parquet`
pub fn shard_rel_path(shard_id: usize) -> PathBuf {
    let file_name = format!(
        "{SHARD_FILE_PREFIX}{:0width$}.parquet",
        shard_id,
        width = SHARD_FILENAME_DIGITS
    );
    data_rel_dir().join(file_name)
}

/// Relative path of the metadata database for `driver`.
pub fn meta_db_rel_path(driver: DatabaseDriver) -> PathBuf {
    PathBuf::from(format!("{META_DB_STEM}.{}", driver.file_extension()))
}
