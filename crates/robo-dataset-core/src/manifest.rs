//! Persisted dataset state.
//!
//! The manifest (`ro_dataset.json`) is the single entry point of a dataset:
//! it names the metadata engine, the feature schema and every frame shard
//! with its row count. It is written last by packaging and save, so a
//! directory without a manifest is never mistaken for a complete dataset.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    features::FeatureSchema,
    layout,
    meta::DatabaseDriver,
    storage::{self, StorageError, StorageLocation},
};

/// Current dataset format version.
///
/// Bumped only when we make a breaking change to the on-disk layout.
pub const DATASET_FORMAT_VERSION: u32 = 1;

/// One frame shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardInfo {
    /// Path relative to the dataset root, `/`-separated.
    pub path: String,
    /// Number of frame rows in the shard.
    pub row_count: u64,
    /// Size of the shard file in bytes.
    pub byte_size: u64,
}

impl ShardInfo {
    /// Relative path as a platform path.
    pub fn rel_path(&self) -> PathBuf {
        self.path.split('/').collect()
    }
}

/// Manifest of a packaged dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetManifest {
    /// On-disk format version.
    pub format_version: u32,
    /// Engine of the metadata database.
    pub database_driver: DatabaseDriver,
    /// Feature columns of every frame row.
    pub features: FeatureSchema,
    /// Frame shards in global row order.
    pub shards: Vec<ShardInfo>,
    /// Total number of frame rows.
    pub row_count: u64,
    /// Number of episodes.
    pub episode_count: u64,
    /// Shard size limit used when writing, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_shard_size: Option<u64>,
    /// Creation time, RFC3339 UTC.
    pub created_at: DateTime<Utc>,
}

/// Errors raised while loading or saving a manifest.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ManifestError {
    /// No manifest at the dataset root.
    #[snafu(display("No dataset manifest at {path}"))]
    MissingManifest {
        /// Expected manifest path.
        path: String,
    },

    /// Storage failure.
    #[snafu(display("Manifest storage error: {source}"))]
    ManifestStorage {
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// The manifest is not valid JSON for this format.
    #[snafu(display("Failed to parse manifest {path}: {source}"))]
    ManifestJson {
        /// Manifest path.
        path: String,
        /// Parser error.
        source: serde_json::Error,
    },

    /// The manifest was written by an incompatible version.
    #[snafu(display("Unsupported dataset format version {found} (supported: {supported})"))]
    UnsupportedVersion {
        /// Version in the manifest.
        found: u32,
        /// Version this build reads.
        supported: u32,
    },

    /// Shard row counts do not add up to the declared total.
    #[snafu(display("Manifest declares {declared} rows but its shards hold {actual}"))]
    RowCountMismatch {
        /// `row_count` field.
        declared: u64,
        /// Sum of shard row counts.
        actual: u64,
    },
}

impl DatasetManifest {
    /// New manifest stamped with the current format version and time.
    pub fn new(
        database_driver: DatabaseDriver,
        features: FeatureSchema,
        shards: Vec<ShardInfo>,
        episode_count: u64,
        max_shard_size: Option<u64>,
    ) -> Self {
        let row_count = shards.iter().map(|s| s.row_count).sum();
        Self {
            format_version: DATASET_FORMAT_VERSION,
            database_driver,
            features,
            shards,
            row_count,
            episode_count,
            max_shard_size,
            created_at: Utc::now(),
        }
    }

    /// Consistency checks that do not touch storage.
    pub fn validate(&self) -> Result<(), ManifestError> {
        ensure!(
            self.format_version == DATASET_FORMAT_VERSION,
            UnsupportedVersionSnafu {
                found: self.format_version,
                supported: DATASET_FORMAT_VERSION,
            }
        );
        let actual: u64 = self.shards.iter().map(|s| s.row_count).sum();
        ensure!(
            actual == self.row_count,
            RowCountMismatchSnafu {
                declared: self.row_count,
                actual,
            }
        );
        Ok(())
    }

    /// Relative path of the metadata database.
    pub fn meta_db_rel_path(&self) -> PathBuf {
        layout::meta_db_rel_path(self.database_driver)
    }

    /// Load and validate the manifest at `location`.
    pub async fn load(location: &StorageLocation) -> Result<Self, ManifestError> {
        let rel = layout::manifest_rel_path();
        let path = location.resolve(&rel).display().to_string();

        let json = match storage::read_to_string(location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return MissingManifestSnafu { path }.fail(),
            Err(e) => return Err(e).context(ManifestStorageSnafu),
        };

        let manifest: DatasetManifest =
            serde_json::from_str(&json).context(ManifestJsonSnafu { path: path.clone() })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write the manifest atomically at `location`.
    pub async fn save(&self, location: &StorageLocation) -> Result<(), ManifestError> {
        let rel = layout::manifest_rel_path();
        let json = serde_json::to_vec_pretty(self).context(ManifestJsonSnafu {
            path: location.resolve(&rel).display().to_string(),
        })?;
        storage::write_atomic(location, &rel, &json)
            .await
            .context(ManifestStorageSnafu)
    }
}

/// Render a relative path with `/` separators for the manifest.
pub(crate) fn manifest_path_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
