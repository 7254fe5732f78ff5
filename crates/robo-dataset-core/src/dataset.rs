//! Dataset query layer.
//!
//! [`RODataset`] opens the frame shards and the metadata database of a
//! packaged dataset together and exposes row access by position:
//!
//! - `get(i)` returns one [`Row`] with every visible column,
//! - `get_batch(indices)` returns a column-major [`RowBatch`] in exactly the
//!   requested order (repeats allowed),
//! - `column(name)` returns a lazy column, or resolved metadata entities for
//!   the key columns when the dataset was opened with `meta_index2meta`.
//!
//! `select_columns` and `select` return cheap views over the same stores.
//! Views, like the dataset itself, can be turned into a serializable
//! [`DatasetHandle`] and reopened elsewhere.

pub mod column;
pub mod handle;
pub mod indices;
pub mod row;
mod save;

use std::{collections::BTreeMap, path::Path, sync::Arc};

use log::info;
use snafu::prelude::*;

use crate::{
    features::{FeatureSchema, FeatureValue},
    frames::{
        FrameError, FrameStore, RowKeys,
        columns::{self, RESERVED_COLUMNS, is_reserved_column},
        reader::decode_value,
    },
    manifest::{DatasetManifest, ManifestError},
    meta::{
        DatabaseDriver, Episode, Instruction, MetaCounts, MetaEntity, MetaError, MetaStore, Robot,
        Task,
        store::{INFO_DATABASE_DRIVER, INFO_FORMAT_VERSION},
    },
    storage::{StorageError, StorageLocation},
};

pub use column::{Column, LazyColumn};
pub use handle::{DatasetHandle, OpenOptions};
pub use indices::Indices;
pub use row::{MetaColumns, Row, RowBatch, RowMeta};

/// Errors raised by [`RODataset`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DatasetError {
    /// The manifest is missing, unreadable or unsupported.
    #[snafu(display("Cannot open dataset: {source}"))]
    OpenManifest {
        /// Underlying manifest error.
        source: ManifestError,
    },

    /// A shard is missing, corrupt or lacks required columns.
    #[snafu(display("Cannot open dataset frames: {source}"))]
    OpenFrames {
        /// Underlying frame error.
        source: FrameError,
    },

    /// The metadata database cannot be opened or read.
    #[snafu(display("Cannot open dataset metadata: {source}"))]
    OpenMeta {
        /// Underlying metadata error.
        source: MetaError,
    },

    /// The metadata database disagrees with the manifest.
    #[snafu(display(
        "Metadata database does not match the manifest: {key} is {found:?}, expected '{expected}'"
    ))]
    InfoMismatch {
        /// Compared entry.
        key: String,
        /// Value implied by the manifest.
        expected: String,
        /// Value found in the database.
        found: Option<String>,
    },

    /// Reading frame rows failed.
    #[snafu(display("Failed to read frames: {source}"))]
    ReadFrames {
        /// Underlying frame error.
        source: FrameError,
    },

    /// A metadata lookup failed.
    #[snafu(display("Metadata lookup failed: {source}"))]
    QueryMeta {
        /// Underlying metadata error.
        source: MetaError,
    },

    /// A row position past the end of the dataset.
    #[snafu(display("Index {index} out of range for dataset of {len} rows"))]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Dataset length.
        len: usize,
    },

    /// A column that is neither reserved nor a visible feature.
    #[snafu(display("Unknown column '{column}'"))]
    UnknownColumn {
        /// Requested column.
        column: String,
    },

    /// The save target cannot be used.
    #[snafu(display("Cannot save dataset to {path}: {source}"))]
    SaveTarget {
        /// Target directory.
        path: String,
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// Writing frames of the copy failed.
    #[snafu(display("Failed to write frames of the copy: {source}"))]
    SaveFrames {
        /// Underlying frame error.
        source: FrameError,
    },

    /// The rows of an episode are not contiguous in the saved view.
    #[snafu(display(
        "Cannot save view: rows of episode {episode} are interleaved with other episodes"
    ))]
    SplitEpisode {
        /// Source episode key.
        episode: i64,
    },

    /// Writing the metadata database of the copy failed.
    #[snafu(display("Failed to write metadata database of the copy: {source}"))]
    SaveMeta {
        /// Underlying metadata error.
        source: MetaError,
    },

    /// Writing the manifest of the copy failed.
    #[snafu(display("Failed to write manifest of the copy: {source}"))]
    SaveManifest {
        /// Underlying manifest error.
        source: ManifestError,
    },
}

impl DatasetError {
    /// True for errors raised while opening a dataset whose on-disk state is
    /// unusable (missing manifest, shard or database, or mismatched stores).
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            DatasetError::OpenManifest { .. }
                | DatasetError::OpenFrames { .. }
                | DatasetError::OpenMeta { .. }
                | DatasetError::InfoMismatch { .. }
        )
    }
}

struct Stores {
    location: StorageLocation,
    manifest: DatasetManifest,
    frames: FrameStore,
    meta: MetaStore,
}

/// Read-only view over a packaged dataset.
///
/// Cloning is cheap; clones and views share the opened stores.
#[derive(Clone)]
pub struct RODataset {
    stores: Arc<Stores>,
    options: OpenOptions,
    features: FeatureSchema,
    projection: Option<Vec<String>>,
    selection: Option<Arc<[u64]>>,
}

impl std::fmt::Debug for RODataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RODataset")
            .field("path", &self.path())
            .field("len", &self.len())
            .field("features", &self.features.len())
            .field("meta_index2meta", &self.options.meta_index2meta)
            .finish()
    }
}

/// Rows decoded per read while streaming a whole column or dataset.
pub(crate) const SCAN_CHUNK_ROWS: usize = 4096;

impl RODataset {
    /// Open the dataset at `path`.
    pub async fn open(path: impl AsRef<Path>, meta_index2meta: bool) -> Result<Self, DatasetError> {
        Self::open_with(path, OpenOptions { meta_index2meta }).await
    }

    /// Open the dataset at `path` with explicit options.
    ///
    /// Everything is validated here: the manifest, every shard and the
    /// metadata database, which must agree with the manifest on format
    /// version, engine and episode count.
    pub async fn open_with(
        path: impl AsRef<Path>,
        options: OpenOptions,
    ) -> Result<Self, DatasetError> {
        let location = StorageLocation::local(path.as_ref());
        let manifest = DatasetManifest::load(&location)
            .await
            .context(OpenManifestSnafu)?;
        let frames = FrameStore::open(&location, &manifest)
            .await
            .context(OpenFramesSnafu)?;
        let meta = MetaStore::open_read_only(
            &location.resolve(&manifest.meta_db_rel_path()),
            manifest.database_driver,
        )
        .context(OpenMetaSnafu)?;
        check_meta_matches_manifest(&meta, &manifest)?;

        info!(
            "opened dataset {} ({} rows, {} episodes, {} shards, {})",
            location.root().display(),
            manifest.row_count,
            manifest.episode_count,
            manifest.shards.len(),
            manifest.database_driver
        );

        Ok(Self {
            features: manifest.features.clone(),
            stores: Arc::new(Stores {
                location,
                manifest,
                frames,
                meta,
            }),
            options,
            projection: None,
            selection: None,
        })
    }

    /// Dataset root.
    pub fn path(&self) -> &Path {
        self.stores.location.root()
    }

    /// Manifest of the underlying dataset.
    pub fn manifest(&self) -> &DatasetManifest {
        &self.stores.manifest
    }

    /// On-disk format version.
    pub fn dataset_format_version(&self) -> u32 {
        self.stores.manifest.format_version
    }

    /// Metadata engine.
    pub fn database_driver(&self) -> DatabaseDriver {
        self.stores.manifest.database_driver
    }

    /// Open options of this view.
    pub fn options(&self) -> OpenOptions {
        self.options
    }

    /// Visible feature columns.
    pub fn features(&self) -> &FeatureSchema {
        &self.features
    }

    /// Reserved columns followed by visible feature columns.
    pub fn column_names(&self) -> Vec<String> {
        RESERVED_COLUMNS
            .iter()
            .copied()
            .chain(self.features.names())
            .map(str::to_string)
            .collect()
    }

    /// Number of visible rows.
    pub fn len(&self) -> usize {
        match &self.selection {
            Some(rows) => rows.len(),
            None => self.stores.frames.len() as usize,
        }
    }

    /// True if no row is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position in the underlying frame store of visible row `index`.
    pub(crate) fn physical_row(&self, index: usize) -> Result<u64, DatasetError> {
        let len = self.len();
        ensure!(index < len, IndexOutOfRangeSnafu { index, len });
        Ok(match &self.selection {
            Some(rows) => rows[index],
            None => index as u64,
        })
    }

    pub(crate) fn ensure_column(&self, name: &str) -> Result<(), DatasetError> {
        ensure!(
            is_reserved_column(name) || self.features.field(name).is_some(),
            UnknownColumnSnafu { column: name }
        );
        Ok(())
    }

    /// Decode `columns` of visible rows `rows`, in request order.
    pub(crate) fn read_values<S: AsRef<str>>(
        &self,
        rows: &[usize],
        columns: &[S],
    ) -> Result<BTreeMap<String, Vec<FeatureValue>>, DatasetError> {
        for name in columns {
            self.ensure_column(name.as_ref())?;
        }
        let physical = rows
            .iter()
            .map(|&i| self.physical_row(i))
            .collect::<Result<Vec<_>, _>>()?;
        let batch = self
            .stores
            .frames
            .read_rows(&physical, columns)
            .context(ReadFramesSnafu)?;

        let mut out = BTreeMap::new();
        for name in columns {
            let name = name.as_ref();
            let values = (0..batch.num_rows())
                .map(|row| decode_value(&batch, name, row))
                .collect::<Result<Vec<_>, _>>()
                .context(ReadFramesSnafu)?;
            out.insert(name.to_string(), values);
        }
        Ok(out)
    }

    /// Reserved key columns of visible rows `rows`.
    pub(crate) fn read_keys(&self, rows: &[usize]) -> Result<Vec<RowKeys>, DatasetError> {
        let physical = rows
            .iter()
            .map(|&i| self.physical_row(i))
            .collect::<Result<Vec<_>, _>>()?;
        self.stores
            .frames
            .read_keys(&physical)
            .context(ReadFramesSnafu)
    }

    /// Row `index` with every visible column.
    pub fn get(&self, index: usize) -> Result<Row, DatasetError> {
        let batch = self.get_batch(vec![index])?;
        Ok(batch.into_rows().pop().unwrap_or_default())
    }

    /// Rows `indices`, column-major, in exactly the requested order.
    ///
    /// With `meta_index2meta`, metadata is resolved with one lookup per
    /// entity kind for the whole batch.
    pub fn get_batch(&self, indices: impl Into<Indices>) -> Result<RowBatch, DatasetError> {
        let rows = indices.into().to_vec();
        let columns = self.column_names();
        let values = self.read_values(&rows, &columns)?;

        let meta = if self.options.meta_index2meta {
            let keys = |name: &str| -> Vec<Option<i64>> {
                values
                    .get(name)
                    .map(|v| v.iter().map(FeatureValue::as_i64).collect())
                    .unwrap_or_default()
            };
            Some(self.resolve_meta(
                &keys(columns::EPISODE_INDEX),
                &keys(columns::ROBOT_INDEX),
                &keys(columns::TASK_INDEX),
                &keys(columns::INSTRUCTION_INDEX),
            )?)
        } else {
            None
        };

        Ok(RowBatch::new(rows.len(), values, meta))
    }

    fn resolve_meta(
        &self,
        episodes: &[Option<i64>],
        robots: &[Option<i64>],
        tasks: &[Option<i64>],
        instructions: &[Option<i64>],
    ) -> Result<MetaColumns, DatasetError> {
        Ok(MetaColumns {
            episodes: self.get_meta_many::<Episode>(episodes)?,
            robots: self.get_meta_many::<Robot>(robots)?,
            tasks: self.get_meta_many::<Task>(tasks)?,
            instructions: self.get_meta_many::<Instruction>(instructions)?,
        })
    }

    /// Column `name` over all visible rows.
    ///
    /// Feature and raw reserved columns come back lazily. With
    /// `meta_index2meta`, the four key columns come back as resolved
    /// entities instead of integers.
    pub fn column(&self, name: &str) -> Result<Column, DatasetError> {
        self.ensure_column(name)?;
        if self.options.meta_index2meta {
            let resolve = || -> Result<Vec<Option<i64>>, DatasetError> {
                let mut keys = Vec::with_capacity(self.len());
                let all: Vec<usize> = (0..self.len()).collect();
                for chunk in all.chunks(SCAN_CHUNK_ROWS) {
                    let values = self.read_values(chunk, &[name])?;
                    keys.extend(values.into_values().flatten().map(|v| v.as_i64()));
                }
                Ok(keys)
            };
            match name {
                columns::EPISODE_INDEX => {
                    return Ok(Column::Episodes(self.get_meta_many(&resolve()?)?));
                }
                columns::ROBOT_INDEX => return Ok(Column::Robots(self.get_meta_many(&resolve()?)?)),
                columns::TASK_INDEX => return Ok(Column::Tasks(self.get_meta_many(&resolve()?)?)),
                columns::INSTRUCTION_INDEX => {
                    return Ok(Column::Instructions(self.get_meta_many(&resolve()?)?));
                }
                _ => {}
            }
        }
        Ok(Column::Values(LazyColumn::new(self.clone(), name)))
    }

    /// View restricted to the feature columns `names`.
    ///
    /// Reserved columns always stay visible; naming one is allowed and has
    /// no effect. Row count and row identity are unchanged.
    pub fn select_columns<S: AsRef<str>>(&self, names: &[S]) -> Result<RODataset, DatasetError> {
        let wanted: Vec<&str> = names
            .iter()
            .map(AsRef::as_ref)
            .filter(|n| !is_reserved_column(n))
            .collect();
        let features = self
            .features
            .project(&wanted)
            .map_err(|column| UnknownColumnSnafu { column }.build())?;
        Ok(RODataset {
            projection: Some(features.names().map(str::to_string).collect()),
            features,
            ..self.clone()
        })
    }

    /// View containing exactly the visible rows `indices`, in that order.
    ///
    /// Only positions are recorded; nothing is read.
    pub fn select(&self, indices: impl Into<Indices>) -> Result<RODataset, DatasetError> {
        let rows = indices
            .into()
            .to_vec()
            .into_iter()
            .map(|i| self.physical_row(i))
            .collect::<Result<Vec<u64>, _>>()?;
        Ok(RODataset {
            selection: Some(rows.into()),
            ..self.clone()
        })
    }

    /// Serializable description of this view.
    pub fn handle(&self) -> DatasetHandle {
        DatasetHandle {
            path: self.path().to_path_buf(),
            options: self.options,
            columns: self.projection.clone(),
            rows: self.selection.as_ref().map(|rows| rows.to_vec()),
        }
    }

    /// Look up one metadata entity; `None` and absent keys yield `None`.
    pub fn get_meta<E: MetaEntity>(&self, key: Option<i64>) -> Result<Option<E>, DatasetError> {
        self.stores.meta.get_meta(key).context(QueryMetaSnafu)
    }

    /// Look up many metadata entities, preserving order and length.
    pub fn get_meta_many<E: MetaEntity>(
        &self,
        keys: &[Option<i64>],
    ) -> Result<Vec<Option<E>>, DatasetError> {
        self.stores.meta.get_meta_many(keys).context(QueryMetaSnafu)
    }

    /// All episodes ordered by index.
    pub fn episodes(&self) -> Result<Vec<Episode>, DatasetError> {
        self.stores.meta.episodes().context(QueryMetaSnafu)
    }

    /// Row counts of the metadata tables.
    pub fn meta_counts(&self) -> Result<MetaCounts, DatasetError> {
        self.stores.meta.counts().context(QueryMetaSnafu)
    }
}

fn check_meta_matches_manifest(
    meta: &MetaStore,
    manifest: &DatasetManifest,
) -> Result<(), DatasetError> {
    let info = meta.dataset_info().context(OpenMetaSnafu)?;
    let expected = [
        (INFO_FORMAT_VERSION, manifest.format_version.to_string()),
        (
            INFO_DATABASE_DRIVER,
            manifest.database_driver.as_str().to_string(),
        ),
    ];
    for (key, expected) in expected {
        let found = info.get(key).cloned();
        ensure!(
            found.as_deref() == Some(expected.as_str()),
            InfoMismatchSnafu {
                key,
                expected,
                found,
            }
        );
    }

    let episodes = meta.counts().context(OpenMetaSnafu)?.episodes;
    ensure!(
        episodes as u64 == manifest.episode_count,
        InfoMismatchSnafu {
            key: "episode_count",
            expected: manifest.episode_count.to_string(),
            found: Some(episodes.to_string()),
        }
    );
    Ok(())
}
