//! Packaging pipeline: turn episode sources into a dataset on disk.
//!
//! Each source implements [`EpisodePackaging`]. [`DatasetPackaging`] walks
//! the sources in order, streams their frames into size-bounded Parquet
//! shards, interns robots, tasks and instructions, and finally writes the
//! metadata database and the manifest.
//!
//! Commit order is shards, then the metadata database, then the manifest.
//! A run that fails part-way leaves no manifest behind, so the directory
//! cannot be opened as a dataset; repackage to a fresh path.

pub mod session;
pub mod shard_size;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    features::{
        FeatureSchema, FeatureValue, FeatureValueError,
        compat::{SchemaCompatibilityError, ensure_schema_exact_match},
    },
    frames::{FrameError, FrameRecord, RowKeys, ShardWriter},
    layout,
    manifest::{DATASET_FORMAT_VERSION, DatasetManifest, ManifestError},
    meta::{
        DatabaseDriver, Episode, MetaError, MetaStore,
        store::{INFO_DATABASE_DRIVER, INFO_FORMAT_VERSION},
    },
    storage::{self, StorageError, StorageLocation},
};

pub use session::PackagingSession;
pub use shard_size::{ParseShardSizeError, ShardSize};

/// Error type returned by episode sources.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Robot reference emitted by a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RobotData {
    /// Robot name.
    pub name: String,
    /// URDF document.
    pub urdf_content: Option<String>,
}

impl RobotData {
    /// New robot reference.
    pub fn new(name: impl Into<String>, urdf_content: Option<&str>) -> Self {
        Self {
            name: name.into(),
            urdf_content: urdf_content.map(str::to_string),
        }
    }
}

/// Task reference emitted by a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskData {
    /// Task name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
}

impl TaskData {
    /// New task reference.
    pub fn new(name: impl Into<String>, description: Option<&str>) -> Self {
        Self {
            name: name.into(),
            description: description.map(str::to_string),
        }
    }
}

/// Instruction reference attached to a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionData {
    /// Optional short name.
    pub name: Option<String>,
    /// Instruction payload.
    pub json_content: serde_json::Value,
}

impl InstructionData {
    /// New instruction reference.
    pub fn new(name: Option<&str>, json_content: serde_json::Value) -> Self {
        Self {
            name: name.map(str::to_string),
            json_content,
        }
    }
}

/// Per-episode metadata, produced before any frame is read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeMeta {
    /// Robot the episode was recorded with.
    pub robot: Option<RobotData>,
    /// Task the episode performs.
    pub task: Option<TaskData>,
}

/// One frame emitted by a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFrame {
    /// Feature values by column; missing columns are stored as null.
    pub features: BTreeMap<String, FeatureValue>,
    /// Instruction active during the frame.
    pub instruction: Option<InstructionData>,
    /// Frame time, nanoseconds since the epoch.
    pub timestamp: Option<i64>,
}

/// A source of one episode.
///
/// [`DatasetPackaging`] calls [`features`](Self::features), then
/// [`generate_episode_meta`](Self::generate_episode_meta), then consumes
/// [`generate_frames`](Self::generate_frames) exactly once, in order,
/// without collecting or rewinding it.
pub trait EpisodePackaging {
    /// Feature columns this source emits. Must equal the packaging schema.
    fn features(&self) -> FeatureSchema;

    /// Robot and task of the episode.
    fn generate_episode_meta(&mut self) -> Result<EpisodeMeta, SourceError>;

    /// Lazily produce the episode's frames.
    fn generate_frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<DataFrame, SourceError>> + '_>;
}

impl<T: EpisodePackaging + ?Sized> EpisodePackaging for Box<T> {
    fn features(&self) -> FeatureSchema {
        (**self).features()
    }

    fn generate_episode_meta(&mut self) -> Result<EpisodeMeta, SourceError> {
        (**self).generate_episode_meta()
    }

    fn generate_frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<DataFrame, SourceError>> + '_> {
        (**self).generate_frames()
    }
}

/// Errors raised while packaging a dataset.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PackagingError {
    /// The target directory exists and is not empty, or cannot be created.
    #[snafu(display("Cannot package into {path}: {source}"))]
    Target {
        /// Target directory.
        path: String,
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// An episode declares a different schema than the packaging schema.
    #[snafu(display("Episode {episode} declares a different feature schema: {source}"))]
    SchemaMismatch {
        /// Position of the episode in the input.
        episode: i64,
        /// What differs.
        source: SchemaCompatibilityError,
    },

    /// A frame value does not conform to the schema.
    #[snafu(display("Episode {episode}, frame {frame}: {source}"))]
    InvalidFrame {
        /// Position of the episode in the input.
        episode: i64,
        /// Position of the frame within the episode.
        frame: i64,
        /// What is wrong.
        source: FeatureValueError,
    },

    /// The source failed to produce its metadata or a frame.
    #[snafu(display("Episode {episode} source failed: {source}"))]
    Source {
        /// Position of the episode in the input.
        episode: i64,
        /// Source error.
        source: SourceError,
    },

    /// Writing frame shards failed.
    #[snafu(display("Failed to write frames: {source}"))]
    WriteFrames {
        /// Underlying frame error.
        source: FrameError,
    },

    /// Writing the metadata database failed.
    #[snafu(display("Failed to write metadata: {source}"))]
    WriteMeta {
        /// Underlying metadata error.
        source: MetaError,
    },

    /// Writing the manifest failed.
    #[snafu(display("Failed to write manifest: {source}"))]
    WriteManifest {
        /// Underlying manifest error.
        source: ManifestError,
    },
}

/// Outcome of a packaging run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackagingSummary {
    /// Dataset root.
    pub path: PathBuf,
    /// Metadata engine used.
    pub database_driver: DatabaseDriver,
    /// Episodes written.
    pub episodes: u64,
    /// Frame rows written.
    pub frames: u64,
    /// Shard files written.
    pub shards: usize,
    /// Distinct robots.
    pub robots: usize,
    /// Distinct tasks.
    pub tasks: usize,
    /// Distinct instructions.
    pub instructions: usize,
}

/// Packages episode sources into a dataset with a fixed schema and engine.
#[derive(Debug, Clone)]
pub struct DatasetPackaging {
    features: FeatureSchema,
    database_driver: DatabaseDriver,
}

impl DatasetPackaging {
    /// Packaging with `features` as the schema every episode must declare.
    pub fn new(features: FeatureSchema, database_driver: DatabaseDriver) -> Self {
        Self {
            features,
            database_driver,
        }
    }

    /// Packaging schema.
    pub fn features(&self) -> &FeatureSchema {
        &self.features
    }

    /// Metadata engine.
    pub fn database_driver(&self) -> DatabaseDriver {
        self.database_driver
    }

    /// Package `episodes` into a new dataset at `dataset_path`.
    ///
    /// `dataset_path` must not exist or be an empty directory. With
    /// `max_shard_size` set, frames are split across shards whose estimated
    /// size stays under the limit (a single larger frame gets its own shard).
    pub async fn packaging<I, E>(
        &self,
        episodes: I,
        dataset_path: impl AsRef<Path>,
        max_shard_size: Option<ShardSize>,
    ) -> Result<PackagingSummary, PackagingError>
    where
        I: IntoIterator<Item = E>,
        E: EpisodePackaging,
    {
        let root = dataset_path.as_ref();
        let location = StorageLocation::local(root);
        storage::ensure_empty_root(&location)
            .await
            .context(TargetSnafu {
                path: root.display().to_string(),
            })?;

        let max_bytes = max_shard_size.map(ShardSize::bytes);
        let mut session = PackagingSession::new();
        let mut writer = ShardWriter::new(location.clone(), self.features.clone(), max_bytes);

        for (position, mut source) in episodes.into_iter().enumerate() {
            let episode = position as i64;
            ensure_schema_exact_match(&self.features, &source.features())
                .context(SchemaMismatchSnafu { episode })?;
            self.package_episode(&mut session, &mut writer, &mut source, episode)
                .await?;
        }

        let shards = writer.finish().await.context(WriteFramesSnafu)?;

        let db_path = location.resolve(&layout::meta_db_rel_path(self.database_driver));
        let info = [
            (INFO_FORMAT_VERSION, DATASET_FORMAT_VERSION.to_string()),
            (
                INFO_DATABASE_DRIVER,
                self.database_driver.as_str().to_string(),
            ),
        ];
        let batch = session.into_batch();
        {
            let store = MetaStore::create(&db_path, self.database_driver, &info)
                .context(WriteMetaSnafu)?;
            store.insert_batch(&batch).context(WriteMetaSnafu)?;
        }

        let manifest = DatasetManifest::new(
            self.database_driver,
            self.features.clone(),
            shards,
            batch.episodes.len() as u64,
            max_bytes,
        );
        manifest.save(&location).await.context(WriteManifestSnafu)?;

        let summary = PackagingSummary {
            path: root.to_path_buf(),
            database_driver: self.database_driver,
            episodes: manifest.episode_count,
            frames: manifest.row_count,
            shards: manifest.shards.len(),
            robots: batch.robots.len(),
            tasks: batch.tasks.len(),
            instructions: batch.instructions.len(),
        };
        info!(
            "packaged {} episodes, {} frames into {} shards at {}",
            summary.episodes,
            summary.frames,
            summary.shards,
            root.display()
        );
        Ok(summary)
    }

    async fn package_episode<E: EpisodePackaging>(
        &self,
        session: &mut PackagingSession,
        writer: &mut ShardWriter,
        source: &mut E,
        episode: i64,
    ) -> Result<(), PackagingError> {
        let meta = source
            .generate_episode_meta()
            .context(SourceSnafu { episode })?;
        let robot_index = session.intern_robot(meta.robot);
        let task_index = session.intern_task(meta.task);

        let episode_index = session.next_episode_index();
        let dataset_begin_index = session.next_row();
        let mut frame_num = 0i64;

        for frame in source.generate_frames() {
            let frame = frame.context(SourceSnafu { episode })?;
            self.features
                .check_frame(&frame.features)
                .context(InvalidFrameSnafu {
                    episode,
                    frame: frame_num,
                })?;

            let keys = RowKeys {
                index: session.claim_row(),
                episode_index,
                robot_index,
                task_index,
                instruction_index: session.intern_instruction(frame.instruction),
                timestamp: frame.timestamp,
            };
            writer
                .push(FrameRecord {
                    keys,
                    features: frame.features,
                })
                .await
                .context(WriteFramesSnafu)?;
            frame_num += 1;
        }

        session.push_episode(Episode {
            index: episode_index,
            dataset_begin_index,
            frame_num,
            robot_index,
            task_index,
        });
        info!("episode {episode_index}: {frame_num} frames from row {dataset_begin_index}");
        Ok(())
    }
}
