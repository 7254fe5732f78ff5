//! Copy a dataset view to a new directory.

use std::{collections::HashSet, path::Path};

use log::info;
use snafu::prelude::*;

use super::{
    DatasetError, QueryMetaSnafu, RODataset, ReadFramesSnafu, SCAN_CHUNK_ROWS, SaveFramesSnafu,
    SaveManifestSnafu, SaveMetaSnafu, SaveTargetSnafu, SplitEpisodeSnafu,
};
use crate::{
    frames::{
        FrameRecord, ShardWriter,
        columns::RESERVED_COLUMNS,
        reader::{decode_features, decode_keys},
    },
    manifest::{DATASET_FORMAT_VERSION, DatasetManifest},
    meta::{
        Episode, MetaBatch, MetaStore,
        store::{INFO_DATABASE_DRIVER, INFO_FORMAT_VERSION},
    },
    storage::{self, StorageLocation},
};

/// Episode table of a saved view.
#[derive(Debug, Default)]
struct SavedEpisodes {
    episodes: Vec<Episode>,
    /// Episode key in the copy of every visible row.
    row_episode: Vec<i64>,
}

impl RODataset {
    /// Write the visible rows and columns of this view as a new dataset at
    /// `path`, which must not exist or be empty.
    ///
    /// The copy is a dataset in its own right. Visible row `i` becomes row
    /// `i` of the copy, and episodes are renumbered densely in the order
    /// they first appear, each covering exactly its visible rows. Episodes
    /// without visible rows are dropped. Robots, tasks and instructions keep
    /// their keys.
    ///
    /// The rows of each episode must be contiguous in the view; a view that
    /// interleaves episodes fails with [`DatasetError::SplitEpisode`] before
    /// anything is written.
    pub async fn save_to_disk(&self, path: impl AsRef<Path>) -> Result<(), DatasetError> {
        let root = path.as_ref();
        let plan = self.saved_episodes()?;

        let target = StorageLocation::local(root);
        storage::ensure_empty_root(&target)
            .await
            .context(SaveTargetSnafu {
                path: root.display().to_string(),
            })?;

        let source = self.manifest();
        let mut writer = ShardWriter::new(
            target.clone(),
            self.features().clone(),
            source.max_shard_size,
        );

        let columns: Vec<&str> = RESERVED_COLUMNS
            .iter()
            .copied()
            .chain(self.features().names())
            .collect();
        let mut start = 0;
        while start < self.len() {
            let end = (start + SCAN_CHUNK_ROWS).min(self.len());
            let physical = (start..end)
                .map(|i| self.physical_row(i))
                .collect::<Result<Vec<_>, _>>()?;
            let batch = self
                .stores
                .frames
                .read_rows(&physical, &columns)
                .context(ReadFramesSnafu)?;
            for row in 0..batch.num_rows() {
                let position = start + row;
                let mut keys = decode_keys(&batch, row).context(ReadFramesSnafu)?;
                keys.index = position as i64;
                keys.episode_index = plan.row_episode[position];
                let record = FrameRecord {
                    keys,
                    features: decode_features(&batch, self.features(), row)
                        .context(ReadFramesSnafu)?,
                };
                writer.push(record).await.context(SaveFramesSnafu)?;
            }
            start = end;
        }
        let shards = writer.finish().await.context(SaveFramesSnafu)?;

        let meta = &self.stores.meta;
        let batch = MetaBatch {
            episodes: plan.episodes,
            robots: meta.all().context(QueryMetaSnafu)?,
            tasks: meta.all().context(QueryMetaSnafu)?,
            instructions: meta.all().context(QueryMetaSnafu)?,
        };
        let info = [
            (INFO_FORMAT_VERSION, DATASET_FORMAT_VERSION.to_string()),
            (
                INFO_DATABASE_DRIVER,
                source.database_driver.as_str().to_string(),
            ),
        ];
        {
            let store = MetaStore::create(
                &target.resolve(&source.meta_db_rel_path()),
                source.database_driver,
                &info,
            )
            .context(SaveMetaSnafu)?;
            store.insert_batch(&batch).context(SaveMetaSnafu)?;
        }

        let manifest = DatasetManifest::new(
            source.database_driver,
            self.features().clone(),
            shards,
            batch.episodes.len() as u64,
            source.max_shard_size,
        );
        manifest.save(&target).await.context(SaveManifestSnafu)?;

        info!(
            "saved {} rows in {} episodes of {} to {}",
            manifest.row_count,
            manifest.episode_count,
            self.path().display(),
            root.display()
        );
        Ok(())
    }

    /// Rebuild the episode table from the visible rows' keys.
    fn saved_episodes(&self) -> Result<SavedEpisodes, DatasetError> {
        let mut plan = SavedEpisodes::default();
        let mut closed = HashSet::new();
        let mut current = None;

        let mut start = 0;
        while start < self.len() {
            let end = (start + SCAN_CHUNK_ROWS).min(self.len());
            let rows: Vec<usize> = (start..end).collect();
            for (position, keys) in (start..end).zip(self.read_keys(&rows)?) {
                if current != Some(keys.episode_index) {
                    if let Some(previous) = current {
                        closed.insert(previous);
                    }
                    ensure!(
                        !closed.contains(&keys.episode_index),
                        SplitEpisodeSnafu {
                            episode: keys.episode_index,
                        }
                    );
                    plan.episodes.push(Episode {
                        index: plan.episodes.len() as i64,
                        dataset_begin_index: position as i64,
                        frame_num: 0,
                        robot_index: keys.robot_index,
                        task_index: keys.task_index,
                    });
                    current = Some(keys.episode_index);
                }
                if let Some(episode) = plan.episodes.last_mut() {
                    episode.frame_num += 1;
                    plan.row_episode.push(episode.index);
                }
            }
            start = end;
        }
        Ok(plan)
    }
}
