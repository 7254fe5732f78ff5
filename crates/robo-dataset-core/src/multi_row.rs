//! Multi-row access: each anchor row is joined with time-offset rows of the
//! same episode.
//!
//! Columns listed in the sampler config come back as a [`FeatureValue::List`]
//! with one slot per configured offset (an empty list for no offsets). All
//! other columns pass through from the anchor row unchanged.

use std::{collections::HashMap, path::Path};

use log::debug;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    dataset::{DatasetError, DatasetHandle, Indices, RODataset, Row, RowBatch, SCAN_CHUNK_ROWS},
    features::FeatureValue,
    frames::columns,
    row_sampler::{
        DeltaTimestampSamplerConfig, EpisodeTimelines, MissingTimestampSnafu, OutOfTolerance,
        OutOfToleranceSnafu, SamplerError, UnknownSamplerColumnSnafu, secs_to_nanos,
    },
};

/// Errors raised by [`ROMultiRowDataset`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MultiRowError {
    /// The wrapped dataset failed.
    #[snafu(display("{source}"))]
    Dataset {
        /// Underlying dataset error.
        source: DatasetError,
    },

    /// Sampling failed or is misconfigured.
    #[snafu(display("{source}"))]
    Sampler {
        /// Underlying sampler error.
        source: SamplerError,
    },
}

/// Reopenable description of an [`ROMultiRowDataset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiRowHandle {
    /// The wrapped dataset view.
    pub dataset: DatasetHandle,
    /// Sampler configuration.
    pub row_sampler: DeltaTimestampSamplerConfig,
}

impl MultiRowHandle {
    /// Reopen the dataset and rebuild the sampler.
    pub async fn open(&self) -> Result<ROMultiRowDataset, MultiRowError> {
        let dataset = self.dataset.open().await.context(DatasetSnafu)?;
        ROMultiRowDataset::from_dataset(dataset, self.row_sampler.clone())
    }
}

/// An [`RODataset`] with delta-timestamp sampling on selected columns.
#[derive(Debug, Clone)]
pub struct ROMultiRowDataset {
    dataset: RODataset,
    config: DeltaTimestampSamplerConfig,
    timelines: EpisodeTimelines,
}

impl ROMultiRowDataset {
    /// Open the dataset at `path` and wrap it.
    pub async fn open(
        path: impl AsRef<Path>,
        row_sampler: DeltaTimestampSamplerConfig,
    ) -> Result<Self, MultiRowError> {
        let dataset = RODataset::open(path, false).await.context(DatasetSnafu)?;
        Self::from_dataset(dataset, row_sampler)
    }

    /// Wrap an open dataset without reopening its stores.
    ///
    /// Validates the config and, when any column is sampled, reads the
    /// `episode_index` and `timestamp` columns once to build the episode
    /// timelines.
    pub fn from_dataset(
        dataset: RODataset,
        row_sampler: DeltaTimestampSamplerConfig,
    ) -> Result<Self, MultiRowError> {
        row_sampler.validate().context(SamplerSnafu)?;
        for column in row_sampler.column_delta_ts.keys() {
            if dataset.ensure_column(column).is_err() {
                return UnknownSamplerColumnSnafu { column }
                    .fail()
                    .context(SamplerSnafu);
            }
        }

        let timelines = if row_sampler.column_delta_ts.is_empty() {
            EpisodeTimelines::default()
        } else {
            build_timelines(&dataset).context(DatasetSnafu)?
        };
        debug!(
            "multi-row dataset over {} rows, {} sampled columns, {} timelines",
            dataset.len(),
            row_sampler.column_delta_ts.len(),
            timelines.episode_count()
        );

        Ok(Self {
            dataset,
            config: row_sampler,
            timelines,
        })
    }

    /// The wrapped dataset.
    pub fn dataset(&self) -> &RODataset {
        &self.dataset
    }

    /// Sampler configuration.
    pub fn config(&self) -> &DeltaTimestampSamplerConfig {
        &self.config
    }

    /// Number of anchor rows.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    /// True if there are no anchor rows.
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Serializable description of this dataset.
    pub fn handle(&self) -> MultiRowHandle {
        MultiRowHandle {
            dataset: self.dataset.handle(),
            row_sampler: self.config.clone(),
        }
    }

    /// Anchor row `index` with sampled columns.
    pub fn get(&self, index: usize) -> Result<Row, MultiRowError> {
        let batch = self.get_batch(vec![index])?;
        Ok(batch.into_rows().pop().unwrap_or_default())
    }

    /// Anchor rows `indices`, in order, with sampled columns.
    pub fn get_batch(&self, indices: impl Into<Indices>) -> Result<RowBatch, MultiRowError> {
        let anchors = indices.into().to_vec();
        let mut batch = self
            .dataset
            .get_batch(anchors.clone())
            .context(DatasetSnafu)?;
        if self.config.column_delta_ts.is_empty() {
            return Ok(batch);
        }

        let episodes: Vec<Option<i64>> = column_ints(&batch, columns::EPISODE_INDEX);
        let timestamps: Vec<Option<i64>> = column_ints(&batch, columns::TIMESTAMP);
        let tolerance = self.config.tolerance_nanos();

        for (column, offsets) in &self.config.column_delta_ts {
            // matches[a][k]: row matched for anchor a, offset k
            let mut matches: Vec<Vec<Option<usize>>> = Vec::with_capacity(anchors.len());
            for (pos, &anchor) in anchors.iter().enumerate() {
                if offsets.is_empty() {
                    matches.push(Vec::new());
                    continue;
                }
                let (Some(episode), Some(ts)) = (episodes[pos], timestamps[pos]) else {
                    return MissingTimestampSnafu { row: anchor }
                        .fail()
                        .context(SamplerSnafu);
                };

                let mut slots = Vec::with_capacity(offsets.len());
                for &offset in offsets {
                    let target = ts.saturating_add(secs_to_nanos(offset));
                    let found = self.timelines.nearest(episode, target, tolerance);
                    if found.is_none() && self.config.out_of_tolerance == OutOfTolerance::Error {
                        return OutOfToleranceSnafu {
                            column: column.clone(),
                            offset,
                            row: anchor,
                        }
                        .fail()
                        .context(SamplerSnafu);
                    }
                    slots.push(found);
                }
                matches.push(slots);
            }

            let mut needed: Vec<usize> = matches.iter().flatten().flatten().copied().collect();
            needed.sort_unstable();
            needed.dedup();
            let values = self
                .dataset
                .read_values(&needed, &[column.as_str()])
                .context(DatasetSnafu)?
                .remove(column)
                .unwrap_or_default();
            let by_row: HashMap<usize, FeatureValue> = needed.into_iter().zip(values).collect();

            let sampled = matches
                .into_iter()
                .map(|slots| {
                    slots
                        .into_iter()
                        .map(|m| {
                            m.and_then(|row| by_row.get(&row).cloned())
                                .unwrap_or(FeatureValue::Null)
                        })
                        .collect::<FeatureValue>()
                })
                .collect();
            batch.columns.insert(column.clone(), sampled);
        }
        Ok(batch)
    }
}

fn column_ints(batch: &RowBatch, name: &str) -> Vec<Option<i64>> {
    batch
        .column(name)
        .map(|values| values.iter().map(FeatureValue::as_i64).collect())
        .unwrap_or_else(|| vec![None; batch.len()])
}

fn build_timelines(dataset: &RODataset) -> Result<EpisodeTimelines, DatasetError> {
    let mut points = Vec::with_capacity(dataset.len());
    let mut start = 0;
    while start < dataset.len() {
        let end = (start + SCAN_CHUNK_ROWS).min(dataset.len());
        let rows: Vec<usize> = (start..end).collect();
        for (row, keys) in rows.iter().zip(dataset.read_keys(&rows)?) {
            points.push((*row, keys.episode_index, keys.timestamp));
        }
        start = end;
    }
    Ok(EpisodeTimelines::build(points))
}
