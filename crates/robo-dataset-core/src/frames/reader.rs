//! Sharded frame reader.
//!
//! [`FrameStore`] opens every shard named in the manifest once, keeps its
//! Parquet footer in memory and maps global row indices onto
//! `(shard, local offset)` pairs through cumulative row offsets.

use std::{collections::BTreeMap, fs::File, path::PathBuf, sync::Arc};

use arrow::{
    array::{RecordBatch, UInt32Array},
    compute::{concat_batches, take_record_batch},
    datatypes::{Schema, SchemaRef},
};
use log::debug;
use parquet::arrow::{
    ProjectionMask,
    arrow_reader::{
        ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReaderBuilder, RowSelection,
    },
};
use snafu::prelude::*;

use super::{
    ArrowSnafu, FrameError, NotParquetSnafu, ParquetSnafu, RowOutOfRangeSnafu, ShardRowCountSnafu,
    ShardSchemaSnafu, ShardStorageSnafu, UnknownFrameColumnSnafu,
    columns::{self, RowKeys, frame_arrow_schema},
};
use crate::{
    features::{FeatureSchema, FeatureValue, compat::ensure_arrow_columns_present, convert::value_at},
    manifest::{DatasetManifest, ShardInfo},
    storage::{self, StorageLocation},
};

const PARQUET_MAGIC: &[u8; 4] = b"PAR1";

/// Batch size used when decoding selected rows.
const READ_BATCH_ROWS: usize = 1024;

struct OpenedShard {
    info: ShardInfo,
    path: PathBuf,
    metadata: ArrowReaderMetadata,
}

/// Read-only view of all frame shards of a dataset as one logical table.
pub struct FrameStore {
    schema: SchemaRef,
    shards: Vec<OpenedShard>,
    /// `offsets[i]` is the global index of shard `i`'s first row.
    offsets: Vec<u64>,
    len: u64,
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("shards", &self.shards.len())
            .field("len", &self.len)
            .finish()
    }
}

impl FrameStore {
    /// Open every shard listed in `manifest`.
    ///
    /// Fails if a shard is missing, is not Parquet, lacks a reserved or
    /// feature column, or holds a different row count than recorded.
    pub async fn open(
        location: &StorageLocation,
        manifest: &DatasetManifest,
    ) -> Result<Self, FrameError> {
        let schema = frame_arrow_schema(&manifest.features);
        let mut shards = Vec::with_capacity(manifest.shards.len());
        let mut offsets = Vec::with_capacity(manifest.shards.len());
        let mut len = 0u64;

        for info in &manifest.shards {
            let rel = info.rel_path();
            let ends = storage::read_head_tail_4(location, &rel)
                .await
                .context(ShardStorageSnafu)?;
            ensure!(
                ends.len >= 8 && &ends.head == PARQUET_MAGIC && &ends.tail == PARQUET_MAGIC,
                NotParquetSnafu {
                    path: info.path.clone(),
                }
            );

            let path = location.resolve(&rel);
            let file = File::open(&path)
                .map_err(|e| parquet::errors::ParquetError::External(Box::new(e)))
                .context(ParquetSnafu {
                    path: info.path.clone(),
                })?;
            let metadata = ArrowReaderMetadata::load(&file, ArrowReaderOptions::default())
                .context(ParquetSnafu {
                    path: info.path.clone(),
                })?;

            ensure_arrow_columns_present(&schema, metadata.schema()).context(
                ShardSchemaSnafu {
                    path: info.path.clone(),
                },
            )?;

            let found = metadata.metadata().file_metadata().num_rows() as u64;
            ensure!(
                found == info.row_count,
                ShardRowCountSnafu {
                    path: info.path.clone(),
                    expected: info.row_count,
                    found,
                }
            );

            debug!("opened shard {} ({found} rows)", info.path);
            offsets.push(len);
            len += found;
            shards.push(OpenedShard {
                info: info.clone(),
                path,
                metadata,
            });
        }

        Ok(Self {
            schema,
            shards,
            offsets,
            len,
        })
    }

    /// Total number of rows across all shards.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Logical frame schema (reserved columns first).
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Shards in global row order.
    pub fn shards(&self) -> impl Iterator<Item = &ShardInfo> {
        self.shards.iter().map(|s| &s.info)
    }

    /// Shard number and local offset of global row `row`.
    pub fn locate(&self, row: u64) -> Result<(usize, u64), FrameError> {
        ensure!(
            row < self.len,
            RowOutOfRangeSnafu { row, len: self.len }
        );
        let shard = self.offsets.partition_point(|&start| start <= row) - 1;
        Ok((shard, row - self.offsets[shard]))
    }

    /// Read `rows` (global indices, any order, repeats allowed) restricted to
    /// `columns`, in that column order.
    ///
    /// Each shard is read at most once, selecting only the touched rows; the
    /// result is then reordered to match `rows`.
    pub fn read_rows<S: AsRef<str>>(
        &self,
        rows: &[u64],
        columns: &[S],
    ) -> Result<RecordBatch, FrameError> {
        let mut projection = Vec::with_capacity(columns.len());
        for name in columns {
            let name = name.as_ref();
            let idx = self
                .schema
                .index_of(name)
                .ok()
                .context(UnknownFrameColumnSnafu { column: name })?;
            projection.push(idx);
        }
        let out_schema = Arc::new(self.schema.project(&projection).context(ArrowSnafu)?);

        if rows.is_empty() {
            return Ok(RecordBatch::new_empty(out_schema));
        }

        // shard -> sorted distinct local offsets
        let mut per_shard: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
        let mut located = Vec::with_capacity(rows.len());
        for &row in rows {
            let (shard, local) = self.locate(row)?;
            per_shard.entry(shard).or_default().push(local);
            located.push((shard, local));
        }

        let mut parts = Vec::with_capacity(per_shard.len());
        let mut part_start: BTreeMap<usize, u32> = BTreeMap::new();
        let mut read_so_far = 0u32;
        for (shard, locals) in per_shard.iter_mut() {
            locals.sort_unstable();
            locals.dedup();
            let batch = self.read_shard_rows(*shard, locals, columns, &out_schema)?;
            part_start.insert(*shard, read_so_far);
            read_so_far += batch.num_rows() as u32;
            parts.push(batch);
        }
        let all = concat_batches(&out_schema, &parts).context(ArrowSnafu)?;

        let mut positions = Vec::with_capacity(located.len());
        for (shard, local) in located {
            let locals = &per_shard[&shard];
            let rank = locals.partition_point(|&l| l < local) as u32;
            positions.push(part_start[&shard] + rank);
        }
        take_record_batch(&all, &UInt32Array::from(positions)).context(ArrowSnafu)
    }

    fn read_shard_rows<S: AsRef<str>>(
        &self,
        shard: usize,
        locals: &[u64],
        columns: &[S],
        out_schema: &SchemaRef,
    ) -> Result<RecordBatch, FrameError> {
        let opened = &self.shards[shard];
        let path = opened.info.path.clone();
        let stored: &Schema = opened.metadata.schema();

        let mut roots = Vec::with_capacity(columns.len());
        for name in columns {
            let name = name.as_ref();
            let idx = stored
                .index_of(name)
                .ok()
                .context(UnknownFrameColumnSnafu { column: name })?;
            roots.push(idx);
        }
        let mask = ProjectionMask::roots(opened.metadata.parquet_schema(), roots.iter().copied());

        let total_rows = opened.info.row_count as usize;
        let selection = RowSelection::from_consecutive_ranges(
            consecutive_ranges(locals).into_iter(),
            total_rows,
        );

        let file = File::open(&opened.path)
            .map_err(|e| parquet::errors::ParquetError::External(Box::new(e)))
            .context(ParquetSnafu { path: path.clone() })?;
        let reader =
            ParquetRecordBatchReaderBuilder::new_with_metadata(file, opened.metadata.clone())
                .with_projection(mask)
                .with_row_selection(selection)
                .with_batch_size(READ_BATCH_ROWS)
                .build()
                .context(ParquetSnafu { path: path.clone() })?;

        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch.context(ArrowSnafu)?);
        }
        let Some(first) = batches.first() else {
            return Ok(RecordBatch::new_empty(Arc::clone(out_schema)));
        };
        let merged = concat_batches(&first.schema(), &batches).context(ArrowSnafu)?;

        // The mask yields columns in file order; put them in requested order.
        let mut order = Vec::with_capacity(columns.len());
        for name in columns {
            order.push(
                merged
                    .schema()
                    .index_of(name.as_ref())
                    .context(ArrowSnafu)?,
            );
        }
        let projected = merged.project(&order).context(ArrowSnafu)?;
        RecordBatch::try_new(Arc::clone(out_schema), projected.columns().to_vec())
            .context(ArrowSnafu)
    }

    /// Read the reserved key columns of `rows`.
    pub fn read_keys(&self, rows: &[u64]) -> Result<Vec<RowKeys>, FrameError> {
        let batch = self.read_rows(rows, &columns::RESERVED_COLUMNS)?;
        (0..batch.num_rows())
            .map(|row| decode_keys(&batch, row))
            .collect()
    }
}

/// Collapse sorted distinct offsets into half-open ranges.
fn consecutive_ranges(sorted: &[u64]) -> Vec<std::ops::Range<usize>> {
    let mut ranges: Vec<std::ops::Range<usize>> = Vec::new();
    for &local in sorted {
        let local = local as usize;
        match ranges.last_mut() {
            Some(last) if last.end == local => last.end += 1,
            _ => ranges.push(local..local + 1),
        }
    }
    ranges
}

/// Decode column `name` at `row` of a batch returned by
/// [`FrameStore::read_rows`].
pub fn decode_value(
    batch: &RecordBatch,
    name: &str,
    row: usize,
) -> Result<FeatureValue, FrameError> {
    let column = batch
        .column_by_name(name)
        .context(UnknownFrameColumnSnafu { column: name })?;
    value_at(column.as_ref(), row).context(ArrowSnafu)
}

/// Decode the reserved key columns at `row`; the batch must carry all of them.
pub fn decode_keys(batch: &RecordBatch, row: usize) -> Result<RowKeys, FrameError> {
    let int = |name: &str| -> Result<Option<i64>, FrameError> {
        Ok(match decode_value(batch, name, row)? {
            FeatureValue::Int64(v) | FeatureValue::Timestamp(v) => Some(v),
            _ => None,
        })
    };
    Ok(RowKeys {
        index: int(columns::INDEX)?.unwrap_or_default(),
        episode_index: int(columns::EPISODE_INDEX)?.unwrap_or_default(),
        robot_index: int(columns::ROBOT_INDEX)?,
        task_index: int(columns::TASK_INDEX)?,
        instruction_index: int(columns::INSTRUCTION_INDEX)?,
        timestamp: int(columns::TIMESTAMP)?,
    })
}

/// Decode the feature columns of `features` at `row`.
pub fn decode_features(
    batch: &RecordBatch,
    features: &FeatureSchema,
    row: usize,
) -> Result<BTreeMap<String, FeatureValue>, FrameError> {
    features
        .names()
        .map(|name| Ok((name.to_string(), decode_value(batch, name, row)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        features::{FeatureField, FeatureType},
        frames::writer::{FrameRecord, ShardWriter},
        meta::DatabaseDriver,
    };
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn schema() -> FeatureSchema {
        FeatureSchema::new(vec![
            FeatureField::new("data", FeatureType::Utf8, true),
            FeatureField::new("step", FeatureType::Int32, false),
        ])
        .expect("schema")
    }

    async fn write_store(
        tmp: &TempDir,
        rows: i64,
        max: Option<u64>,
    ) -> Result<FrameStore, Box<dyn std::error::Error>> {
        let location = StorageLocation::local(tmp.path());
        let mut writer = ShardWriter::new(location.clone(), schema(), max);
        for i in 0..rows {
            writer
                .push(FrameRecord {
                    keys: RowKeys {
                        index: i,
                        episode_index: i / 4,
                        robot_index: None,
                        task_index: Some(0),
                        instruction_index: None,
                        timestamp: Some(i * 10),
                    },
                    features: BTreeMap::from([
                        ("data".to_string(), FeatureValue::from(format!("row-{i}"))),
                        ("step".to_string(), FeatureValue::Int32(i as i32)),
                    ]),
                })
                .await?;
        }
        let shards = writer.finish().await?;
        let manifest = DatasetManifest::new(DatabaseDriver::Sqlite, schema(), shards, 0, max);
        Ok(FrameStore::open(&location, &manifest).await?)
    }

    #[tokio::test]
    async fn reads_across_shards_in_requested_order() -> TestResult {
        let tmp = TempDir::new()?;
        let store = write_store(&tmp, 10, Some(200)).await?;
        assert!(store.shards().count() > 1);
        assert_eq!(store.len(), 10);

        let rows = [9, 0, 4, 4, 7];
        let batch = store.read_rows(&rows, &["step", "index"])?;
        assert_eq!(batch.num_rows(), 5);
        assert_eq!(batch.schema().field(0).name(), "step");
        for (pos, &row) in rows.iter().enumerate() {
            assert_eq!(decode_value(&batch, "step", pos)?, FeatureValue::Int32(row as i32));
            assert_eq!(decode_value(&batch, "index", pos)?, FeatureValue::Int64(row as i64));
        }
        Ok(())
    }

    #[tokio::test]
    async fn locate_and_range_checks() -> TestResult {
        let tmp = TempDir::new()?;
        let store = write_store(&tmp, 6, None).await?;
        assert_eq!(store.locate(5)?, (0, 5));
        assert!(matches!(
            store.locate(6),
            Err(FrameError::RowOutOfRange { row: 6, len: 6 })
        ));
        assert!(matches!(
            store.read_rows(&[0], &["nope"]),
            Err(FrameError::UnknownFrameColumn { .. })
        ));
        let keys = store.read_keys(&[5])?;
        assert_eq!(keys[0].episode_index, 1);
        assert_eq!(keys[0].task_index, Some(0));
        assert_eq!(keys[0].timestamp, Some(50));
        Ok(())
    }

    #[tokio::test]
    async fn empty_row_list_gives_empty_batch() -> TestResult {
        let tmp = TempDir::new()?;
        let store = write_store(&tmp, 3, None).await?;
        let batch = store.read_rows::<&str>(&[], &["data"])?;
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_non_parquet_shard() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel = crate::layout::shard_rel_path(0);
        storage::write_atomic(&location, &rel, b"definitely not parquet").await?;
        let manifest = DatasetManifest::new(
            DatabaseDriver::Sqlite,
            schema(),
            vec![ShardInfo {
                path: "data/frames-00000.parquet".to_string(),
                row_count: 1,
                byte_size: 22,
            }],
            1,
            None,
        );
        assert!(matches!(
            FrameStore::open(&location, &manifest).await,
            Err(FrameError::NotParquet { .. })
        ));
        Ok(())
    }

    #[test]
    fn consecutive_offsets_merge() {
        assert_eq!(consecutive_ranges(&[0, 1, 2, 5, 7, 8]), vec![0..3, 5..6, 7..9]);
        assert!(consecutive_ranges(&[]).is_empty());
    }
}
