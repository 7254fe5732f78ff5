//! Size-bounded shard writer.
//!
//! Rows are buffered and written to the current shard in batches of at
//! most [`WRITE_BATCH_ROWS`]. Each row's size is estimated up front; when the
//! current shard already holds data and the next row would push it past the
//! limit, the shard is closed and the row starts a new one. A single row
//! larger than the limit therefore still gets a shard of its own.
//!
//! Shards are streamed to temp files and only renamed into place when
//! closed, so an aborted run leaves no partial `.parquet` files behind.

use std::{collections::BTreeMap, fs::File, io::BufWriter, sync::Arc};

use arrow::{
    array::{ArrayRef, Int64Array, RecordBatch, TimestampNanosecondArray},
    datatypes::SchemaRef,
};
use log::{debug, info};
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use snafu::prelude::*;

use super::{
    ArrowSnafu, FrameError, ParquetSnafu, ShardStorageSnafu,
    columns::{RowKeys, frame_arrow_schema},
};
use crate::{
    features::{FeatureSchema, FeatureValue, convert::build_array},
    layout,
    manifest::{ShardInfo, manifest_path_string},
    storage::{
        StorageLocation,
        output::{PendingFile, open_pending_file},
    },
};

/// Maximum rows per record batch handed to the Parquet writer.
pub const WRITE_BATCH_ROWS: usize = 256;

/// Maximum rows per Parquet row group.
pub const ROW_GROUP_ROWS: usize = 4096;

static NULL: FeatureValue = FeatureValue::Null;

/// One frame row ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// Reserved column values.
    pub keys: RowKeys,
    /// Feature values by column name; missing columns are stored as null.
    pub features: BTreeMap<String, FeatureValue>,
}

impl FrameRecord {
    /// Approximate stored size of the row.
    pub fn estimated_size(&self) -> u64 {
        let features: usize = self.features.values().map(FeatureValue::estimated_size).sum();
        (RowKeys::ESTIMATED_SIZE + features) as u64
    }
}

struct OpenShard {
    id: usize,
    pending: PendingFile,
    writer: ArrowWriter<BufWriter<File>>,
    rows: u64,
    estimated_bytes: u64,
}

/// Streams frame rows into `data/frames-NNNNN.parquet` shards.
pub struct ShardWriter {
    location: StorageLocation,
    features: FeatureSchema,
    schema: SchemaRef,
    max_shard_size: Option<u64>,
    next_shard_id: usize,
    current: Option<OpenShard>,
    buffer: Vec<FrameRecord>,
    shards: Vec<ShardInfo>,
}

impl std::fmt::Debug for ShardWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardWriter")
            .field("location", &self.location)
            .field("max_shard_size", &self.max_shard_size)
            .field("next_shard_id", &self.next_shard_id)
            .field("buffered", &self.buffer.len())
            .field("closed_shards", &self.shards.len())
            .finish()
    }
}

impl ShardWriter {
    /// New writer rooted at `location`. `max_shard_size` of `None` means a
    /// single shard.
    pub fn new(
        location: StorageLocation,
        features: FeatureSchema,
        max_shard_size: Option<u64>,
    ) -> Self {
        let schema = frame_arrow_schema(&features);
        Self {
            location,
            features,
            schema,
            max_shard_size,
            next_shard_id: 0,
            current: None,
            buffer: Vec::with_capacity(WRITE_BATCH_ROWS),
            shards: Vec::new(),
        }
    }

    /// Arrow schema of the shards being written.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Append one row, rotating shards as needed.
    pub async fn push(&mut self, record: FrameRecord) -> Result<(), FrameError> {
        let size = record.estimated_size();

        let rotate = match (&self.current, self.max_shard_size) {
            (Some(shard), Some(max)) => {
                shard.estimated_bytes > 0 && shard.estimated_bytes + size > max
            }
            _ => false,
        };
        if rotate {
            self.close_current().await?;
        }
        if self.current.is_none() {
            self.open_next().await?;
        }

        if let Some(shard) = self.current.as_mut() {
            shard.rows += 1;
            shard.estimated_bytes += size;
        }
        self.buffer.push(record);

        if self.buffer.len() >= WRITE_BATCH_ROWS {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Close the open shard and return every shard written, in order.
    pub async fn finish(mut self) -> Result<Vec<ShardInfo>, FrameError> {
        self.close_current().await?;
        Ok(self.shards)
    }

    async fn open_next(&mut self) -> Result<(), FrameError> {
        let id = self.next_shard_id;
        let rel = layout::shard_rel_path(id);
        let (pending, sink) = open_pending_file(&self.location, &rel)
            .await
            .context(ShardStorageSnafu)?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(ROW_GROUP_ROWS)
            .build();
        let writer =
            ArrowWriter::try_new(sink, Arc::clone(&self.schema), Some(props)).context(
                ParquetSnafu {
                    path: manifest_path_string(&rel),
                },
            )?;

        debug!("opened shard {}", pending.final_path().display());
        self.next_shard_id += 1;
        self.current = Some(OpenShard {
            id,
            pending,
            writer,
            rows: 0,
            estimated_bytes: 0,
        });
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<(), FrameError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let Some(shard) = self.current.as_mut() else {
            return Ok(());
        };

        let batch = build_batch(&self.schema, &self.features, &self.buffer)?;
        let path = manifest_path_string(&layout::shard_rel_path(shard.id));
        shard.writer.write(&batch).context(ParquetSnafu { path })?;
        self.buffer.clear();
        Ok(())
    }

    async fn close_current(&mut self) -> Result<(), FrameError> {
        self.flush_buffer()?;
        let Some(shard) = self.current.take() else {
            return Ok(());
        };

        let rel = layout::shard_rel_path(shard.id);
        let path = manifest_path_string(&rel);
        let sink = shard
            .writer
            .into_inner()
            .context(ParquetSnafu { path: path.clone() })?;
        let byte_size = shard
            .pending
            .commit(sink)
            .await
            .context(ShardStorageSnafu)?;

        info!(
            "wrote shard {path}: {} rows, {byte_size} bytes",
            shard.rows
        );
        self.shards.push(ShardInfo {
            path,
            row_count: shard.rows,
            byte_size,
        });
        Ok(())
    }
}

/// Build one record batch (reserved columns, then features) from `rows`.
pub(crate) fn build_batch(
    schema: &SchemaRef,
    features: &FeatureSchema,
    rows: &[FrameRecord],
) -> Result<RecordBatch, FrameError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    let keys = rows.iter().map(|r| &r.keys);
    columns.push(Arc::new(Int64Array::from_iter_values(
        keys.clone().map(|k| k.index),
    )));
    columns.push(Arc::new(Int64Array::from_iter_values(
        keys.clone().map(|k| k.episode_index),
    )));
    columns.push(Arc::new(keys.clone().map(|k| k.robot_index).collect::<Int64Array>()));
    columns.push(Arc::new(keys.clone().map(|k| k.task_index).collect::<Int64Array>()));
    columns.push(Arc::new(
        keys.clone()
            .map(|k| k.instruction_index)
            .collect::<Int64Array>(),
    ));
    columns.push(Arc::new(
        keys.map(|k| k.timestamp)
            .collect::<TimestampNanosecondArray>(),
    ));

    for field in features.fields() {
        let values: Vec<&FeatureValue> = rows
            .iter()
            .map(|r| r.features.get(&field.name).unwrap_or(&NULL))
            .collect();
        columns.push(build_array(&field.data_type, &values).context(ArrowSnafu)?);
    }

    RecordBatch::try_new(Arc::clone(schema), columns).context(ArrowSnafu)
}
