//! Frame storage: the sharded Parquet half of a dataset.
//!
//! Every frame row carries the reserved key columns from [`columns`] plus
//! the dataset's feature columns. [`writer::ShardWriter`] streams rows into
//! size-bounded shards during packaging and save; [`reader::FrameStore`]
//! addresses rows by global index across all shards.

pub mod columns;
pub mod reader;
pub mod writer;

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{features::compat::SchemaCompatibilityError, storage::StorageError};

pub use columns::{RowKeys, frame_arrow_schema};
pub use reader::FrameStore;
pub use writer::{FrameRecord, ShardWriter};

/// Errors raised while writing or reading frame shards.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FrameError {
    /// Storage error while touching a shard file.
    #[snafu(display("Shard storage error: {source}"))]
    ShardStorage {
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// Parquet read or write error.
    #[snafu(display("Parquet error in {path}: {source}"))]
    Parquet {
        /// Shard path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow conversion or compute error.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// The shard file does not carry Parquet magic bytes.
    #[snafu(display("Shard {path} is not a Parquet file"))]
    NotParquet {
        /// Shard path.
        path: String,
    },

    /// The shard's embedded schema does not match the manifest.
    #[snafu(display("Shard {path} does not match the dataset schema: {source}"))]
    ShardSchema {
        /// Shard path.
        path: String,
        /// What differs.
        source: SchemaCompatibilityError,
    },

    /// The shard holds a different number of rows than the manifest says.
    #[snafu(display("Shard {path} holds {found} rows, manifest says {expected}"))]
    ShardRowCount {
        /// Shard path.
        path: String,
        /// Rows per manifest.
        expected: u64,
        /// Rows in the file.
        found: u64,
    },

    /// A global row index past the end of the store.
    #[snafu(display("Row {row} out of range for {len} rows"))]
    RowOutOfRange {
        /// Requested row.
        row: u64,
        /// Row count of the store.
        len: u64,
    },

    /// A column that is neither reserved nor a declared feature.
    #[snafu(display("Unknown frame column {column}"))]
    UnknownFrameColumn {
        /// Requested column.
        column: String,
    },
}
