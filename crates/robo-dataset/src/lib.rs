//! # robo-dataset
//!
//! Episodic robot datasets: frames in sharded Parquet files, episodes,
//! robots, tasks and instructions in an embedded SQLite or DuckDB database.
//!
//! This crate is the supported public entry point and provides a small, stable surface.
//!
//! ## Example
//!
//! ```rust,ignore
//! use robo_dataset::prelude::*;
//!
//! let packaging = DatasetPackaging::new(features, DatabaseDriver::DuckDb);
//! packaging.packaging(episodes, "out/dataset", Some("1GB".parse()?)).await?;
//!
//! let dataset = RODataset::open("out/dataset", true).await?;
//! let row = dataset.get(0)?;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Metadata entities and lookups.
pub mod meta {
    pub use robo_dataset_core::meta::{
        DatabaseDriver, Episode, Instruction, MetaCounts, MetaEntity, Robot, Task,
    };
}

/// Delta-timestamp sampling.
pub mod sampling {
    pub use robo_dataset_core::multi_row::{MultiRowError, MultiRowHandle, ROMultiRowDataset};
    pub use robo_dataset_core::row_sampler::{
        DEFAULT_TOLERANCE_SECS, DeltaTimestampSamplerConfig, OutOfTolerance, SamplerError,
    };
}

pub use robo_dataset_core::dataset::{
    Column, DatasetError, DatasetHandle, Indices, LazyColumn, OpenOptions, RODataset, Row,
    RowBatch, RowMeta,
};
pub use robo_dataset_core::features::{FeatureField, FeatureSchema, FeatureType, FeatureValue};
pub use robo_dataset_core::manifest::DatasetManifest;
pub use robo_dataset_core::packaging::{
    DataFrame, DatasetPackaging, EpisodeMeta, EpisodePackaging, InstructionData, PackagingError,
    PackagingSummary, ParseShardSizeError, RobotData, ShardSize, SourceError, TaskData,
};
