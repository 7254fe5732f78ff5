//! Wrapper prelude.
//!
//! The `robo-dataset` crate is the supported public entry point.
//! Downstream code should prefer importing from this prelude instead of
//! depending on internal core module paths.

pub use crate::meta::{self, DatabaseDriver};
pub use crate::sampling::{DeltaTimestampSamplerConfig, OutOfTolerance, ROMultiRowDataset};
pub use crate::{
    DataFrame, DatasetError, DatasetPackaging, EpisodeMeta, EpisodePackaging, FeatureField,
    FeatureSchema, FeatureType, FeatureValue, InstructionData, PackagingError, RODataset,
    RobotData, Row, ShardSize, SourceError, TaskData,
};
