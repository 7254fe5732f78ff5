//! Reserved frame columns.
//!
//! These are written into every shard in front of the feature columns and
//! may not be used as feature names.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};

use crate::features::FeatureSchema;

/// Dense global row id.
pub const INDEX: &str = "index";
/// Key of the owning episode.
pub const EPISODE_INDEX: &str = "episode_index";
/// Key of the robot, if any.
pub const ROBOT_INDEX: &str = "robot_index";
/// Key of the task, if any.
pub const TASK_INDEX: &str = "task_index";
/// Key of the frame's instruction, if any.
pub const INSTRUCTION_INDEX: &str = "instruction_index";
/// Frame time in nanoseconds since the epoch, if any.
pub const TIMESTAMP: &str = "timestamp";

/// All reserved column names, in storage order.
pub const RESERVED_COLUMNS: [&str; 6] = [
    INDEX,
    EPISODE_INDEX,
    ROBOT_INDEX,
    TASK_INDEX,
    INSTRUCTION_INDEX,
    TIMESTAMP,
];

/// True if `name` is one of [`RESERVED_COLUMNS`].
pub fn is_reserved_column(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
}

/// Arrow fields of the reserved columns.
pub fn reserved_fields() -> Vec<Field> {
    vec![
        Field::new(INDEX, DataType::Int64, false),
        Field::new(EPISODE_INDEX, DataType::Int64, false),
        Field::new(ROBOT_INDEX, DataType::Int64, true),
        Field::new(TASK_INDEX, DataType::Int64, true),
        Field::new(INSTRUCTION_INDEX, DataType::Int64, true),
        Field::new(TIMESTAMP, DataType::Timestamp(TimeUnit::Nanosecond, None), true),
    ]
}

/// Full shard schema: reserved columns followed by the features.
pub fn frame_arrow_schema(features: &FeatureSchema) -> SchemaRef {
    let mut fields = reserved_fields();
    fields.extend(features.fields().iter().map(|f| f.to_arrow_field()));
    Arc::new(Schema::new(fields))
}

/// Reserved-column values of one frame row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowKeys {
    /// Global row id.
    pub index: i64,
    /// Owning episode.
    pub episode_index: i64,
    /// Robot key.
    pub robot_index: Option<i64>,
    /// Task key.
    pub task_index: Option<i64>,
    /// Instruction key.
    pub instruction_index: Option<i64>,
    /// Frame time, ns.
    pub timestamp: Option<i64>,
}

impl RowKeys {
    /// Approximate stored size of the reserved columns.
    pub(crate) const ESTIMATED_SIZE: usize = 6 * 8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureField, FeatureType};

    #[test]
    fn schema_puts_reserved_columns_first() {
        let features =
            FeatureSchema::new(vec![FeatureField::new("data", FeatureType::Utf8, true)])
                .expect("schema");
        let schema = frame_arrow_schema(&features);
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            vec![
                "index",
                "episode_index",
                "robot_index",
                "task_index",
                "instruction_index",
                "timestamp",
                "data"
            ]
        );
        assert!(!schema.field(0).is_nullable());
        assert!(schema.field(2).is_nullable());
    }
}
