//! Materialized rows and row batches.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    features::FeatureValue,
    meta::{Episode, Instruction, Robot, Task},
};

/// Metadata entities referenced by one frame row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowMeta {
    /// Owning episode.
    pub episode: Option<Episode>,
    /// Robot, if the episode has one.
    pub robot: Option<Robot>,
    /// Task, if the episode has one.
    pub task: Option<Task>,
    /// Instruction active during the frame.
    pub instruction: Option<Instruction>,
}

/// One frame row: every visible column plus, optionally, resolved metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Column values by name, reserved columns included.
    pub values: BTreeMap<String, FeatureValue>,
    /// Resolved metadata, present when the dataset resolves keys.
    pub meta: Option<RowMeta>,
}

impl Row {
    /// Value of column `name`.
    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name)
    }

    /// Column names, sorted.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Plain JSON object of the row; metadata goes under `"meta"`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        if let Some(meta) = &self.meta {
            object.insert(
                "meta".to_string(),
                serde_json::to_value(meta).unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::Value::Object(object)
    }
}

/// Resolved metadata of a batch, one entry per requested row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetaColumns {
    /// Episode of each row.
    pub episodes: Vec<Option<Episode>>,
    /// Robot of each row.
    pub robots: Vec<Option<Robot>>,
    /// Task of each row.
    pub tasks: Vec<Option<Task>>,
    /// Instruction of each row.
    pub instructions: Vec<Option<Instruction>>,
}

impl MetaColumns {
    /// Metadata of row `i` of the batch.
    pub fn row(&self, i: usize) -> RowMeta {
        RowMeta {
            episode: self.episodes.get(i).cloned().flatten(),
            robot: self.robots.get(i).cloned().flatten(),
            task: self.tasks.get(i).cloned().flatten(),
            instruction: self.instructions.get(i).cloned().flatten(),
        }
    }
}

/// Column-major result of batch access, in requested row order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    len: usize,
    /// Values by column name, one entry per requested row.
    pub columns: BTreeMap<String, Vec<FeatureValue>>,
    /// Resolved metadata, present when the dataset resolves keys.
    pub meta: Option<MetaColumns>,
}

impl RowBatch {
    pub(crate) fn new(
        len: usize,
        columns: BTreeMap<String, Vec<FeatureValue>>,
        meta: Option<MetaColumns>,
    ) -> Self {
        Self { len, columns, meta }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Values of column `name`.
    pub fn column(&self, name: &str) -> Option<&[FeatureValue]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Column names, sorted.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Row `i` of the batch.
    pub fn row(&self, i: usize) -> Option<Row> {
        if i >= self.len {
            return None;
        }
        let values = self
            .columns
            .iter()
            .map(|(name, values)| {
                (
                    name.clone(),
                    values.get(i).cloned().unwrap_or(FeatureValue::Null),
                )
            })
            .collect();
        Some(Row {
            values,
            meta: self.meta.as_ref().map(|m| m.row(i)),
        })
    }

    /// Rows in order.
    pub fn into_rows(self) -> Vec<Row> {
        (0..self.len).filter_map(|i| self.row(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_rows_pick_the_same_position_in_every_column() {
        let batch = RowBatch::new(
            2,
            BTreeMap::from([
                ("a".to_string(), vec![FeatureValue::Int32(1), FeatureValue::Int32(2)]),
                ("b".to_string(), vec![FeatureValue::from("x"), FeatureValue::Null]),
            ]),
            None,
        );
        let row = batch.row(1).expect("row 1");
        assert_eq!(row.get("a"), Some(&FeatureValue::Int32(2)));
        assert_eq!(row.get("b"), Some(&FeatureValue::Null));
        assert!(batch.row(2).is_none());
        assert_eq!(
            row.to_json(),
            serde_json::json!({"a": 2, "b": null})
        );
    }
}
