//! Column access.

use crate::{
    dataset::{DatasetError, Indices, RODataset, SCAN_CHUNK_ROWS},
    features::FeatureValue,
    meta::{Episode, Instruction, Robot, Task},
};

/// Result of [`RODataset::column`].
#[derive(Debug, Clone)]
pub enum Column {
    /// Raw values, read on demand.
    Values(LazyColumn),
    /// Resolved `episode_index`.
    Episodes(Vec<Option<Episode>>),
    /// Resolved `robot_index`.
    Robots(Vec<Option<Robot>>),
    /// Resolved `task_index`.
    Tasks(Vec<Option<Task>>),
    /// Resolved `instruction_index`.
    Instructions(Vec<Option<Instruction>>),
}

impl Column {
    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            Column::Values(c) => c.len(),
            Column::Episodes(v) => v.len(),
            Column::Robots(v) => v.len(),
            Column::Tasks(v) => v.len(),
            Column::Instructions(v) => v.len(),
        }
    }

    /// True if the column has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The lazy column, if this is a raw column.
    pub fn as_values(&self) -> Option<&LazyColumn> {
        match self {
            Column::Values(c) => Some(c),
            _ => None,
        }
    }
}

/// One column of a dataset view; values are decoded when asked for.
#[derive(Debug, Clone)]
pub struct LazyColumn {
    dataset: RODataset,
    name: String,
}

impl LazyColumn {
    pub(crate) fn new(dataset: RODataset, name: &str) -> Self {
        Self {
            dataset,
            name: name.to_string(),
        }
    }

    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    /// True if the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at row `index`.
    pub fn get(&self, index: usize) -> Result<FeatureValue, DatasetError> {
        Ok(self.get_batch(vec![index])?.pop().unwrap_or_default())
    }

    /// Values at `indices`, in order.
    pub fn get_batch(&self, indices: impl Into<Indices>) -> Result<Vec<FeatureValue>, DatasetError> {
        let rows = indices.into().to_vec();
        let mut values = self.dataset.read_values(&rows, &[self.name.as_str()])?;
        Ok(values.remove(&self.name).unwrap_or_default())
    }

    /// Every value of the column, reading in bounded chunks.
    pub fn to_vec(&self) -> Result<Vec<FeatureValue>, DatasetError> {
        let mut out = Vec::with_capacity(self.len());
        let mut start = 0;
        while start < self.len() {
            let end = (start + SCAN_CHUNK_ROWS).min(self.len());
            out.extend(self.get_batch(start..end)?);
            start = end;
        }
        Ok(out)
    }
}
