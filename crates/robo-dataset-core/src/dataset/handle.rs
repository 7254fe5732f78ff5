//! Serializable dataset handles and open options.
//!
//! A [`DatasetHandle`] is everything needed to rebuild an [`RODataset`] view
//! in another process: the dataset path plus the view's options, projection
//! and row selection. Reopening reads both stores again; no data is copied.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{DatasetError, RODataset};

/// Options for [`RODataset::open_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Resolve `*_index` keys into metadata entities on row access.
    #[serde(default)]
    pub meta_index2meta: bool,
}

/// Reopenable description of an [`RODataset`] view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHandle {
    /// Dataset root.
    pub path: PathBuf,
    /// Open options of the view.
    #[serde(default)]
    pub options: OpenOptions,
    /// Visible feature columns, `None` for all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    /// Visible rows as positions in the underlying dataset, `None` for all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<u64>>,
}

impl DatasetHandle {
    /// Reopen the dataset and reapply projection and selection.
    pub async fn open(&self) -> Result<RODataset, DatasetError> {
        let mut dataset = RODataset::open_with(&self.path, self.options).await?;
        if let Some(columns) = &self.columns {
            dataset = dataset.select_columns(columns)?;
        }
        if let Some(rows) = &self.rows {
            let rows: Vec<usize> = rows.iter().map(|&r| r as usize).collect();
            dataset = dataset.select(rows)?;
        }
        Ok(dataset)
    }
}
