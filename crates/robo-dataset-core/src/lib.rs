//! Core engine for episodic robot datasets.
//!
//! A dataset is a directory holding two stores kept consistent with each
//! other:
//!
//! - frame rows in size-bounded Parquet shards, addressed by a dense global
//!   row index (`frames` module),
//! - episodes, robots, tasks and instructions in an embedded SQLite or
//!   DuckDB database (`meta` module),
//!
//! tied together by a JSON manifest (`manifest` module).
//!
//! Datasets are written once by the packaging pipeline (`packaging`) and then
//! read through [`dataset::RODataset`], or through
//! [`multi_row::ROMultiRowDataset`] for delta-timestamp sampling.
#![warn(missing_docs)]

pub mod dataset;
pub mod features;
pub mod frames;
pub mod layout;
pub mod manifest;
pub mod meta;
pub mod multi_row;
pub mod packaging;
pub mod row_sampler;
pub mod storage;
