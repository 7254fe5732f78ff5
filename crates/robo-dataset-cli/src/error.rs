use robo_dataset_core::{dataset::DatasetError, multi_row::MultiRowError};

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display(
        "Failed to open dataset at {dataset}: {source}. \
         Ensure it was written by the packaging pipeline and is complete."
    ))]
    OpenDataset {
        dataset: String,
        #[snafu(source(from(DatasetError, Box::new)))]
        source: Box<DatasetError>,
    },

    #[snafu(display("Failed to read dataset {dataset}: {source}"))]
    ReadDataset {
        dataset: String,
        #[snafu(source(from(DatasetError, Box::new)))]
        source: Box<DatasetError>,
    },

    #[snafu(display("Failed to copy dataset to {dst}: {source}"))]
    CopyDataset {
        dst: String,
        #[snafu(source(from(DatasetError, Box::new)))]
        source: Box<DatasetError>,
    },

    #[snafu(display("Sampler config not found or not accessible: {path}"))]
    ConfigMissing {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Invalid sampler config {path}: {source}"))]
    ConfigJson {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("Sampling failed: {source}"))]
    Sample {
        #[snafu(source(from(MultiRowError, Box::new)))]
        source: Box<MultiRowError>,
    },

    #[snafu(display("Invalid row range {start}..{end} for dataset of {len} rows"))]
    InvalidRange { start: usize, end: usize, len: usize },

    #[snafu(display("Failed to write output: {source}"))]
    Output { source: std::io::Error },

    #[snafu(display("Failed to encode output: {source}"))]
    Encode { source: serde_json::Error },
}
