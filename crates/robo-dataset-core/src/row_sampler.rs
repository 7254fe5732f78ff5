//! Delta-timestamp row sampling.
//!
//! For an anchor row with timestamp `t` and a configured offset `d` (in
//! seconds), the sampler picks the row of the same episode whose timestamp is
//! closest to `t + d`. A candidate is accepted when it lies within
//! `tolerance` seconds of the target. On equal distance the lower row wins.
//! Rows without a timestamp are never candidates.

pub mod timeline;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

pub use timeline::EpisodeTimelines;

/// Default match tolerance in seconds.
pub const DEFAULT_TOLERANCE_SECS: f64 = 0.01;

const NANOS_PER_SEC: f64 = 1e9;

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE_SECS
}

/// What to put in a slot whose offset has no row within tolerance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfTolerance {
    /// A null value.
    #[default]
    Null,
    /// Fail the access with [`SamplerError::OutOfTolerance`].
    Error,
}

/// Configuration of delta-timestamp sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaTimestampSamplerConfig {
    /// Offsets in seconds per column. Columns not listed pass through.
    pub column_delta_ts: BTreeMap<String, Vec<f64>>,
    /// Maximum distance in seconds between target and matched timestamp.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Policy for offsets without a match.
    #[serde(default)]
    pub out_of_tolerance: OutOfTolerance,
}

impl Default for DeltaTimestampSamplerConfig {
    fn default() -> Self {
        Self {
            column_delta_ts: BTreeMap::new(),
            tolerance: DEFAULT_TOLERANCE_SECS,
            out_of_tolerance: OutOfTolerance::default(),
        }
    }
}

impl DeltaTimestampSamplerConfig {
    /// Config with `column_delta_ts` and the default tolerance.
    pub fn new(column_delta_ts: BTreeMap<String, Vec<f64>>) -> Self {
        Self {
            column_delta_ts,
            ..Self::default()
        }
    }

    /// Same config with another tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Same config with another out-of-tolerance policy.
    pub fn with_out_of_tolerance(mut self, policy: OutOfTolerance) -> Self {
        self.out_of_tolerance = policy;
        self
    }

    /// Check offsets and tolerance are finite and the tolerance is not
    /// negative.
    pub fn validate(&self) -> Result<(), SamplerError> {
        ensure!(
            self.tolerance.is_finite() && self.tolerance >= 0.0,
            InvalidToleranceSnafu {
                tolerance: self.tolerance,
            }
        );
        for (column, offsets) in &self.column_delta_ts {
            for &offset in offsets {
                ensure!(
                    offset.is_finite(),
                    InvalidOffsetSnafu {
                        column: column.clone(),
                        offset,
                    }
                );
            }
        }
        Ok(())
    }

    pub(crate) fn tolerance_nanos(&self) -> i64 {
        secs_to_nanos(self.tolerance)
    }
}

pub(crate) fn secs_to_nanos(secs: f64) -> i64 {
    (secs * NANOS_PER_SEC).round() as i64
}

/// Errors raised by delta-timestamp sampling.
#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum SamplerError {
    /// The tolerance is negative or not finite.
    #[snafu(display("Invalid sampler tolerance {tolerance}"))]
    InvalidTolerance {
        /// Configured tolerance.
        tolerance: f64,
    },

    /// An offset is not finite.
    #[snafu(display("Invalid offset {offset} for column '{column}'"))]
    InvalidOffset {
        /// Column the offset belongs to.
        column: String,
        /// Configured offset.
        offset: f64,
    },

    /// A configured column is not visible in the dataset.
    #[snafu(display("Sampler column '{column}' is not a dataset column"))]
    UnknownSamplerColumn {
        /// Configured column.
        column: String,
    },

    /// The anchor row has no timestamp but offsets are configured.
    #[snafu(display("Row {row} has no timestamp to sample around"))]
    MissingTimestamp {
        /// Anchor row.
        row: usize,
    },

    /// No row lies within tolerance of the target time.
    #[snafu(display(
        "No row within tolerance of offset {offset}s for column '{column}' at row {row}"
    ))]
    OutOfTolerance {
        /// Sampled column.
        column: String,
        /// Offset that found no match.
        offset: f64,
        /// Anchor row.
        row: usize,
    },
}
