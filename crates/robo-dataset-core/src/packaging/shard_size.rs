//! Human-readable shard size limits (`"1MB"`, `"512KiB"`, `"4096"`).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Errors that can occur while parsing a [`ShardSize`] from a string.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum ParseShardSizeError {
    /// The input string was empty or whitespace.
    #[snafu(display("shard size cannot be empty"))]
    Empty,

    /// The numeric portion of the spec failed to parse.
    #[snafu(display("invalid shard size value in '{spec}': {source}"))]
    InvalidNumber {
        /// The original spec string.
        spec: String,
        /// The parse error returned by `u64::from_str`.
        source: std::num::ParseIntError,
    },

    /// The parsed size was zero.
    #[snafu(display("shard size must be > 0 in '{spec}'"))]
    Zero {
        /// The original spec string.
        spec: String,
    },

    /// The size does not fit in 64 bits once scaled by its unit.
    #[snafu(display("shard size '{spec}' overflows u64"))]
    Overflow {
        /// The original spec string.
        spec: String,
    },

    /// The spec used an unsupported unit suffix.
    #[snafu(display(
        "unknown shard size unit '{unit}' in '{spec}' (expected B|KB|MB|GB|TB|KiB|MiB|GiB|TiB)"
    ))]
    UnknownUnit {
        /// The original spec string.
        spec: String,
        /// The unrecognized unit suffix.
        unit: String,
    },
}

/// Upper bound on the estimated size of one frame shard, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardSize(u64);

impl ShardSize {
    /// Limit of `bytes` bytes; `None` for zero.
    pub fn from_bytes(bytes: u64) -> Option<Self> {
        (bytes > 0).then_some(Self(bytes))
    }

    /// The limit in bytes.
    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Parse a human-friendly size (e.g. `1MB`, `512KiB`, `4096`).
    ///
    /// Decimal units (`KB`, `MB`, ...) are powers of 1000, binary units
    /// (`KiB`, `MiB`, ...) powers of 1024. Units are case-insensitive and a
    /// bare number means bytes.
    ///
    /// # Errors
    /// Returns [`ParseShardSizeError`] if the spec is empty, has an invalid or
    /// zero number, overflows, or uses an unsupported unit.
    pub fn parse(spec: &str) -> Result<Self, ParseShardSizeError> {
        spec.parse()
    }
}

impl FromStr for ShardSize {
    type Err = ParseShardSizeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let spec = input.trim();
        ensure!(!spec.is_empty(), EmptySnafu);

        let unit_start = spec
            .char_indices()
            .find(|(_, c)| c.is_ascii_alphabetic())
            .map_or(spec.len(), |(i, _)| i);
        let (num_str, unit_str) = spec.split_at(unit_start);

        let value: u64 = num_str
            .trim()
            .parse()
            .context(InvalidNumberSnafu { spec })?;
        ensure!(value > 0, ZeroSnafu { spec });

        let multiplier: u64 = match unit_str.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "kb" => 1_000,
            "mb" => 1_000_000,
            "gb" => 1_000_000_000,
            "tb" => 1_000_000_000_000,
            "kib" => 1 << 10,
            "mib" => 1 << 20,
            "gib" => 1 << 30,
            "tib" => 1 << 40,
            _ => {
                return UnknownUnitSnafu {
                    spec,
                    unit: unit_str.trim(),
                }
                .fail();
            }
        };

        value
            .checked_mul(multiplier)
            .map(ShardSize)
            .context(OverflowSnafu { spec })
    }
}

impl fmt::Display for ShardSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_binary_and_bare_sizes() {
        assert_eq!(ShardSize::parse("1MB").map(ShardSize::bytes), Ok(1_000_000));
        assert_eq!(ShardSize::parse(" 512 KiB ").map(ShardSize::bytes), Ok(512 * 1024));
        assert_eq!(ShardSize::parse("2gb").map(ShardSize::bytes), Ok(2_000_000_000));
        assert_eq!(ShardSize::parse("4096").map(ShardSize::bytes), Ok(4096));
        assert_eq!(ShardSize::parse("10B").map(ShardSize::bytes), Ok(10));
        assert_eq!(ShardSize::parse("1TiB").map(ShardSize::bytes), Ok(1 << 40));
    }

    #[test]
    fn rejects_bad_specs() {
        assert_eq!(ShardSize::parse("  "), Err(ParseShardSizeError::Empty));
        assert!(matches!(
            ShardSize::parse("MB"),
            Err(ParseShardSizeError::InvalidNumber { .. })
        ));
        assert!(matches!(
            ShardSize::parse("0KB"),
            Err(ParseShardSizeError::Zero { .. })
        ));
        assert!(matches!(
            ShardSize::parse("3 parsecs"),
            Err(ParseShardSizeError::UnknownUnit { unit, .. }) if unit == "parsecs"
        ));
        assert!(matches!(
            ShardSize::parse("99999999999TB"),
            Err(ParseShardSizeError::Overflow { .. })
        ));
    }

    #[test]
    fn zero_bytes_is_not_a_limit() {
        assert_eq!(ShardSize::from_bytes(0), None);
        assert_eq!(ShardSize::from_bytes(7).map(ShardSize::bytes), Some(7));
    }
}
