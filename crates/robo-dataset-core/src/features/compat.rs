//! Helpers for enforcing schema compatibility.
//!
//! Rule: **no schema evolution**. Every episode fed to a packaging run must
//! declare exactly the packaging schema:
//! - same column set (order-insensitive),
//! - same logical type (including nested element and field definitions),
//! - same `nullable` flag.
//!
//! The same rule, expressed over Arrow types, is used when a shard is opened
//! and its embedded schema is compared with the manifest.

use std::collections::HashMap;

use arrow::datatypes::{DataType, Schema};
use snafu::prelude::*;

use super::{FeatureField, FeatureSchema, FeatureType};

/// Errors raised when two schemas are not compatible.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum SchemaCompatibilityError {
    /// The candidate is missing a column that exists in the reference schema.
    #[snafu(display("Schema is missing required column {column}"))]
    MissingColumn {
        /// The name of the missing column.
        column: String,
    },

    /// The candidate has an extra column that does not exist in the reference schema.
    #[snafu(display("Schema has extra column {column} not present in the dataset schema"))]
    ExtraColumn {
        /// The name of the extra column.
        column: String,
    },

    /// Column exists in both schemas, but the logical type or nullability differ.
    #[snafu(display(
        "Type mismatch for column {column}: dataset has {expected}, got {found} (nullable {expected_nullable} vs {found_nullable})"
    ))]
    TypeMismatch {
        /// The name of the column with mismatched type.
        column: String,
        /// The type in the reference schema.
        expected: FeatureType,
        /// The type in the candidate schema.
        found: FeatureType,
        /// Nullability in the reference schema.
        expected_nullable: bool,
        /// Nullability in the candidate schema.
        found_nullable: bool,
    },

    /// A physical (Arrow) column does not have the expected type.
    #[snafu(display("Stored column {column} has type {found}, expected {expected}"))]
    ArrowTypeMismatch {
        /// The name of the column.
        column: String,
        /// The Arrow type derived from the manifest.
        expected: DataType,
        /// The Arrow type found in storage.
        found: DataType,
    },
}

/// A convenience type alias for results of schema compatibility operations.
pub type SchemaResult<T> = Result<T, SchemaCompatibilityError>;

fn columns_by_name(schema: &FeatureSchema) -> HashMap<&str, &FeatureField> {
    schema
        .fields()
        .iter()
        .map(|col| (col.name.as_str(), col))
        .collect()
}

/// Require `candidate` to declare exactly the columns of `reference`.
pub fn ensure_schema_exact_match(
    reference: &FeatureSchema,
    candidate: &FeatureSchema,
) -> SchemaResult<()> {
    let expected = columns_by_name(reference);
    let found = columns_by_name(candidate);

    for field in reference.fields() {
        match found.get(field.name.as_str()) {
            None => {
                return MissingColumnSnafu {
                    column: field.name.clone(),
                }
                .fail();
            }
            Some(other) => {
                if field.data_type != other.data_type || field.nullable != other.nullable {
                    return TypeMismatchSnafu {
                        column: field.name.clone(),
                        expected: field.data_type.clone(),
                        found: other.data_type.clone(),
                        expected_nullable: field.nullable,
                        found_nullable: other.nullable,
                    }
                    .fail();
                }
            }
        }
    }

    for field in candidate.fields() {
        if !expected.contains_key(field.name.as_str()) {
            return ExtraColumnSnafu {
                column: field.name.clone(),
            }
            .fail();
        }
    }

    Ok(())
}

/// Require every column of `expected` to be present in `stored` with the same
/// Arrow data type. Extra stored columns are tolerated.
pub fn ensure_arrow_columns_present(expected: &Schema, stored: &Schema) -> SchemaResult<()> {
    for field in expected.fields() {
        let Ok(found) = stored.field_with_name(field.name()) else {
            return MissingColumnSnafu {
                column: field.name().clone(),
            }
            .fail();
        };
        if found.data_type() != field.data_type() {
            return ArrowTypeMismatchSnafu {
                column: field.name().clone(),
                expected: field.data_type().clone(),
                found: found.data_type().clone(),
            }
            .fail();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::Field;

    use super::*;

    fn schema(cols: Vec<(&str, FeatureType, bool)>) -> FeatureSchema {
        FeatureSchema::new(
            cols.into_iter()
                .map(|(name, dtype, nullable)| FeatureField::new(name, dtype, nullable))
                .collect(),
        )
        .expect("valid feature schema")
    }

    #[test]
    fn schemas_match_regardless_of_order() {
        let a = schema(vec![
            ("data", FeatureType::Utf8, true),
            ("v", FeatureType::Float64, false),
        ]);
        let b = schema(vec![
            ("v", FeatureType::Float64, false),
            ("data", FeatureType::Utf8, true),
        ]);
        ensure_schema_exact_match(&a, &b).expect("same columns");
    }

    #[test]
    fn missing_extra_and_mismatched_columns() {
        let reference = schema(vec![("data", FeatureType::Utf8, true)]);

        let missing = schema(vec![]);
        assert!(matches!(
            ensure_schema_exact_match(&reference, &missing),
            Err(SchemaCompatibilityError::MissingColumn { .. })
        ));

        let extra = schema(vec![
            ("data", FeatureType::Utf8, true),
            ("more", FeatureType::Bool, true),
        ]);
        assert!(matches!(
            ensure_schema_exact_match(&reference, &extra),
            Err(SchemaCompatibilityError::ExtraColumn { ref column }) if column == "more"
        ));

        let nullability = schema(vec![("data", FeatureType::Utf8, false)]);
        assert!(matches!(
            ensure_schema_exact_match(&reference, &nullability),
            Err(SchemaCompatibilityError::TypeMismatch { .. })
        ));

        let nested = schema(vec![(
            "data",
            FeatureType::list_of(FeatureType::Utf8),
            true,
        )]);
        assert!(matches!(
            ensure_schema_exact_match(&reference, &nested),
            Err(SchemaCompatibilityError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn arrow_columns_checked_by_name_and_type() {
        let expected = Schema::new(vec![Field::new("index", DataType::Int64, false)]);
        let good = Schema::new(vec![
            Field::new("extra", DataType::Utf8, true),
            Field::new("index", DataType::Int64, false),
        ]);
        ensure_arrow_columns_present(&expected, &good).expect("present");

        let bad = Schema::new(vec![Field::new("index", DataType::Int32, false)]);
        assert!(matches!(
            ensure_arrow_columns_present(&expected, &bad),
            Err(SchemaCompatibilityError::ArrowTypeMismatch { .. })
        ));

        let empty = Schema::empty();
        assert!(matches!(
            ensure_arrow_columns_present(&expected, &empty),
            Err(SchemaCompatibilityError::MissingColumn { .. })
        ));
    }
}
