//! Feature schema model.
//!
//! A dataset declares its per-frame payload as an ordered list of
//! [`FeatureField`]s. Each field has a logical [`FeatureType`] which maps
//! one-to-one onto an Arrow [`DataType`]; the mapping is what the shard
//! writer uses to build record batches and what the reader uses to check
//! shards against the manifest.
//!
//! Submodules:
//! - [`value`]: the dynamic [`FeatureValue`] model and conformance checks,
//! - [`convert`]: `FeatureValue` <-> Arrow array conversion,
//! - [`compat`]: schema compatibility rules (no schema evolution).

pub mod compat;
pub mod convert;
pub mod value;

use std::{collections::HashSet, fmt, sync::Arc};

use arrow::datatypes::{DataType, Field, FieldRef, Fields, TimeUnit};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::frames::columns::is_reserved_column;

pub use value::{FeatureValue, FeatureValueError};

/// A named, typed column of the frame payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureField {
    /// Column name.
    pub name: String,
    /// Logical data type of the column.
    pub data_type: FeatureType,
    /// Whether the column allows null values.
    pub nullable: bool,
}

impl FeatureField {
    /// Create a new field.
    pub fn new(name: impl Into<String>, data_type: FeatureType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    /// Arrow field for this feature.
    pub fn to_arrow_field(&self) -> Field {
        Field::new(
            self.name.clone(),
            self.data_type.to_arrow_datatype(),
            self.nullable,
        )
    }

    fn to_arrow_field_ref(&self) -> FieldRef {
        Arc::new(self.to_arrow_field())
    }
}

impl fmt::Display for FeatureField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{}?: {}", self.name, self.data_type)
        } else {
            write!(f, "{}: {}", self.name, self.data_type)
        }
    }
}

/// Logical data types a feature column can have.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeatureType {
    /// Boolean value.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 encoded string.
    Utf8,
    /// Variable-length binary data (encoded images, point clouds, ...).
    Binary,
    /// Nanoseconds since the Unix epoch, no timezone.
    Timestamp,
    /// Variable-length list with a single element field definition.
    List {
        /// Element field definition for list items.
        elements: Box<FeatureField>,
    },
    /// Struct with named child fields.
    Struct {
        /// Ordered set of child fields for the struct.
        fields: Vec<FeatureField>,
    },
}

impl FeatureType {
    /// List of nullable `element` values, with the conventional `item`
    /// element name.
    pub fn list_of(element: FeatureType) -> Self {
        FeatureType::List {
            elements: Box::new(FeatureField::new("item", element, true)),
        }
    }

    /// Struct over `fields`.
    pub fn struct_of(fields: Vec<FeatureField>) -> Self {
        FeatureType::Struct { fields }
    }

    /// Arrow data type for this logical type.
    pub fn to_arrow_datatype(&self) -> DataType {
        match self {
            FeatureType::Bool => DataType::Boolean,
            FeatureType::Int32 => DataType::Int32,
            FeatureType::Int64 => DataType::Int64,
            FeatureType::Float32 => DataType::Float32,
            FeatureType::Float64 => DataType::Float64,
            FeatureType::Utf8 => DataType::Utf8,
            FeatureType::Binary => DataType::Binary,
            FeatureType::Timestamp => DataType::Timestamp(TimeUnit::Nanosecond, None),
            FeatureType::List { elements } => DataType::List(elements.to_arrow_field_ref()),
            FeatureType::Struct { fields } => DataType::Struct(Fields::from(
                fields
                    .iter()
                    .map(FeatureField::to_arrow_field_ref)
                    .collect::<Vec<_>>(),
            )),
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureType::Bool => write!(f, "bool"),
            FeatureType::Int32 => write!(f, "int32"),
            FeatureType::Int64 => write!(f, "int64"),
            FeatureType::Float32 => write!(f, "float32"),
            FeatureType::Float64 => write!(f, "float64"),
            FeatureType::Utf8 => write!(f, "utf8"),
            FeatureType::Binary => write!(f, "binary"),
            FeatureType::Timestamp => write!(f, "timestamp[ns]"),
            FeatureType::List { elements } => write!(f, "List<{elements}>"),
            FeatureType::Struct { fields } => {
                write!(f, "Struct{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Errors that can occur while constructing or validating a feature schema.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
pub enum FeatureSchemaError {
    /// Duplicate column names are not allowed.
    #[snafu(display("Duplicate feature column: {column}"))]
    DuplicateColumn {
        /// The duplicate column name.
        column: String,
    },

    /// Feature columns may not shadow the columns the store adds to every row.
    #[snafu(display("Feature column {column} collides with a reserved frame column"))]
    ReservedColumn {
        /// The offending column name.
        column: String,
    },

    /// Column, element and struct field names must be non-empty.
    #[snafu(display("Empty field name under '{column_path}'"))]
    EmptyName {
        /// Path of the parent (empty for top-level columns).
        column_path: String,
    },

    /// Structs need at least one child field.
    #[snafu(display("Struct column '{column_path}' has no fields"))]
    EmptyStruct {
        /// Path of the struct column.
        column_path: String,
    },

    /// Duplicate field names within a struct are not allowed.
    #[snafu(display("Duplicate field name: column={column_path}, field={field}"))]
    DuplicatedFieldName {
        /// Column path for the struct that contains the duplicate field.
        column_path: String,
        /// Duplicate field name.
        field: String,
    },
}

pub(crate) fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}.{child}")
    }
}

fn validate_type(column_path: &str, data_type: &FeatureType) -> Result<(), FeatureSchemaError> {
    match data_type {
        FeatureType::List { elements } => {
            ensure!(
                !elements.name.is_empty(),
                EmptyNameSnafu {
                    column_path: column_path.to_string(),
                }
            );
            validate_type(&join_path(column_path, &elements.name), &elements.data_type)
        }
        FeatureType::Struct { fields } => {
            ensure!(
                !fields.is_empty(),
                EmptyStructSnafu {
                    column_path: column_path.to_string(),
                }
            );
            let mut seen = HashSet::new();
            for field in fields {
                ensure!(
                    !field.name.is_empty(),
                    EmptyNameSnafu {
                        column_path: column_path.to_string(),
                    }
                );
                ensure!(
                    seen.insert(field.name.as_str()),
                    DuplicatedFieldNameSnafu {
                        column_path: column_path.to_string(),
                        field: field.name.clone(),
                    }
                );
                validate_type(&join_path(column_path, &field.name), &field.data_type)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Ordered, validated collection of feature columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Vec<FeatureField>", into = "Vec<FeatureField>")]
pub struct FeatureSchema {
    fields: Vec<FeatureField>,
}

impl FeatureSchema {
    /// Build a schema, validating names and nested types.
    pub fn new(fields: Vec<FeatureField>) -> Result<Self, FeatureSchemaError> {
        let mut seen = HashSet::new();
        for field in &fields {
            ensure!(
                !field.name.is_empty(),
                EmptyNameSnafu {
                    column_path: String::new(),
                }
            );
            ensure!(
                !is_reserved_column(&field.name),
                ReservedColumnSnafu {
                    column: field.name.clone(),
                }
            );
            ensure!(
                seen.insert(field.name.as_str()),
                DuplicateColumnSnafu {
                    column: field.name.clone(),
                }
            );
            validate_type(&field.name, &field.data_type)?;
        }
        Ok(Self { fields })
    }

    /// Columns in declaration order.
    pub fn fields(&self) -> &[FeatureField] {
        &self.fields
    }

    /// Look up a column by name.
    pub fn field(&self, name: &str) -> Option<&FeatureField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Column names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Number of feature columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the schema declares no feature columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sub-schema with only `names`, in declaration order.
    ///
    /// Returns the first unknown name as the error.
    pub fn project<S: AsRef<str>>(&self, names: &[S]) -> Result<FeatureSchema, String> {
        for name in names {
            if self.field(name.as_ref()).is_none() {
                return Err(name.as_ref().to_string());
            }
        }
        let fields = self
            .fields
            .iter()
            .filter(|f| names.iter().any(|n| n.as_ref() == f.name))
            .cloned()
            .collect();
        Ok(FeatureSchema { fields })
    }
}

impl TryFrom<Vec<FeatureField>> for FeatureSchema {
    type Error = FeatureSchemaError;

    fn try_from(fields: Vec<FeatureField>) -> Result<Self, Self::Error> {
        FeatureSchema::new(fields)
    }
}

impl From<FeatureSchema> for Vec<FeatureField> {
    fn from(schema: FeatureSchema) -> Self {
        schema.fields
    }
}

impl fmt::Display for FeatureSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joints_type() -> FeatureType {
        FeatureType::struct_of(vec![FeatureField::new(
            "position",
            FeatureType::list_of(FeatureType::list_of(FeatureType::Float32)),
            true,
        )])
    }

    #[test]
    fn builds_nested_schema_and_arrow_types() {
        let schema = FeatureSchema::new(vec![
            FeatureField::new("data", FeatureType::Utf8, true),
            FeatureField::new("joints", joints_type(), true),
        ])
        .expect("valid schema");

        assert_eq!(schema.len(), 2);
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["data", "joints"]);

        let dt = schema
            .field("joints")
            .expect("joints")
            .data_type
            .to_arrow_datatype();
        match dt {
            DataType::Struct(fields) => {
                assert_eq!(fields.len(), 1);
                assert!(matches!(fields[0].data_type(), DataType::List(_)));
            }
            other => panic!("unexpected type {other}"),
        }
    }

    #[test]
    fn rejects_duplicate_and_reserved_columns() {
        let err = FeatureSchema::new(vec![
            FeatureField::new("a", FeatureType::Int32, false),
            FeatureField::new("a", FeatureType::Int64, false),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            FeatureSchemaError::DuplicateColumn {
                column: "a".to_string()
            }
        );

        let err =
            FeatureSchema::new(vec![FeatureField::new("index", FeatureType::Int64, false)])
                .unwrap_err();
        assert!(matches!(err, FeatureSchemaError::ReservedColumn { .. }));

        let err = FeatureSchema::new(vec![FeatureField::new(
            "timestamp",
            FeatureType::Timestamp,
            true,
        )])
        .unwrap_err();
        assert!(matches!(err, FeatureSchemaError::ReservedColumn { .. }));
    }

    #[test]
    fn rejects_empty_and_duplicated_struct_fields() {
        let err = FeatureSchema::new(vec![FeatureField::new(
            "s",
            FeatureType::struct_of(vec![]),
            true,
        )])
        .unwrap_err();
        assert_eq!(
            err,
            FeatureSchemaError::EmptyStruct {
                column_path: "s".to_string()
            }
        );

        let err = FeatureSchema::new(vec![FeatureField::new(
            "s",
            FeatureType::struct_of(vec![
                FeatureField::new("x", FeatureType::Float64, true),
                FeatureField::new("x", FeatureType::Float64, true),
            ]),
            true,
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            FeatureSchemaError::DuplicatedFieldName { ref field, .. } if field == "x"
        ));
    }

    #[test]
    fn serde_round_trip_validates() {
        let schema = FeatureSchema::new(vec![FeatureField::new("joints", joints_type(), true)])
            .expect("valid schema");
        let json = serde_json::to_string(&schema).expect("serialize");
        let back: FeatureSchema = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, schema);

        let bad = r#"[{"name":"episode_index","data_type":"Int64","nullable":false}]"#;
        assert!(serde_json::from_str::<FeatureSchema>(bad).is_err());
    }

    #[test]
    fn project_keeps_declaration_order() {
        let schema = FeatureSchema::new(vec![
            FeatureField::new("a", FeatureType::Int32, true),
            FeatureField::new("b", FeatureType::Int32, true),
            FeatureField::new("c", FeatureType::Int32, true),
        ])
        .expect("valid schema");

        let projected = schema.project(&["c", "a"]).expect("known names");
        assert_eq!(projected.names().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(schema.project(&["zzz"]).unwrap_err(), "zzz");
    }

    #[test]
    fn display_is_readable() {
        let ty = FeatureType::list_of(FeatureType::Float32);
        assert_eq!(ty.to_string(), "List<item?: float32>");
    }
}
