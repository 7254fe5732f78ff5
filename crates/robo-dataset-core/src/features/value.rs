//! Dynamic feature values.
//!
//! [`FeatureValue`] is what episode sources emit per frame and what the
//! dataset hands back per row. Values are checked against the declared
//! [`FeatureField`] before they reach the shard writer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use super::{FeatureField, FeatureSchema, FeatureType, join_path};

/// A single (possibly nested) feature value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    /// Missing value.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 32-bit float.
    Float32(f32),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
    /// Opaque bytes.
    Binary(Vec<u8>),
    /// Nanoseconds since the Unix epoch.
    Timestamp(i64),
    /// Ordered list of values.
    List(Vec<FeatureValue>),
    /// Struct members keyed by field name.
    Struct(BTreeMap<String, FeatureValue>),
}

impl FeatureValue {
    /// True for [`FeatureValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, FeatureValue::Null)
    }

    /// Short variant name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FeatureValue::Null => "null",
            FeatureValue::Bool(_) => "bool",
            FeatureValue::Int32(_) => "int32",
            FeatureValue::Int64(_) => "int64",
            FeatureValue::Float32(_) => "float32",
            FeatureValue::Float64(_) => "float64",
            FeatureValue::Utf8(_) => "utf8",
            FeatureValue::Binary(_) => "binary",
            FeatureValue::Timestamp(_) => "timestamp",
            FeatureValue::List(_) => "list",
            FeatureValue::Struct(_) => "struct",
        }
    }

    /// Integer view of the value (`Int32`, `Int64`, `Timestamp`).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FeatureValue::Int32(v) => Some(i64::from(*v)),
            FeatureValue::Int64(v) | FeatureValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Floating point view of the value (any numeric variant).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Float32(v) => Some(f64::from(*v)),
            FeatureValue::Float64(v) => Some(*v),
            FeatureValue::Int32(v) => Some(f64::from(*v)),
            FeatureValue::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// String view of a `Utf8` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Items of a `List` value.
    pub fn as_list(&self) -> Option<&[FeatureValue]> {
        match self {
            FeatureValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Members of a `Struct` value.
    pub fn as_struct(&self) -> Option<&BTreeMap<String, FeatureValue>> {
        match self {
            FeatureValue::Struct(members) => Some(members),
            _ => None,
        }
    }

    /// Approximate serialized size in bytes, used for shard rotation.
    pub fn estimated_size(&self) -> usize {
        match self {
            FeatureValue::Null | FeatureValue::Bool(_) => 1,
            FeatureValue::Int32(_) | FeatureValue::Float32(_) => 4,
            FeatureValue::Int64(_) | FeatureValue::Float64(_) | FeatureValue::Timestamp(_) => 8,
            FeatureValue::Utf8(s) => 4 + s.len(),
            FeatureValue::Binary(b) => 4 + b.len(),
            FeatureValue::List(items) => {
                4 + items.iter().map(FeatureValue::estimated_size).sum::<usize>()
            }
            FeatureValue::Struct(members) => members
                .values()
                .map(FeatureValue::estimated_size)
                .sum::<usize>()
                .max(1),
        }
    }

    /// Plain JSON rendering: numbers, strings, arrays and objects without
    /// variant tags. Bytes become an array of integers; non-finite floats
    /// become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FeatureValue::Null => Value::Null,
            FeatureValue::Bool(b) => Value::Bool(*b),
            FeatureValue::Int32(v) => Value::from(*v),
            FeatureValue::Int64(v) | FeatureValue::Timestamp(v) => Value::from(*v),
            FeatureValue::Float32(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FeatureValue::Float64(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FeatureValue::Utf8(s) => Value::String(s.clone()),
            FeatureValue::Binary(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
            FeatureValue::List(items) => {
                Value::Array(items.iter().map(FeatureValue::to_json).collect())
            }
            FeatureValue::Struct(members) => Value::Object(
                members
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Bool(v)
    }
}

impl From<i32> for FeatureValue {
    fn from(v: i32) -> Self {
        FeatureValue::Int32(v)
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        FeatureValue::Int64(v)
    }
}

impl From<f32> for FeatureValue {
    fn from(v: f32) -> Self {
        FeatureValue::Float32(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Float64(v)
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::Utf8(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Utf8(v.to_string())
    }
}

impl<T: Into<FeatureValue>> From<Option<T>> for FeatureValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FeatureValue::Null, Into::into)
    }
}

impl<T: Into<FeatureValue>> From<Vec<T>> for FeatureValue {
    fn from(v: Vec<T>) -> Self {
        FeatureValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl FromIterator<FeatureValue> for FeatureValue {
    fn from_iter<I: IntoIterator<Item = FeatureValue>>(iter: I) -> Self {
        FeatureValue::List(iter.into_iter().collect())
    }
}

/// A value does not conform to its declared field.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
pub enum FeatureValueError {
    /// A non-nullable column or field received a null.
    #[snafu(display("Null value for non-nullable column '{column_path}'"))]
    NullNotAllowed {
        /// Path of the offending column.
        column_path: String,
    },

    /// The value variant does not match the declared type.
    #[snafu(display("Column '{column_path}' expects {expected}, got {found}"))]
    TypeMismatch {
        /// Path of the offending column.
        column_path: String,
        /// Declared type.
        expected: FeatureType,
        /// Variant name of the provided value.
        found: &'static str,
    },

    /// A struct value carries a member the type does not declare.
    #[snafu(display("Struct column '{column_path}' has no field '{field}'"))]
    UnknownStructField {
        /// Path of the struct column.
        column_path: String,
        /// Undeclared member name.
        field: String,
    },

    /// A frame carries a column the schema does not declare.
    #[snafu(display("Frame has undeclared feature column '{column}'"))]
    UnknownColumn {
        /// Undeclared column name.
        column: String,
    },
}

/// Check `value` against `field`, recursing into lists and structs.
pub fn check_value(
    field: &FeatureField,
    column_path: &str,
    value: &FeatureValue,
) -> Result<(), FeatureValueError> {
    if value.is_null() {
        ensure!(
            field.nullable,
            NullNotAllowedSnafu {
                column_path: column_path.to_string(),
            }
        );
        return Ok(());
    }

    let mismatch = || {
        TypeMismatchSnafu {
            column_path: column_path.to_string(),
            expected: field.data_type.clone(),
            found: value.kind(),
        }
        .build()
    };

    match (&field.data_type, value) {
        (FeatureType::Bool, FeatureValue::Bool(_))
        | (FeatureType::Int32, FeatureValue::Int32(_))
        | (FeatureType::Int64, FeatureValue::Int64(_))
        | (FeatureType::Float32, FeatureValue::Float32(_))
        | (FeatureType::Float64, FeatureValue::Float64(_))
        | (FeatureType::Utf8, FeatureValue::Utf8(_))
        | (FeatureType::Binary, FeatureValue::Binary(_))
        | (FeatureType::Timestamp, FeatureValue::Timestamp(_)) => Ok(()),
        (FeatureType::List { elements }, FeatureValue::List(items)) => {
            let item_path = join_path(column_path, &elements.name);
            for item in items {
                check_value(elements, &item_path, item)?;
            }
            Ok(())
        }
        (FeatureType::Struct { fields }, FeatureValue::Struct(members)) => {
            for name in members.keys() {
                ensure!(
                    fields.iter().any(|f| &f.name == name),
                    UnknownStructFieldSnafu {
                        column_path: column_path.to_string(),
                        field: name.clone(),
                    }
                );
            }
            for child in fields {
                let member = members.get(&child.name).unwrap_or(&FeatureValue::Null);
                check_value(child, &join_path(column_path, &child.name), member)?;
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

impl FeatureSchema {
    /// Check one frame's feature map. Missing columns count as null.
    pub fn check_frame(
        &self,
        features: &BTreeMap<String, FeatureValue>,
    ) -> Result<(), FeatureValueError> {
        for name in features.keys() {
            ensure!(
                self.field(name).is_some(),
                UnknownColumnSnafu {
                    column: name.clone()
                }
            );
        }
        for field in self.fields() {
            let value = features.get(&field.name).unwrap_or(&FeatureValue::Null);
            check_value(field, &field.name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_field() -> FeatureField {
        FeatureField::new(
            "joints",
            FeatureType::struct_of(vec![FeatureField::new(
                "position",
                FeatureType::list_of(FeatureType::Float32),
                false,
            )]),
            true,
        )
    }

    #[test]
    fn conversions_build_expected_variants() {
        assert_eq!(FeatureValue::from(3_i32), FeatureValue::Int32(3));
        assert_eq!(FeatureValue::from("x"), FeatureValue::Utf8("x".into()));
        assert_eq!(FeatureValue::from(None::<f64>), FeatureValue::Null);
        assert_eq!(
            FeatureValue::from(vec![1.0_f32, 2.0]),
            FeatureValue::List(vec![FeatureValue::Float32(1.0), FeatureValue::Float32(2.0)])
        );
        let collected: FeatureValue = (0..2).map(FeatureValue::Int64).collect();
        assert_eq!(collected.as_list().map(<[_]>::len), Some(2));
    }

    #[test]
    fn nested_values_conform() {
        let field = position_field();
        let value = FeatureValue::Struct(BTreeMap::from([(
            "position".to_string(),
            FeatureValue::from(vec![0.5_f32, 1.5]),
        )]));
        check_value(&field, "joints", &value).expect("conforming value");
        check_value(&field, "joints", &FeatureValue::Null).expect("nullable struct");
    }

    #[test]
    fn nested_violations_name_the_path() {
        let field = position_field();

        let missing_member = FeatureValue::Struct(BTreeMap::new());
        let err = check_value(&field, "joints", &missing_member).unwrap_err();
        assert_eq!(
            err,
            FeatureValueError::NullNotAllowed {
                column_path: "joints.position".to_string()
            }
        );

        let wrong_item = FeatureValue::Struct(BTreeMap::from([(
            "position".to_string(),
            FeatureValue::from(vec![1.0_f64]),
        )]));
        let err = check_value(&field, "joints", &wrong_item).unwrap_err();
        assert!(matches!(
            err,
            FeatureValueError::TypeMismatch { ref column_path, found: "float64", .. }
                if column_path == "joints.position.item"
        ));

        let extra = FeatureValue::Struct(BTreeMap::from([
            ("position".to_string(), FeatureValue::List(vec![])),
            ("velocity".to_string(), FeatureValue::List(vec![])),
        ]));
        let err = check_value(&field, "joints", &extra).unwrap_err();
        assert!(matches!(err, FeatureValueError::UnknownStructField { .. }));
    }

    #[test]
    fn check_frame_rejects_undeclared_columns() {
        let schema = FeatureSchema::new(vec![position_field()]).expect("schema");
        let frame = BTreeMap::from([("oops".to_string(), FeatureValue::Bool(true))]);
        let err = schema.check_frame(&frame).unwrap_err();
        assert_eq!(
            err,
            FeatureValueError::UnknownColumn {
                column: "oops".to_string()
            }
        );
        schema
            .check_frame(&BTreeMap::new())
            .expect("missing nullable column is null");
    }

    #[test]
    fn json_rendering_is_untagged() {
        let value = FeatureValue::Struct(BTreeMap::from([
            ("a".to_string(), FeatureValue::Int32(1)),
            ("b".to_string(), FeatureValue::Float64(f64::NAN)),
            ("c".to_string(), FeatureValue::from(vec!["x", "y"])),
        ]));
        assert_eq!(
            value.to_json(),
            serde_json::json!({"a": 1, "b": null, "c": ["x", "y"]})
        );
    }

    #[test]
    fn estimated_size_tracks_payload() {
        let small = FeatureValue::from("ab");
        let big = FeatureValue::from("a".repeat(1000));
        assert!(big.estimated_size() > small.estimated_size() + 900);
    }
}
