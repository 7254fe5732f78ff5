//! Conversion between [`FeatureValue`]s and Arrow arrays.
//!
//! The writer side turns one column's worth of values into an [`ArrayRef`];
//! the reader side pulls a single row out of any supported array.

use std::sync::Arc;

use arrow::{
    array::{
        Array, ArrayRef, BinaryArray, BooleanArray, Float32Array, Float64Array, Int32Array,
        Int64Array, ListArray, StringArray, StructArray, TimestampNanosecondArray,
        cast::AsArray,
    },
    buffer::{NullBuffer, OffsetBuffer},
    datatypes::{
        DataType, Fields, Float32Type, Float64Type, Int32Type, Int64Type, TimeUnit,
        TimestampNanosecondType,
    },
    error::ArrowError,
};

use super::{FeatureField, FeatureType, FeatureValue};

static NULL: FeatureValue = FeatureValue::Null;

fn unexpected(expected: &FeatureType, value: &FeatureValue) -> ArrowError {
    ArrowError::InvalidArgumentError(format!(
        "cannot store {} value in {expected} column",
        value.kind()
    ))
}

fn nulls_of(values: &[&FeatureValue]) -> Option<NullBuffer> {
    if values.iter().any(|v| v.is_null()) {
        Some(NullBuffer::from(
            values.iter().map(|v| !v.is_null()).collect::<Vec<bool>>(),
        ))
    } else {
        None
    }
}

macro_rules! primitive_column {
    ($values:expr, $ty:expr, $variant:ident, $array:ty) => {{
        let mut out = Vec::with_capacity($values.len());
        for v in $values {
            match v {
                FeatureValue::Null => out.push(None),
                FeatureValue::$variant(x) => out.push(Some(*x)),
                other => return Err(unexpected($ty, other)),
            }
        }
        Arc::new(<$array>::from(out)) as ArrayRef
    }};
}

/// Build one Arrow array of `data_type` from `values`, one slot per value.
pub fn build_array(
    data_type: &FeatureType,
    values: &[&FeatureValue],
) -> Result<ArrayRef, ArrowError> {
    let array = match data_type {
        FeatureType::Bool => primitive_column!(values, data_type, Bool, BooleanArray),
        FeatureType::Int32 => primitive_column!(values, data_type, Int32, Int32Array),
        FeatureType::Int64 => primitive_column!(values, data_type, Int64, Int64Array),
        FeatureType::Float32 => primitive_column!(values, data_type, Float32, Float32Array),
        FeatureType::Float64 => primitive_column!(values, data_type, Float64, Float64Array),
        FeatureType::Timestamp => {
            primitive_column!(values, data_type, Timestamp, TimestampNanosecondArray)
        }
        FeatureType::Utf8 => {
            let mut out: Vec<Option<&str>> = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    FeatureValue::Null => out.push(None),
                    FeatureValue::Utf8(s) => out.push(Some(s.as_str())),
                    other => return Err(unexpected(data_type, other)),
                }
            }
            Arc::new(StringArray::from(out)) as ArrayRef
        }
        FeatureType::Binary => {
            let mut out: Vec<Option<&[u8]>> = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    FeatureValue::Null => out.push(None),
                    FeatureValue::Binary(b) => out.push(Some(b.as_slice())),
                    other => return Err(unexpected(data_type, other)),
                }
            }
            Arc::new(BinaryArray::from_opt_vec(out)) as ArrayRef
        }
        FeatureType::List { elements } => build_list(data_type, elements, values)?,
        FeatureType::Struct { fields } => build_struct(data_type, fields, values)?,
    };
    Ok(array)
}

fn build_list(
    data_type: &FeatureType,
    elements: &FeatureField,
    values: &[&FeatureValue],
) -> Result<ArrayRef, ArrowError> {
    let mut lengths = Vec::with_capacity(values.len());
    let mut children: Vec<&FeatureValue> = Vec::new();
    for v in values {
        match v {
            FeatureValue::Null => lengths.push(0),
            FeatureValue::List(items) => {
                lengths.push(items.len());
                children.extend(items.iter());
            }
            other => return Err(unexpected(data_type, other)),
        }
    }

    let child = build_array(&elements.data_type, &children)?;
    let field = Arc::new(elements.to_arrow_field());
    let list = ListArray::try_new(
        field,
        OffsetBuffer::from_lengths(lengths),
        child,
        nulls_of(values),
    )?;
    Ok(Arc::new(list))
}

fn build_struct(
    data_type: &FeatureType,
    fields: &[FeatureField],
    values: &[&FeatureValue],
) -> Result<ArrayRef, ArrowError> {
    for v in values {
        if !matches!(v, FeatureValue::Null | FeatureValue::Struct(_)) {
            return Err(unexpected(data_type, v));
        }
    }

    let mut columns = Vec::with_capacity(fields.len());
    for field in fields {
        let child_values: Vec<&FeatureValue> = values
            .iter()
            .map(|v| match v {
                FeatureValue::Struct(members) => members.get(&field.name).unwrap_or(&NULL),
                _ => &NULL,
            })
            .collect();
        columns.push(build_array(&field.data_type, &child_values)?);
    }

    let arrow_fields: Fields = fields.iter().map(FeatureField::to_arrow_field).collect();
    let array = StructArray::try_new(arrow_fields, columns, nulls_of(values))?;
    Ok(Arc::new(array))
}

/// Read row `row` of `array` back into a [`FeatureValue`].
pub fn value_at(array: &dyn Array, row: usize) -> Result<FeatureValue, ArrowError> {
    if array.is_null(row) {
        return Ok(FeatureValue::Null);
    }

    let value = match array.data_type() {
        DataType::Boolean => FeatureValue::Bool(array.as_boolean().value(row)),
        DataType::Int32 => FeatureValue::Int32(array.as_primitive::<Int32Type>().value(row)),
        DataType::Int64 => FeatureValue::Int64(array.as_primitive::<Int64Type>().value(row)),
        DataType::Float32 => FeatureValue::Float32(array.as_primitive::<Float32Type>().value(row)),
        DataType::Float64 => FeatureValue::Float64(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => FeatureValue::Utf8(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => FeatureValue::Utf8(array.as_string::<i64>().value(row).to_string()),
        DataType::Binary => FeatureValue::Binary(array.as_binary::<i32>().value(row).to_vec()),
        DataType::LargeBinary => {
            FeatureValue::Binary(array.as_binary::<i64>().value(row).to_vec())
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => FeatureValue::Timestamp(
            array
                .as_primitive::<TimestampNanosecondType>()
                .value(row),
        ),
        DataType::List(_) => {
            let items = array.as_list::<i32>().value(row);
            let mut out = Vec::with_capacity(items.len());
            for i in 0..items.len() {
                out.push(value_at(items.as_ref(), i)?);
            }
            FeatureValue::List(out)
        }
        DataType::Struct(_) => {
            let st = array.as_struct();
            let mut members = std::collections::BTreeMap::new();
            for (field, column) in st.fields().iter().zip(st.columns()) {
                members.insert(field.name().clone(), value_at(column.as_ref(), row)?);
            }
            FeatureValue::Struct(members)
        }
        other => {
            return Err(ArrowError::NotYetImplemented(format!(
                "reading {other} columns as feature values"
            )));
        }
    };
    Ok(value)
}
