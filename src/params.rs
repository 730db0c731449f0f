/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file params.rs
 * @brief Command field extraction with protocol-exact validation errors
 */

use crate::error::{FauxGateError, Result};
use bson::{Bson, Document};
use std::time::Duration;

/// Type name as it appears in server error messages.
pub fn bson_type_alias(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::Undefined => "undefined",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::DbPointer(_) => "dbPointer",
        Bson::JavaScriptCode(_) => "javascript",
        Bson::Symbol(_) => "symbol",
        Bson::JavaScriptCodeWithScope(_) => "javascriptWithScope",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        Bson::MaxKey => "maxKey",
        Bson::MinKey => "minKey",
    }
}

pub fn wrong_type(command: &str, field: &str, actual: &Bson, expected: &str) -> FauxGateError {
    FauxGateError::TypeMismatch(format!(
        "BSON field '{}.{}' is the wrong type '{}', expected type '{}'",
        command,
        field,
        bson_type_alias(actual),
        expected
    ))
}

/// Collection named by the command's first field.
pub fn collection_name(command: &Document, command_name: &str, database: &str) -> Result<String> {
    match command.get(command_name) {
        Some(Bson::String(name)) if !name.is_empty() => Ok(name.clone()),
        Some(Bson::String(_)) => Err(FauxGateError::InvalidNamespace(format!(
            "Invalid namespace specified '{}.'",
            database
        ))),
        Some(other) => Err(FauxGateError::InvalidNamespace(format!(
            "collection name has invalid type {}",
            bson_type_alias(other)
        ))),
        None => Err(FauxGateError::InvalidNamespace(
            "collection name is missing".to_string(),
        )),
    }
}

const MAX_TIME_MS_LIMIT: i64 = i32::MAX as i64;

fn max_time_out_of_range(value: impl std::fmt::Display) -> FauxGateError {
    FauxGateError::BadValue(format!(
        "{} value for maxTimeMS is out of range [0, {}]",
        value, MAX_TIME_MS_LIMIT
    ))
}

/// Parses `maxTimeMS`. Missing or zero means no limit.
pub fn max_time_ms(command: &Document) -> Result<Option<Duration>> {
    let millis = match command.get("maxTimeMS") {
        None => return Ok(None),
        Some(Bson::Int32(v)) => i64::from(*v),
        Some(Bson::Int64(v)) => *v,
        Some(Bson::Double(v)) => {
            if v.fract() != 0.0 || !v.is_finite() {
                return Err(FauxGateError::BadValue(
                    "maxTimeMS has non-integral value".to_string(),
                ));
            }
            if *v < 0.0 || *v > MAX_TIME_MS_LIMIT as f64 {
                return Err(if *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                    max_time_out_of_range(*v as i64)
                } else {
                    max_time_out_of_range(v)
                });
            }
            *v as i64
        }
        Some(_) => {
            return Err(FauxGateError::BadValue(
                "maxTimeMS must be a number".to_string(),
            ))
        }
    };

    if !(0..=MAX_TIME_MS_LIMIT).contains(&millis) {
        return Err(max_time_out_of_range(millis));
    }

    Ok((millis > 0).then(|| Duration::from_millis(millis as u64)))
}

pub fn optional_bool(command: &Document, command_name: &str, field: &str) -> Result<Option<bool>> {
    match command.get(field) {
        None => Ok(None),
        Some(Bson::Boolean(v)) => Ok(Some(*v)),
        Some(other) => Err(wrong_type(command_name, field, other, "bool")),
    }
}

pub fn optional_document<'a>(
    command: &'a Document,
    command_name: &str,
    field: &str,
) -> Result<Option<&'a Document>> {
    match command.get(field) {
        None => Ok(None),
        Some(Bson::Document(v)) => Ok(Some(v)),
        Some(other) => Err(wrong_type(command_name, field, other, "object")),
    }
}

/// Whole numbers in any numeric encoding.
pub fn optional_integer(command: &Document, command_name: &str, field: &str) -> Result<Option<i64>> {
    match command.get(field) {
        None => Ok(None),
        Some(Bson::Int32(v)) => Ok(Some(i64::from(*v))),
        Some(Bson::Int64(v)) => Ok(Some(*v)),
        Some(Bson::Double(v)) if v.fract() == 0.0 && v.is_finite() => Ok(Some(*v as i64)),
        Some(Bson::Double(v)) => Err(FauxGateError::BadValue(format!(
            "BSON field '{}.{}' has non-integral value {}",
            command_name, field, v
        ))),
        Some(other) => Err(wrong_type(command_name, field, other, "number")),
    }
}

pub fn required_long(command: &Document, command_name: &str, field: &str) -> Result<i64> {
    match command.get(field) {
        Some(Bson::Int64(v)) => Ok(*v),
        Some(other) => Err(wrong_type(command_name, field, other, "long")),
        None => Err(FauxGateError::BadValue(format!(
            "BSON field '{}.{}' is missing but a required field",
            command_name, field
        ))),
    }
}

pub fn required_string<'a>(command: &'a Document, command_name: &str, field: &str) -> Result<&'a str> {
    match command.get(field) {
        Some(Bson::String(v)) => Ok(v.as_str()),
        Some(other) => Err(wrong_type(command_name, field, other, "string")),
        None => Err(FauxGateError::BadValue(format!(
            "BSON field '{}.{}' is missing but a required field",
            command_name, field
        ))),
    }
}

pub fn required_array<'a>(
    command: &'a Document,
    command_name: &str,
    field: &str,
) -> Result<&'a Vec<Bson>> {
    match command.get(field) {
        Some(Bson::Array(v)) => Ok(v),
        Some(other) => Err(wrong_type(command_name, field, other, "array")),
        None => Err(FauxGateError::BadValue(format!(
            "BSON field '{}.{}' is missing but a required field",
            command_name, field
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_max_time_ms_valid() {
        for value in [Bson::Int32(0), Bson::Int64(0), Bson::Double(0.0)] {
            assert_eq!(max_time_ms(&doc! { "maxTimeMS": value }).unwrap(), None);
        }
        for value in [Bson::Int32(10000), Bson::Int64(10000), Bson::Double(10000.0)] {
            assert_eq!(
                max_time_ms(&doc! { "maxTimeMS": value }).unwrap(),
                Some(Duration::from_secs(10))
            );
        }
        assert_eq!(max_time_ms(&doc! { "find": "c" }).unwrap(), None);
    }

    #[test]
    fn test_max_time_ms_errors() {
        let cases = [
            (Bson::String("1".into()), "maxTimeMS must be a number"),
            (Bson::Null, "maxTimeMS must be a number"),
            (Bson::Array(vec![]), "maxTimeMS must be a number"),
            (Bson::Document(doc! {}), "maxTimeMS must be a number"),
            (Bson::Double(43.15), "maxTimeMS has non-integral value"),
            (
                Bson::Double(-14245345234123246.0),
                "-14245345234123246 value for maxTimeMS is out of range [0, 2147483647]",
            ),
            (
                Bson::Int64(i64::MAX),
                "9223372036854775807 value for maxTimeMS is out of range [0, 2147483647]",
            ),
            (
                Bson::Int64(i64::MIN),
                "-9223372036854775808 value for maxTimeMS is out of range [0, 2147483647]",
            ),
            (
                Bson::Int32(-1123123),
                "-1123123 value for maxTimeMS is out of range [0, 2147483647]",
            ),
        ];

        for (value, message) in cases {
            let err = max_time_ms(&doc! { "maxTimeMS": value }).unwrap_err();
            assert_eq!(err.code(), 2);
            assert_eq!(err.to_string(), message);
        }
    }

    #[test]
    fn test_collection_name_types() {
        let cases = [
            (Bson::Document(doc! {}), "object"),
            (Bson::Array(vec![]), "array"),
            (Bson::Double(3.14), "double"),
            (Bson::Boolean(true), "bool"),
            (Bson::Null, "null"),
            (Bson::Int32(42), "int"),
            (Bson::Int64(42), "long"),
        ];
        for (value, alias) in cases {
            let err = collection_name(&doc! { "find": value }, "find", "test").unwrap_err();
            assert_eq!(err.code(), 73);
            assert_eq!(err.code_name(), "InvalidNamespace");
            assert_eq!(
                err.to_string(),
                format!("collection name has invalid type {}", alias)
            );
        }
        assert_eq!(
            collection_name(&doc! { "find": "items" }, "find", "test").unwrap(),
            "items"
        );
    }

    #[test]
    fn test_wrong_type_message() {
        let err = optional_bool(&doc! { "showRecordId": 1 }, "find", "showRecordId").unwrap_err();
        assert_eq!(
            err.to_string(),
            "BSON field 'find.showRecordId' is the wrong type 'int', expected type 'bool'"
        );
        let err = required_long(&doc! { "getMore": 1 }, "getMore", "getMore").unwrap_err();
        assert_eq!(err.code(), 14);
    }
}
