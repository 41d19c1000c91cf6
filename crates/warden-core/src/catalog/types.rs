//! Core type definitions for the catalog.

use std::fmt;

use serde::{Deserialize, Serialize};
use warden_proto::Value;

/// Scalar data types a field can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    /// Boolean value.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 string.
    String,
}

impl ScalarType {
    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ScalarType::Int32 | ScalarType::Int64 | ScalarType::Float64)
    }

    /// Check if this type is an integer type.
    pub fn is_integer(&self) -> bool {
        matches!(self, ScalarType::Int32 | ScalarType::Int64)
    }

    /// Zero value of the type; strings have none.
    pub fn zero(&self) -> Value {
        match self {
            ScalarType::Bool => Value::Bool(false),
            ScalarType::Int32 => Value::Int32(0),
            ScalarType::Int64 => Value::Int64(0),
            ScalarType::Float64 => Value::Float64(0.0),
            ScalarType::String => Value::Null,
        }
    }

    /// Convert a non-null value into this type, widening or narrowing
    /// integers when the value fits.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ScalarType::Bool, Value::Bool(b)) => Some(Value::Bool(*b)),
            (ScalarType::Int32, Value::Int32(i)) => Some(Value::Int32(*i)),
            (ScalarType::Int32, Value::Int64(i)) => i32::try_from(*i).ok().map(Value::Int32),
            (ScalarType::Int64, Value::Int32(_) | Value::Int64(_)) => {
                value.as_i64().map(Value::Int64)
            }
            (ScalarType::Float64, v) if v.is_numeric() => v.as_f64().map(Value::Float64),
            (ScalarType::String, Value::String(s)) => Some(Value::String(s.clone())),
            _ => None,
        }
    }

    /// Get the type name.
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::Float64 => "float64",
            ScalarType::String => "string",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
