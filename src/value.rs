//! Value types for query parameters and results.

use crate::error::{Error, Result};
use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::ToSql;
use std::time::{SystemTime, UNIX_EPOCH};

/// A database value that can be used as a parameter or returned from a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp, stored as whole seconds since the epoch
    Timestamp(SystemTime),
}

impl Value {
    /// Returns true if the value is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Read the value as a 64-bit integer.
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Bool(v) => Ok(*v as i64),
            Value::Int32(v) => Ok(*v as i64),
            Value::Int64(v) => Ok(*v),
            other => Err(Error::TypeConversion(format!(
                "cannot read {:?} as integer",
                other
            ))),
        }
    }

    /// Read the value as a string slice.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(v) => Ok(v),
            other => Err(Error::TypeConversion(format!(
                "cannot read {:?} as string",
                other
            ))),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let out = match self {
            Value::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Value::Bool(v) => ToSqlOutput::Owned(SqliteValue::Integer(*v as i64)),
            Value::Int32(v) => ToSqlOutput::Owned(SqliteValue::Integer(*v as i64)),
            Value::Int64(v) => ToSqlOutput::Owned(SqliteValue::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Owned(SqliteValue::Real(*v as f64)),
            Value::Double(v) => ToSqlOutput::Owned(SqliteValue::Real(*v)),
            Value::String(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            Value::Timestamp(v) => {
                let secs = match v.duration_since(UNIX_EPOCH) {
                    Ok(d) => d.as_secs() as i64,
                    // before the epoch: round down, like the positive side
                    Err(e) => {
                        let d = e.duration();
                        -(d.as_secs() as i64) - (d.subsec_nanos() > 0) as i64
                    }
                };
                ToSqlOutput::Owned(SqliteValue::Integer(secs))
            }
        };
        Ok(out)
    }
}

impl From<SqliteValue> for Value {
    fn from(value: SqliteValue) -> Self {
        match value {
            SqliteValue::Null => Value::Null,
            SqliteValue::Integer(v) => Value::Int64(v),
            SqliteValue::Real(v) => Value::Double(v),
            SqliteValue::Text(v) => Value::String(v),
            SqliteValue::Blob(v) => Value::Bytes(v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<SystemTime> for Value {
    fn from(v: SystemTime) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
