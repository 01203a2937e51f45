//! Value transforms convert between the wire representation of an attribute and the value handed
//! to application code.

use std::rc::Rc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::{Error, Result};

pub trait Transformation {
    /// Application value -> wire value.
    fn serialize(&self, value: &Value, options: Option<&Value>) -> Result<Value>;

    /// Wire value -> application value.
    fn hydrate(&self, value: &Value, options: Option<&Value>) -> Result<Value>;

    /// Value reported for an attribute the cache has never received.
    fn default_value(&self, _options: Option<&Value>) -> Option<Value> {
        None
    }
}

fn failure(transform: &str, message: impl Into<String>) -> Error {
    Error::Transform {
        transform: transform.to_string(),
        message: message.into(),
    }
}

fn allows_null(options: Option<&Value>) -> bool {
    options
        .and_then(|o| o.get("allowNull"))
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

pub struct StringTransform;

impl Transformation for StringTransform {
    fn serialize(&self, value: &Value, options: Option<&Value>) -> Result<Value> {
        self.hydrate(value, options)
    }

    fn hydrate(&self, value: &Value, _options: Option<&Value>) -> Result<Value> {
        Ok(match value {
            Value::Null | Value::String(_) => value.clone(),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => return Err(failure("string", format!("cannot convert {other} to a string"))),
        })
    }
}

pub struct NumberTransform;

impl Transformation for NumberTransform {
    fn serialize(&self, value: &Value, options: Option<&Value>) -> Result<Value> {
        self.hydrate(value, options)
    }

    fn hydrate(&self, value: &Value, _options: Option<&Value>) -> Result<Value> {
        match value {
            Value::Null | Value::Number(_) => Ok(value.clone()),
            Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| failure("number", format!("`{s}` is not a number"))),
            other => Err(failure("number", format!("cannot convert {other} to a number"))),
        }
    }
}

pub struct BooleanTransform;

impl Transformation for BooleanTransform {
    fn serialize(&self, value: &Value, options: Option<&Value>) -> Result<Value> {
        self.hydrate(value, options)
    }

    fn hydrate(&self, value: &Value, options: Option<&Value>) -> Result<Value> {
        Ok(match value {
            Value::Null if allows_null(options) => Value::Null,
            Value::Null => Value::Bool(false),
            Value::Bool(_) => value.clone(),
            Value::Number(n) => Value::Bool(n.as_f64() == Some(1.0)),
            Value::String(s) => {
                Value::Bool(matches!(s.to_lowercase().as_str(), "true" | "t" | "1"))
            }
            other => return Err(failure("boolean", format!("cannot convert {other} to a boolean"))),
        })
    }

    fn default_value(&self, options: Option<&Value>) -> Option<Value> {
        (!allows_null(options)).then_some(Value::Bool(false))
    }
}

/// Dates travel as RFC 3339 strings; numbers are read as milliseconds since the epoch. Both
/// directions normalize to UTC.
pub struct DateTransform;

impl DateTransform {
    fn normalize(value: &Value) -> Result<Value> {
        let parsed: DateTime<Utc> = match value {
            Value::Null => return Ok(Value::Null),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map_err(|e| failure("date", format!("`{s}` is not an RFC 3339 date: {e}")))?
                .with_timezone(&Utc),
            Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or_else(|| failure("date", format!("{n} is not a millisecond timestamp")))?,
            other => return Err(failure("date", format!("cannot convert {other} to a date"))),
        };
        Ok(Value::String(
            parsed.to_rfc3339_opts(SecondsFormat::Millis, true),
        ))
    }
}

impl Transformation for DateTransform {
    fn serialize(&self, value: &Value, _options: Option<&Value>) -> Result<Value> {
        Self::normalize(value)
    }

    fn hydrate(&self, value: &Value, _options: Option<&Value>) -> Result<Value> {
        Self::normalize(value)
    }
}

/// Hydrates a cached wire value, falling back to the transform's default when nothing is cached.
pub(crate) fn hydrate_wire(
    transform: Option<&dyn Transformation>,
    wire: Option<Value>,
    options: Option<&Value>,
) -> Result<Value> {
    match (wire, transform) {
        (Some(wire), Some(transform)) => transform.hydrate(&wire, options),
        (Some(wire), None) => Ok(wire),
        (None, Some(transform)) => Ok(transform.default_value(options).unwrap_or(Value::Null)),
        (None, None) => Ok(Value::Null),
    }
}

pub(crate) fn builtin() -> Vec<(&'static str, Rc<dyn Transformation>)> {
    vec![
        ("string", Rc::new(StringTransform)),
        ("number", Rc::new(NumberTransform)),
        ("boolean", Rc::new(BooleanTransform)),
        ("date", Rc::new(DateTransform)),
    ]
}
