use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing custom attributes of a context.
///
/// # Examples
/// ```
/// # use flagpole::{AttributeValue, Attributes};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("username".to_owned(), "john_doe".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Enum representing possible values of a context attribute or a clause value.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, `bool` and collections.
///
/// Examples:
/// ```
/// # use flagpole::AttributeValue;
/// let string_attr: AttributeValue = "example".into();
/// let number_attr: AttributeValue = 42.0.into();
/// let bool_attr: AttributeValue = true.into();
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone, Default)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A null value or absence of value.
    #[default]
    Null,
    /// A boolean value.
    Bool(bool),
    /// A numerical value.
    Number(f64),
    /// A string value.
    String(String),
    /// An array of values.
    Array(Vec<AttributeValue>),
    /// A JSON object.
    Object(HashMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        if let AttributeValue::Number(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let AttributeValue::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Look up a property of an object value.
    pub(crate) fn get(&self, name: &str) -> Option<&AttributeValue> {
        match self {
            AttributeValue::Object(map) => map.get(name),
            _ => None,
        }
    }

    /// Convert to the string used for bucketing. Strings are used as-is and numbers are truncated
    /// to an integer. Other types cannot be bucketed.
    pub(crate) fn as_bucketable(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(n) if n.is_finite() => Some((n.trunc() as i64).to_string()),
            _ => None,
        }
    }

    /// Interpret value as a timestamp in milliseconds: either a number or an RFC3339 string.
    pub(crate) fn as_timestamp_millis(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.timestamp_millis() as f64),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttributeValue::Null,
            serde_json::Value::Bool(b) => AttributeValue::Bool(b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(AttributeValue::Number)
                .unwrap_or(AttributeValue::Null),
            serde_json::Value::String(s) => AttributeValue::String(s),
            serde_json::Value::Array(values) => {
                AttributeValue::Array(values.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                AttributeValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&AttributeValue> for serde_json::Value {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Null => serde_json::Value::Null,
            AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
            AttributeValue::Number(n) => number_to_json(*n),
            AttributeValue::String(s) => serde_json::Value::String(s.clone()),
            AttributeValue::Array(values) => {
                serde_json::Value::Array(values.iter().map(Into::into).collect())
            }
            AttributeValue::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            ),
        }
    }
}

/// Integral numbers are written without a fractional part, so `99.0` serializes as `99`.
fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}
