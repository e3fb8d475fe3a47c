//! Datum - PhotonLite's JSON-like document value.
//!
//! A `Datum` represents any value that can be stored in a document.
//! Objects keep their fields in key order, so a document behaves as an
//! ordered key/value structure.
//!
//! # Supported Types
//!
//! - **Null**: Absence of a value
//! - **Boolean**: true or false
//! - **Integer**: i64, kept exact through every codec
//! - **Float**: f64 floating point numbers
//! - **String**: UTF-8 encoded text
//! - **Array**: Ordered list of datums
//! - **Object**: Ordered key-value map (like a JSON object)
//!
//! # Example
//!
//! ```rust
//! use photonlite::Datum;
//! use serde_json::json;
//!
//! let doc = Datum::from(json!({"name": "Alice", "address": {"city": "Paris"}}));
//! assert_eq!(doc.lookup("address.city").and_then(Datum::as_str), Some("Paris"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Datum represents a value in a PhotonLite document.
///
/// JSON-compatible through serde; the variant order matters for untagged
/// deserialization (integers are tried before floats).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Datum>),
    Object(BTreeMap<String, Datum>),
}

impl Datum {
    /// An empty object
    pub fn object() -> Self {
        Datum::Object(BTreeMap::new())
    }

    /// Check if datum is null
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as number, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Integer(n) => Some(*n as f64),
            Datum::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&Vec<Datum>> {
        match self {
            Datum::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object
    pub fn as_object(&self) -> Option<&BTreeMap<String, Datum>> {
        match self {
            Datum::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Get a top-level field of an object
    pub fn get(&self, field: &str) -> Option<&Datum> {
        self.as_object().and_then(|obj| obj.get(field))
    }

    /// Set a top-level field, turning a non-object into an object first
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Datum>) {
        if !matches!(self, Datum::Object(_)) {
            *self = Datum::object();
        }
        if let Datum::Object(obj) = self {
            obj.insert(field.into(), value.into());
        }
    }

    /// Resolve a dotted path such as `address.city` or `tags.0`.
    ///
    /// Numeric segments index into arrays. Returns `None` when any segment
    /// is missing.
    pub fn lookup(&self, path: &str) -> Option<&Datum> {
        path.split('.').try_fold(self, |current, segment| match current {
            Datum::Object(obj) => obj.get(segment),
            Datum::Array(arr) => segment.parse::<usize>().ok().and_then(|i| arr.get(i)),
            _ => None,
        })
    }

    /// Plain-text rendering used when deriving index keys.
    ///
    /// Strings render without quotes; whole floats render without a
    /// fractional part so `21` and `21.0` produce the same key.
    pub fn render(&self) -> String {
        match self {
            Datum::Null => "null".to_string(),
            Datum::Boolean(b) => b.to_string(),
            Datum::Integer(n) => n.to_string(),
            Datum::Float(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
                format!("{}", *n as i64)
            }
            Datum::Float(n) => n.to_string(),
            Datum::String(s) => s.clone(),
            Datum::Array(_) | Datum::Object(_) => self.to_string(),
        }
    }
}

// Conversions
impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Boolean(b)
    }
}

impl From<i32> for Datum {
    fn from(n: i32) -> Self {
        Datum::Integer(n as i64)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Integer(n)
    }
}

impl From<u32> for Datum {
    fn from(n: u32) -> Self {
        Datum::Integer(n as i64)
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Datum::Float(n)
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::String(s)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::String(s.to_string())
    }
}

impl From<Vec<Datum>> for Datum {
    fn from(items: Vec<Datum>) -> Self {
        Datum::Array(items)
    }
}

impl From<serde_json::Value> for Datum {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Datum::Null,
            serde_json::Value::Bool(b) => Datum::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Datum::Integer(i),
                None => Datum::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Datum::String(s),
            serde_json::Value::Array(arr) => {
                Datum::Array(arr.into_iter().map(Datum::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Datum::Object(obj.into_iter().map(|(k, v)| (k, Datum::from(v))).collect())
            }
        }
    }
}

impl From<Datum> for serde_json::Value {
    fn from(datum: Datum) -> Self {
        match datum {
            Datum::Null => serde_json::Value::Null,
            Datum::Boolean(b) => serde_json::Value::Bool(b),
            Datum::Integer(n) => serde_json::Value::Number(n.into()),
            Datum::Float(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Datum::String(s) => serde_json::Value::String(s),
            Datum::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(serde_json::Value::from).collect())
            }
            Datum::Object(obj) => serde_json::Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "null"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Integer(n) => write!(f, "{}", n),
            Datum::Float(n) => write!(f, "{}", n),
            Datum::String(s) => write!(f, "{:?}", s),
            Datum::Array(arr) => {
                write!(f, "[")?;
                for (i, item) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Datum::Object(obj) => {
                write!(f, "{{")?;
                for (i, (key, value)) in obj.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}
