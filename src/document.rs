//! Documents and object identifiers

use crate::datum::Datum;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Object identifier, the primary key of a document.
///
/// The byte encoding is order preserving: integers are 8 big-endian bytes and
/// UUIDv7 values are their 16 raw bytes, both of which sort the same way as
/// their logical values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Oid {
    Int(u64),
    Uuid(Uuid),
}

impl Oid {
    /// Fresh time-ordered identifier
    pub fn new_uuid() -> Self {
        Oid::Uuid(Uuid::now_v7())
    }

    /// Encode as keyspace key
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Oid::Int(n) => n.to_be_bytes().to_vec(),
            Oid::Uuid(u) => u.as_bytes().to_vec(),
        }
    }

    /// Decode a keyspace key
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Ok(Oid::Int(u64::from_be_bytes(buf)))
            }
            16 => Uuid::from_slice(bytes)
                .map(Oid::Uuid)
                .map_err(|e| Error::Corruption(format!("Invalid oid bytes: {}", e))),
            n => Err(Error::Corruption(format!("Invalid oid length: {} bytes", n))),
        }
    }

    /// Parse the display form (decimal or hyphenated UUID)
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(n) = s.parse::<u64>() {
            return Ok(Oid::Int(n));
        }
        Uuid::parse_str(s)
            .map(Oid::Uuid)
            .map_err(|_| Error::InvalidArgument(format!("Invalid oid: {}", s)))
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Oid::Int(n) => Some(*n),
            Oid::Uuid(_) => None,
        }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Oid::Int(n) => write!(f, "{}", n),
            Oid::Uuid(u) => write!(f, "{}", u.hyphenated()),
        }
    }
}

impl From<u64> for Oid {
    fn from(n: u64) -> Self {
        Oid::Int(n)
    }
}

impl From<Uuid> for Oid {
    fn from(u: Uuid) -> Self {
        Oid::Uuid(u)
    }
}

/// How `append` assigns identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// Dense integers: last key + 1, starting at 1
    #[default]
    Integer,
    /// UUIDv7
    Uuid,
}

impl KeyMode {
    /// The oid that follows `last` (the current highest key, if any)
    pub fn next_oid(&self, last: Option<Oid>) -> Result<Oid> {
        match self {
            KeyMode::Uuid => Ok(Oid::new_uuid()),
            KeyMode::Integer => match last {
                None => Ok(Oid::Int(1)),
                Some(Oid::Int(n)) => n
                    .checked_add(1)
                    .map(Oid::Int)
                    .ok_or_else(|| Error::Internal("Integer oid space exhausted".to_string())),
                Some(Oid::Uuid(_)) => Err(Error::InvalidArgument(
                    "Table holds uuid oids but is configured for integer keys".to_string(),
                )),
            },
        }
    }
}

/// A stored document: identifier plus content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub oid: Option<Oid>,
    pub content: Datum,
}

impl Document {
    /// New document without an identifier
    pub fn new(content: impl Into<Datum>) -> Self {
        Self {
            oid: None,
            content: content.into(),
        }
    }

    pub fn with_oid(oid: impl Into<Oid>, content: impl Into<Datum>) -> Self {
        Self {
            oid: Some(oid.into()),
            content: content.into(),
        }
    }

    /// The identifier, required on update paths
    pub fn require_oid(&self) -> Result<Oid> {
        self.oid
            .ok_or_else(|| Error::InvalidArgument("Document has no oid".to_string()))
    }

    /// Field lookup by dotted path
    pub fn get(&self, path: &str) -> Option<&Datum> {
        self.content.lookup(path)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Datum>) {
        self.content.set(field, value);
    }

    /// Content must be an object
    pub fn validate(&self) -> Result<()> {
        match self.content {
            Datum::Object(_) => Ok(()),
            _ => Err(Error::InvalidArgument(
                "Document content must be an object".to_string(),
            )),
        }
    }
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        Document::new(Datum::from(value))
    }
}

impl From<Datum> for Document {
    fn from(content: Datum) -> Self {
        Document::new(content)
    }
}
