//! Scan parameters and pagination state

use crate::document::{Document, Oid};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use std::fmt;
use std::sync::Arc;

/// Document filter applied during scans
pub type Predicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// How a scan walks a table.
///
/// ```rust
/// use photonlite::Query;
///
/// let query = Query::new()
///     .index("by_age")
///     .filter(|doc| doc.get("active").and_then(|v| v.as_bool()) == Some(true))
///     .limit(10);
/// ```
#[derive(Clone)]
pub struct Query {
    pub(crate) index: Option<String>,
    pub(crate) predicate: Option<Predicate>,
    pub(crate) limit: Option<usize>,
    pub(crate) page: Option<(usize, usize)>,
    pub(crate) inclusive: bool,
    pub(crate) nodup: bool,
    pub(crate) reverse: bool,
}

impl Query {
    pub fn new() -> Self {
        Self {
            index: None,
            predicate: None,
            limit: None,
            page: None,
            inclusive: true,
            nodup: false,
            reverse: false,
        }
    }

    /// Walk in index order instead of primary order
    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index = Some(name.into());
        self
    }

    /// Keep only documents matching `predicate`
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// At most `n` documents, counted after filtering
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Offset paging: page `number` (zero-based) of `size` documents
    pub fn page(mut self, number: usize, size: usize) -> Self {
        self.page = Some((number, size));
        self
    }

    /// Whether range bounds are included (default true)
    pub fn inclusive(mut self, inclusive: bool) -> Self {
        self.inclusive = inclusive;
        self
    }

    /// Only the first entry of each distinct index key
    pub fn nodup(mut self, nodup: bool) -> Self {
        self.nodup = nodup;
        self
    }

    /// Walk from the end
    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn index_name(&self) -> Option<&str> {
        self.index.as_deref()
    }

    /// Documents to skip and the cap on documents returned
    pub(crate) fn window(&self) -> (usize, Option<usize>) {
        let (skip, page_cap) = match self.page {
            Some((number, size)) => (number.saturating_mul(size), Some(size)),
            None => (0, None),
        };
        let cap = match (page_cap, self.limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        (skip, cap)
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("index", &self.index)
            .field("filtered", &self.predicate.is_some())
            .field("limit", &self.limit)
            .field("page", &self.page)
            .field("inclusive", &self.inclusive)
            .field("nodup", &self.nodup)
            .field("reverse", &self.reverse)
            .finish()
    }
}

/// Resume point of `Table::filter`: the last `(key, oid)` pair seen.
///
/// For primary-order scans the key is the oid's own encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub key: Option<Vec<u8>>,
    pub oid: Option<Oid>,
}

impl PageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    pub fn reset(&mut self) {
        self.key = None;
        self.oid = None;
    }

    pub(crate) fn set(&mut self, key: Vec<u8>, oid: Oid) {
        self.key = Some(key);
        self.oid = Some(oid);
    }

    /// Opaque, URL-safe form. An empty context gives an empty token.
    pub fn to_token(&self) -> String {
        let (Some(key), Some(oid)) = (&self.key, &self.oid) else {
            return String::new();
        };
        let oid = oid.to_bytes();
        let mut raw = Vec::with_capacity(4 + key.len() + oid.len());
        raw.extend_from_slice(&(key.len() as u32).to_be_bytes());
        raw.extend_from_slice(key);
        raw.extend_from_slice(&oid);
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn from_token(token: &str) -> Result<Self> {
        if token.is_empty() {
            return Ok(Self::default());
        }
        let invalid = || Error::InvalidArgument("Invalid page token".to_string());
        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        if raw.len() < 4 {
            return Err(invalid());
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&raw[..4]);
        let key_len = u32::from_be_bytes(len) as usize;
        let rest = &raw[4..];
        if rest.len() < key_len {
            return Err(invalid());
        }
        let (key, oid) = rest.split_at(key_len);
        let oid = Oid::from_bytes(oid).map_err(|_| invalid())?;
        Ok(Self {
            key: Some(key.to_vec()),
            oid: Some(oid),
        })
    }
}

/// An index entry without its document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: String,
    pub oid: Oid,
}
