//! Keyspace catalog and table layout.
//!
//! Each keyspace lives in its own redb table keyed by `(key, value)` with an
//! empty value, which orders duplicates by value. The `$keyspaces` table maps
//! keyspace names to their [`KeyspaceInfo`].

use super::{engine_error, ENTRY_OVERHEAD, PAGE_SIZE};
use crate::error::{Error, Result};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key of a keyspace table
pub(crate) type Pair = (&'static [u8], &'static [u8]);

/// Keyspace name → serialized `KeyspaceInfo`
pub(crate) const CATALOG: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("$keyspaces");

/// Table backing the keyspace `name`
pub(crate) fn keyspace_table(name: &str) -> TableDefinition<'_, Pair, ()> {
    TableDefinition::new(name)
}

/// Every keyspace as of one transaction
pub(crate) type Catalog = BTreeMap<String, KeyspaceInfo>;

/// Catalog entry of one keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceInfo {
    /// Many values per key, ordered by value
    pub dupsort: bool,
    pub entries: u64,
    /// Accounted bytes of all entries
    pub bytes: u64,
}

impl KeyspaceInfo {
    pub fn new(dupsort: bool) -> Self {
        Self {
            dupsort,
            entries: 0,
            bytes: 0,
        }
    }

    /// Pages used: one root page plus the entry bytes rounded up
    pub fn pages(&self) -> u64 {
        pages_for(self.bytes)
    }
}

pub(crate) fn pages_for(bytes: u64) -> u64 {
    1 + bytes.div_ceil(PAGE_SIZE)
}

/// Accounted bytes of one entry
pub(crate) fn cost(key: &[u8], value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64 + ENTRY_OVERHEAD
}

/// Read the whole catalog
pub(crate) fn load(table: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<Catalog> {
    let mut catalog = Catalog::new();
    for row in table.iter().map_err(engine_error)? {
        let (name, info) = row.map_err(engine_error)?;
        let info: KeyspaceInfo = serde_json::from_slice(info.value()).map_err(|e| {
            Error::Corruption(format!("Invalid catalog row {}: {}", name.value(), e))
        })?;
        catalog.insert(name.value().to_string(), info);
    }
    Ok(catalog)
}

pub(crate) fn encode(info: &KeyspaceInfo) -> Result<Vec<u8>> {
    serde_json::to_vec(info)
        .map_err(|e| Error::Serialization(format!("Failed to encode catalog row: {}", e)))
}

/// Bytes of pages in use across `catalog`, metadata pages included
pub(crate) fn used_bytes(catalog: &Catalog, meta_pages: u64) -> u64 {
    let pages: u64 = catalog.values().map(KeyspaceInfo::pages).sum();
    (meta_pages + pages) * PAGE_SIZE
}
