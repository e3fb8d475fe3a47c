//! Storage engine: named keyspaces over a redb file, with one writer and
//! many readers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ Environment                                     │
//! │  redb::Database (data.redb)                     │
//! │   ├─ "$keyspaces" catalog: name → KeyspaceInfo  │
//! │   └─ one table per keyspace: (key, value) → ()  │
//! │  writer mutex ──► WriteTxn ──► commit           │
//! │  readers ──► ReadTxn (MVCC snapshot)            │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Every keyspace is a redb table keyed by the `(key, value)` pair, so a
//! duplicate-sorted keyspace keeps many values per key in value order and a
//! plain keyspace keeps one. The catalog records each keyspace's duplicate
//! flag, entry count and accounted bytes.
//!
//! The environment enforces a map-size budget over the accounted pages. A
//! write that would exceed it fails with
//! [`Error::MapFull`](crate::error::Error::MapFull); after
//! [`Environment::resize`] every previously issued [`KeyspaceHandle`] is
//! stale and fails with [`Error::StaleHandle`](crate::error::Error::StaleHandle)
//! until refreshed.

pub mod catalog;
pub mod cursor;
pub mod env;
pub mod txn;

pub use catalog::KeyspaceInfo;
pub use cursor::{Cursor, Entry};
pub use env::Environment;
pub use txn::{ReadTxn, WriteTxn};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Page size used for usage accounting
pub const PAGE_SIZE: u64 = 4096;

/// Per-entry bookkeeping bytes counted on top of key and value
pub const ENTRY_OVERHEAD: u64 = 16;

/// Pages reserved for environment metadata
pub const META_PAGES: u64 = 2;

/// Longest key accepted by `put`
pub const MAX_KEY_SIZE: usize = 511;

/// Smallest accepted map size
pub const MIN_MAP_SIZE: u64 = 64 * 1024;

/// File holding the environment when `subdir` is set
pub const DATA_FILE: &str = "data.redb";

/// Environment tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Initial map size in bytes
    pub map_size: u64,
    /// Maximum number of named keyspaces
    pub max_dbs: usize,
    /// Maximum concurrent read transactions
    pub max_readers: usize,
    /// Make every commit durable before it returns
    pub sync: bool,
    /// Commit through redb's two-phase protocol
    pub metasync: bool,
    /// Defer commit flushes until `sync` or close
    pub map_async: bool,
    /// The path is a directory holding `data.redb`
    pub subdir: bool,
    /// Report the whole map as allocated
    pub writemap: bool,
    /// Keep a large page cache
    pub readahead: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            map_size: 10 * 1024 * 1024,
            max_dbs: 128,
            max_readers: 126,
            sync: true,
            metasync: true,
            map_async: false,
            subdir: true,
            writemap: false,
            readahead: true,
        }
    }
}

/// Flags for `WriteTxn::put`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutFlags {
    /// Do not replace or add to an existing key
    pub no_overwrite: bool,
    /// Do not add an existing (key, value) pair again (duplicate-sorted only)
    pub no_dup_data: bool,
}

/// Handle to a named keyspace, valid until the next map resize
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyspaceHandle {
    name: String,
    dupsort: bool,
    epoch: u64,
}

impl KeyspaceHandle {
    pub(crate) fn new(name: impl Into<String>, dupsort: bool, epoch: u64) -> Self {
        Self {
            name: name.into(),
            dupsort,
            epoch,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dupsort(&self) -> bool {
        self.dupsort
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Read access shared by read and write transactions
pub trait KvRead {
    /// Handle for an existing keyspace
    fn find_keyspace(&self, name: &str) -> Result<Option<KeyspaceHandle>>;

    /// Names of every keyspace visible to this transaction
    fn keyspace_names(&self) -> Vec<String>;

    /// Catalog entry as of this transaction; `None` when the keyspace does
    /// not exist in this view
    fn keyspace_info(&self, handle: &KeyspaceHandle) -> Result<Option<KeyspaceInfo>>;

    /// Cursor over the keyspace as of this transaction. A keyspace that
    /// does not exist in this view reads as empty.
    fn cursor(&self, handle: &KeyspaceHandle) -> Result<Cursor<'_>>;

    /// First value under `key`
    fn get(&self, handle: &KeyspaceHandle, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.cursor(handle)?.set_key(key)?.map(|(_, value)| value))
    }

    /// Number of entries
    fn count(&self, handle: &KeyspaceHandle) -> Result<usize> {
        Ok(self
            .keyspace_info(handle)?
            .map_or(0, |info| info.entries as usize))
    }

    /// Bytes of pages used by one keyspace
    fn keyspace_used(&self, handle: &KeyspaceHandle) -> Result<u64> {
        Ok(self
            .keyspace_info(handle)?
            .map_or(0, |info| info.pages() * PAGE_SIZE))
    }
}

/// Map any redb failure onto the crate error
pub(crate) fn engine_error(err: impl Into<redb::Error>) -> Error {
    match err.into() {
        redb::Error::DatabaseAlreadyOpen => {
            Error::Locked("database file is held by another handle".to_string())
        }
        redb::Error::Io(e) => Error::Io(e),
        redb::Error::Corrupted(msg) => Error::Corruption(msg),
        other => Error::Storage(other.to_string()),
    }
}
