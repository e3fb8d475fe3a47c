// PhotonLite - Embedded document store
// Tables of documents with secondary indexes over an ordered key-value engine

#![warn(rust_2018_idioms)]

pub mod codec;
pub mod compression;
pub mod config;
pub mod database;
pub mod datum;
pub mod document;
pub mod index;
pub mod journal;
pub mod keyfn;
pub mod metadata;
pub mod registry;
pub mod storage;
pub mod table;

// Re-exports for convenience
pub use codec::Codec;
pub use compression::{Compression, CompressionStats};
pub use config::DatabaseConfig;
pub use database::{Database, ReadScope, Transaction, WriteScope};
pub use datum::Datum;
pub use document::{Document, KeyMode, Oid};
pub use index::{Index, IndexConfig};
pub use journal::{JournalEntry, JournalKind};
pub use keyfn::{KeySpec, KeyTemplate};
pub use registry::KeyFnRegistry;
pub use storage::{EnvConfig, Environment};
pub use table::{
    DeleteTarget, Documents, IndexEntries, IndexEntry, IndexOptions, PageContext, Query, Table,
    TableOptions, TableSettings,
};

/// PhotonLite error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Storage error: {0}")]
        Storage(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Compression error: {0}")]
        Compression(String),

        #[error("Corrupted data: {0}")]
        Corruption(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("No such table: {0}")]
        NoSuchTable(String),

        #[error("No such index: {table}.{index}")]
        NoSuchIndex { table: String, index: String },

        #[error("Document not found: {0}")]
        DocumentNotFound(String),

        #[error("Duplicate key in index {index}: {key}")]
        DuplicateKey { index: String, key: String },

        #[error("Invalid key function: {0}")]
        InvalidKeyFunction(String),

        #[error("Unknown key function: {0}")]
        UnknownKeyFunction(String),

        #[error("Map full: {required} bytes required, map size is {map_size}")]
        MapFull { required: u64, map_size: u64 },

        #[error("Stale keyspace handle (map resized): {0}")]
        StaleHandle(String),

        #[error("Key too large: {size} bytes exceeds limit of {max} bytes")]
        KeyTooLarge { size: usize, max: usize },

        #[error("Too many concurrent readers (limit {0})")]
        ReadersFull(usize),

        #[error("Too many keyspaces (limit {0})")]
        DbsFull(usize),

        #[error("Environment is locked: {0}")]
        Locked(String),

        #[error("Database is closed")]
        Closed,

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// True for the conditions the resize-retry combinator recovers from.
        pub fn is_capacity(&self) -> bool {
            matches!(self, Error::MapFull { .. } | Error::StaleHandle(_))
        }

        /// True for absence conditions (table, index or document).
        pub fn is_not_found(&self) -> bool {
            matches!(
                self,
                Error::NoSuchTable(_) | Error::NoSuchIndex { .. } | Error::DocumentNotFound(_)
            )
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;

    #[test]
    fn test_capacity_classification() {
        let full = Error::MapFull {
            required: 10,
            map_size: 5,
        };
        assert!(full.is_capacity());
        assert!(Error::StaleHandle("people".into()).is_capacity());
        assert!(!Error::Closed.is_capacity());
        assert!(Error::NoSuchTable("x".into()).is_not_found());
    }
}
