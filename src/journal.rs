//! Replication journal.
//!
//! When replication is enabled every mutation of a user table appends an
//! entry to the `__binlog__` keyspace inside the same write transaction, so
//! the journal and the data it describes commit or abort together. Entries
//! are keyed by a big-endian sequence number and never change once written.

use crate::error::{Error, Result};
use crate::storage::{KeyspaceHandle, KvRead, PutFlags, WriteTxn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Keyspace holding journal entries
pub const JOURNAL_KEYSPACE: &str = "__binlog__";

/// Tables with this prefix are never journaled
pub const SYSTEM_PREFIX: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    Create,
    Append,
    Update,
    Delete,
    Empty,
    Remove,
    Ensure,
    Drop,
}

impl std::fmt::Display for JournalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JournalKind::Create => "create",
            JournalKind::Append => "append",
            JournalKind::Update => "update",
            JournalKind::Delete => "delete",
            JournalKind::Empty => "empty",
            JournalKind::Remove => "remove",
            JournalKind::Ensure => "ensure",
            JournalKind::Drop => "drop",
        };
        f.write_str(name)
    }
}

/// One journal record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: JournalKind,
    pub table: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Whether mutations of `table` are journaled
pub fn is_journaled(table: &str) -> bool {
    !table.starts_with(SYSTEM_PREFIX)
}

/// Append an entry, returning its sequence number
pub(crate) fn append(
    txn: &mut WriteTxn<'_>,
    handle: &KeyspaceHandle,
    kind: JournalKind,
    table: &str,
    payload: serde_json::Value,
) -> Result<u64> {
    let seq = match txn.cursor(handle)?.last()? {
        Some((key, _)) => decode_seq(&key)? + 1,
        None => 1,
    };

    let entry = JournalEntry {
        seq,
        kind,
        table: table.to_string(),
        payload,
        timestamp: Utc::now(),
    };
    let bytes = serde_json::to_vec(&entry)
        .map_err(|e| Error::Serialization(format!("Failed to encode journal entry: {}", e)))?;

    let no_overwrite = PutFlags {
        no_overwrite: true,
        ..Default::default()
    };
    if !txn.put(handle, &seq.to_be_bytes(), &bytes, no_overwrite)? {
        return Err(Error::Internal(format!("Journal sequence {} already used", seq)));
    }

    debug!(seq, kind = %kind, table, "Journaled mutation");
    Ok(seq)
}

/// Entries with a sequence number above `after_seq`, oldest first
pub fn read(
    kv: &dyn KvRead,
    handle: &KeyspaceHandle,
    after_seq: u64,
    limit: usize,
) -> Result<Vec<JournalEntry>> {
    let mut cursor = kv.cursor(handle)?;
    let mut entry = match after_seq.checked_add(1) {
        Some(start) => cursor.set_range(&start.to_be_bytes())?,
        None => None,
    };

    let mut entries = Vec::new();
    while let Some((_, value)) = entry {
        if entries.len() >= limit {
            break;
        }
        let record: JournalEntry = serde_json::from_slice(&value)
            .map_err(|e| Error::Corruption(format!("Invalid journal entry: {}", e)))?;
        entries.push(record);
        entry = cursor.next()?;
    }
    Ok(entries)
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Corruption(format!("Invalid journal key length {}", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EnvConfig, Environment};
    use serde_json::json;

    #[test]
    fn test_sequence_and_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Environment::open(dir.path(), EnvConfig::default())?;

        let mut txn = env.begin_write()?;
        let handle = txn.open_keyspace(JOURNAL_KEYSPACE, false)?;
        assert_eq!(append(&mut txn, &handle, JournalKind::Create, "people", json!({}))?, 1);
        assert_eq!(
            append(&mut txn, &handle, JournalKind::Append, "people", json!({"oid": 1}))?,
            2
        );
        txn.commit()?;

        let read_txn = env.begin_read()?;
        let all = read(&read_txn, &handle, 0, 10)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].kind, JournalKind::Append);
        assert_eq!(all[1].payload["oid"], 1);

        let tail = read(&read_txn, &handle, 1, 10)?;
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2]);
        assert_eq!(read(&read_txn, &handle, 0, 1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_entry_wire_format() -> Result<()> {
        let entry = JournalEntry {
            seq: 3,
            kind: JournalKind::Ensure,
            table: "people".to_string(),
            payload: json!({"name": "by_name"}),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&entry).map_err(|e| Error::Serialization(e.to_string()))?;
        assert_eq!(value["type"], "ensure");
        assert_eq!(value["seq"], 3);
        Ok(())
    }

    #[test]
    fn test_system_tables_are_not_journaled() {
        assert!(is_journaled("people"));
        assert!(!is_journaled("__metadata__"));
    }
}
