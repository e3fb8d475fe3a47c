//! Positioned cursors over one keyspace.
//!
//! Every positioning call runs a bounded range query against the keyspace
//! table and returns the entry the cursor lands on, or `None` (leaving the
//! position unchanged) when there is no such entry. A cursor opened in a
//! write transaction sees that transaction's later writes.

use super::catalog::{keyspace_table, Pair};
use super::engine_error;
use crate::error::Result;
use redb::{ReadOnlyTable, ReadableTable, WriteTransaction};
use std::ops::Bound;

/// Key/value pair as stored in a keyspace
pub type Entry = (Vec<u8>, Vec<u8>);

/// Lowest value of any key
const NONE: &[u8] = &[];

pub(crate) type Bounds<'a> = (Bound<(&'a [u8], &'a [u8])>, Bound<(&'a [u8], &'a [u8])>);

/// Smallest key strictly greater than every entry under `key`
pub(crate) fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// Bounds of every entry under exactly `key`
pub(crate) fn under<'a>(key: &'a [u8], successor: &'a [u8]) -> Bounds<'a> {
    (
        Bound::Included((key, NONE)),
        Bound::Excluded((successor, NONE)),
    )
}

/// First (or with `back`, last) entry of `table` within `bounds`
pub(crate) fn edge<T>(table: &T, bounds: Bounds<'_>, back: bool) -> Result<Option<Entry>>
where
    T: ReadableTable<Pair, ()>,
{
    let mut range = table.range(bounds).map_err(engine_error)?;
    let found = if back { range.next_back() } else { range.next() };
    match found {
        Some(row) => {
            let (pair, _) = row.map_err(engine_error)?;
            let (key, value) = pair.value();
            Ok(Some((key.to_vec(), value.to_vec())))
        }
        None => Ok(None),
    }
}

enum Source<'t> {
    /// Keyspace absent from the transaction's view
    Missing,
    Snapshot(ReadOnlyTable<Pair, ()>),
    Pending {
        txn: &'t WriteTransaction,
        name: String,
    },
}

pub struct Cursor<'t> {
    source: Source<'t>,
    position: Option<Entry>,
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            Source::Missing => "missing",
            Source::Snapshot(_) => "snapshot",
            Source::Pending { .. } => "pending",
        };
        f.debug_struct("Cursor")
            .field("source", &source)
            .field("position", &self.position)
            .finish()
    }
}

#[allow(clippy::should_implement_trait)]
impl<'t> Cursor<'t> {
    pub(crate) fn missing() -> Self {
        Self::with(Source::Missing)
    }

    pub(crate) fn snapshot(table: ReadOnlyTable<Pair, ()>) -> Self {
        Self::with(Source::Snapshot(table))
    }

    pub(crate) fn pending(txn: &'t WriteTransaction, name: &str) -> Self {
        Self::with(Source::Pending {
            txn,
            name: name.to_string(),
        })
    }

    fn with(source: Source<'t>) -> Self {
        Self {
            source,
            position: None,
        }
    }

    fn find(&self, bounds: Bounds<'_>, back: bool) -> Result<Option<Entry>> {
        match &self.source {
            Source::Missing => Ok(None),
            Source::Snapshot(table) => edge(table, bounds, back),
            Source::Pending { txn, name } => {
                let table = txn.open_table(keyspace_table(name)).map_err(engine_error)?;
                edge(&table, bounds, back)
            }
        }
    }

    fn land(&mut self, bounds: Bounds<'_>, back: bool) -> Result<Option<Entry>> {
        let found = self.find(bounds, back)?;
        if found.is_some() {
            self.position.clone_from(&found);
        }
        Ok(found)
    }

    pub fn first(&mut self) -> Result<Option<Entry>> {
        self.land((Bound::Unbounded, Bound::Unbounded), false)
    }

    pub fn last(&mut self) -> Result<Option<Entry>> {
        self.land((Bound::Unbounded, Bound::Unbounded), true)
    }

    /// Entry after the current one; `first` when unpositioned
    pub fn next(&mut self) -> Result<Option<Entry>> {
        let Some((key, value)) = self.position.clone() else {
            return self.first();
        };
        self.land((Bound::Excluded((&key[..], &value[..])), Bound::Unbounded), false)
    }

    /// Entry before the current one; `last` when unpositioned
    pub fn prev(&mut self) -> Result<Option<Entry>> {
        let Some((key, value)) = self.position.clone() else {
            return self.last();
        };
        self.land((Bound::Unbounded, Bound::Excluded((&key[..], &value[..]))), true)
    }

    /// First entry of the next distinct key
    pub fn next_nodup(&mut self) -> Result<Option<Entry>> {
        let Some((key, _)) = self.position.clone() else {
            return self.first();
        };
        let successor = key_successor(&key);
        self.land((Bound::Included((&successor[..], NONE)), Bound::Unbounded), false)
    }

    /// Last entry of the previous distinct key
    pub fn prev_nodup(&mut self) -> Result<Option<Entry>> {
        let Some((key, _)) = self.position.clone() else {
            return self.last();
        };
        self.land((Bound::Unbounded, Bound::Excluded((&key[..], NONE))), true)
    }

    /// First entry under exactly `key`
    pub fn set_key(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        let successor = key_successor(key);
        self.land(under(key, &successor), false)
    }

    /// First entry with a key at or after `key`
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        self.land((Bound::Included((key, NONE)), Bound::Unbounded), false)
    }

    /// Last entry with a key at or before `key`
    pub fn set_range_back(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        let successor = key_successor(key);
        self.land((Bound::Unbounded, Bound::Excluded((&successor[..], NONE))), true)
    }

    /// First entry strictly after the pair `(key, value)`
    pub fn set_after(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Entry>> {
        self.land((Bound::Excluded((key, value)), Bound::Unbounded), false)
    }

    /// Last entry strictly before the pair `(key, value)`
    pub fn set_before(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Entry>> {
        self.land((Bound::Unbounded, Bound::Excluded((key, value))), true)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Result;
    use crate::storage::{Cursor, EnvConfig, Environment, KvRead, PutFlags};

    fn fixture(dir: &std::path::Path) -> Result<Environment> {
        let env = Environment::open(dir, EnvConfig::default())?;
        let mut txn = env.begin_write()?;
        let ks = txn.open_keyspace("dups", true)?;
        for (k, v) in [("a", "1"), ("b", "1"), ("b", "2"), ("b", "3"), ("d", "1")] {
            txn.put(&ks, k.as_bytes(), v.as_bytes(), PutFlags::default())?;
        }
        txn.commit()?;
        Ok(env)
    }

    fn pair(k: &str, v: &str) -> Option<(Vec<u8>, Vec<u8>)> {
        Some((k.as_bytes().to_vec(), v.as_bytes().to_vec()))
    }

    fn open(kv: &dyn KvRead) -> Result<Cursor<'_>> {
        let ks = kv.find_keyspace("dups")?.expect("fixture keyspace");
        kv.cursor(&ks)
    }

    #[test]
    fn test_walk_both_directions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let env = fixture(dir.path())?;
        let read = env.begin_read()?;
        let mut cursor = open(&read)?;
        assert_eq!(cursor.next()?, pair("a", "1"));
        assert_eq!(cursor.next()?, pair("b", "1"));
        assert_eq!(cursor.last()?, pair("d", "1"));
        assert_eq!(cursor.prev()?, pair("b", "3"));
        assert_eq!(cursor.next()?, pair("d", "1"));
        assert_eq!(cursor.next()?, None);
        // position stays on the last entry found
        assert_eq!(cursor.prev()?, pair("b", "3"));
        Ok(())
    }

    #[test]
    fn test_nodup_movement() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let env = fixture(dir.path())?;
        let read = env.begin_read()?;
        let mut cursor = open(&read)?;
        cursor.set_key(b"b")?;
        assert_eq!(cursor.next_nodup()?, pair("d", "1"));
        assert_eq!(cursor.prev_nodup()?, pair("b", "3"));
        assert_eq!(cursor.prev_nodup()?, pair("a", "1"));
        assert_eq!(cursor.prev_nodup()?, None);
        Ok(())
    }

    #[test]
    fn test_seeks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let env = fixture(dir.path())?;
        let read = env.begin_read()?;
        let mut cursor = open(&read)?;
        assert_eq!(cursor.set_key(b"c")?, None);
        assert_eq!(cursor.set_range(b"c")?, pair("d", "1"));
        assert_eq!(cursor.set_range_back(b"c")?, pair("b", "3"));
        assert_eq!(cursor.set_range_back(b"b")?, pair("b", "3"));
        assert_eq!(cursor.set_range(b"e")?, None);
        assert_eq!(cursor.set_after(b"b", b"2")?, pair("b", "3"));
        assert_eq!(cursor.set_after(b"b", b"25")?, pair("b", "3"));
        assert_eq!(cursor.set_before(b"b", b"1")?, pair("a", "1"));
        assert_eq!(cursor.set_before(b"a", b"")?, None);
        Ok(())
    }

    #[test]
    fn test_write_cursor_sees_pending_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let env = fixture(dir.path())?;
        let mut txn = env.begin_write()?;
        let ks = txn.open_keyspace("dups", true)?;
        txn.put(&ks, b"c", b"9", PutFlags::default())?;
        assert_eq!(txn.cursor(&ks)?.set_range(b"c")?, pair("c", "9"));
        assert_eq!(env.begin_read()?.cursor(&ks)?.set_range(b"c")?, pair("d", "1"));
        txn.abort();
        Ok(())
    }
}
