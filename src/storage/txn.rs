//! Read and write transactions

use super::catalog::{self, cost, keyspace_table, pages_for, Catalog, KeyspaceInfo, CATALOG};
use super::cursor::{edge, key_successor, under, Cursor, Entry};
use super::env::EnvShared;
use super::{engine_error, KeyspaceHandle, KvRead, PutFlags, MAX_KEY_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use parking_lot::MutexGuard;
use redb::ReadableTable;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

fn find(catalog: &Catalog, env: &EnvShared, name: &str) -> Option<KeyspaceHandle> {
    catalog
        .get(name)
        .map(|info| KeyspaceHandle::new(name, info.dupsort, env.epoch.load(Ordering::Acquire)))
}

/// Read-only view of one committed snapshot
pub struct ReadTxn<'env> {
    env: &'env EnvShared,
    txn: redb::ReadTransaction,
    catalog: Catalog,
}

impl<'env> ReadTxn<'env> {
    pub(crate) fn new(env: &'env EnvShared, txn: redb::ReadTransaction, catalog: Catalog) -> Self {
        Self { env, txn, catalog }
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.env.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl KvRead for ReadTxn<'_> {
    fn find_keyspace(&self, name: &str) -> Result<Option<KeyspaceHandle>> {
        Ok(find(&self.catalog, self.env, name))
    }

    fn keyspace_names(&self) -> Vec<String> {
        self.catalog.keys().cloned().collect()
    }

    fn keyspace_info(&self, handle: &KeyspaceHandle) -> Result<Option<KeyspaceInfo>> {
        self.env.check_handle(handle)?;
        Ok(self.catalog.get(handle.name()).copied())
    }

    fn cursor(&self, handle: &KeyspaceHandle) -> Result<Cursor<'_>> {
        self.env.check_handle(handle)?;
        if !self.catalog.contains_key(handle.name()) {
            return Ok(Cursor::missing());
        }
        let table = self
            .txn
            .open_table(keyspace_table(handle.name()))
            .map_err(engine_error)?;
        Ok(Cursor::snapshot(table))
    }
}

/// The single write transaction. Changes are private until `commit`.
pub struct WriteTxn<'env> {
    env: &'env EnvShared,
    txn: redb::WriteTransaction,
    catalog: Catalog,
    /// Catalog rows to rewrite on commit
    touched: BTreeSet<String>,
    used: u64,
    _writer: MutexGuard<'env, ()>,
}

impl<'env> WriteTxn<'env> {
    pub(crate) fn new(
        env: &'env EnvShared,
        writer: MutexGuard<'env, ()>,
        txn: redb::WriteTransaction,
        catalog: Catalog,
        used: u64,
    ) -> Self {
        Self {
            env,
            txn,
            catalog,
            touched: BTreeSet::new(),
            used,
            _writer: writer,
        }
    }

    /// Fail with `MapFull` when growing usage to `required` would overflow
    /// the map
    fn reserve(&self, required: u64) -> Result<()> {
        let map_size = self.env.map_size.load(Ordering::Acquire);
        if required > self.used && required > map_size {
            return Err(Error::MapFull { required, map_size });
        }
        Ok(())
    }

    fn info(&self, handle: &KeyspaceHandle) -> Result<KeyspaceInfo> {
        self.env.check_handle(handle)?;
        self.catalog
            .get(handle.name())
            .copied()
            .ok_or_else(|| Error::Storage(format!("Keyspace {} does not exist", handle.name())))
    }

    fn record(&mut self, name: &str, info: Option<KeyspaceInfo>, used: u64) {
        match info {
            Some(info) => self.catalog.insert(name.to_string(), info),
            None => self.catalog.remove(name),
        };
        self.touched.insert(name.to_string());
        self.used = used;
    }

    /// Open a keyspace, creating it when absent. An existing keyspace keeps
    /// its duplicate-sort flag.
    pub fn open_keyspace(&mut self, name: &str, dupsort: bool) -> Result<KeyspaceHandle> {
        self.env.ensure_open()?;
        if name.is_empty() || name.starts_with('$') {
            return Err(Error::InvalidArgument(format!("Invalid keyspace name {:?}", name)));
        }
        if let Some(handle) = find(&self.catalog, self.env, name) {
            return Ok(handle);
        }

        let max_dbs = self.env.config.max_dbs;
        if self.catalog.len() >= max_dbs {
            return Err(Error::DbsFull(max_dbs));
        }
        let used = self.used + PAGE_SIZE;
        self.reserve(used)?;

        self.txn
            .open_table(keyspace_table(name))
            .map_err(engine_error)?;
        self.record(name, Some(KeyspaceInfo::new(dupsort)), used);
        debug!(keyspace = name, dupsort, "Created keyspace");

        Ok(KeyspaceHandle::new(
            name,
            dupsort,
            self.env.epoch.load(Ordering::Acquire),
        ))
    }

    /// Store an entry. Returns false when a flag refused the write.
    pub fn put(
        &mut self,
        handle: &KeyspaceHandle,
        key: &[u8],
        value: &[u8],
        flags: PutFlags,
    ) -> Result<bool> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        let mut info = self.info(handle)?;

        let (bytes, used, replaced) = {
            let mut table = self
                .txn
                .open_table(keyspace_table(handle.name()))
                .map_err(engine_error)?;
            let successor = key_successor(key);
            let existing = edge(&table, under(key, &successor), false)?;
            if flags.no_overwrite && existing.is_some() {
                return Ok(false);
            }

            let mut replaced = None;
            if info.dupsort {
                // a pair is stored once; re-adding it only fails with `no_dup_data`
                if table.get((key, value)).map_err(engine_error)?.is_some() {
                    return Ok(!flags.no_dup_data);
                }
            } else if let Some((_, old)) = existing {
                replaced = Some(old);
            }

            let released = replaced.as_deref().map_or(0, |old| cost(key, old));
            let bytes = info.bytes - released + cost(key, value);
            let used = self.used - info.pages() * PAGE_SIZE + pages_for(bytes) * PAGE_SIZE;
            self.reserve(used)?;

            if let Some(old) = &replaced {
                table.remove((key, old.as_slice())).map_err(engine_error)?;
            }
            table.insert((key, value), ()).map_err(engine_error)?;
            (bytes, used, replaced.is_some())
        };

        info.bytes = bytes;
        if !replaced {
            info.entries += 1;
        }
        self.record(handle.name(), Some(info), used);
        Ok(true)
    }

    /// Delete one duplicate (`Some(value)`) or every value under `key`.
    /// Returns whether anything was removed.
    pub fn delete(&mut self, handle: &KeyspaceHandle, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        let mut info = self.info(handle)?;

        let removed: Vec<Entry> = {
            let mut table = self
                .txn
                .open_table(keyspace_table(handle.name()))
                .map_err(engine_error)?;
            let doomed = match value {
                Some(value) => vec![(key.to_vec(), value.to_vec())],
                None => {
                    let successor = key_successor(key);
                    table
                        .range(under(key, &successor))
                        .map_err(engine_error)?
                        .map(|row| {
                            let (pair, _) = row.map_err(engine_error)?;
                            let (k, v) = pair.value();
                            Ok((k.to_vec(), v.to_vec()))
                        })
                        .collect::<Result<Vec<Entry>>>()?
                }
            };

            let mut removed = Vec::with_capacity(doomed.len());
            for (k, v) in doomed {
                if table
                    .remove((k.as_slice(), v.as_slice()))
                    .map_err(engine_error)?
                    .is_some()
                {
                    removed.push((k, v));
                }
            }
            removed
        };
        if removed.is_empty() {
            return Ok(false);
        }

        let released: u64 = removed.iter().map(|(k, v)| cost(k, v)).sum();
        let before = info.pages();
        info.bytes -= released;
        info.entries -= removed.len() as u64;
        let used = self.used - before * PAGE_SIZE + info.pages() * PAGE_SIZE;
        self.record(handle.name(), Some(info), used);
        Ok(true)
    }

    /// Empty the keyspace, or remove it entirely with `delete`
    pub fn drop_keyspace(&mut self, handle: &KeyspaceHandle, delete: bool) -> Result<()> {
        self.env.check_handle(handle)?;
        let name = handle.name();
        let Some(info) = self.catalog.get(name).copied() else {
            return Ok(());
        };

        self.txn
            .delete_table(keyspace_table(name))
            .map_err(engine_error)?;
        let released = info.pages() * PAGE_SIZE;
        if delete {
            self.record(name, None, self.used - released);
        } else {
            self.txn
                .open_table(keyspace_table(name))
                .map_err(engine_error)?;
            let used = self.used - released + PAGE_SIZE;
            self.record(name, Some(KeyspaceInfo::new(info.dupsort)), used);
        }
        Ok(())
    }

    /// Bytes of pages used including uncommitted changes
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Persist the catalog changes and commit
    pub fn commit(self) -> Result<()> {
        let WriteTxn {
            env,
            txn,
            catalog,
            touched,
            used,
            _writer,
        } = self;

        {
            let mut table = txn.open_table(CATALOG).map_err(engine_error)?;
            for name in &touched {
                match catalog.get(name) {
                    Some(info) => {
                        let row = catalog::encode(info)?;
                        table
                            .insert(name.as_str(), row.as_slice())
                            .map_err(engine_error)?;
                    }
                    None => {
                        table.remove(name.as_str()).map_err(engine_error)?;
                    }
                }
            }
        }
        txn.commit().map_err(engine_error)?;

        env.publish(catalog, used);
        debug!(keyspaces = touched.len(), used, "Committed write transaction");
        Ok(())
    }

    /// Discard the changes
    pub fn abort(self) {
        let touched = self.touched.len();
        if let Err(e) = self.txn.abort() {
            warn!(error = %e, "Failed to abort write transaction");
        }
        debug!(keyspaces = touched, "Aborted write transaction");
    }
}

impl KvRead for WriteTxn<'_> {
    fn find_keyspace(&self, name: &str) -> Result<Option<KeyspaceHandle>> {
        Ok(find(&self.catalog, self.env, name))
    }

    fn keyspace_names(&self) -> Vec<String> {
        self.catalog.keys().cloned().collect()
    }

    fn keyspace_info(&self, handle: &KeyspaceHandle) -> Result<Option<KeyspaceInfo>> {
        self.env.check_handle(handle)?;
        Ok(self.catalog.get(handle.name()).copied())
    }

    fn cursor(&self, handle: &KeyspaceHandle) -> Result<Cursor<'_>> {
        self.env.check_handle(handle)?;
        if !self.catalog.contains_key(handle.name()) {
            return Ok(Cursor::missing());
        }
        Ok(Cursor::pending(&self.txn, handle.name()))
    }
}
