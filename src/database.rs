//! Database: owns the storage environment, the schema keyspace, the table
//! registry and the transaction scopes every table operation runs in.

use crate::compression::Compression;
use crate::config::DatabaseConfig;
use crate::datum::Datum;
use crate::error::{Error, Result};
use crate::journal::{self, JournalEntry, JournalKind, JOURNAL_KEYSPACE, SYSTEM_PREFIX};
use crate::metadata::{self, validate_name, METADATA_KEYSPACE};
use crate::registry::KeyFnRegistry;
use crate::storage::{Environment, KeyspaceHandle, KvRead, ReadTxn, WriteTxn};
use crate::table::{Table, TableOptions, TableSettings};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Map growths one `with_resize_retry` call may make before giving up
pub const MAX_GROWTH_STEPS: usize = 8;

/// Access to a consistent view of the database. Implemented by both scope
/// types so read operations accept either.
pub trait Transaction {
    /// The underlying key-value view
    fn kv(&self) -> &dyn KvRead;

    fn environment(&self) -> &Environment;

    /// Handle of the schema keyspace
    fn metadata(&self) -> &KeyspaceHandle;

    /// Native key functions
    fn registry(&self) -> &KeyFnRegistry;
}

#[derive(Debug, Clone)]
struct SystemHandles {
    metadata: KeyspaceHandle,
    /// Present only with replication on
    journal: Option<KeyspaceHandle>,
}

/// Read-only scope over one snapshot
pub struct ReadScope<'env> {
    env: &'env Environment,
    txn: ReadTxn<'env>,
    system: SystemHandles,
    registry: &'env KeyFnRegistry,
}

impl Transaction for ReadScope<'_> {
    fn kv(&self) -> &dyn KvRead {
        &self.txn
    }

    fn environment(&self) -> &Environment {
        self.env
    }

    fn metadata(&self) -> &KeyspaceHandle {
        &self.system.metadata
    }

    fn registry(&self) -> &KeyFnRegistry {
        self.registry
    }
}

/// The write scope. Committed when the closure passed to
/// `Database::write` returns `Ok`, aborted otherwise.
pub struct WriteScope<'env> {
    env: &'env Environment,
    txn: WriteTxn<'env>,
    system: SystemHandles,
    registry: &'env KeyFnRegistry,
    schema_dirty: bool,
}

impl<'env> WriteScope<'env> {
    pub(crate) fn txn_mut(&mut self) -> &mut WriteTxn<'env> {
        &mut self.txn
    }

    /// The registry, borrowed for the scope's whole life
    pub(crate) fn keyfns(&self) -> &'env KeyFnRegistry {
        self.registry
    }

    /// Record a mutation when replication is on and the table is journaled
    pub(crate) fn journal(
        &mut self,
        kind: JournalKind,
        table: &str,
        payload: serde_json::Value,
    ) -> Result<Option<u64>> {
        match &self.system.journal {
            Some(handle) if journal::is_journaled(table) => {
                journal::append(&mut self.txn, handle, kind, table, payload).map(Some)
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn put_meta<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        metadata::put(&mut self.txn, &self.system.metadata, key, value)
    }

    pub(crate) fn delete_meta(&mut self, key: &str) -> Result<bool> {
        metadata::delete(&mut self.txn, &self.system.metadata, key)
    }

    /// Table handles changed in this scope; resynchronise them on abort
    pub(crate) fn mark_schema_dirty(&mut self) {
        self.schema_dirty = true;
    }

    /// Bytes in use including this scope's changes
    pub fn used(&self) -> u64 {
        self.txn.used()
    }
}

impl Transaction for WriteScope<'_> {
    fn kv(&self) -> &dyn KvRead {
        &self.txn
    }

    fn environment(&self) -> &Environment {
        self.env
    }

    fn metadata(&self) -> &KeyspaceHandle {
        &self.system.metadata
    }

    fn registry(&self) -> &KeyFnRegistry {
        self.registry
    }
}

/// An embedded document database
pub struct Database {
    path: PathBuf,
    config: DatabaseConfig,
    env: RwLock<Option<Environment>>,
    system: RwLock<Option<SystemHandles>>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    registry: KeyFnRegistry,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("tables", &self.tables.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Database {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let db = Self {
            path: path.as_ref().to_path_buf(),
            config,
            env: RwLock::new(None),
            system: RwLock::new(None),
            tables: RwLock::new(HashMap::new()),
            registry: KeyFnRegistry::new(),
        };
        db.reopen()?;
        Ok(db)
    }

    /// Open again after `close`. Does nothing when already open.
    pub fn reopen(&self) -> Result<()> {
        let mut slot = self.env.write();
        if slot.as_ref().is_some_and(|env| !env.is_closed()) {
            return Ok(());
        }

        let env = Environment::open(&self.path, self.config.storage.clone())?;
        let system = {
            let mut txn = env.begin_write()?;
            let metadata = txn.open_keyspace(METADATA_KEYSPACE, false)?;
            let journal = if self.config.replication {
                Some(txn.open_keyspace(JOURNAL_KEYSPACE, false)?)
            } else {
                None
            };
            txn.commit()?;
            SystemHandles { metadata, journal }
        };

        *self.system.write() = Some(system);
        *slot = Some(env);
        self.tables.write().clear();

        info!(
            path = ?self.path,
            replication = self.config.replication,
            map_size = self.config.storage.map_size,
            "Opened database"
        );
        Ok(())
    }

    /// Flush, release the environment and forget every table handle.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        let env = self.env.write().take();
        self.system.write().take();
        self.tables.write().clear();

        let Some(env) = env else {
            return Ok(());
        };
        if self.config.compact_on_close {
            env.compact()?;
        }
        env.close()?;
        info!(path = ?self.path, "Closed database");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.env.read().as_ref().is_some_and(|env| !env.is_closed())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn handles(&self) -> Result<(Environment, SystemHandles)> {
        let env = self.env.read().clone().ok_or(Error::Closed)?;
        let system = self.system.read().clone().ok_or(Error::Closed)?;
        Ok((env, system))
    }

    /// Run `f` in a read scope
    pub fn read<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&ReadScope<'_>) -> Result<T>,
    {
        self.with_resize_retry(|| self.read_once(&mut f))
    }

    fn read_once<T, F>(&self, f: &mut F) -> Result<T>
    where
        F: FnMut(&ReadScope<'_>) -> Result<T>,
    {
        let (env, system) = self.handles()?;
        let scope = ReadScope {
            env: &env,
            txn: env.begin_read()?,
            system,
            registry: &self.registry,
        };
        f(&scope)
    }

    /// Run `f` in the write scope: commit on `Ok`, abort on `Err`. Waits for
    /// any other writer. Must not be nested inside another write scope.
    pub fn write<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut WriteScope<'_>) -> Result<T>,
    {
        self.with_resize_retry(|| self.write_once(&mut f))
    }

    fn write_once<T, F>(&self, f: &mut F) -> Result<T>
    where
        F: FnMut(&mut WriteScope<'_>) -> Result<T>,
    {
        let (env, system) = self.handles()?;
        let mut scope = WriteScope {
            env: &env,
            txn: env.begin_write()?,
            system,
            registry: &self.registry,
            schema_dirty: false,
        };

        let result = f(&mut scope);
        let WriteScope {
            txn,
            system,
            schema_dirty,
            ..
        } = scope;
        match result {
            Ok(value) => match txn.commit() {
                Ok(()) => Ok(value),
                Err(e) => {
                    if schema_dirty {
                        self.resync(self.reload_tables());
                    }
                    Err(e)
                }
            },
            Err(e) => {
                // reload while still holding the writer so no other write
                // observes the half-applied schema
                if schema_dirty {
                    self.resync(self.reload_from(&env, system));
                }
                txn.abort();
                Err(e)
            }
        }
    }

    fn resync(&self, outcome: Result<()>) {
        match outcome {
            Ok(()) => debug!("Resynchronised tables after aborted schema change"),
            Err(e) => warn!(error = %e, "Failed to resynchronise tables"),
        }
    }

    /// Run `op`, recovering from capacity signals. `MapFull` grows the map
    /// and re-runs the operation, at most `MAX_GROWTH_STEPS` times;
    /// `StaleHandle` refreshes every handle and re-runs it once.
    pub fn with_resize_retry<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut refreshed = false;
        let mut growths = 0;
        loop {
            match op() {
                Err(Error::MapFull { required, map_size }) if growths < MAX_GROWTH_STEPS => {
                    growths += 1;
                    let new_size = map_size
                        .saturating_mul(2)
                        .max(required.saturating_add(required / 4));
                    info!(required, map_size, new_size, step = growths, "Map full, growing");
                    self.resize(new_size)?;
                }
                Err(Error::StaleHandle(keyspace)) if !refreshed => {
                    debug!(%keyspace, "Handle outlived a resize, refreshing");
                    self.refresh_handles()?;
                    refreshed = true;
                }
                other => return other,
            }
        }
    }

    /// Change the map size and refresh every handle
    pub fn resize(&self, new_size: u64) -> Result<()> {
        let (env, _) = self.handles()?;
        env.resize(new_size)?;
        self.refresh_handles()
    }

    fn refresh_handles(&self) -> Result<()> {
        let (env, _) = self.handles()?;
        {
            let mut system = self.system.write();
            if let Some(system) = system.as_mut() {
                system.metadata = env.refresh(&system.metadata)?;
                if let Some(journal) = system.journal.as_mut() {
                    *journal = env.refresh(journal)?;
                }
            }
        }
        self.reload_tables()
    }

    /// Re-read every registered table from the committed state
    fn reload_tables(&self) -> Result<()> {
        let (env, system) = self.handles()?;
        self.reload_from(&env, system)
    }

    fn reload_from(&self, env: &Environment, system: SystemHandles) -> Result<()> {
        let tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        if tables.is_empty() {
            return Ok(());
        }
        let scope = ReadScope {
            env,
            txn: env.begin_read()?,
            system,
            registry: &self.registry,
        };
        for table in &tables {
            table.reload(&scope)?;
        }
        Ok(())
    }

    /// The table `name` with default settings. The table need not exist:
    /// it is created by its first write.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.table_with(name, TableOptions::default())
    }

    /// The table `name`, created with `options` on its first write.
    ///
    /// A table that has not been written yet takes the requested
    /// compression. An existing table keeps its stored settings. The one
    /// exception is compression asked for on a non-empty table stored
    /// uncompressed: its documents are recompressed once, in a write scope
    /// of their own, so this must not be called from inside `write` in that
    /// case.
    pub fn table_with(&self, name: &str, options: TableOptions) -> Result<Arc<Table>> {
        validate_name("Table", name)?;

        let registered = self.tables.read().get(name).cloned();
        let table = match registered {
            Some(table) => table,
            None => {
                let requested = TableSettings::new(
                    options.compression.unwrap_or(self.config.compression),
                    options.codec.unwrap_or(self.config.codec),
                    options.key_mode.unwrap_or(self.config.key_mode),
                );
                let opened = self.read(|scope| Table::open(name, scope, requested.clone()))?;
                let mut tables = self.tables.write();
                Arc::clone(
                    tables
                        .entry(name.to_string())
                        .or_insert_with(|| Arc::new(opened)),
                )
            }
        };

        if let Some(wanted) = options.compression {
            if table.exists() {
                self.apply_compression(&table, wanted)?;
            } else {
                table.request_compression(wanted);
            }
        }
        Ok(table)
    }

    fn apply_compression(&self, table: &Table, wanted: Compression) -> Result<()> {
        let stored = table.settings().compression;
        if !table.exists() || stored == wanted {
            return Ok(());
        }
        let records = self.read(|scope| table.records(scope))?;
        if !stored.is_enabled() && wanted.is_enabled() && records > 0 {
            let stats = self.write(|scope| table.recompress(scope, wanted))?;
            info!(
                table = table.name(),
                records,
                ratio = stats.ratio,
                "Enabled compression on existing table"
            );
        } else {
            warn!(
                table = table.name(),
                stored = stored.name(),
                requested = wanted.name(),
                "Keeping stored compression"
            );
        }
        Ok(())
    }

    /// Whether the table has been created
    pub fn exists(&self, name: &str) -> Result<bool> {
        self.read(|scope| {
            let row: Option<TableSettings> =
                metadata::get(scope.kv(), scope.metadata(), &metadata::settings_key(name))?;
            Ok(row.is_some())
        })
    }

    /// Names of created tables, sorted. `include_system` adds the
    /// database's own keyspaces.
    pub fn tables(&self, include_system: bool) -> Result<Vec<String>> {
        self.read(|scope| {
            let mut names = metadata::table_names(scope.kv(), scope.metadata())?;
            if include_system {
                names.extend(
                    scope
                        .kv()
                        .keyspace_names()
                        .into_iter()
                        .filter(|name| name.starts_with(SYSTEM_PREFIX)),
                );
                names.sort();
            }
            Ok(names)
        })
    }

    /// Remove a table, its indexes and its schema rows
    pub fn drop(&self, name: &str) -> Result<()> {
        if !self.exists(name)? {
            return Err(Error::NoSuchTable(name.to_string()));
        }
        let table = self.table(name)?;
        self.write(|scope| table.destroy(scope))?;
        self.tables.write().remove(name);
        Ok(())
    }

    /// Register a native key function for indexes created with
    /// `KeySpec::native(name)`
    pub fn register_key_fn<F>(&self, name: &str, func: F) -> Result<()>
    where
        F: Fn(&Datum) -> Vec<String> + Send + Sync + 'static,
    {
        self.registry.register(name, func)?;
        debug!(name, "Registered key function");
        Ok(())
    }

    pub fn registry(&self) -> &KeyFnRegistry {
        &self.registry
    }

    /// Journal entries after `after_seq`, oldest first
    pub fn journal(&self, after_seq: u64, limit: usize) -> Result<Vec<JournalEntry>> {
        self.read(|scope| match scope.kv().find_keyspace(JOURNAL_KEYSPACE)? {
            Some(handle) => journal::read(scope.kv(), &handle, after_seq, limit),
            None => Ok(Vec::new()),
        })
    }

    /// Bytes of pages in use
    pub fn storage_used(&self) -> Result<u64> {
        let (env, _) = self.handles()?;
        Ok(env.storage_used())
    }

    /// Bytes reserved on disk
    pub fn storage_allocated(&self) -> Result<u64> {
        let (env, _) = self.handles()?;
        env.storage_allocated()
    }

    pub fn map_size(&self) -> Result<u64> {
        let (env, _) = self.handles()?;
        Ok(env.map_size())
    }

    /// Release free pages and shrink the database file
    pub fn compact(&self) -> Result<()> {
        let (env, _) = self.handles()?;
        env.compact()?;
        info!(path = ?self.path, "Compacted database");
        Ok(())
    }

    /// Flush deferred commits
    pub fn sync(&self) -> Result<()> {
        let (env, _) = self.handles()?;
        env.sync()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, path = ?self.path, "Failed to close database");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use serde_json::json;

    fn open(dir: &Path, replication: bool) -> Result<Database> {
        let config = DatabaseConfig {
            replication,
            ..Default::default()
        };
        Database::open(dir, config)
    }

    #[test]
    fn test_table_is_created_by_first_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open(dir.path(), false)?;

        let people = db.table("people")?;
        assert!(!db.exists("people")?);
        assert!(db.tables(false)?.is_empty());

        db.write(|scope| people.append(scope, json!({"name": "Tom"})))?;
        assert!(db.exists("people")?);
        assert_eq!(db.tables(false)?, vec!["people"]);
        assert_eq!(db.tables(true)?, vec!["__metadata__", "people"]);
        Ok(())
    }

    #[test]
    fn test_failed_write_rolls_back_schema() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open(dir.path(), false)?;
        let people = db.table("people")?;

        let result: Result<()> = db.write(|scope| {
            people.append(scope, json!({"name": "Tom"}))?;
            people.ensure(scope, "by_name", "{name}", false, false)?;
            Err(Error::InvalidArgument("give up".to_string()))
        });
        assert!(result.is_err());

        assert!(!people.exists());
        assert!(people.index_names().is_empty());
        assert!(!db.exists("people")?);
        assert_eq!(db.read(|scope| people.records(scope))?, 0);
        Ok(())
    }

    #[test]
    fn test_reserved_and_invalid_names() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open(dir.path(), false)?;
        assert!(matches!(db.table("_private"), Err(Error::InvalidArgument(_))));
        assert!(matches!(db.table("__metadata__"), Err(Error::InvalidArgument(_))));
        assert!(matches!(db.drop("missing"), Err(Error::NoSuchTable(_))));
        Ok(())
    }

    #[test]
    fn test_close_is_idempotent_and_reopen_restores() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open(dir.path(), false)?;
        let people = db.table("people")?;
        let oid = db.write(|scope| people.append(scope, json!({"name": "Tom"})))?;

        db.close()?;
        db.close()?;
        assert!(!db.is_open());
        assert!(matches!(db.table("people"), Err(Error::Closed)));

        db.reopen()?;
        db.reopen()?;
        let people = db.table("people")?;
        let doc = db.read(|scope| people.get(scope, oid))?;
        assert_eq!(doc.and_then(|d| d.get("name").cloned()), Some(Datum::from("Tom")));
        Ok(())
    }

    #[test]
    fn test_resize_retry_gives_up_after_growth_cap() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open(dir.path(), false)?;
        let mut attempts = 0;
        let result: Result<()> = db.with_resize_retry(|| {
            attempts += 1;
            Err(Error::MapFull {
                required: 1 << 20,
                map_size: 1 << 20,
            })
        });
        assert!(matches!(result, Err(Error::MapFull { .. })));
        assert_eq!(attempts, MAX_GROWTH_STEPS + 1);
        Ok(())
    }

    #[test]
    fn test_unwritten_table_takes_later_compression() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open(dir.path(), false)?;
        let people = db.table("people")?;
        assert_eq!(people.settings().compression, Compression::None);

        let again = db.table_with("people", TableOptions::new().compression(Compression::Lz4))?;
        assert!(Arc::ptr_eq(&people, &again));
        db.write(|scope| people.append(scope, json!({"name": "Tom"})))?;
        assert_eq!(people.settings().compression, Compression::Lz4);
        drop(people);
        drop(again);
        db.close()?;

        db.reopen()?;
        let people = db.table("people")?;
        assert_eq!(people.settings().compression, Compression::Lz4);
        Ok(())
    }

    #[test]
    fn test_journal_only_with_replication() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open(dir.path(), false)?;
        let people = db.table("people")?;
        db.write(|scope| people.append(scope, json!({"name": "Tom"})))?;
        assert!(db.journal(0, 100)?.is_empty());
        drop(db);

        let db = open(dir.path(), true)?;
        let people = db.table("people")?;
        let doc = Document::with_oid(1u64, json!({"name": "Tim"}));
        db.write(|scope| people.save(scope, &doc))?;

        let entries = db.journal(0, 100)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[0].kind, JournalKind::Update);
        assert_eq!(entries[0].payload["doc"]["name"], "Tim");
        Ok(())
    }
}
