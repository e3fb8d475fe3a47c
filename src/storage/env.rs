//! Environment: owns the redb database, the writer lock and the committed
//! keyspace catalog.

use super::catalog::{self, Catalog, CATALOG};
use super::txn::{ReadTxn, WriteTxn};
use super::{engine_error, EnvConfig, KeyspaceHandle, DATA_FILE, META_PAGES, MIN_MAP_SIZE};
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use redb::Durability;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Page cache when `readahead` is off
const SMALL_CACHE: usize = 4 * 1024 * 1024;

/// Source of handle epochs. Process-wide so handles never match an
/// environment other than the one (and the map size) they were issued for.
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

/// Commit an empty transaction durably, flushing every earlier commit
fn flush(db: &redb::Database) -> Result<()> {
    let mut txn = db.begin_write().map_err(engine_error)?;
    txn.set_durability(Durability::Immediate);
    txn.commit().map_err(engine_error)
}

pub(crate) struct EnvShared {
    pub(crate) path: PathBuf,
    pub(crate) file: PathBuf,
    pub(crate) config: EnvConfig,
    pub(crate) map_size: AtomicU64,
    pub(crate) epoch: AtomicU64,
    pub(crate) readers: AtomicUsize,
    pub(crate) closed: AtomicBool,
    /// Accounted bytes of the committed state
    used: AtomicU64,
    /// Catalog as of the last commit
    catalog: RwLock<Catalog>,
    db: RwLock<Option<redb::Database>>,
    writer: Mutex<()>,
}

impl EnvShared {
    /// Fail with `StaleHandle` for handles issued before the last resize
    pub(crate) fn check_handle(&self, handle: &KeyspaceHandle) -> Result<()> {
        if handle.epoch() != self.epoch.load(Ordering::Acquire) {
            return Err(Error::StaleHandle(handle.name().to_string()));
        }
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Make a commit's catalog the committed one
    pub(crate) fn publish(&self, catalog: Catalog, used: u64) {
        *self.catalog.write() = catalog;
        self.used.store(used, Ordering::Release);
    }

    fn durability(&self) -> Durability {
        if !self.config.sync {
            Durability::None
        } else if self.config.map_async {
            Durability::Eventual
        } else {
            Durability::Immediate
        }
    }

    /// Commits are not durable until flushed
    fn defers_flush(&self) -> bool {
        !self.config.sync || self.config.map_async
    }

    fn snapshot(&self) -> Result<(redb::ReadTransaction, Catalog)> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(Error::Closed)?;
        let txn = db.begin_read().map_err(engine_error)?;
        let catalog = {
            let table = txn.open_table(CATALOG).map_err(engine_error)?;
            catalog::load(&table)?
        };
        Ok((txn, catalog))
    }
}

/// An open storage environment. Cloning shares the same environment.
#[derive(Clone)]
pub struct Environment {
    shared: Arc<EnvShared>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.shared.path)
            .field("map_size", &self.map_size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Environment {
    /// Open or create an environment and load its keyspace catalog.
    pub fn open(path: impl AsRef<Path>, config: EnvConfig) -> Result<Self> {
        if config.map_size < MIN_MAP_SIZE {
            return Err(Error::InvalidArgument(format!(
                "map_size {} is below the minimum of {} bytes",
                config.map_size, MIN_MAP_SIZE
            )));
        }
        if config.max_dbs == 0 || config.max_readers == 0 {
            return Err(Error::InvalidArgument(
                "max_dbs and max_readers must be positive".to_string(),
            ));
        }

        let path = path.as_ref().to_path_buf();
        let file = if config.subdir {
            std::fs::create_dir_all(&path)?;
            path.join(DATA_FILE)
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            path.clone()
        };

        let mut builder = redb::Builder::new();
        if !config.readahead {
            builder.set_cache_size(SMALL_CACHE);
        }
        let db = builder.create(&file).map_err(engine_error)?;

        // creates the catalog table on first open
        let catalog = {
            let txn = db.begin_write().map_err(engine_error)?;
            let catalog = {
                let table = txn.open_table(CATALOG).map_err(engine_error)?;
                catalog::load(&table)?
            };
            txn.commit().map_err(engine_error)?;
            catalog
        };

        let used = catalog::used_bytes(&catalog, META_PAGES);
        let map_size = if used > config.map_size {
            info!(
                configured = config.map_size,
                used, "Stored data exceeds configured map size, growing map"
            );
            used
        } else {
            config.map_size
        };

        info!(
            path = ?path,
            keyspaces = catalog.len(),
            used,
            map_size,
            "Opened storage environment"
        );

        Ok(Self {
            shared: Arc::new(EnvShared {
                path,
                file,
                config,
                map_size: AtomicU64::new(map_size),
                epoch: AtomicU64::new(next_epoch()),
                readers: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                used: AtomicU64::new(used),
                catalog: RwLock::new(catalog),
                db: RwLock::new(Some(db)),
                writer: Mutex::new(()),
            }),
        })
    }

    /// Begin a read transaction on the latest committed snapshot
    pub fn begin_read(&self) -> Result<ReadTxn<'_>> {
        let shared = &*self.shared;
        shared.ensure_open()?;

        let active = shared.readers.fetch_add(1, Ordering::AcqRel) + 1;
        if active > shared.config.max_readers {
            shared.readers.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ReadersFull(shared.config.max_readers));
        }

        match shared.snapshot() {
            Ok((txn, catalog)) => Ok(ReadTxn::new(shared, txn, catalog)),
            Err(e) => {
                shared.readers.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Begin the write transaction, waiting for any current writer
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        let shared = &*self.shared;
        shared.ensure_open()?;

        let writer = shared.writer.lock();
        let mut txn = {
            let guard = shared.db.read();
            let db = guard.as_ref().ok_or(Error::Closed)?;
            db.begin_write().map_err(engine_error)?
        };
        txn.set_durability(shared.durability());
        txn.set_two_phase_commit(shared.config.metasync);

        let catalog = shared.catalog.read().clone();
        let used = shared.used.load(Ordering::Acquire);
        Ok(WriteTxn::new(shared, writer, txn, catalog, used))
    }

    /// Grow (or shrink) the map. Every handle issued before the call
    /// becomes stale.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        let shared = &*self.shared;
        shared.ensure_open()?;

        let _writer = shared.writer.lock();
        let used = self.storage_used();
        if new_size < used.max(MIN_MAP_SIZE) {
            return Err(Error::InvalidArgument(format!(
                "map_size {} is smaller than the {} bytes in use",
                new_size, used
            )));
        }

        let old_size = shared.map_size.swap(new_size, Ordering::AcqRel);
        shared.epoch.store(next_epoch(), Ordering::Release);
        info!(old_size, new_size, used, "Resized storage map");
        Ok(())
    }

    /// A handle for the same keyspace valid under the current map
    pub fn refresh(&self, handle: &KeyspaceHandle) -> Result<KeyspaceHandle> {
        self.shared.ensure_open()?;
        let dupsort = self
            .shared
            .catalog
            .read()
            .get(handle.name())
            .map_or(handle.dupsort(), |info| info.dupsort);
        Ok(KeyspaceHandle::new(
            handle.name(),
            dupsort,
            self.shared.epoch.load(Ordering::Acquire),
        ))
    }

    /// A handle by name, whether or not the keyspace exists yet
    pub fn handle(&self, name: &str, dupsort: bool) -> Result<KeyspaceHandle> {
        self.refresh(&KeyspaceHandle::new(name, dupsort, 0))
    }

    pub fn map_size(&self) -> u64 {
        self.shared.map_size.load(Ordering::Acquire)
    }

    /// Bytes of pages used by the committed state
    pub fn storage_used(&self) -> u64 {
        self.shared.used.load(Ordering::Acquire)
    }

    /// Bytes reserved on disk: the whole map with `writemap`, otherwise
    /// the database file's size
    pub fn storage_allocated(&self) -> Result<u64> {
        if self.shared.config.writemap {
            return Ok(self.map_size());
        }
        match std::fs::metadata(&self.shared.file) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of every committed keyspace
    pub fn keyspace_names(&self) -> Vec<String> {
        self.shared.catalog.read().keys().cloned().collect()
    }

    /// Make commits deferred by `map_async` or `sync = false` durable
    pub fn sync(&self) -> Result<()> {
        self.shared.ensure_open()?;
        let _writer = self.shared.writer.lock();
        let guard = self.shared.db.read();
        let db = guard.as_ref().ok_or(Error::Closed)?;
        flush(db)
    }

    /// Release free pages and shrink the database file. Fails while read
    /// transactions are open.
    pub fn compact(&self) -> Result<()> {
        self.shared.ensure_open()?;
        let _writer = self.shared.writer.lock();
        let mut guard = self.shared.db.write();
        let db = guard.as_mut().ok_or(Error::Closed)?;
        flush(db)?;
        let compacted = db.compact().map_err(engine_error)?;
        debug!(compacted, "Compacted database file");
        Ok(())
    }

    /// Flush and release the environment. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _writer = self.shared.writer.lock();
        if let Some(db) = self.shared.db.write().take() {
            if self.shared.defers_flush() {
                flush(&db)?;
            }
        }
        info!(path = ?self.shared.path, "Closed storage environment");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn config(&self) -> &EnvConfig {
        &self.shared.config
    }

    /// Active read transactions
    pub fn readers(&self) -> usize {
        self.shared.readers.load(Ordering::Acquire)
    }
}

impl Drop for EnvShared {
    fn drop(&mut self) {
        let defers_flush = self.defers_flush();
        if let Some(db) = self.db.get_mut().as_ref() {
            if defers_flush {
                if let Err(e) = flush(db) {
                    warn!("Failed to flush database on drop: {}", e);
                }
            }
        }
        debug!(path = ?self.path, "Dropped storage environment");
    }
}
