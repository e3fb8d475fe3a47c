//! Tables: documents in a primary keyspace plus their secondary indexes.
//!
//! The primary keyspace is named after the table and maps encoded oids to
//! encoded documents (codec, then compression). Every index is kept in step
//! with it inside the same write transaction.

pub mod query;
pub mod scan;

pub use query::{IndexEntry, PageContext, Predicate, Query};
pub use scan::{Documents, IndexEntries};

use self::scan::{Direction, KeyRange, RawScan, ResumePoint};
use crate::codec::Codec;
use crate::compression::{Compression, CompressionStats};
use crate::database::{Transaction, WriteScope};
use crate::datum::Datum;
use crate::document::{Document, KeyMode, Oid};
use crate::error::{Error, Result};
use crate::index::{self, Index, IndexConfig};
use crate::journal::JournalKind;
use crate::keyfn::{KeyFunction, KeySpec};
use crate::metadata::{self, settings_key, validate_name};
use crate::storage::{Entry, KeyspaceHandle, KvRead, PutFlags};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::btree_map::Entry as Slot;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Persisted per-table settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSettings {
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub key_mode: KeyMode,
    pub created_at: DateTime<Utc>,
}

impl TableSettings {
    pub fn new(compression: Compression, codec: Codec, key_mode: KeyMode) -> Self {
        Self {
            compression,
            codec,
            key_mode,
            created_at: Utc::now(),
        }
    }

    /// Serialize then compress
    pub fn encode(&self, content: &Datum) -> Result<Vec<u8>> {
        let bytes = self.codec.encode(content)?;
        self.compression.compress(&bytes)
    }

    /// Decompress then deserialize
    pub fn decode(&self, bytes: &[u8]) -> Result<Datum> {
        let raw = self.compression.decompress(bytes)?;
        self.codec.decode(&raw)
    }
}

/// Settings requested when opening a table. Unset fields fall back to the
/// database configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TableOptions {
    pub compression: Option<Compression>,
    pub codec: Option<Codec>,
    pub key_mode: Option<KeyMode>,
}

impl TableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn key_mode(mut self, key_mode: KeyMode) -> Self {
        self.key_mode = Some(key_mode);
        self
    }
}

/// Options of `Table::ensure_with`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    /// Several documents may share a key
    pub duplicates: bool,
    /// A unique key taken by another document is reassigned
    pub overwrite: bool,
    /// Recreate and reindex even if the index exists
    pub force: bool,
}

/// What `Table::delete` removes
#[derive(Debug, Clone)]
pub enum DeleteTarget {
    One(Oid),
    Many(Vec<Oid>),
    Doc(Document),
}

impl From<Oid> for DeleteTarget {
    fn from(oid: Oid) -> Self {
        DeleteTarget::One(oid)
    }
}

impl From<Vec<Oid>> for DeleteTarget {
    fn from(oids: Vec<Oid>) -> Self {
        DeleteTarget::Many(oids)
    }
}

impl From<&[Oid]> for DeleteTarget {
    fn from(oids: &[Oid]) -> Self {
        DeleteTarget::Many(oids.to_vec())
    }
}

impl From<&Document> for DeleteTarget {
    fn from(doc: &Document) -> Self {
        DeleteTarget::Doc(doc.clone())
    }
}

impl From<Document> for DeleteTarget {
    fn from(doc: Document) -> Self {
        DeleteTarget::Doc(doc)
    }
}

struct TableState {
    /// Absent until the first write creates the keyspace
    primary: Option<KeyspaceHandle>,
    settings: TableSettings,
    /// Settings row exists
    persisted: bool,
    indexes: BTreeMap<String, Index>,
}

impl TableState {
    fn index(&self, table: &str, name: &str) -> Result<&Index> {
        self.indexes.get(name).ok_or_else(|| Error::NoSuchIndex {
            table: table.to_string(),
            index: name.to_string(),
        })
    }

    /// Key in the scanned keyspace for a range bound
    fn bound(&self, table: &str, index: Option<&str>, doc: Option<&Document>) -> Result<Option<Vec<u8>>> {
        let Some(doc) = doc else {
            return Ok(None);
        };
        match index {
            Some(name) => {
                let index = self.index(table, name)?;
                index.key_function().key(&doc.content).map(Some).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "Range bound has no key in index {}.{}",
                        table, name
                    ))
                })
            }
            None => Ok(Some(doc.require_oid()?.to_bytes())),
        }
    }
}

/// A named collection of documents
pub struct Table {
    name: String,
    state: RwLock<TableState>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("persisted", &state.persisted)
            .field("settings", &state.settings)
            .field("indexes", &state.indexes.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn to_payload(value: impl Serialize) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::Serialization(format!("Failed to encode journal payload: {}", e)))
}

/// Every entry of a keyspace, read before the caller starts writing
fn entries(kv: &dyn KvRead, handle: &KeyspaceHandle) -> Result<Vec<Entry>> {
    let mut cursor = kv.cursor(handle)?;
    let mut entries = Vec::new();
    while let Some(entry) = cursor.next()? {
        entries.push(entry);
    }
    Ok(entries)
}

/// Read the table's schema as seen by `txn`
fn load_state(txn: &impl Transaction, name: &str, requested: &TableSettings) -> Result<TableState> {
    let kv = txn.kv();
    let stored: Option<TableSettings> = metadata::get(kv, txn.metadata(), &settings_key(name))?;
    let persisted = stored.is_some();
    let settings = stored.unwrap_or_else(|| requested.clone());

    let mut indexes = BTreeMap::new();
    for config in metadata::index_configs(kv, txn.metadata(), name)? {
        let index = Index::attach(kv, txn.environment(), config, txn.registry())?;
        indexes.insert(index.name().to_string(), index);
    }

    Ok(TableState {
        primary: kv.find_keyspace(name)?,
        settings,
        persisted,
        indexes,
    })
}

impl Table {
    /// Open the table against `txn`. A table that doesn't exist yet gets
    /// the requested settings, applied when it is first written.
    pub(crate) fn open(name: &str, txn: &impl Transaction, requested: TableSettings) -> Result<Self> {
        let state = load_state(txn, name, &requested)?;
        if state.persisted && state.settings.codec != requested.codec {
            warn!(
                table = name,
                stored = state.settings.codec.name(),
                requested = requested.codec.name(),
                "Keeping stored codec"
            );
        }
        debug!(table = name, persisted = state.persisted, indexes = state.indexes.len(), "Opened table");
        Ok(Self {
            name: name.to_string(),
            state: RwLock::new(state),
        })
    }

    /// Re-read schema and handles. Used after a resize or an aborted schema
    /// change; settings of a table that still doesn't exist are kept.
    pub(crate) fn reload(&self, txn: &impl Transaction) -> Result<()> {
        let mut state = self.state.write();
        let requested = state.settings.clone();
        *state = load_state(txn, &self.name, &requested)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the table has been written
    pub fn exists(&self) -> bool {
        self.state.read().persisted
    }

    pub fn settings(&self) -> TableSettings {
        self.state.read().settings.clone()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.read().indexes.keys().cloned().collect()
    }

    pub fn index_config(&self, name: &str) -> Option<IndexConfig> {
        self.state.read().indexes.get(name).map(|i| i.config().clone())
    }

    /// Use `compression` when the table is first written. No effect once
    /// the table exists.
    pub(crate) fn request_compression(&self, compression: Compression) {
        let mut state = self.state.write();
        if !state.persisted && state.settings.compression != compression {
            debug!(table = %self.name, compression = compression.name(), "Changed requested compression");
            state.settings.compression = compression;
        }
    }

    /// Create the keyspace and settings row on first write
    fn create_if_missing(&self, scope: &mut WriteScope<'_>) -> Result<()> {
        let mut state = self.state.write();
        if state.persisted && state.primary.is_some() {
            return Ok(());
        }
        let handle = scope.txn_mut().open_keyspace(&self.name, false)?;
        if !state.persisted {
            scope.put_meta(&settings_key(&self.name), &state.settings)?;
            scope.journal(JournalKind::Create, &self.name, to_payload(&state.settings)?)?;
            state.persisted = true;
            info!(
                table = %self.name,
                compression = state.settings.compression.name(),
                codec = state.settings.codec.name(),
                "Created table"
            );
        }
        state.primary = Some(handle);
        scope.mark_schema_dirty();
        Ok(())
    }

    /// Insert a document, returning its oid
    pub fn append(&self, scope: &mut WriteScope<'_>, doc: impl Into<Document>) -> Result<Oid> {
        let doc = doc.into();
        doc.validate()?;
        self.create_if_missing(scope)?;

        let state = self.state.read();
        let primary = state
            .primary
            .clone()
            .ok_or_else(|| Error::Internal(format!("Table {} has no keyspace", self.name)))?;

        let oid = match doc.oid {
            Some(oid) => {
                if scope.kv().get(&primary, &oid.to_bytes())?.is_some() {
                    return Err(Error::DuplicateKey {
                        index: format!("{}.oid", self.name),
                        key: oid.to_string(),
                    });
                }
                oid
            }
            None => {
                let last = match scope.kv().cursor(&primary)?.last()? {
                    Some((key, _)) => Some(Oid::from_bytes(&key)?),
                    None => None,
                };
                state.settings.key_mode.next_oid(last)?
            }
        };

        for index in state.indexes.values() {
            index.check_keys(scope.kv(), oid, &doc.content)?;
        }

        let encoded = state.settings.encode(&doc.content)?;
        let no_overwrite = PutFlags {
            no_overwrite: true,
            ..Default::default()
        };
        if !scope.txn_mut().put(&primary, &oid.to_bytes(), &encoded, no_overwrite)? {
            return Err(Error::DuplicateKey {
                index: format!("{}.oid", self.name),
                key: oid.to_string(),
            });
        }
        scope.journal(
            JournalKind::Append,
            &self.name,
            json!({ "oid": oid, "doc": to_payload(&doc.content)? }),
        )?;
        for index in state.indexes.values() {
            index.put(scope.txn_mut(), oid, &doc.content)?;
        }

        debug!(table = %self.name, %oid, bytes = encoded.len(), "Appended document");
        Ok(oid)
    }

    /// Replace the content of an existing document
    pub fn save(&self, scope: &mut WriteScope<'_>, doc: &Document) -> Result<()> {
        let oid = doc.require_oid()?;
        doc.validate()?;

        let state = self.state.read();
        let primary = state
            .primary
            .clone()
            .ok_or_else(|| Error::DocumentNotFound(oid.to_string()))?;
        let key = oid.to_bytes();
        let old = match scope.kv().get(&primary, &key)? {
            Some(bytes) => state.settings.decode(&bytes)?,
            None => return Err(Error::DocumentNotFound(oid.to_string())),
        };

        for index in state.indexes.values() {
            index.check_keys(scope.kv(), oid, &doc.content)?;
        }

        let encoded = state.settings.encode(&doc.content)?;
        scope.txn_mut().put(&primary, &key, &encoded, PutFlags::default())?;
        scope.journal(
            JournalKind::Update,
            &self.name,
            json!({ "oid": oid, "doc": to_payload(&doc.content)? }),
        )?;
        let mut moved = 0;
        for index in state.indexes.values() {
            if index.save(scope.txn_mut(), oid, &old, &doc.content)? {
                moved += 1;
            }
        }

        debug!(table = %self.name, %oid, indexes_changed = moved, "Saved document");
        Ok(())
    }

    /// Remove documents. Every target must exist; nothing is removed
    /// otherwise. Returns the number removed.
    pub fn delete(&self, scope: &mut WriteScope<'_>, target: impl Into<DeleteTarget>) -> Result<usize> {
        let oids = match target.into() {
            DeleteTarget::One(oid) => vec![oid],
            DeleteTarget::Many(oids) => oids,
            DeleteTarget::Doc(doc) => vec![doc.require_oid()?],
        };
        let mut seen = BTreeSet::new();
        let oids: Vec<Oid> = oids.into_iter().filter(|oid| seen.insert(*oid)).collect();

        let state = self.state.read();
        let Some(primary) = state.primary.clone() else {
            return match oids.first() {
                Some(oid) => Err(Error::DocumentNotFound(oid.to_string())),
                None => Ok(0),
            };
        };

        let mut doomed = Vec::with_capacity(oids.len());
        for oid in oids {
            match scope.kv().get(&primary, &oid.to_bytes())? {
                Some(bytes) => doomed.push((oid, state.settings.decode(&bytes)?)),
                None => return Err(Error::DocumentNotFound(oid.to_string())),
            }
        }

        for (oid, content) in &doomed {
            scope.txn_mut().delete(&primary, &oid.to_bytes(), None)?;
            scope.journal(JournalKind::Delete, &self.name, json!({ "oid": oid }))?;
            for index in state.indexes.values() {
                index.delete(scope.txn_mut(), *oid, content)?;
            }
        }

        debug!(table = %self.name, count = doomed.len(), "Deleted documents");
        Ok(doomed.len())
    }

    /// Fetch one document; absence is not an error
    pub fn get(&self, txn: &impl Transaction, oid: Oid) -> Result<Option<Document>> {
        let state = self.state.read();
        let Some(primary) = &state.primary else {
            return Ok(None);
        };
        match txn.kv().get(primary, &oid.to_bytes())? {
            Some(bytes) => Ok(Some(Document {
                oid: Some(oid),
                content: state.settings.decode(&bytes)?,
            })),
            None => Ok(None),
        }
    }

    /// Number of documents
    pub fn records(&self, txn: &impl Transaction) -> Result<usize> {
        match &self.state.read().primary {
            Some(primary) => txn.kv().count(primary),
            None => Ok(0),
        }
    }

    /// Bytes of pages used by the primary keyspace and every index
    pub fn storage_used(&self, txn: &impl Transaction) -> Result<u64> {
        let state = self.state.read();
        let mut used = match &state.primary {
            Some(primary) => txn.kv().keyspace_used(primary)?,
            None => 0,
        };
        for index in state.indexes.values() {
            used += txn.kv().keyspace_used(index.handle())?;
        }
        Ok(used)
    }

    fn scan<'t>(
        &self,
        txn: &'t impl Transaction,
        query: &Query,
        range: KeyRange,
        direction: Direction,
        resume: Option<ResumePoint>,
        window: (usize, Option<usize>),
    ) -> Result<Documents<'t>> {
        let state = self.state.read();
        let index = match query.index_name() {
            Some(name) => Some(state.index(&self.name, name)?),
            None => None,
        };
        let Some(primary) = &state.primary else {
            return Ok(Documents::empty(state.settings.clone()));
        };

        let kv = txn.kv();
        let (cursor, lookup) = match index {
            Some(index) => (kv.cursor(index.handle())?, Some(kv.cursor(primary)?)),
            None => (kv.cursor(primary)?, None),
        };
        let nodup = query.nodup && index.is_some();
        let scan = RawScan::new(cursor, direction, range, nodup, resume);
        let (skip, cap) = window;
        Ok(Documents::new(
            scan,
            lookup,
            state.settings.clone(),
            query.predicate.clone(),
            skip,
            cap,
        ))
    }

    fn direction(query: &Query) -> Direction {
        if query.reverse {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    /// Every document in primary or index order
    pub fn find<'t>(&self, txn: &'t impl Transaction, query: Query) -> Result<Documents<'t>> {
        self.scan(txn, &query, KeyRange::all(), Self::direction(&query), None, query.window())
    }

    /// Documents between the keys derived from `lower` and `upper` (their
    /// oids when the query names no index). A missing bound is open.
    pub fn range<'t>(
        &self,
        txn: &'t impl Transaction,
        query: Query,
        lower: Option<&Document>,
        upper: Option<&Document>,
    ) -> Result<Documents<'t>> {
        let range = self.key_range(&query, lower, upper)?;
        self.scan(txn, &query, range, Self::direction(&query), None, query.window())
    }

    fn key_range(&self, query: &Query, lower: Option<&Document>, upper: Option<&Document>) -> Result<KeyRange> {
        let state = self.state.read();
        Ok(KeyRange {
            lower: state.bound(&self.name, query.index_name(), lower)?,
            upper: state.bound(&self.name, query.index_name(), upper)?,
            inclusive: query.inclusive,
        })
    }

    /// One page of a resumable scan.
    ///
    /// A positive `page_size` walks forward from the context, a negative one
    /// walks backward; either way the page comes back in forward order and
    /// the context moves to the last entry examined.
    pub fn filter(
        &self,
        txn: &impl Transaction,
        query: Query,
        lower: Option<&Document>,
        upper: Option<&Document>,
        context: &mut PageContext,
        page_size: isize,
    ) -> Result<Vec<Document>> {
        if page_size == 0 {
            return Err(Error::InvalidArgument("page_size cannot be zero".to_string()));
        }
        let direction = if page_size > 0 {
            Direction::Forward
        } else {
            Direction::Backward
        };
        let resume = match (&context.key, context.oid) {
            (Some(key), Some(oid)) => {
                let value = query.index_name().map(|_| oid.to_bytes());
                Some((key.clone(), value))
            }
            _ => None,
        };

        let range = self.key_range(&query, lower, upper)?;
        let mut docs = self.scan(txn, &query, range, direction, resume, (0, Some(page_size.unsigned_abs())))?;
        let mut page = Vec::new();
        for doc in docs.by_ref() {
            page.push(doc?);
        }
        if let Some((key, oid)) = docs.position() {
            context.set(key.clone(), *oid);
        }

        if direction == Direction::Backward {
            page.reverse();
        }
        Ok(page)
    }

    /// First document in primary or index order
    pub fn first(&self, txn: &impl Transaction, index: Option<&str>) -> Result<Option<Document>> {
        let mut query = Query::new().limit(1);
        if let Some(name) = index {
            query = query.index(name);
        }
        self.find(txn, query)?.next().transpose()
    }

    /// Last document in primary or index order
    pub fn last(&self, txn: &impl Transaction, index: Option<&str>) -> Result<Option<Document>> {
        let mut query = Query::new().limit(1).reverse(true);
        if let Some(name) = index {
            query = query.index(name);
        }
        self.find(txn, query)?.next().transpose()
    }

    fn seek_range(&self, query: &Query, template: &Document) -> Result<(String, KeyRange)> {
        let name = query
            .index_name()
            .ok_or_else(|| Error::InvalidArgument("seek requires an index".to_string()))?;
        let state = self.state.read();
        let index = state.index(&self.name, name)?;
        let key = index.key_function().key(&template.content).ok_or_else(|| {
            Error::InvalidArgument(format!("Seek template has no key in index {}.{}", self.name, name))
        })?;
        Ok((name.to_string(), KeyRange::exact(key)))
    }

    /// Documents whose key in the query's index equals the template's
    pub fn seek<'t>(&self, txn: &'t impl Transaction, query: Query, template: &Document) -> Result<Documents<'t>> {
        let (_, range) = self.seek_range(&query, template)?;
        self.scan(txn, &query, range, Self::direction(&query), None, query.window())
    }

    /// Like `seek`, without loading documents
    pub fn seek_keys<'t>(
        &self,
        txn: &'t impl Transaction,
        query: Query,
        template: &Document,
    ) -> Result<IndexEntries<'t>> {
        let (name, range) = self.seek_range(&query, template)?;
        let state = self.state.read();
        let index = state.index(&self.name, &name)?;
        let cursor = txn.kv().cursor(index.handle())?;
        let scan = RawScan::new(cursor, Self::direction(&query), range, query.nodup, None);
        let (skip, cap) = query.window();
        Ok(IndexEntries::new(Some(scan), skip, cap))
    }

    /// Documents strictly after `last_seen` in primary order. Starts over
    /// when `last_seen` no longer exists.
    pub fn tail<'t>(&self, txn: &'t impl Transaction, last_seen: Option<Oid>) -> Result<Documents<'t>> {
        let resume = match (last_seen, &self.state.read().primary) {
            (Some(oid), Some(primary)) => {
                let key = oid.to_bytes();
                if txn.kv().get(primary, &key)?.is_some() {
                    Some((key, None))
                } else {
                    debug!(table = %self.name, %oid, "Tail position is gone, restarting");
                    None
                }
            }
            _ => None,
        };
        self.scan(txn, &Query::new(), KeyRange::all(), Direction::Forward, resume, (0, None))
    }

    /// Create an index. See `ensure_with`.
    pub fn ensure(
        &self,
        scope: &mut WriteScope<'_>,
        name: &str,
        key: impl Into<KeySpec>,
        duplicates: bool,
        force: bool,
    ) -> Result<IndexConfig> {
        let options = IndexOptions {
            duplicates,
            force,
            ..Default::default()
        };
        self.ensure_with(scope, name, key, options)
    }

    /// Create an index, or return the existing one unless `force` is set.
    /// A new or forced index is filled from one scan of the table.
    pub fn ensure_with(
        &self,
        scope: &mut WriteScope<'_>,
        name: &str,
        key: impl Into<KeySpec>,
        options: IndexOptions,
    ) -> Result<IndexConfig> {
        validate_name("Index", name)?;
        if !options.force {
            if let Some(index) = self.state.read().indexes.get(name) {
                return Ok(index.config().clone());
            }
        }

        let spec = key.into();
        let config = IndexConfig::new(&self.name, name, &spec, options.duplicates, options.overwrite);
        let registry = scope.keyfns();
        let key_fn = config.resolve(registry)?;

        let row = config.keyspace_name();
        let stored: Option<IndexConfig> = metadata::get(scope.kv(), scope.metadata(), &row)?;
        if let Some(stored) = &stored {
            if stored.table != self.name {
                return Err(Error::InvalidArgument(format!(
                    "Index {}.{} collides with keyspace {} of table {}",
                    self.name, name, row, stored.table
                )));
            }
        }
        // nothing is written until every document is known to fit the index
        self.check_fill(scope.kv(), &config, &key_fn)?;
        self.create_if_missing(scope)?;

        let mut state = self.state.write();
        scope.mark_schema_dirty();
        // the keyspace is recreated so the duplicate flag can change
        match state.indexes.remove(name) {
            Some(old) => old.drop(scope.txn_mut())?,
            None => {
                if let Some(handle) = scope.kv().find_keyspace(&row)? {
                    scope.txn_mut().drop_keyspace(&handle, true)?;
                }
            }
        }
        let index = Index::create(scope.txn_mut(), config.clone(), registry)?;

        if stored.as_ref() != Some(&config) {
            scope.put_meta(&row, &config)?;
            scope.journal(JournalKind::Ensure, &self.name, to_payload(&config)?)?;
        }

        let entries = Self::fill(scope, &state, &index)?;
        state.indexes.insert(name.to_string(), index);
        info!(table = %self.name, index = name, entries, force = options.force, "Ensured index");
        Ok(config)
    }

    /// Fail as filling a new index over the current documents would: a
    /// derived key over the size limit, or (unique without overwrite) a key
    /// shared by two documents. Writes nothing.
    fn check_fill(&self, kv: &dyn KvRead, config: &IndexConfig, key_fn: &KeyFunction) -> Result<()> {
        let state = self.state.read();
        let Some(primary) = &state.primary else {
            return Ok(());
        };
        let unique = !config.dupsort && !config.overwrite;
        let mut holders: BTreeMap<Vec<u8>, Oid> = BTreeMap::new();
        let mut cursor = kv.cursor(primary)?;
        while let Some((key, value)) = cursor.next()? {
            let oid = Oid::from_bytes(&key)?;
            let content = state.settings.decode(&value)?;
            for derived in key_fn.keys(&content) {
                index::check_key_size(&derived)?;
                if !unique {
                    continue;
                }
                match holders.entry(derived) {
                    Slot::Occupied(holder) if *holder.get() != oid => {
                        return Err(config.duplicate_key(holder.key()));
                    }
                    Slot::Occupied(_) => {}
                    Slot::Vacant(slot) => {
                        slot.insert(oid);
                    }
                }
            }
        }
        Ok(())
    }

    /// Put every document into `index`
    fn fill(scope: &mut WriteScope<'_>, state: &TableState, index: &Index) -> Result<usize> {
        let Some(primary) = &state.primary else {
            return Ok(0);
        };
        let documents = entries(scope.kv(), primary)?;
        for (key, value) in &documents {
            let oid = Oid::from_bytes(key)?;
            let content = state.settings.decode(value)?;
            index.put(scope.txn_mut(), oid, &content)?;
        }
        Ok(documents.len())
    }

    /// Empty an index and rebuild it from the table
    pub fn reindex(&self, scope: &mut WriteScope<'_>, name: &str) -> Result<usize> {
        let state = self.state.read();
        let index = state.index(&self.name, name)?;
        index.empty(scope.txn_mut())?;
        let entries = Self::fill(scope, &state, index)?;
        info!(table = %self.name, index = name, entries, "Reindexed");
        Ok(entries)
    }

    /// Remove an index and its configuration
    pub fn drop_index(&self, scope: &mut WriteScope<'_>, name: &str) -> Result<()> {
        let mut state = self.state.write();
        let index = state.indexes.remove(name).ok_or_else(|| Error::NoSuchIndex {
            table: self.name.clone(),
            index: name.to_string(),
        })?;
        scope.mark_schema_dirty();

        let row = index.config().keyspace_name();
        index.drop(scope.txn_mut())?;
        scope.delete_meta(&row)?;
        scope.journal(JournalKind::Drop, &self.name, json!({ "index": name }))?;
        info!(table = %self.name, index = name, "Dropped index");
        Ok(())
    }

    /// Remove every document, keeping indexes defined
    pub fn empty(&self, scope: &mut WriteScope<'_>) -> Result<()> {
        let state = self.state.read();
        let Some(primary) = &state.primary else {
            return Ok(());
        };
        scope.txn_mut().drop_keyspace(primary, false)?;
        for index in state.indexes.values() {
            index.empty(scope.txn_mut())?;
        }
        scope.journal(JournalKind::Empty, &self.name, json!({}))?;
        info!(table = %self.name, "Emptied table");
        Ok(())
    }

    /// Re-encode every document with `compression` and persist the new
    /// setting
    pub fn recompress(&self, scope: &mut WriteScope<'_>, compression: Compression) -> Result<CompressionStats> {
        self.create_if_missing(scope)?;
        let mut state = self.state.write();
        let primary = state
            .primary
            .clone()
            .ok_or_else(|| Error::Internal(format!("Table {} has no keyspace", self.name)))?;

        let mut target = state.settings.clone();
        target.compression = compression;
        let entries = entries(scope.kv(), &primary)?;

        let (mut before, mut after) = (0usize, 0usize);
        for (key, value) in &entries {
            let content = state.settings.decode(value)?;
            let encoded = target.encode(&content)?;
            before += value.len();
            after += encoded.len();
            scope.txn_mut().put(&primary, key, &encoded, PutFlags::default())?;
        }

        scope.put_meta(&settings_key(&self.name), &target)?;
        scope.mark_schema_dirty();
        state.settings = target;

        let stats = CompressionStats::new(before, after);
        info!(
            table = %self.name,
            algorithm = compression.name(),
            documents = entries.len(),
            before,
            after,
            saved = %format!("{:.1}%", stats.space_saved_percent()),
            "Recompressed table"
        );
        Ok(stats)
    }

    /// Remove the table's keyspaces and metadata rows
    pub(crate) fn destroy(&self, scope: &mut WriteScope<'_>) -> Result<()> {
        let mut state = self.state.write();
        scope.mark_schema_dirty();

        for (_, index) in std::mem::take(&mut state.indexes) {
            let row = index.config().keyspace_name();
            index.drop(scope.txn_mut())?;
            scope.delete_meta(&row)?;
        }
        if let Some(primary) = state.primary.take() {
            scope.txn_mut().drop_keyspace(&primary, true)?;
        }
        scope.delete_meta(&settings_key(&self.name))?;
        scope.journal(JournalKind::Remove, &self.name, json!({}))?;
        state.persisted = false;

        info!(table = %self.name, "Dropped table");
        Ok(())
    }
}
