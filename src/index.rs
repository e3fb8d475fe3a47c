//! Secondary indexes.
//!
//! An index is a keyspace named `_{table}_{index}` mapping derived keys to
//! oids. Unique indexes hold one oid per key; duplicate-permitting indexes
//! are duplicate-sorted keyspaces holding every oid under a key in oid
//! order. A document whose key function yields nothing is simply not a
//! member of the index.

use crate::datum::Datum;
use crate::document::Oid;
use crate::error::{Error, Result};
use crate::keyfn::{KeyFunction, KeySpec, KeyTemplate};
use crate::registry::KeyFnRegistry;
use crate::storage::{Environment, KeyspaceHandle, KvRead, PutFlags, WriteTxn, MAX_KEY_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Fail with `KeyTooLarge` for a derived key the storage layer would reject
pub(crate) fn check_key_size(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_SIZE,
        });
    }
    Ok(())
}

/// Persisted index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub table: String,
    pub name: String,
    /// Template source, for template indexes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Registered function name, for native indexes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    /// Several oids may share a key
    pub dupsort: bool,
    /// A unique key taken by another oid is reassigned instead of rejected
    #[serde(default)]
    pub overwrite: bool,
}

impl IndexConfig {
    pub fn new(table: &str, name: &str, spec: &KeySpec, dupsort: bool, overwrite: bool) -> Self {
        let (key, func) = match spec {
            KeySpec::Template(source) => (Some(source.clone()), None),
            KeySpec::Native(name) => (None, Some(name.clone())),
        };
        Self {
            table: table.to_string(),
            name: name.to_string(),
            key,
            func,
            dupsort,
            overwrite,
        }
    }

    /// Keyspace (and metadata row) name
    pub fn keyspace_name(&self) -> String {
        Index::keyspace_name(&self.table, &self.name)
    }

    pub(crate) fn duplicate_key(&self, key: &[u8]) -> Error {
        Error::DuplicateKey {
            index: format!("{}.{}", self.table, self.name),
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }

    /// Compile or look up the key function
    pub fn resolve(&self, registry: &KeyFnRegistry) -> Result<KeyFunction> {
        match (&self.func, &self.key) {
            (Some(name), _) => Ok(KeyFunction::Native {
                name: name.clone(),
                func: registry.get(name)?,
            }),
            (None, Some(source)) => Ok(KeyFunction::Template(KeyTemplate::parse(source)?)),
            (None, None) => Err(Error::InvalidKeyFunction(format!(
                "Index {}.{} has neither a template nor a function",
                self.table, self.name
            ))),
        }
    }
}

/// An open index
#[derive(Debug, Clone)]
pub struct Index {
    config: IndexConfig,
    key_fn: KeyFunction,
    handle: KeyspaceHandle,
}

impl Index {
    pub fn keyspace_name(table: &str, index: &str) -> String {
        format!("_{}_{}", table, index)
    }

    /// Open the index keyspace, creating it when absent
    pub(crate) fn create(
        txn: &mut WriteTxn<'_>,
        config: IndexConfig,
        registry: &KeyFnRegistry,
    ) -> Result<Self> {
        let key_fn = config.resolve(registry)?;
        let handle = txn.open_keyspace(&config.keyspace_name(), config.dupsort)?;
        Ok(Self {
            config,
            key_fn,
            handle,
        })
    }

    /// Attach to the index as seen by `kv`. A keyspace missing from that
    /// view gets a handle that reads as empty.
    pub(crate) fn attach(
        kv: &dyn KvRead,
        env: &Environment,
        config: IndexConfig,
        registry: &KeyFnRegistry,
    ) -> Result<Self> {
        let key_fn = config.resolve(registry)?;
        let name = config.keyspace_name();
        let handle = match kv.find_keyspace(&name)? {
            Some(handle) => handle,
            None => env.handle(&name, config.dupsort)?,
        };
        Ok(Self {
            config,
            key_fn,
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn handle(&self) -> &KeyspaceHandle {
        &self.handle
    }

    pub fn key_function(&self) -> &KeyFunction {
        &self.key_fn
    }

    pub fn is_unique(&self) -> bool {
        !self.config.dupsort
    }

    /// Keys the document contributes to this index
    pub fn keys_for(&self, doc: &Datum) -> Vec<Vec<u8>> {
        self.key_fn.keys(doc)
    }

    /// Fail if storing `doc` under `oid` would: `KeyTooLarge` for an
    /// oversized key, `DuplicateKey` for a unique key held by another
    /// document. Writes nothing.
    pub fn check_keys(&self, kv: &dyn KvRead, oid: Oid, doc: &Datum) -> Result<()> {
        let keys = self.keys_for(doc);
        for key in &keys {
            check_key_size(key)?;
        }
        if !self.is_unique() || self.config.overwrite {
            return Ok(());
        }
        let oid_bytes = oid.to_bytes();
        for key in &keys {
            if let Some(holder) = kv.get(&self.handle, key)? {
                if holder != oid_bytes {
                    return Err(self.config.duplicate_key(key));
                }
            }
        }
        Ok(())
    }

    /// Add the document's keys
    pub fn put(&self, txn: &mut WriteTxn<'_>, oid: Oid, doc: &Datum) -> Result<()> {
        let keys = self.keys_for(doc);
        self.put_keys(txn, oid, &keys)
    }

    fn put_keys(&self, txn: &mut WriteTxn<'_>, oid: Oid, keys: &[Vec<u8>]) -> Result<()> {
        let oid_bytes = oid.to_bytes();
        for key in keys {
            if self.is_unique() && !self.config.overwrite {
                if let Some(holder) = txn.get(&self.handle, key)? {
                    if holder != oid_bytes {
                        return Err(self.config.duplicate_key(key));
                    }
                    continue;
                }
            }
            txn.put(&self.handle, key, &oid_bytes, PutFlags::default())?;
        }
        Ok(())
    }

    /// Move the document from its old keys to its new keys. Returns false,
    /// having written nothing, when the keys are unchanged.
    pub fn save(&self, txn: &mut WriteTxn<'_>, oid: Oid, old: &Datum, new: &Datum) -> Result<bool> {
        let old_keys: BTreeSet<Vec<u8>> = self.keys_for(old).into_iter().collect();
        let new_keys: BTreeSet<Vec<u8>> = self.keys_for(new).into_iter().collect();
        if old_keys == new_keys {
            return Ok(false);
        }

        let oid_bytes = oid.to_bytes();
        for stale in old_keys.difference(&new_keys) {
            txn.delete(&self.handle, stale, Some(&oid_bytes))?;
        }
        let added: Vec<Vec<u8>> = new_keys.difference(&old_keys).cloned().collect();
        self.put_keys(txn, oid, &added)?;

        debug!(index = %self.config.name, %oid, "Updated index keys");
        Ok(true)
    }

    /// Remove every entry pointing at this document
    pub fn delete(&self, txn: &mut WriteTxn<'_>, oid: Oid, doc: &Datum) -> Result<()> {
        let oid_bytes = oid.to_bytes();
        for key in self.keys_for(doc) {
            txn.delete(&self.handle, &key, Some(&oid_bytes))?;
        }
        Ok(())
    }

    /// First oid stored under the key derived from `template`
    pub fn get(&self, kv: &dyn KvRead, template: &Datum) -> Result<Option<Oid>> {
        let Some(key) = self.key_fn.key(template) else {
            return Ok(None);
        };
        kv.get(&self.handle, &key)?
            .map(|bytes| Oid::from_bytes(&bytes))
            .transpose()
    }

    /// Number of entries
    pub fn count(&self, kv: &dyn KvRead) -> Result<usize> {
        kv.count(&self.handle)
    }

    /// Remove every entry, keeping the keyspace
    pub fn empty(&self, txn: &mut WriteTxn<'_>) -> Result<()> {
        txn.drop_keyspace(&self.handle, false)
    }

    /// Remove the keyspace
    pub fn drop(self, txn: &mut WriteTxn<'_>) -> Result<()> {
        txn.drop_keyspace(&self.handle, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EnvConfig;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Datum {
        Datum::from(value)
    }

    fn setup(dupsort: bool, overwrite: bool) -> Result<(tempfile::TempDir, Environment, IndexConfig)> {
        let dir = tempfile::tempdir()?;
        let env = Environment::open(dir.path(), EnvConfig::default())?;
        let config = IndexConfig::new("people", "by_name", &KeySpec::from("{name}"), dupsort, overwrite);
        Ok((dir, env, config))
    }

    #[test]
    fn test_unique_index_rejects_second_oid() -> Result<()> {
        let (_dir, env, config) = setup(false, false)?;
        let registry = KeyFnRegistry::new();
        let mut txn = env.begin_write()?;
        let index = Index::create(&mut txn, config, &registry)?;

        index.put(&mut txn, Oid::Int(1), &doc(json!({"name": "Tom"})))?;
        // same oid again is fine
        index.put(&mut txn, Oid::Int(1), &doc(json!({"name": "Tom"})))?;
        let tom2 = doc(json!({"name": "Tom"}));
        assert!(matches!(
            index.check_keys(&txn, Oid::Int(2), &tom2),
            Err(Error::DuplicateKey { .. })
        ));
        assert!(matches!(
            index.put(&mut txn, Oid::Int(2), &tom2),
            Err(Error::DuplicateKey { .. })
        ));
        assert_eq!(index.get(&txn, &tom2)?, Some(Oid::Int(1)));
        Ok(())
    }

    #[test]
    fn test_overwrite_reassigns_key() -> Result<()> {
        let (_dir, env, config) = setup(false, true)?;
        let registry = KeyFnRegistry::new();
        let mut txn = env.begin_write()?;
        let index = Index::create(&mut txn, config, &registry)?;

        index.put(&mut txn, Oid::Int(1), &doc(json!({"name": "Tom"})))?;
        index.put(&mut txn, Oid::Int(2), &doc(json!({"name": "Tom"})))?;
        assert_eq!(index.get(&txn, &doc(json!({"name": "Tom"})))?, Some(Oid::Int(2)));
        assert_eq!(index.count(&txn)?, 1);
        Ok(())
    }

    #[test]
    fn test_duplicates_and_save() -> Result<()> {
        let (_dir, env, config) = setup(true, false)?;
        let registry = KeyFnRegistry::new();
        let mut txn = env.begin_write()?;
        let index = Index::create(&mut txn, config, &registry)?;

        let tom = doc(json!({"name": "Tom"}));
        index.put(&mut txn, Oid::Int(2), &tom)?;
        index.put(&mut txn, Oid::Int(1), &tom)?;
        assert_eq!(index.count(&txn)?, 2);
        assert_eq!(index.get(&txn, &tom)?, Some(Oid::Int(1)));

        let renamed = doc(json!({"name": "Tim"}));
        assert!(index.save(&mut txn, Oid::Int(2), &tom, &renamed)?);
        assert_eq!(index.get(&txn, &renamed)?, Some(Oid::Int(2)));
        assert_eq!(index.count(&txn)?, 2);

        // missing field: the document leaves the index
        assert!(index.save(&mut txn, Oid::Int(2), &renamed, &doc(json!({"age": 4})))?);
        assert_eq!(index.count(&txn)?, 1);

        index.delete(&mut txn, Oid::Int(1), &tom)?;
        assert_eq!(index.count(&txn)?, 0);
        Ok(())
    }

    #[test]
    fn test_check_keys_rejects_oversized_keys() -> Result<()> {
        let (_dir, env, config) = setup(true, false)?;
        let registry = KeyFnRegistry::new();
        let mut txn = env.begin_write()?;
        let index = Index::create(&mut txn, config, &registry)?;

        let long = doc(json!({"name": "x".repeat(600)}));
        assert!(matches!(
            index.check_keys(&txn, Oid::Int(1), &long),
            Err(Error::KeyTooLarge { size: 600, .. })
        ));
        index.check_keys(&txn, Oid::Int(1), &doc(json!({"name": "Tom"})))?;
        assert_eq!(index.count(&txn)?, 0);
        Ok(())
    }

    #[test]
    fn test_save_with_unchanged_keys_leaves_index_alone() -> Result<()> {
        let (_dir, env, config) = setup(false, false)?;
        let registry = KeyFnRegistry::new();
        let mut txn = env.begin_write()?;
        let index = Index::create(&mut txn, config, &registry)?;

        let tom = doc(json!({"name": "Tom", "age": 3}));
        index.put(&mut txn, Oid::Int(1), &tom)?;
        let used = txn.used();
        let older = doc(json!({"name": "Tom", "age": 4}));
        assert!(!index.save(&mut txn, Oid::Int(1), &tom, &older)?);
        assert_eq!(txn.used(), used);
        assert_eq!(index.get(&txn, &tom)?, Some(Oid::Int(1)));

        assert!(index.save(&mut txn, Oid::Int(1), &older, &doc(json!({"name": "Tim"})))?);
        assert_eq!(index.get(&txn, &tom)?, None);
        assert_eq!(index.count(&txn)?, 1);
        Ok(())
    }

    #[test]
    fn test_unregistered_native_function() {
        let config = IndexConfig::new("people", "custom", &KeySpec::native("nope"), false, false);
        assert!(matches!(
            config.resolve(&KeyFnRegistry::new()),
            Err(Error::UnknownKeyFunction(_))
        ));
    }

    #[test]
    fn test_config_round_trip_omits_unused_fields() -> Result<()> {
        let config = IndexConfig::new("people", "by_name", &KeySpec::from("{name}"), true, false);
        let json = serde_json::to_value(&config).map_err(|e| Error::Serialization(e.to_string()))?;
        assert_eq!(json["key"], "{name}");
        assert!(json.get("func").is_none());
        Ok(())
    }
}
