//! Schema rows in the `__metadata__` keyspace.
//!
//! - `@{table}` holds the table's `TableSettings`
//! - `_{table}_{index}` holds an `IndexConfig`

use crate::error::{Error, Result};
use crate::index::IndexConfig;
use crate::storage::{KeyspaceHandle, KvRead, PutFlags, WriteTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Keyspace holding schema rows
pub const METADATA_KEYSPACE: &str = "__metadata__";

/// Longest table or index name
pub const MAX_NAME_LEN: usize = 128;

const SETTINGS_PREFIX: &str = "@";

pub fn settings_key(table: &str) -> String {
    format!("{}{}", SETTINGS_PREFIX, table)
}

/// Validate a user table or index name.
///
/// Names start with a letter and use ASCII alphanumerics, `_` or `-`.
/// Anything starting with `_` is reserved for the database itself.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument(format!("{} name cannot be empty", kind)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "{} name too long (max {} characters)",
            kind, MAX_NAME_LEN
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(Error::InvalidArgument(format!(
            "{} name '{}' must start with a letter",
            kind, name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::InvalidArgument(format!(
            "{} name '{}' can only contain alphanumeric characters, underscores, and hyphens",
            kind, name
        )));
    }
    Ok(())
}

pub fn get<T: DeserializeOwned>(
    kv: &dyn KvRead,
    handle: &KeyspaceHandle,
    key: &str,
) -> Result<Option<T>> {
    kv.get(handle, key.as_bytes())?
        .map(|bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Corruption(format!("Invalid metadata row {}: {}", key, e)))
        })
        .transpose()
}

pub fn put<T: Serialize>(
    txn: &mut WriteTxn<'_>,
    handle: &KeyspaceHandle,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Error::Serialization(format!("Failed to encode metadata {}: {}", key, e)))?;
    txn.put(handle, key.as_bytes(), &bytes, PutFlags::default())?;
    Ok(())
}

pub fn delete(txn: &mut WriteTxn<'_>, handle: &KeyspaceHandle, key: &str) -> Result<bool> {
    txn.delete(handle, key.as_bytes(), None)
}

/// Names of every table with a settings row, sorted
pub fn table_names(kv: &dyn KvRead, handle: &KeyspaceHandle) -> Result<Vec<String>> {
    let mut cursor = kv.cursor(handle)?;
    let mut names = Vec::new();
    let mut entry = cursor.set_range(SETTINGS_PREFIX.as_bytes())?;
    while let Some((key, _)) = entry {
        let Some(name) = key.strip_prefix(SETTINGS_PREFIX.as_bytes()) else {
            break;
        };
        names.push(String::from_utf8_lossy(name).into_owned());
        entry = cursor.next()?;
    }
    Ok(names)
}

/// Index configurations of one table, in index-name order
pub fn index_configs(
    kv: &dyn KvRead,
    handle: &KeyspaceHandle,
    table: &str,
) -> Result<Vec<IndexConfig>> {
    let prefix = format!("_{}_", table);
    let mut cursor = kv.cursor(handle)?;
    let mut configs = Vec::new();
    let mut entry = cursor.set_range(prefix.as_bytes())?;
    while let Some((key, value)) = entry {
        if !key.starts_with(prefix.as_bytes()) {
            break;
        }
        let config: IndexConfig = serde_json::from_slice(&value).map_err(|e| {
            Error::Corruption(format!(
                "Invalid index row {}: {}",
                String::from_utf8_lossy(&key),
                e
            ))
        })?;
        // `_{table}_{index}` prefixes overlap when names contain '_'
        if config.table == table {
            configs.push(config);
        }
        entry = cursor.next()?;
    }
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyfn::KeySpec;
    use crate::storage::{EnvConfig, Environment};

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Table", "people").is_ok());
        assert!(validate_name("Table", "people_2024-v2").is_ok());
        assert!(validate_name("Table", "").is_err());
        assert!(validate_name("Table", "_hidden").is_err());
        assert!(validate_name("Table", "2fast").is_err());
        assert!(validate_name("Table", "has space").is_err());
        assert!(validate_name("Table", &"a".repeat(129)).is_err());
    }

    #[test]
    fn test_rows_are_listed_per_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Environment::open(dir.path(), EnvConfig::default())?;
        let mut txn = env.begin_write()?;
        let meta = txn.open_keyspace(METADATA_KEYSPACE, false)?;

        put(&mut txn, &meta, &settings_key("a"), &serde_json::json!({}))?;
        put(&mut txn, &meta, &settings_key("a_b"), &serde_json::json!({}))?;
        let spec = KeySpec::from("{x}");
        for config in [
            IndexConfig::new("a", "b_c", &spec, false, false),
            IndexConfig::new("a_b", "d", &spec, false, false),
            IndexConfig::new("a", "z", &spec, true, false),
        ] {
            put(&mut txn, &meta, &config.keyspace_name(), &config)?;
        }

        assert_eq!(table_names(&txn, &meta)?, vec!["a", "a_b"]);
        let names: Vec<String> = index_configs(&txn, &meta, "a")?
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["b_c", "z"]);
        assert_eq!(index_configs(&txn, &meta, "a_b")?.len(), 1);

        assert!(delete(&mut txn, &meta, &settings_key("a"))?);
        let settings: Option<serde_json::Value> = get(&txn, &meta, &settings_key("a"))?;
        assert!(settings.is_none());
        Ok(())
    }
}
