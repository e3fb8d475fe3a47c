//! Database configuration
//!
//! Loaded from TOML, then overridden by `PHOTONLITE_*` environment
//! variables:
//!
//! ```toml
//! replication = true
//! compression = { algorithm = "zstd", level = 3 }
//! codec = "msgpack"
//!
//! [storage]
//! map_size = 67108864
//! sync = false
//! ```

use crate::codec::Codec;
use crate::compression::Compression;
use crate::document::KeyMode;
use crate::error::{Error, Result};
use crate::storage::{EnvConfig, MIN_MAP_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "PHOTONLITE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Storage environment tuning
    pub storage: EnvConfig,
    /// Produce the replication journal
    pub replication: bool,
    /// Compression for tables that don't ask for one
    pub compression: Compression,
    /// Codec for new tables
    pub codec: Codec,
    /// Oid generation for new tables
    pub key_mode: KeyMode,
    /// Compact the database file when closing
    pub compact_on_close: bool,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_key_mode(value: &str) -> Option<KeyMode> {
    match value.to_ascii_lowercase().as_str() {
        "integer" | "int" => Some(KeyMode::Integer),
        "uuid" => Some(KeyMode::Uuid),
        _ => None,
    }
}

fn set<T>(target: &mut T, var: &str, raw: Option<String>, parse: impl Fn(&str) -> Option<T>) {
    if let Some(raw) = raw {
        match parse(&raw) {
            Some(value) => *target = value,
            None => warn!(var, value = %raw, "Ignoring invalid environment override"),
        }
    }
}

impl DatabaseConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Read a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))
    }

    /// File (when given) then environment overrides, validated
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `PHOTONLITE_*` overrides from `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |suffix: &str| {
            let name = format!("{}{}", ENV_PREFIX, suffix);
            (lookup(&name), name)
        };

        let (raw, name) = var("MAP_SIZE");
        set(&mut self.storage.map_size, &name, raw, |v| v.parse().ok());
        let (raw, name) = var("MAX_DBS");
        set(&mut self.storage.max_dbs, &name, raw, |v| v.parse().ok());
        let (raw, name) = var("MAX_READERS");
        set(&mut self.storage.max_readers, &name, raw, |v| v.parse().ok());
        let (raw, name) = var("SYNC");
        set(&mut self.storage.sync, &name, raw, parse_bool);
        let (raw, name) = var("MAP_ASYNC");
        set(&mut self.storage.map_async, &name, raw, parse_bool);
        let (raw, name) = var("WRITEMAP");
        set(&mut self.storage.writemap, &name, raw, parse_bool);
        let (raw, name) = var("REPLICATION");
        set(&mut self.replication, &name, raw, parse_bool);
        let (raw, name) = var("COMPRESSION");
        set(&mut self.compression, &name, raw, |v| Compression::from_str(v).ok());
        let (raw, name) = var("CODEC");
        set(&mut self.codec, &name, raw, |v| Codec::from_str(v).ok());
        let (raw, name) = var("KEY_MODE");
        set(&mut self.key_mode, &name, raw, parse_key_mode);
        let (raw, name) = var("COMPACT_ON_CLOSE");
        set(&mut self.compact_on_close, &name, raw, parse_bool);
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.map_size < MIN_MAP_SIZE {
            return Err(Error::InvalidArgument(format!(
                "map_size {} is below the minimum of {} bytes",
                self.storage.map_size, MIN_MAP_SIZE
            )));
        }
        if self.storage.max_dbs < 3 {
            return Err(Error::Config(
                "max_dbs must leave room for the metadata and journal keyspaces".to_string(),
            ));
        }
        if let Compression::Zstd { level } = self.compression {
            if !(1..=22).contains(&level) {
                return Err(Error::Config(format!("zstd level {} out of range 1-22", level)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_toml_with_defaults() -> Result<()> {
        let config = DatabaseConfig::from_toml(
            r#"
            replication = true
            codec = "msgpack"
            compression = { algorithm = "lz4" }

            [storage]
            map_size = 1048576
            sync = false
            "#,
        )?;
        assert!(config.replication);
        assert_eq!(config.codec, Codec::MsgPack);
        assert_eq!(config.compression, Compression::Lz4);
        assert_eq!(config.storage.map_size, 1_048_576);
        assert!(!config.storage.sync);
        assert_eq!(config.storage.max_dbs, EnvConfig::default().max_dbs);
        assert_eq!(config.key_mode, KeyMode::Integer);
        Ok(())
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PHOTONLITE_MAP_SIZE", "2097152"),
            ("PHOTONLITE_REPLICATION", "yes"),
            ("PHOTONLITE_COMPRESSION", "zstd:7"),
            ("PHOTONLITE_KEY_MODE", "uuid"),
            ("PHOTONLITE_MAX_DBS", "many"),
        ]
        .into_iter()
        .collect();

        let mut config = DatabaseConfig::default();
        config.apply_env(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.storage.map_size, 2_097_152);
        assert!(config.replication);
        assert_eq!(config.compression, Compression::Zstd { level: 7 });
        assert_eq!(config.key_mode, KeyMode::Uuid);
        // invalid values leave the default in place
        assert_eq!(config.storage.max_dbs, EnvConfig::default().max_dbs);
    }

    #[test]
    fn test_validation() {
        let mut config = DatabaseConfig::default();
        assert!(config.validate().is_ok());
        config.storage.map_size = 1024;
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            DatabaseConfig::from_toml("replication = \"maybe\""),
            Err(Error::Config(_))
        ));
    }
}
