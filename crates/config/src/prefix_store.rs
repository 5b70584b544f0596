//! Durable storage of approved command prefixes in `config.toml`.
//!
//! Writes go through the raw TOML table so unrelated keys and sections the
//! user wrote by hand survive the round-trip.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustedloop_core::PrefixStore;
use tracing::{debug, info};

use crate::{AppConfig, ConfigError};

const SECTION: &str = "authorization";
const KEY: &str = "allowed_prefixes";

/// [`PrefixStore`] backed by the `[authorization]` section of a config file.
#[derive(Debug)]
pub struct TomlPrefixStore {
    path: PathBuf,
    known: Mutex<BTreeSet<String>>,
}

impl TomlPrefixStore {
    /// Open the store, reading the prefixes already in `path` (if it exists).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = AppConfig::load_from(&path)?;
        Ok(Self {
            known: Mutex::new(config.authorization.allowed_prefixes.into_iter().collect()),
            path,
        })
    }

    /// Open the store at the default config path.
    pub fn open_default() -> Result<Self, ConfigError> {
        Self::open(AppConfig::config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> Result<toml::Table, ConfigError> {
        if !self.path.exists() {
            return Ok(toml::Table::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::ReadError {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        content.parse::<toml::Table>().map_err(|e| ConfigError::ParseError {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn write_prefix(&self, prefix: &str) -> Result<(), ConfigError> {
        let mut table = self.read_table()?;

        let section = table
            .entry(SECTION)
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        let toml::Value::Table(section) = section else {
            return Err(ConfigError::ValidationError(format!(
                "[{SECTION}] in {} is not a table",
                self.path.display()
            )));
        };

        let list = section
            .entry(KEY)
            .or_insert_with(|| toml::Value::Array(Vec::new()));
        let toml::Value::Array(list) = list else {
            return Err(ConfigError::ValidationError(format!(
                "{SECTION}.{KEY} in {} is not an array",
                self.path.display()
            )));
        };

        if !list.iter().any(|v| v.as_str() == Some(prefix)) {
            list.push(toml::Value::String(prefix.to_string()));
        }

        let rendered = toml::to_string_pretty(&table).map_err(|e| ConfigError::WriteError {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        }

        std::fs::write(&self.path, rendered).map_err(|e| ConfigError::WriteError {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

impl PrefixStore for TomlPrefixStore {
    fn contains(&self, prefix: &str) -> bool {
        self.known
            .lock()
            .map(|known| known.contains(prefix))
            .unwrap_or(false)
    }

    fn persist(&self, prefix: &str) -> rustedloop_core::Result<()> {
        let mut known = self
            .known
            .lock()
            .map_err(|_| rustedloop_core::Error::Internal("prefix store lock poisoned".into()))?;

        if known.contains(prefix) {
            debug!(prefix, "Prefix already persisted");
            return Ok(());
        }

        self.write_prefix(prefix)?;
        known.insert(prefix.to_string());
        info!(prefix, path = %self.path.display(), "Persisted authorized prefix");
        Ok(())
    }
}
