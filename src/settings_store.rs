use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Desired lock state of the monitored services.
pub const LOCKED_SETTING: &str = "Locked";
/// Allow a periodic unlock so that signature updates can run.
pub const ALLOW_DEFENDER_SETTING: &str = "AllowDefender";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("settings file {path} does not hold a key-value object")]
    NotAnObject { path: PathBuf },
}

/// Durable key-value store for user preferences.
///
/// Values are read fresh from the backing store on every call so that edits
/// made by another process are seen on the next tick.
pub trait SettingsStore: Send + Sync {
    /// Read a boolean, returning `default` when the key is absent.
    fn get_bool(&self, key: &str, default: bool) -> Result<bool, SettingsError>;
    fn set_bool(&self, key: &str, value: bool) -> Result<(), SettingsError>;
    fn is_value_set(&self, key: &str) -> bool;
    /// Keepalive invoked once per tick; refreshes whatever handle the store
    /// keeps on its backing storage.
    fn renew_key(&self) -> Result<(), SettingsError>;
}

/// Settings persisted as a flat JSON object.
pub struct JsonSettingsStore {
    path: PathBuf,
    // Serializes read-modify-write cycles from this process.
    write_lock: Mutex<()>,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<Map<String, Value>, SettingsError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        let value: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(SettingsError::NotAnObject {
                path: self.path.clone(),
            }),
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let json = serde_json::to_string_pretty(map).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })?;
        // Write then rename so a concurrent reader never sees a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}

impl SettingsStore for JsonSettingsStore {
    fn get_bool(&self, key: &str, default: bool) -> Result<bool, SettingsError> {
        let map = self.read_map()?;
        Ok(map.get(key).and_then(value_as_bool).unwrap_or(default))
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read_map()?;
        map.insert(key.to_string(), Value::Bool(value));
        self.write_map(&map)
    }

    fn is_value_set(&self, key: &str) -> bool {
        match self.read_map() {
            Ok(map) => map.get(key).and_then(value_as_bool).is_some(),
            Err(err) => {
                tracing::warn!("(from is_value_set) {err}");
                false
            }
        }
    }

    fn renew_key(&self) -> Result<(), SettingsError> {
        // The file is reopened on every access; renewing only checks that it
        // is still readable.
        self.read_map().map(|_| ())
    }
}
