//! Credential source for the persistent connection.
//!
//! The application keeps its session in a key-value store; the socket client
//! only needs three values from it, read fresh on every connect attempt.

use crate::core::{NetError, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub const TOKEN_KEY: &str = "token";
pub const TENANT_KEY: &str = "tenant-id";
pub const STORE_KEY: &str = "store-id";

pub const REQUIRED_KEYS: [&str; 3] = [TOKEN_KEY, TENANT_KEY, STORE_KEY];

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Handshake headers built from the stored session.
///
/// Empty values count as missing. Fails with [`NetError::AuthMissing`]
/// naming every absent key.
pub fn connection_headers(store: &dyn KeyValueStore) -> Result<Vec<(String, String)>> {
    let mut values = Vec::with_capacity(REQUIRED_KEYS.len());
    let mut missing = Vec::new();
    for key in REQUIRED_KEYS {
        match store.get(key)?.filter(|value| !value.is_empty()) {
            Some(value) => values.push(value),
            None => missing.push(key.to_string()),
        }
    }
    if !missing.is_empty() {
        return Err(NetError::AuthMissing(missing));
    }

    Ok(vec![
        ("Authorization".to_string(), format!("Bearer {}", values[0])),
        (TENANT_KEY.to_string(), values[1].clone()),
        (STORE_KEY.to_string(), values[2].clone()),
    ])
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(token: &str, tenant_id: &str, store_id: &str) -> Self {
        let store = Self::new();
        if let Ok(mut values) = store.values.write() {
            values.insert(TOKEN_KEY.to_string(), token.to_string());
            values.insert(TENANT_KEY.to_string(), tenant_id.to_string());
            values.insert(STORE_KEY.to_string(), store_id.to_string());
        }
        store
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.write()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.write()?.remove(key);
        Ok(())
    }
}

/// Store persisted as a flat JSON object, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file starts out empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|err| {
                NetError::Io(format!("Failed to read store '{}': {}", path.display(), err))
            })?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let bytes = serde_json::to_vec_pretty(values)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|err| NetError::Io(format!("Failed to persist '{}': {}", self.path.display(), err)))?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write()?;
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.write()?;
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}
