//! Key-value state file holding the node's persistent identity.
//!
//! One store per container, at `{pod state dir}/engine.state`. The file is a
//! flat JSON object; writes go through a temp file plus rename so a crash
//! mid-write leaves either the old state or the new state, never a torn file.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, Result};

/// Store key for the node's WireGuard private key (hex).
pub const KEY_NODE_KEY: &str = "node-key";
/// Store key for the persisted login profile (JSON).
pub const KEY_PROFILE: &str = "profile";

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, loading existing contents if present.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let map = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(EngineError::Store(e)),
        };
        Ok(Arc::new(Self {
            path,
            inner: Mutex::new(map),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    /// Set a key and persist the whole store.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(key.to_string(), value.to_string());
        self.persist(&map)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.remove(key).is_some() {
            self.persist(&map)?;
        }
        Ok(())
    }

    fn persist(&self, map: &HashMap<String, String>) -> Result<()> {
        let data = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)
                .map_err(EngineError::Store)?;
            file.write_all(&data).map_err(EngineError::Store)?;
            file.sync_all().map_err(EngineError::Store)?;
        }
        fs::rename(&tmp, &self.path).map_err(EngineError::Store)?;
        Ok(())
    }
}
