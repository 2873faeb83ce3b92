//! On-disk state: one directory per container under `{root}/pods/`.
//!
//! ```text
//! {root}/pods/{containerId}/metadata.json   pod record, 0600
//! {root}/pods/{containerId}/engine.state    engine identity (FileStore)
//! ```
//!
//! A crash between directory creation and the first metadata write leaves a
//! directory with no readable record; recovery treats that the same as a
//! never-created pod and orphan-cleans it.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted record of a managed pod. Field names are the on-disk contract;
/// existing state directories must stay readable across daemon upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    pub container_id: String,
    pub pod_name: String,
    pub namespace: String,
    pub hostname: String,
    pub overlay_ipv4: String,
    #[serde(default)]
    pub overlay_ipv6: String,
    pub created_at: DateTime<Utc>,
    pub netns_path: String,
    pub host_veth_name: String,
    #[serde(default)]
    pub cluster_ip: String,
}

#[derive(Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pods_dir(&self) -> PathBuf {
        self.root.join("pods")
    }

    pub fn pod_dir(&self, container_id: &str) -> PathBuf {
        self.pods_dir().join(container_id)
    }

    pub fn metadata(&self, container_id: &str) -> PathBuf {
        self.pod_dir(container_id).join("metadata.json")
    }

    pub fn engine_state(&self, container_id: &str) -> PathBuf {
        self.pod_dir(container_id).join("engine.state")
    }

    /// Create the per-container directory, owner-only.
    pub fn ensure_pod_dir(&self, container_id: &str) -> io::Result<PathBuf> {
        let dir = self.pod_dir(container_id);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)?;
        Ok(dir)
    }

    /// Write the pod record, pretty-printed, owner-only.
    pub fn save_record(&self, record: &PodRecord) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(self.metadata(&record.container_id))?;
        io::Write::write_all(&mut file, &data)
    }

    pub fn load_record(&self, container_id: &str) -> io::Result<PodRecord> {
        let data = fs::read(self.metadata(container_id))?;
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Remove the whole per-container directory. Absence is success.
    pub fn remove_pod_dir(&self, container_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.pod_dir(container_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Container ids with a state directory, in no particular order.
    pub fn list_pods(&self) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(self.pods_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    ids.push(name);
                }
            }
        }
        Ok(ids)
    }

    pub fn engine_state_exists(&self, container_id: &str) -> bool {
        self.engine_state(container_id).exists()
    }
}
