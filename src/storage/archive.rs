//! # Secure Archive
//!
//! File-backed store with three sections: `config/` for YAML configs,
//! `certs/` for the trust bundle and key material, and `state/` for JSON
//! blobs (`jwt_blacklist.json`, `gossip_state.json`, `services_state.json`).
//!
//! The archive is single-writer. State blobs are staged in memory and
//! flushed by an autosave task when dirty; every write goes through a
//! temp-file rename so a crash never leaves a half-written blob. Each blob
//! carries a `last_saved` timestamp.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Opaque key/value archive with an autosave lifecycle.
pub struct SecureArchive {
    root: PathBuf,
    state: Mutex<ArchiveState>,
}

struct ArchiveState {
    blobs: HashMap<String, Value>,
    dirty: HashSet<String>,
}

impl SecureArchive {
    /// Open (or create) an archive rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for section in ["config", "certs", "state"] {
            fs::create_dir_all(root.join(section))
                .with_context(|| format!("creating archive section {section}"))?;
        }

        Ok(Self {
            root,
            state: Mutex::new(ArchiveState {
                blobs: HashMap::new(),
                dirty: HashSet::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.root.join("state").join(format!("{name}.json"))
    }

    /// Load a state blob, preferring the staged in-memory copy.
    pub fn load_state(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.state.lock().blobs.get(name) {
            return Some(value.clone());
        }

        let path = self.state_path(name);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => {
                self.state.lock().blobs.insert(name.to_string(), value.clone());
                Some(value)
            }
            Err(err) => {
                error!("Failed to parse archive blob {}: {}", path.display(), err);
                None
            }
        }
    }

    /// Stage a state blob for the next flush.
    pub fn put_state(&self, name: &str, value: Value) {
        let mut state = self.state.lock();
        state.blobs.insert(name.to_string(), value);
        state.dirty.insert(name.to_string());
    }

    /// Write every dirty blob to disk atomically.
    pub fn flush(&self) -> Result<()> {
        let pending: Vec<(String, Value)> = {
            let mut state = self.state.lock();
            let dirty: Vec<String> = state.dirty.drain().collect();
            dirty
                .into_iter()
                .filter_map(|name| state.blobs.get(&name).cloned().map(|v| (name, v)))
                .collect()
        };

        for (name, mut value) in pending {
            if let Value::Object(ref mut map) = value {
                map.insert(
                    "last_saved".to_string(),
                    Value::from(chrono::Utc::now().timestamp()),
                );
            }
            self.write_atomic(&self.state_path(&name), &value)
                .with_context(|| format!("flushing archive blob {name}"))?;
            debug!("Flushed archive blob: {}", name);
        }

        Ok(())
    }

    fn write_atomic(&self, path: &Path, value: &Value) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let serialized = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read raw key material from `certs/`.
    pub fn read_cert(&self, name: &str) -> Option<Vec<u8>> {
        fs::read(self.root.join("certs").join(name)).ok()
    }

    /// Write raw key material into `certs/`.
    pub fn write_cert(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.root.join("certs").join(name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Spawn the autosave task. Flushes when dirty, and once more on
    /// cancellation so shutdown never loses staged state.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        interval_secs: u64,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let archive = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = archive.flush() {
                            error!("Archive autosave failed: {}", err);
                        }
                    }
                    _ = cancel.cancelled() => {
                        if let Err(err) = archive.flush() {
                            error!("Final archive flush failed: {}", err);
                        }
                        info!("Archive autosave stopped");
                        break;
                    }
                }
            }
        })
    }
}
