//! Persistence of the set of active plugin ids.
//!
//! The active set survives restarts and is the ground truth for discovery:
//! a plugin is activated at startup only if its id is in the set.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;

use crate::{PluginError, Result};

/// Store for the active plugin ids. Ids are kept in insertion order without
/// duplicates.
#[async_trait]
pub trait ActiveSetStore: Send + Sync {
    async fn get_active_plugin_ids(&self) -> Result<Vec<String>>;

    async fn set_active_plugin_ids(&self, ids: &[String]) -> Result<()>;
}

/// Remove duplicates, keeping the first occurrence.
pub fn dedup_ids(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

/// Active set persisted as a JSON array.
pub struct FileActiveSetStore {
    path: PathBuf,
    initial: Vec<String>,
}

impl FileActiveSetStore {
    /// `initial` is returned while nothing has been persisted yet.
    pub fn new(path: impl Into<PathBuf>, initial: Vec<String>) -> Self {
        Self {
            path: path.into(),
            initial: dedup_ids(&initial),
        }
    }
}

#[async_trait]
impl ActiveSetStore for FileActiveSetStore {
    async fn get_active_plugin_ids(&self) -> Result<Vec<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(self.initial.clone());
            }
            Err(e) => return Err(e.into()),
        };

        let ids: Vec<String> = serde_json::from_str(&content).map_err(|e| {
            PluginError::SerializationError(format!(
                "Invalid active plugins file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(dedup_ids(&ids))
    }

    async fn set_active_plugin_ids(&self, ids: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&dedup_ids(ids))?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

/// In-memory active set.
#[derive(Default)]
pub struct MemoryActiveSetStore {
    ids: Mutex<Vec<String>>,
}

impl MemoryActiveSetStore {
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            ids: Mutex::new(dedup_ids(&ids)),
        }
    }
}

#[async_trait]
impl ActiveSetStore for MemoryActiveSetStore {
    async fn get_active_plugin_ids(&self) -> Result<Vec<String>> {
        Ok(self.ids.lock().clone())
    }

    async fn set_active_plugin_ids(&self, ids: &[String]) -> Result<()> {
        *self.ids.lock() = dedup_ids(ids);
        Ok(())
    }
}
