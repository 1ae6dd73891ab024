//! Persistence adapters for document states.
//!
//! The hub hands whole state trees to an adapter, keyed by their `_id`.
//! Adapters never see deltas; a document is written when it goes dirty and
//! the persistence job runs, or when its last participant closes it.

use crate::error::PersistenceError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use syncbus_store::state::id_of;
use syncbus_store::StateTree;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Storage backend for document states.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Load the state stored under `id`.
    async fn get(&self, id: &str) -> Result<StateTree>;

    /// Store `state` under its `_id`, replacing any previous version.
    async fn set(&self, state: StateTree) -> Result<StateTree>;

    async fn has(&self, id: &str) -> Result<bool>;

    /// Remove the state stored under `id`. Returns false if there was none.
    async fn delete(&self, id: &str) -> Result<bool>;
}

fn require_id(state: &StateTree) -> Result<String> {
    id_of(state)
        .map(str::to_string)
        .ok_or(PersistenceError::MissingId)
}

// ============================================================================
// Memory
// ============================================================================

/// Keeps serialized states in a map.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    storage: RwLock<HashMap<String, String>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.storage.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.read().is_empty()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn get(&self, id: &str) -> Result<StateTree> {
        let json = self
            .storage
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn set(&self, state: StateTree) -> Result<StateTree> {
        let id = require_id(&state)?;
        let json = serde_json::to_string(&state)?;
        self.storage.write().insert(id, json);
        Ok(state)
    }

    async fn has(&self, id: &str) -> Result<bool> {
        Ok(self.storage.read().contains_key(id))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.storage.write().remove(id).is_some())
    }
}

// ============================================================================
// Null
// ============================================================================

/// Stores nothing and knows nothing. Used by pure clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAdapter;

#[async_trait]
impl PersistenceAdapter for NullAdapter {
    async fn get(&self, id: &str) -> Result<StateTree> {
        Err(PersistenceError::NotFound(id.to_string()))
    }

    async fn set(&self, state: StateTree) -> Result<StateTree> {
        Ok(state)
    }

    async fn has(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn delete(&self, _id: &str) -> Result<bool> {
        Ok(true)
    }
}

// ============================================================================
// File
// ============================================================================

/// One JSON file per document in a directory.
///
/// Writes go to a temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileAdapter {
    dir: PathBuf,
}

impl FileAdapter {
    /// Use `dir`, creating it if missing.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "file persistence ready");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: &str) -> PathBuf {
        let name: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl PersistenceAdapter for FileAdapter {
    async fn get(&self, id: &str) -> Result<StateTree> {
        let bytes = match fs::read(self.path_of(id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn set(&self, state: StateTree) -> Result<StateTree> {
        let id = require_id(&state)?;
        let path = self.path_of(&id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&state)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(state)
    }

    async fn has(&self, id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_of(id)).await?)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        match fs::remove_file(self.path_of(id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
