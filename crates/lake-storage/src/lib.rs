//! Tiered object storage for the lake: staging landing area + bronze history.

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lake-storage";

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Staging,
    Bronze,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Staging => "staging",
            Tier::Bronze => "bronze",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub path: String,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {tier}/{path}")]
    NotFound { tier: Tier, path: String },
    #[error("invalid object path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("{operation} {tier}/{path}: {source}")]
    Io {
        operation: &'static str,
        tier: Tier,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn io(operation: &'static str, tier: Tier, path: &str, source: std::io::Error) -> Self {
        StorageError::Io {
            operation,
            tier,
            path: path.to_string(),
            source,
        }
    }
}

/// Primitive operations the ingestion engine needs from object storage.
///
/// `put` replaces the whole object atomically: readers observe either the
/// previous content or the new content, never a partial write.
/// `delete` of a missing object succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, tier: Tier, prefix: &str) -> Result<Vec<String>, StorageError>;
    async fn get(&self, tier: Tier, path: &str) -> Result<Vec<u8>, StorageError>;
    async fn put(&self, tier: Tier, path: &str, bytes: &[u8]) -> Result<StoredObject, StorageError>;
    async fn delete(&self, tier: Tier, path: &str) -> Result<(), StorageError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn validate_path(path: &str) -> Result<(), StorageError> {
    let invalid = |reason| StorageError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if path.is_empty() || path.ends_with('/') {
        return Err(invalid("object paths must name a file"));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(invalid("object paths must be relative and normalized")),
        }
    }
    Ok(())
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Filesystem-backed store; each tier is a directory under `root`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tier_root(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.as_str())
    }

    fn resolve(&self, tier: Tier, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(self.tier_root(tier).join(path))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list(&self, tier: Tier, prefix: &str) -> Result<Vec<String>, StorageError> {
        let tier_root = self.tier_root(tier);
        let mut found = Vec::new();
        let mut pending = vec![(tier_root, String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::io("listing", tier, &rel, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| StorageError::io("listing", tier, &rel, err))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                let entry_rel = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| StorageError::io("listing", tier, &entry_rel, err))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), entry_rel));
                } else if !is_temp_name(&name) && entry_rel.starts_with(prefix) {
                    found.push(entry_rel);
                }
            }
        }

        found.sort();
        Ok(found)
    }

    async fn get(&self, tier: Tier, path: &str) -> Result<Vec<u8>, StorageError> {
        let absolute = self.resolve(tier, path)?;
        match fs::read(&absolute).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                tier,
                path: path.to_string(),
            }),
            Err(err) => Err(StorageError::io("reading", tier, path, err)),
        }
    }

    /// Writes into a sibling temp file, syncs it, renames it over the target, then syncs
    /// the parent directory so the rename itself survives a crash.
    async fn put(&self, tier: Tier, path: &str, bytes: &[u8]) -> Result<StoredObject, StorageError> {
        let absolute = self.resolve(tier, path)?;
        let parent = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.tier_root(tier));
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StorageError::io("creating directory for", tier, path, err))?;

        let temp_path = parent.join(format!(".{}.{}{TEMP_SUFFIX}", Uuid::new_v4(), bytes.len()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &absolute).await
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io("atomically replacing", tier, path, err));
        }
        sync_dir(&parent)
            .await
            .map_err(|err| StorageError::io("syncing directory for", tier, path, err))?;

        debug!(%tier, path, bytes = bytes.len(), "object replaced");
        Ok(StoredObject {
            path: path.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    async fn delete(&self, tier: Tier, path: &str) -> Result<(), StorageError> {
        let absolute = self.resolve(tier, path)?;
        match fs::remove_file(&absolute).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io("deleting", tier, path, err)),
        }
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

// Directory handles cannot be synced this way off unix.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// In-process store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(Tier, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, tier: Tier, prefix: &str) -> Result<Vec<String>, StorageError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .keys()
            .filter(|(t, path)| *t == tier && path.starts_with(prefix))
            .map(|(_, path)| path.clone())
            .collect())
    }

    async fn get(&self, tier: Tier, path: &str) -> Result<Vec<u8>, StorageError> {
        validate_path(path)?;
        self.objects
            .lock()
            .await
            .get(&(tier, path.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                tier,
                path: path.to_string(),
            })
    }

    async fn put(&self, tier: Tier, path: &str, bytes: &[u8]) -> Result<StoredObject, StorageError> {
        validate_path(path)?;
        self.objects
            .lock()
            .await
            .insert((tier, path.to_string()), bytes.to_vec());
        Ok(StoredObject {
            path: path.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    async fn delete(&self, tier: Tier, path: &str) -> Result<(), StorageError> {
        validate_path(path)?;
        self.objects.lock().await.remove(&(tier, path.to_string()));
        Ok(())
    }
}
