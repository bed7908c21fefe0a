//! Durable blob storage for job logs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{FleetError, Result};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `local_path` under `key`, replacing any existing object.
    async fn put(&self, key: &str, local_path: &Path) -> Result<()>;
}

/// A `<bucket>/<prefix...>` location, as configured for a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPath {
    pub bucket: String,
    pub prefix: String,
}

impl BucketPath {
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/');
        let (bucket, prefix) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        if bucket.is_empty() {
            return Err(FleetError::Config(format!(
                "bucket path {:?} does not name a bucket",
                path
            )));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// Key under which a finished job's log is stored.
    pub fn log_key(&self, log_file: &Path) -> Result<String> {
        let name = log_file
            .file_name()
            .ok_or_else(|| {
                FleetError::Internal(format!("log file {} has no file name", log_file.display()))
            })?
            .to_string_lossy();
        if self.prefix.is_empty() {
            Ok(format!("logs/{}", name))
        } else {
            Ok(format!("{}/logs/{}", self.prefix, name))
        }
    }
}

impl std::fmt::Display for BucketPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{}", self.bucket)
        } else {
            write!(f, "{}/{}", self.bucket, self.prefix)
        }
    }
}

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for DirObjectStore {
    async fn put(&self, key: &str, local_path: &Path) -> Result<()> {
        if key.split('/').any(|part| part == "..") {
            return Err(FleetError::Store(format!("refusing key {:?}", key)));
        }
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FleetError::Store(e.to_string()))?;
        }
        tokio::fs::copy(local_path, &dest)
            .await
            .map_err(|e| FleetError::Store(format!("{}: {}", local_path.display(), e)))?;
        Ok(())
    }
}

/// Keeps uploaded objects in memory, keyed by object key.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).cloned()
    }

    /// Every key ever uploaded, in upload order, including repeats.
    pub async fn uploads(&self) -> Vec<String> {
        self.uploads.lock().await.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, local_path: &Path) -> Result<()> {
        let contents = tokio::fs::read(local_path)
            .await
            .map_err(|e| FleetError::Store(format!("{}: {}", local_path.display(), e)))?;
        self.objects.lock().await.insert(key.to_string(), contents);
        self.uploads.lock().await.push(key.to_string());
        Ok(())
    }
}
