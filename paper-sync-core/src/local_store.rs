//! [`ObjectStore`] backed by a plain directory.
//!
//! Object keys are relative paths under the root. Used by `--local-bucket`
//! runs and by the reconciliation tests.

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::contract::{BoxError, ObjectStore, UploadOutcome};

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

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn digest(path: &Path) -> Result<(u64, Vec<u8>), BoxError> {
        let bytes = fs::read(path).await?;
        Ok((bytes.len() as u64, Md5::digest(&bytes).to_vec()))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BoxError> {
        let mut keys = Vec::new();
        if !fs::try_exists(&self.root).await? {
            return Ok(keys);
        }
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<UploadOutcome, BoxError> {
        let target = self.object_path(key);
        let (size, md5) = Self::digest(local).await?;
        if fs::try_exists(&target).await? && Self::digest(&target).await? == (size, md5) {
            return Ok(UploadOutcome::Unchanged);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = fs::copy(local, &target).await?;
        debug!(key, bytes, "Copied into local bucket");
        Ok(UploadOutcome::Uploaded { bytes })
    }

    async fn rename(&self, key: &str, new_key: &str) -> Result<(), BoxError> {
        let target = self.object_path(new_key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.object_path(key), &target).await?;
        Ok(())
    }
}
