//! Bringing the bucket in line with an [`ExpectedFileSet`].
//!
//! Everything under the paper's prefix that the set does not account for is
//! moved under `trash/`, never deleted.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::contract::{BoxError, ObjectStore, UploadOutcome};
use crate::file_state::{ExpectedFileSet, FileStateEntry, FileStatus};

/// Namespace leftover objects are moved into.
pub const TRASH_PREFIX: &str = "trash/";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("object store {op} failed for {key}: {source}")]
    Store {
        op: &'static str,
        key: String,
        source: BoxError,
    },
    #[error("expected file {} (for {key}) does not exist", .path.display())]
    MissingLocalFile { path: PathBuf, key: String },
    #[error("cannot walk {}: {source}", .path.display())]
    Walk { path: PathBuf, source: io::Error },
}

/// Keys touched by one reconciliation, by what happened to them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub uploaded: Vec<String>,
    pub unchanged: Vec<String>,
    /// Obsolete entries whose legacy file is gone.
    pub skipped: Vec<String>,
    /// Original keys that were moved under [`TRASH_PREFIX`].
    pub trashed: Vec<String>,
}

pub fn trash_key(key: &str) -> String {
    format!("{TRASH_PREFIX}{key}")
}

pub struct Reconciler<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: ObjectStore + ?Sized> Reconciler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn reconcile(
        &self,
        expected: &ExpectedFileSet,
    ) -> Result<ReconcileReport, ReconcileError> {
        let prefix = expected.destination_prefix.as_str();
        let mut snapshot: BTreeSet<String> = self
            .store
            .list(prefix)
            .await
            .map_err(|source| store_error("list", prefix, source))?
            .into_iter()
            .collect();
        debug!(prefix, objects = snapshot.len(), "Listed destination prefix");

        let mut report = ReconcileReport::default();
        for entry in &expected.entries {
            let Some(files) = self.local_files(entry).await? else {
                report.skipped.push(entry.destination_key.clone());
                continue;
            };
            for (local, key) in files {
                match self.store.upload(&local, &key).await {
                    Ok(UploadOutcome::Uploaded { bytes }) => {
                        info!(key = %key, bytes, "Uploaded");
                        report.uploaded.push(key.clone());
                    }
                    Ok(UploadOutcome::Unchanged) => {
                        debug!(key = %key, "Unchanged, upload skipped");
                        report.unchanged.push(key.clone());
                    }
                    Err(source) => return Err(store_error("upload", &key, source)),
                }
                snapshot.remove(&key);
            }
        }

        for key in snapshot {
            let new_key = trash_key(&key);
            self.store
                .rename(&key, &new_key)
                .await
                .map_err(|source| store_error("rename", &key, source))?;
            info!(key = %key, trash = %new_key, "Moved unexpected object to trash");
            report.trashed.push(key);
        }

        info!(
            paper_id = %expected.paper,
            version = expected.versioned.version(),
            uploaded = report.uploaded.len(),
            unchanged = report.unchanged.len(),
            skipped = report.skipped.len(),
            trashed = report.trashed.len(),
            "Reconciled"
        );
        Ok(report)
    }

    /// `(local file, key)` pairs one entry stands for.
    ///
    /// Directory entries expand to every file below them. `None` means an
    /// obsolete entry whose file is gone.
    async fn local_files(
        &self,
        entry: &FileStateEntry,
    ) -> Result<Option<Vec<(PathBuf, String)>>, ReconcileError> {
        let path = &entry.source_path;
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if entry.status == FileStatus::Obsolete {
                    warn!(path = %path.display(), key = %entry.destination_key, "Obsolete file missing, skipping");
                    return Ok(None);
                }
                error!(path = %path.display(), key = %entry.destination_key, "Expected file missing");
                return Err(ReconcileError::MissingLocalFile {
                    path: path.clone(),
                    key: entry.destination_key.clone(),
                });
            }
            Err(source) => {
                return Err(ReconcileError::Walk {
                    path: path.clone(),
                    source,
                })
            }
        };

        if !metadata.is_dir() {
            return Ok(Some(vec![(path.clone(), entry.destination_key.clone())]));
        }

        let base = entry.destination_key.trim_end_matches('/');
        let mut files = walk(path).await?;
        files.sort();
        Ok(Some(
            files
                .into_iter()
                .filter_map(|file| {
                    let rel = file.strip_prefix(path).ok()?;
                    let rel = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    let key = format!("{base}/{rel}");
                    Some((file, key))
                })
                .collect(),
        ))
    }
}

/// Every file below `root`.
async fn walk(root: &Path) -> Result<Vec<PathBuf>, ReconcileError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let walk_err = |source| ReconcileError::Walk {
            path: dir.clone(),
            source,
        };
        let mut entries = fs::read_dir(&dir).await.map_err(walk_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(walk_err)? {
            if entry.file_type().await.map_err(walk_err)?.is_dir() {
                pending.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

fn store_error(op: &'static str, key: &str, source: BoxError) -> ReconcileError {
    error!(op, key, error = %source, "Object store operation failed");
    ReconcileError::Store {
        op,
        key: key.to_string(),
        source,
    }
}
