//! Making sure rendered PDFs and HTML exist on the legacy host before mirroring.
//!
//! The common case is that the artifact is already in the ps_cache and nothing
//! else happens. Otherwise one webnode is asked to render it synchronously and
//! the cache is checked again; only that second look decides the outcome,
//! since other triggers may be rendering the same paper concurrently.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LegacyLayout, Webnode};
use crate::contract::RenderClient;
use crate::file_state::{ExpectedFileSet, FileKind};
use crate::identifier::VersionedId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Pdf,
    Html,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Html => "html",
        }
    }

    fn for_file_kind(kind: FileKind) -> Option<Self> {
        match kind {
            FileKind::PdfCache => Some(ArtifactKind::Pdf),
            FileKind::HtmlCache => Some(ArtifactKind::Html),
            FileKind::Abstract | FileKind::Submission => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The artifact was absent before and after asking for it.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{kind} for {idv} does not exist at {}", .path.display())]
pub struct MissingGeneratedFile {
    pub kind: ArtifactKind,
    pub idv: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyPresent,
    /// Present after a render request to `host`.
    Generated { host: String },
}

/// Smooth weighted round-robin over the configured webnodes.
///
/// A host with parallelism `n` gets `n` slots in the schedule, spread out so
/// that no host is asked twice in a row while others have slots left. The
/// cursor is atomic and shared by every worker.
#[derive(Debug)]
pub struct HostSelector {
    hosts: Vec<Webnode>,
    schedule: Vec<usize>,
    cursor: AtomicUsize,
}

impl HostSelector {
    pub fn new(hosts: Vec<Webnode>) -> Self {
        let schedule = smooth_schedule(&hosts);
        Self {
            hosts,
            schedule,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// The next host to ask; `None` when no hosts are configured.
    pub fn next(&self) -> Option<&Webnode> {
        if self.schedule.is_empty() {
            return None;
        }
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.schedule.len();
        self.hosts.get(self.schedule[slot])
    }
}

fn smooth_schedule(hosts: &[Webnode]) -> Vec<usize> {
    let weights: Vec<i64> = hosts.iter().map(|h| i64::from(h.parallelism.max(1))).collect();
    let total: i64 = weights.iter().sum();
    let mut current = vec![0i64; hosts.len()];
    let mut schedule = Vec::with_capacity(total as usize);
    for _ in 0..total {
        for (c, w) in current.iter_mut().zip(&weights) {
            *c += w;
        }
        let Some((best, _)) = current
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
        else {
            break;
        };
        current[best] -= total;
        schedule.push(best);
    }
    schedule
}

/// Confirms rendered artifacts, asking webnodes when they are missing.
pub struct ArtifactEnsurer<'a, R: RenderClient + ?Sized> {
    layout: &'a LegacyLayout,
    selector: &'a HostSelector,
    client: &'a R,
    timeout: Duration,
}

impl<'a, R: RenderClient + ?Sized> ArtifactEnsurer<'a, R> {
    pub fn new(
        layout: &'a LegacyLayout,
        selector: &'a HostSelector,
        client: &'a R,
        timeout: Duration,
    ) -> Self {
        Self {
            layout,
            selector,
            client,
            timeout,
        }
    }

    fn artifact_path(&self, kind: ArtifactKind, vid: &VersionedId) -> PathBuf {
        match kind {
            ArtifactKind::Pdf => self.layout.pdf_cache_path(vid),
            ArtifactKind::Html => self.layout.html_cache_dir(vid),
        }
    }

    pub async fn ensure(
        &self,
        kind: ArtifactKind,
        vid: &VersionedId,
    ) -> Result<EnsureOutcome, MissingGeneratedFile> {
        let path = self.artifact_path(kind, vid);
        if exists(&path).await {
            debug!(%kind, idv = %vid, "Artifact already present");
            return Ok(EnsureOutcome::AlreadyPresent);
        }

        let host = self.selector.next();
        if let Some(host) = host {
            info!(%kind, idv = %vid, host = %host.host, "Requesting artifact generation");
            match self
                .client
                .request_render(host, kind, &vid.idv(), self.timeout)
                .await
            {
                Ok(receipt) => debug!(
                    %kind,
                    idv = %vid,
                    host = %host.host,
                    status = receipt.status,
                    duration_ms = receipt.duration.as_millis() as u64,
                    url = %receipt.source_url,
                    "Render request returned"
                ),
                Err(e) => warn!(%kind, idv = %vid, host = %host.host, error = %e, "Render request failed"),
            }
        } else {
            warn!(%kind, idv = %vid, "No webnodes configured, cannot request generation");
        }

        if exists(&path).await {
            Ok(EnsureOutcome::Generated {
                host: host.map(|h| h.host.clone()).unwrap_or_default(),
            })
        } else {
            Err(MissingGeneratedFile {
                kind,
                idv: vid.idv(),
                path,
            })
        }
    }

    /// Ensures every rendered artifact the set expects.
    pub async fn ensure_expected(
        &self,
        expected: &ExpectedFileSet,
    ) -> Result<Vec<EnsureOutcome>, MissingGeneratedFile> {
        let mut outcomes = Vec::new();
        for entry in &expected.entries {
            if let Some(kind) = ArtifactKind::for_file_kind(entry.kind) {
                outcomes.push(self.ensure(kind, &expected.versioned).await?);
            }
        }
        Ok(outcomes)
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
