use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::identifier::{PaperId, VersionedId};

/// Key segment that every legacy root is rewritten to in the bucket.
const FTP_KEY: &str = "ftp/";
const ORIG_KEY: &str = "orig/";
const PS_CACHE_KEY: &str = "ps_cache/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{0} is not under any legacy root")]
    OutsideLegacyRoots(String),
    #[error("{0} does not map back to any legacy root")]
    UnknownKey(String),
}

/// Where the legacy host keeps things.
///
/// `ftp` holds the latest version of every paper, `orig` the superseded
/// versions, and `ps_cache` the rendered PDF/HTML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyLayout {
    pub ftp_prefix: PathBuf,
    pub orig_prefix: PathBuf,
    pub ps_cache_prefix: PathBuf,
}

impl Default for LegacyLayout {
    fn default() -> Self {
        Self {
            ftp_prefix: PathBuf::from("/data/ftp"),
            orig_prefix: PathBuf::from("/data/orig"),
            ps_cache_prefix: PathBuf::from("/cache/ps_cache"),
        }
    }
}

impl LegacyLayout {
    /// Rooted at `root`, with the usual `data/ftp`, `data/orig`, `cache/ps_cache` subtrees.
    pub fn under(root: &Path) -> Self {
        Self {
            ftp_prefix: root.join("data/ftp"),
            orig_prefix: root.join("data/orig"),
            ps_cache_prefix: root.join("cache/ps_cache"),
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            ftp = %self.ftp_prefix.display(),
            orig = %self.orig_prefix.display(),
            ps_cache = %self.ps_cache_prefix.display(),
            "Loaded legacy layout"
        );
    }

    /// Directory holding the latest version of every paper of the month.
    pub fn latest_dir(&self, paper: &PaperId) -> PathBuf {
        self.ftp_prefix
            .join(paper.archive())
            .join("papers")
            .join(paper.yymm())
    }

    /// Directory holding the superseded versions.
    pub fn versioned_dir(&self, paper: &PaperId) -> PathBuf {
        self.orig_prefix
            .join(paper.archive())
            .join("papers")
            .join(paper.yymm())
    }

    /// Unversioned latest file, e.g. `<ftp>/arxiv/papers/1208/1208.9998.tar.gz`.
    ///
    /// With an empty `dotext` this is the stem every latest file of the paper shares.
    pub fn source_path(&self, paper: &PaperId, dotext: &str) -> PathBuf {
        self.latest_dir(paper)
            .join(format!("{}{}", paper.filename(), dotext))
    }

    /// Versioned superseded file, e.g. `<orig>/arxiv/papers/1208/1208.9998v1.pdf`.
    pub fn versioned_source_path(&self, vid: &VersionedId, dotext: &str) -> PathBuf {
        self.versioned_dir(vid.paper())
            .join(format!("{}{}", vid.filename(), dotext))
    }

    pub fn pdf_cache_path(&self, vid: &VersionedId) -> PathBuf {
        self.ps_cache_prefix
            .join(vid.paper().archive())
            .join("pdf")
            .join(vid.paper().yymm())
            .join(format!("{}.pdf", vid.filename()))
    }

    pub fn html_cache_dir(&self, vid: &VersionedId) -> PathBuf {
        self.ps_cache_prefix
            .join(vid.paper().archive())
            .join("html")
            .join(vid.paper().yymm())
            .join(vid.filename())
    }

    fn roots(&self) -> [(&Path, &'static str); 3] {
        [
            (self.ps_cache_prefix.as_path(), PS_CACHE_KEY),
            (self.ftp_prefix.as_path(), FTP_KEY),
            (self.orig_prefix.as_path(), ORIG_KEY),
        ]
    }

    /// Rewrites a legacy path into its bucket key.
    pub fn destination_key(&self, path: &Path) -> Result<String, LayoutError> {
        for (root, key_prefix) in self.roots() {
            if let Ok(rest) = path.strip_prefix(root) {
                let rest = rest
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                return Ok(format!("{key_prefix}{rest}"));
            }
        }
        Err(LayoutError::OutsideLegacyRoots(path.display().to_string()))
    }

    /// Inverse of [`LegacyLayout::destination_key`].
    pub fn legacy_path(&self, key: &str) -> Result<PathBuf, LayoutError> {
        for (root, key_prefix) in self.roots() {
            if let Some(rest) = key.strip_prefix(key_prefix) {
                return Ok(root.join(rest.trim_end_matches('/')));
            }
        }
        Err(LayoutError::UnknownKey(key.to_string()))
    }
}

/// A host able to render PDFs and HTML on request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webnode {
    pub host: String,
    /// How many renders the host handles at once; its share of the requests.
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

fn default_parallelism() -> u32 {
    1
}

/// Tuning of the consumer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    /// Pause between empty pulls.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_max_messages() -> usize {
    1
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_generation_timeout_secs() -> u64 {
    2
}

fn default_idle_backoff_ms() -> u64 {
    200
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_messages: default_max_messages(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            idle_backoff_ms: default_idle_backoff_ms(),
        }
    }
}

impl ConsumerSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn trace_loaded(&self) {
        info!(
            workers = self.workers,
            max_messages = self.max_messages,
            shutdown_timeout_secs = self.shutdown_timeout_secs,
            generation_timeout_secs = self.generation_timeout_secs,
            "Loaded consumer settings"
        );
        debug!(?self, "Consumer settings (full debug)");
    }
}
