//! Resolution of the files a submission event should leave in the bucket.
//!
//! Given one [`SubmissionEvent`], [`FileStateResolver::resolve`] works out every
//! legacy file that ought to be mirrored for the paper, where each one lands in
//! the bucket, and which of them belong to the superseded version.
//!
//! The legacy host has no single canonical key per paper: the source can be a
//! `.tar.gz`, a single `.gz`, a `.pdf` or an `.html.gz`, and the metadata that
//! says which is not always in the event. Missing details are recovered from
//! the host itself (probing extensions, reading the `.abs` sidecar, peeking
//! into the tarball or the gzip).
//!
//! A paper with two coexisting source artifacts (a PDF-only submission with a
//! separate ancillary `.tar.gz`) cannot be expressed by this model.

use flate2::read::GzDecoder;
use regex::Regex;
use std::cell::OnceCell;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LayoutError, LegacyLayout};
use crate::event::{PublishType, SubmissionEvent};
use crate::identifier::{IdentifierError, PaperId, VersionedId};
use crate::source_flag::{SourceFlag, SourceFormat};

/// Extensions a source file may have, in probing order.
pub const PROBE_EXTENSIONS: [&str; 4] = [".tar.gz", ".gz", ".pdf", ".html.gz"];

/// Top-level member of a tarball marking the submission as removed.
pub const REMOVED_MARKER: &str = "removed.txt";

/// Leading text of a single-file source that is to be ignored.
pub const IGNORE_MARKER: &[u8] = b"%auto-ignore";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("version '{version}' of {paper_id} is not a positive integer")]
    InvalidVersion { paper_id: String, version: String },
    #[error(transparent)]
    InvalidPaperId(#[from] IdentifierError),
    #[error("no source file for {paper_id} under {}", .dir.display())]
    SourceNotFound { paper_id: String, dir: PathBuf },
    #[error("cannot inspect {}: {source}", .path.display())]
    Inspect { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("resolution task did not finish: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Abstract,
    Submission,
    PdfCache,
    HtmlCache,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Abstract => "abstract",
            FileKind::Submission => "submission",
            FileKind::PdfCache => "pdf-cache",
            FileKind::HtmlCache => "html-cache",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    Current,
    Obsolete,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileStatus::Current => "current",
            FileStatus::Obsolete => "obsolete",
        })
    }
}

/// One file that should exist in the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStateEntry {
    pub kind: FileKind,
    pub status: FileStatus,
    pub source_path: PathBuf,
    /// Bucket key; ends with `/` for directory entries.
    pub destination_key: String,
}

impl FileStateEntry {
    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::HtmlCache
    }
}

/// How the submission is classified on the legacy host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Live { format: SourceFormat },
    /// The tarball carries the removal marker.
    Removed,
    /// The single-file source starts with the ignore marker.
    Ignored,
}

/// Everything one event says should be in the bucket.
#[derive(Debug, Clone)]
pub struct ExpectedFileSet {
    pub paper: PaperId,
    pub versioned: VersionedId,
    pub publish_type: PublishType,
    pub state: SubmissionState,
    pub src_ext: String,
    /// Auxiliary flags picked up from the metadata (`S`, `A`, `B`, ...).
    pub flags: SourceFlag,
    /// Bucket prefix shared by every latest file of the paper.
    pub destination_prefix: String,
    pub entries: Vec<FileStateEntry>,
}

impl ExpectedFileSet {
    pub fn current(&self) -> impl Iterator<Item = &FileStateEntry> {
        self.entries
            .iter()
            .filter(|e| e.status == FileStatus::Current)
    }

    pub fn obsolete(&self) -> impl Iterator<Item = &FileStateEntry> {
        self.entries
            .iter()
            .filter(|e| e.status == FileStatus::Obsolete)
    }

    pub fn find(&self, kind: FileKind, status: FileStatus) -> Option<&FileStateEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.status == status)
    }
}

/// Metadata recovered from the `.abs` sidecar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbsSourceType {
    pub format: Option<SourceFormat>,
    pub flags: SourceFlag,
}

fn date_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^Date\s*(?::|\(revised\s*(?P<version>.*?)\):)\s*(?P<date>.*?)(?:\s+\((?P<size_kilobytes>\d+)kb,?(?P<source_type>.*)\))?$",
        )
        .expect("static regex")
    })
}

/// Reads the source-type code off the last `Date` line of an `.abs` header.
///
/// The header ends at the first blank line. `D H I O P X` name a format (the
/// last one wins); `S A B` are kept as auxiliary flags.
pub fn parse_abs_source_type<R: BufRead>(reader: R) -> io::Result<AbsSourceType> {
    let mut last_date: Option<String> = None;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if line.starts_with("Date") {
            last_date = Some(line.to_string());
        }
    }

    let mut parsed = AbsSourceType::default();
    let Some(line) = last_date else {
        return Ok(parsed);
    };
    let Some(code) = date_line()
        .captures(&line)
        .and_then(|caps| caps.name("source_type"))
    else {
        return Ok(parsed);
    };
    let mut aux = String::new();
    for c in code.as_str().chars() {
        if let Some(format) = SourceFormat::from_flag_char(c) {
            parsed.format = Some(format);
        } else if matches!(c, 'S' | 'A' | 'B') {
            aux.push(c);
        }
    }
    parsed.flags = SourceFlag::from_code(&aux);
    Ok(parsed)
}

/// Lazily inspected source files of one paper.
///
/// Lives for one resolution only; nothing is cached across events.
struct SourceInspector {
    tgz_path: PathBuf,
    gz_path: PathBuf,
    top_levels: OnceCell<HashSet<String>>,
}

impl SourceInspector {
    fn new(layout: &LegacyLayout, paper: &PaperId) -> Self {
        Self {
            tgz_path: layout.source_path(paper, ".tar.gz"),
            gz_path: layout.source_path(paper, ".gz"),
            top_levels: OnceCell::new(),
        }
    }

    fn top_levels(&self) -> &HashSet<String> {
        self.top_levels.get_or_init(|| {
            if !self.tgz_path.exists() {
                return HashSet::new();
            }
            match tarball_names(&self.tgz_path) {
                Ok(names) => names,
                Err(e) => {
                    warn!(path = %self.tgz_path.display(), error = %e, "Unreadable tarball, treating as not removed");
                    HashSet::new()
                }
            }
        })
    }

    fn is_removed(&self) -> bool {
        self.top_levels().contains(REMOVED_MARKER)
    }

    fn is_ignored(&self) -> Result<bool, ResolveError> {
        if !self.gz_path.exists() {
            return Ok(false);
        }
        gz_starts_with(&self.gz_path, IGNORE_MARKER).map_err(|source| {
            warn!(path = %self.gz_path.display(), error = %source, "Unreadable .gz source");
            ResolveError::Inspect {
                path: self.gz_path.clone(),
                source,
            }
        })
    }
}

/// Member names of a gzipped tarball, with any leading `./` dropped.
fn tarball_names(path: &Path) -> io::Result<HashSet<String>> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
    let mut names = HashSet::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        names.insert(name.trim_start_matches("./").to_string());
    }
    Ok(names)
}

fn gz_starts_with(path: &Path, needle: &[u8]) -> io::Result<bool> {
    let mut head = Vec::with_capacity(needle.len());
    GzDecoder::new(File::open(path)?)
        .take(needle.len() as u64)
        .read_to_end(&mut head)?;
    Ok(head == needle)
}

/// Resolves [`SubmissionEvent`]s against one legacy layout.
pub struct FileStateResolver<'a> {
    layout: &'a LegacyLayout,
}

impl<'a> FileStateResolver<'a> {
    pub fn new(layout: &'a LegacyLayout) -> Self {
        Self { layout }
    }

    /// [`resolve`](Self::resolve) on the blocking pool.
    ///
    /// Resolution reads the legacy filesystem and can decompress a whole
    /// tarball; async callers go through here.
    pub async fn resolve_blocking(
        &self,
        event: &SubmissionEvent,
    ) -> Result<ExpectedFileSet, ResolveError> {
        let layout = self.layout.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || FileStateResolver::new(&layout).resolve(&event)).await?
    }

    pub fn resolve(&self, event: &SubmissionEvent) -> Result<ExpectedFileSet, ResolveError> {
        let version = event
            .version
            .as_ref()
            .and_then(|v| v.as_positive())
            .ok_or_else(|| ResolveError::InvalidVersion {
                paper_id: event.paper_id.clone(),
                version: event.version_label(),
            })?;
        let paper = PaperId::parse(&event.paper_id)?;
        let versioned = paper.versioned(version);
        info!(
            paper_id = %paper,
            version,
            publish_type = %event.publish_type,
            src_ext = event.src_ext.as_deref().unwrap_or("-"),
            "Resolving expected files"
        );

        let layout = self.layout;
        let src_ext = match &event.src_ext {
            Some(ext) => ext.clone(),
            None => self.probe_latest_extension(&paper)?,
        };

        let inspector = SourceInspector::new(layout, &paper);
        let mut flags = SourceFlag::default();
        let current = |kind, path: PathBuf| (kind, FileStatus::Current, path);

        let mut files = vec![current(FileKind::Abstract, layout.source_path(&paper, ".abs"))];
        let state = if inspector.is_removed() {
            files.push(current(FileKind::Submission, inspector.tgz_path.clone()));
            SubmissionState::Removed
        } else if inspector.is_ignored()? {
            files.push(current(FileKind::Submission, inspector.gz_path.clone()));
            SubmissionState::Ignored
        } else {
            let (format, abs_flags) = self.source_format(event, &paper, &src_ext);
            flags = abs_flags;
            files.push(current(
                FileKind::Submission,
                layout.source_path(&paper, &src_ext),
            ));
            if format.is_tex_family() {
                files.push(current(FileKind::PdfCache, layout.pdf_cache_path(&versioned)));
            } else if format.is_html_family() {
                files.push(current(FileKind::HtmlCache, layout.html_cache_dir(&versioned)));
            }
            SubmissionState::Live { format }
        };
        debug!(paper_id = %paper, ?state, "Classified submission");

        if event.publish_type.supersedes_previous() {
            let previous = paper.versioned(version.saturating_sub(1).max(1));
            files.push((
                FileKind::Abstract,
                FileStatus::Obsolete,
                layout.versioned_source_path(&previous, ".abs"),
            ));
            let previous_source = PROBE_EXTENSIONS
                .iter()
                .map(|ext| layout.versioned_source_path(&previous, ext))
                .find(|path| path.exists())
                .unwrap_or_else(|| layout.versioned_source_path(&previous, &src_ext));
            files.push((FileKind::Submission, FileStatus::Obsolete, previous_source));
        }

        let entries = files
            .into_iter()
            .map(|(kind, status, source_path)| {
                let mut destination_key = layout.destination_key(&source_path)?;
                if kind == FileKind::HtmlCache {
                    destination_key.push('/');
                }
                Ok(FileStateEntry {
                    kind,
                    status,
                    source_path,
                    destination_key,
                })
            })
            .collect::<Result<Vec<_>, ResolveError>>()?;

        let destination_prefix = layout.destination_key(&layout.source_path(&paper, ""))?;

        Ok(ExpectedFileSet {
            paper,
            versioned,
            publish_type: event.publish_type,
            state,
            src_ext,
            flags,
            destination_prefix,
            entries,
        })
    }

    /// First extension in [`PROBE_EXTENSIONS`] whose latest file exists.
    fn probe_latest_extension(&self, paper: &PaperId) -> Result<String, ResolveError> {
        PROBE_EXTENSIONS
            .iter()
            .find(|ext| self.layout.source_path(paper, ext).exists())
            .map(|ext| {
                debug!(paper_id = %paper, src_ext = ext, "Probed source extension");
                ext.to_string()
            })
            .ok_or_else(|| ResolveError::SourceNotFound {
                paper_id: paper.id().to_string(),
                dir: self.layout.latest_dir(paper),
            })
    }

    /// Format from the event, else from the `.abs` sidecar, else from the extension.
    fn source_format(
        &self,
        event: &SubmissionEvent,
        paper: &PaperId,
        src_ext: &str,
    ) -> (SourceFormat, SourceFlag) {
        if let Some(name) = &event.source_format {
            match SourceFormat::parse(name) {
                Some(format) => return (format, SourceFlag::default()),
                None => warn!(paper_id = %paper, source_format = %name, "Unknown source format in event, ignoring"),
            }
        }

        let abs = self.read_abs(paper);
        let format = abs
            .format
            .unwrap_or_else(|| SourceFormat::from_extension(src_ext, abs.format));
        (format, abs.flags)
    }

    fn read_abs(&self, paper: &PaperId) -> AbsSourceType {
        let abs_path = self.layout.source_path(paper, ".abs");
        let parsed = File::open(&abs_path)
            .and_then(|f| parse_abs_source_type(BufReader::new(f)));
        match parsed {
            Ok(abs) => abs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %abs_path.display(), "abs file does not exist");
                AbsSourceType::default()
            }
            Err(e) => {
                warn!(path = %abs_path.display(), error = %e, "Error reading abs file");
                AbsSourceType::default()
            }
        }
    }
}
