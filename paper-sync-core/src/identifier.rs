//! Paper identifiers as they appear in publish events and on the legacy host.
//!
//! Two shapes are accepted:
//! - new style: `1208.9998`, `2101.00123`, optionally `v2` suffixed
//! - old style: `hep-th/9901001`, `math.AG/0101001`, optionally `v2` suffixed
//!
//! The legacy filesystem stores new-style papers under the `arxiv` archive and
//! old-style papers under their own archive (`hep-th`, `math`, ...).

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("'{0}' is not a recognised paper identifier")]
    Unrecognised(String),
    #[error("version suffix of '{0}' is not a positive integer")]
    BadVersion(String),
}

fn new_style() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<yymm>\d{4})\.(?P<num>\d{4,5})(?:v(?P<version>\d+))?$")
            .expect("static regex")
    })
}

fn old_style() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<archive>[a-z][a-z\-]*)(?:\.[A-Z]{2})?/(?P<yymm>\d{4})(?P<num>\d{3})(?:v(?P<version>\d+))?$",
        )
        .expect("static regex")
    })
}

/// A parsed paper identifier, with the version it was written with (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperId {
    id: String,
    archive: String,
    yymm: String,
    filename: String,
    version: Option<u32>,
}

impl PaperId {
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let raw = raw.trim();
        if let Some(caps) = new_style().captures(raw) {
            let yymm = caps["yymm"].to_string();
            let filename = format!("{}.{}", yymm, &caps["num"]);
            return Ok(PaperId {
                id: filename.clone(),
                archive: "arxiv".to_string(),
                yymm,
                filename,
                version: parse_version(raw, caps.name("version").map(|m| m.as_str()))?,
            });
        }
        if let Some(caps) = old_style().captures(raw) {
            let yymm = caps["yymm"].to_string();
            let filename = format!("{}{}", yymm, &caps["num"]);
            // strip the `vN` suffix; the `v` sits right before the version digits
            let end = caps.name("version").map_or(raw.len(), |m| m.start() - 1);
            let id = raw[..end].to_string();
            return Ok(PaperId {
                id,
                archive: caps["archive"].to_string(),
                yymm,
                filename,
                version: parse_version(raw, caps.name("version").map(|m| m.as_str()))?,
            });
        }
        Err(IdentifierError::Unrecognised(raw.to_string()))
    }

    /// The identifier without any version suffix, e.g. `1208.9998` or `hep-th/9901001`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn archive(&self) -> &str {
        &self.archive
    }

    pub fn yymm(&self) -> &str {
        &self.yymm
    }

    /// File stem used on the legacy host, e.g. `1208.9998` or `9901001`.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Pins the identifier to a version. A version already embedded in the
    /// identifier wins over `fallback`.
    pub fn versioned(&self, fallback: u32) -> VersionedId {
        VersionedId {
            paper: self.clone(),
            version: self.version.unwrap_or(fallback),
        }
    }
}

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

fn parse_version(raw: &str, digits: Option<&str>) -> Result<Option<u32>, IdentifierError> {
    match digits {
        None => Ok(None),
        Some(d) => match d.parse::<u32>() {
            Ok(v) if v > 0 => Ok(Some(v)),
            _ => Err(IdentifierError::BadVersion(raw.to_string())),
        },
    }
}

/// A paper identifier pinned to one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedId {
    paper: PaperId,
    version: u32,
}

impl VersionedId {
    pub fn paper(&self) -> &PaperId {
        &self.paper
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// `1208.9998v2` / `hep-th/9901001v2`; what render hosts are asked for.
    pub fn idv(&self) -> String {
        format!("{}v{}", self.paper.id, self.version)
    }

    /// `1208.9998v2` / `9901001v2`; the versioned file stem on the legacy host.
    pub fn filename(&self) -> String {
        format!("{}v{}", self.paper.filename, self.version)
    }
}

impl fmt::Display for VersionedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.paper.id, self.version)
    }
}
