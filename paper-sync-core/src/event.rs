//! Decoding of submission publish events from raw broker payloads.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a payload could not be turned into a [`SubmissionEvent`].
#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("payload is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("payload is not a submission event: {0}")]
    Syntax(#[from] serde_json::Error),
}

/// What happened to the paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishType {
    New,
    Rep,
    Wdr,
    Cross,
    Jref,
}

impl PublishType {
    /// Replacements and withdrawals supersede the previous version's files.
    pub fn supersedes_previous(self) -> bool {
        matches!(self, PublishType::Rep | PublishType::Wdr)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PublishType::New => "new",
            PublishType::Rep => "rep",
            PublishType::Wdr => "wdr",
            PublishType::Cross => "cross",
            PublishType::Jref => "jref",
        }
    }
}

impl FromStr for PublishType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(PublishType::New),
            "rep" => Ok(PublishType::Rep),
            "wdr" => Ok(PublishType::Wdr),
            "cross" => Ok(PublishType::Cross),
            "jref" => Ok(PublishType::Jref),
            other => Err(format!("unknown publish type '{other}'")),
        }
    }
}

impl fmt::Display for PublishType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The version field exactly as the publisher sent it.
///
/// Publishers are not consistent about sending numbers or strings, so
/// validation is left to resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawVersion {
    Integer(i64),
    Text(String),
    Other(serde_json::Value),
}

impl RawVersion {
    /// The version as a positive integer, if it is one.
    pub fn as_positive(&self) -> Option<u32> {
        let value = match self {
            RawVersion::Integer(n) => *n,
            RawVersion::Text(s) => s.trim().parse::<i64>().ok()?,
            RawVersion::Other(_) => return None,
        };
        u32::try_from(value).ok().filter(|v| *v > 0)
    }
}

impl fmt::Display for RawVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawVersion::Integer(n) => write!(f, "{n}"),
            RawVersion::Text(s) => f.write_str(s),
            RawVersion::Other(v) => write!(f, "{v}"),
        }
    }
}

/// One publish/replace/withdraw notification for a paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionEvent {
    #[serde(rename = "type")]
    pub publish_type: PublishType,
    pub paper_id: String,
    #[serde(default)]
    pub version: Option<RawVersion>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub src_ext: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub source_format: Option<String>,
}

impl SubmissionEvent {
    /// Version for log fields; `-` when absent.
    pub fn version_label(&self) -> String {
        self.version
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string)
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Decodes a raw broker payload. No side effects beyond logging.
pub fn decode(payload: &[u8]) -> Result<SubmissionEvent, MalformedMessage> {
    let text = std::str::from_utf8(payload).map_err(|e| {
        warn!(error = %e, len = payload.len(), "Message payload is not UTF-8");
        MalformedMessage::NotUtf8(e)
    })?;
    let event: SubmissionEvent = serde_json::from_str(text).map_err(|e| {
        let head: String = text.chars().take(1024).collect();
        warn!(error = %e, payload = %head, "Message payload is not a submission event");
        MalformedMessage::Syntax(e)
    })?;
    debug!(
        paper_id = %event.paper_id,
        version = %event.version_label(),
        publish_type = %event.publish_type,
        "Decoded submission event"
    );
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_full_event() {
        let event = decode(
            br#"{"type":"rep","paper_id":"1208.9998","version":2,"src_ext":".pdf","source_format":"pdf"}"#,
        )
        .unwrap();
        assert_eq!(event.publish_type, PublishType::Rep);
        assert_eq!(event.paper_id, "1208.9998");
        assert_eq!(event.version.as_ref().and_then(RawVersion::as_positive), Some(2));
        assert_eq!(event.src_ext.as_deref(), Some(".pdf"));
        assert_eq!(event.source_format.as_deref(), Some("pdf"));
    }

    #[test]
    fn optional_fields_may_be_missing_or_empty() {
        let event =
            decode(br#"{"type":"new","paper_id":"1208.9998","version":"1","src_ext":""}"#).unwrap();
        assert_eq!(event.src_ext, None);
        assert_eq!(event.source_format, None);
        assert_eq!(event.version.as_ref().and_then(RawVersion::as_positive), Some(1));
    }

    #[test]
    fn non_utf8_is_malformed() {
        let err = decode(&[0xff, 0xfe, b'{']).unwrap_err();
        assert!(matches!(err, MalformedMessage::NotUtf8(_)));
    }

    #[test]
    fn bad_json_is_malformed() {
        assert!(matches!(
            decode(b"{not json").unwrap_err(),
            MalformedMessage::Syntax(_)
        ));
        assert!(matches!(
            decode(br#"{"type":"bogus","paper_id":"1208.9998","version":1}"#).unwrap_err(),
            MalformedMessage::Syntax(_)
        ));
    }

    #[test]
    fn publish_types_parse_from_their_names() {
        assert_eq!("rep".parse::<PublishType>(), Ok(PublishType::Rep));
        assert_eq!(" WDR ".parse::<PublishType>(), Ok(PublishType::Wdr));
        assert!("replace".parse::<PublishType>().is_err());
        assert!(PublishType::Wdr.supersedes_previous());
        assert!(!PublishType::Cross.supersedes_previous());
    }

    #[test]
    fn raw_versions_only_accept_positive_integers() {
        assert_eq!(RawVersion::Integer(0).as_positive(), None);
        assert_eq!(RawVersion::Integer(-3).as_positive(), None);
        assert_eq!(RawVersion::Text("two".into()).as_positive(), None);
        assert_eq!(RawVersion::Text(" 7 ".into()).as_positive(), Some(7));
        assert_eq!(
            RawVersion::Other(serde_json::json!(1.5)).as_positive(),
            None
        );
    }
}
