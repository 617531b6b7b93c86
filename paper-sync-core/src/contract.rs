//! # contract: the external collaborators of the sync pipeline
//!
//! The pipeline talks to three systems it does not own:
//! - a message broker delivering publish events ([`MessageSource`])
//! - an object store holding the mirrored files ([`ObjectStore`])
//! - render hosts that produce PDFs and HTML on request ([`RenderClient`])
//!
//! Each one is a trait here so the core never depends on a transport. The
//! binary crate provides the Pub/Sub, GCS and webnode HTTP implementations;
//! tests use the `mockall` mocks generated below or the filesystem store in
//! [`crate::local_store`].
//!
//! ## Errors
//! All trait methods return the boxed [`BoxError`]. Retrying transient
//! failures is the implementor's job; an error coming out of these traits has
//! already exhausted whatever retry policy the implementor has.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use mockall::automock;

use crate::artifact::ArtifactKind;
use crate::config::Webnode;

/// Error type used at every trait seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A message as pulled from the broker, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Broker-assigned message id, for logs.
    pub message_id: String,
    /// Handle used to ack or nack this delivery.
    pub ack_id: String,
    pub data: Vec<u8>,
}

/// Pull-based subscription to publish events.
///
/// Delivery is at least once and unordered.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Pull up to `max_messages`; an empty batch means nothing is pending right now.
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, BoxError>;

    /// Mark a delivery as done; it will not be redelivered.
    async fn ack(&self, ack_id: &str) -> Result<(), BoxError>;

    /// Hand a delivery back for redelivery after the broker's backoff.
    async fn nack(&self, ack_id: &str) -> Result<(), BoxError>;
}

/// What an upload ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Bytes were transferred.
    Uploaded { bytes: u64 },
    /// An identical object was already at the key.
    Unchanged,
}

/// The durable destination of the mirrored files.
///
/// There is deliberately no delete: objects that are no longer wanted are
/// renamed into a trash namespace.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every key starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BoxError>;

    /// Copy `local` to `key`, skipping the transfer when an object with the same
    /// size (and checksum, where the store has one) is already there.
    async fn upload(&self, local: &Path, key: &str) -> Result<UploadOutcome, BoxError>;

    /// Move the object at `key` to `new_key`.
    async fn rename(&self, key: &str, new_key: &str) -> Result<(), BoxError>;
}

/// Answer of a render host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderReceipt {
    /// URL the host was asked for.
    pub source_url: String,
    pub status: u16,
    pub duration: Duration,
}

/// Synchronous render requests to a webnode.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RenderClient: Send + Sync {
    /// Ask `host` to render `idv` as `kind`, waiting at most `timeout`.
    ///
    /// A successful return says nothing about the artifact existing afterwards.
    async fn request_render(
        &self,
        host: &Webnode,
        kind: ArtifactKind,
        idv: &str,
        timeout: Duration,
    ) -> Result<RenderReceipt, BoxError>;
}
