//! # consumer: the pull loop that turns publish events into bucket state
//!
//! Every message goes through `decode → resolve → ensure artifacts →
//! reconcile` and is acked only when all four succeed. Any failure nacks the
//! message; broker redelivery is the only retry mechanism, so no stage keeps
//! its own retry loop.
//!
//! ## Workers
//! [`ConsumerLoop::run`] starts `workers` tokio tasks. Each one gets a private
//! [`WorkerContext`] (broker handle, object store, render client) built by a
//! [`WorkerFactory`] before any pulling starts, so a broken transport fails the
//! whole run up front rather than one message at a time. The only state the
//! workers share is the read-only [`SyncPipeline`] and its webnode cursor.
//!
//! ## Shutdown
//! Cancelling the token stops new pulls. Messages already pulled are finished;
//! workers still busy after `shutdown_timeout` are abandoned and their messages
//! come back through broker redelivery.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactEnsurer, HostSelector, MissingGeneratedFile};
use crate::config::{ConsumerSettings, LegacyLayout, Webnode};
use crate::contract::{BoxError, MessageSource, ObjectStore, ReceivedMessage, RenderClient};
use crate::event::{self, MalformedMessage, SubmissionEvent};
use crate::file_state::{ExpectedFileSet, FileStateResolver, ResolveError, SubmissionState};
use crate::reconcile::{ReconcileError, ReconcileReport, Reconciler};

/// Clients owned by one worker for its whole life.
pub struct WorkerContext {
    pub source: Arc<dyn MessageSource>,
    pub store: Box<dyn ObjectStore>,
    pub render: Box<dyn RenderClient>,
}

/// Builds one [`WorkerContext`] per worker.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn build(&self, worker: usize) -> Result<WorkerContext, BoxError>;
}

/// How one message ended; decides ack or nack and the log severity.
#[derive(Debug)]
pub enum MessageOutcome {
    Synced(ReconcileReport),
    Malformed(MalformedMessage),
    ResolveFailed {
        event: SubmissionEvent,
        error: ResolveError,
    },
    MissingGeneratedFile(MissingGeneratedFile),
    ReconcileFailed(ReconcileError),
}

impl MessageOutcome {
    pub fn should_ack(&self) -> bool {
        matches!(self, MessageOutcome::Synced(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            MessageOutcome::Synced(_) => "synced",
            MessageOutcome::Malformed(_) => "malformed",
            MessageOutcome::ResolveFailed { .. } => "resolve-failed",
            MessageOutcome::MissingGeneratedFile(_) => "missing-generated-file",
            MessageOutcome::ReconcileFailed(_) => "reconcile-failed",
        }
    }
}

impl fmt::Display for MessageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why `--test` could not produce an expected file set.
#[derive(Debug, Error)]
pub enum InspectError {
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[derive(Debug)]
pub struct InspectedMessage {
    pub message_id: String,
    pub resolution: Result<ExpectedFileSet, InspectError>,
}

/// Read-only state every worker shares.
pub struct SyncPipeline {
    layout: LegacyLayout,
    selector: HostSelector,
    generation_timeout: Duration,
}

impl SyncPipeline {
    pub fn new(layout: LegacyLayout, webnodes: Vec<Webnode>, generation_timeout: Duration) -> Self {
        let selector = HostSelector::new(webnodes);
        if selector.is_empty() {
            warn!("No webnodes configured, missing PDF/HTML will only be waited for");
        }
        Self {
            layout,
            selector,
            generation_timeout,
        }
    }

    pub fn layout(&self) -> &LegacyLayout {
        &self.layout
    }

    /// Runs every stage for one message without acking or nacking it.
    pub async fn process(&self, ctx: &WorkerContext, msg: &ReceivedMessage) -> MessageOutcome {
        let event = match event::decode(&msg.data) {
            Ok(event) => event,
            Err(e) => return MessageOutcome::Malformed(e),
        };

        let resolved = FileStateResolver::new(&self.layout)
            .resolve_blocking(&event)
            .await;
        let expected = match resolved {
            Ok(expected) => expected,
            Err(error) => return MessageOutcome::ResolveFailed { event, error },
        };

        if let SubmissionState::Live { .. } = expected.state {
            let ensurer = ArtifactEnsurer::new(
                &self.layout,
                &self.selector,
                ctx.render.as_ref(),
                self.generation_timeout,
            );
            if let Err(missing) = ensurer.ensure_expected(&expected).await {
                return MessageOutcome::MissingGeneratedFile(missing);
            }
        }

        match Reconciler::new(ctx.store.as_ref()).reconcile(&expected).await {
            Ok(report) => MessageOutcome::Synced(report),
            Err(e) => MessageOutcome::ReconcileFailed(e),
        }
    }

    /// Processes one message, logs the outcome and acks or nacks it.
    pub async fn handle(&self, ctx: &WorkerContext, msg: &ReceivedMessage) -> MessageOutcome {
        debug!(message_id = %msg.message_id, bytes = msg.data.len(), "Processing message");
        let outcome = self.process(ctx, msg).await;
        log_outcome(&msg.message_id, &outcome);

        let settled = if outcome.should_ack() {
            ctx.source.ack(&msg.ack_id).await
        } else {
            ctx.source.nack(&msg.ack_id).await
        };
        if let Err(e) = settled {
            warn!(
                message_id = %msg.message_id,
                ack = outcome.should_ack(),
                error = %e,
                "Could not settle message, broker will redeliver"
            );
        }
        outcome
    }

    /// Pulls a single message, resolves it and hands it back with a nack.
    pub async fn inspect_one(
        &self,
        source: &dyn MessageSource,
    ) -> Result<Option<InspectedMessage>, BoxError> {
        let Some(msg) = source.pull(1).await?.into_iter().next() else {
            return Ok(None);
        };
        let resolution = match event::decode(&msg.data) {
            Ok(event) => FileStateResolver::new(&self.layout)
                .resolve_blocking(&event)
                .await
                .map_err(InspectError::from),
            Err(e) => Err(InspectError::from(e)),
        };
        source.nack(&msg.ack_id).await?;
        Ok(Some(InspectedMessage {
            message_id: msg.message_id,
            resolution,
        }))
    }
}

fn log_outcome(message_id: &str, outcome: &MessageOutcome) {
    match outcome {
        MessageOutcome::Synced(report) => info!(
            message_id,
            uploaded = report.uploaded.len(),
            trashed = report.trashed.len(),
            "Message synced, acking"
        ),
        MessageOutcome::Malformed(e) => {
            error!(message_id, error = %e, "Malformed message, nacking")
        }
        MessageOutcome::ResolveFailed { event, error } => warn!(
            message_id,
            paper_id = %event.paper_id,
            version = %event.version_label(),
            publish_type = %event.publish_type,
            error = %error,
            "Could not resolve expected files, nacking"
        ),
        MessageOutcome::MissingGeneratedFile(e) => info!(
            message_id,
            kind = %e.kind,
            idv = %e.idv,
            "Generated file not there yet, nacking for redelivery"
        ),
        MessageOutcome::ReconcileFailed(e) => {
            error!(message_id, error = %e, "Processing error during reconcile, nacking")
        }
    }
}

/// Per-worker counts, summed into [`ConsumerSummary`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub acked: u64,
    pub nacked: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub acked: u64,
    pub nacked: u64,
    /// Workers that had not finished when the shutdown timeout ran out.
    pub abandoned_workers: usize,
    /// Workers that died (panicked) instead of returning.
    pub failed_workers: usize,
}

impl ConsumerSummary {
    fn record(&mut self, joined: Result<WorkerStats, JoinError>) {
        match joined {
            Ok(stats) => {
                self.acked += stats.acked;
                self.nacked += stats.nacked;
            }
            Err(e) => {
                self.failed_workers += 1;
                error!(
                    error = %e,
                    "Worker task failed, its in-flight message is left to redelivery"
                );
            }
        }
    }
}

pub struct ConsumerLoop {
    pipeline: Arc<SyncPipeline>,
    settings: ConsumerSettings,
}

impl ConsumerLoop {
    pub fn new(pipeline: Arc<SyncPipeline>, settings: ConsumerSettings) -> Self {
        Self { pipeline, settings }
    }

    /// Runs until `cancel` fires, then drains in-flight messages.
    ///
    /// Only a failure to build a worker context is returned as an error.
    pub async fn run(
        &self,
        factory: &dyn WorkerFactory,
        cancel: CancellationToken,
    ) -> Result<ConsumerSummary, BoxError> {
        let workers = self.settings.workers.max(1);
        let mut contexts = Vec::with_capacity(workers);
        for worker in 0..workers {
            contexts.push(factory.build(worker).await?);
        }
        info!(workers, max_messages = self.settings.max_messages, "Starting consumer workers");

        let mut set = JoinSet::new();
        for (worker, ctx) in contexts.into_iter().enumerate() {
            set.spawn(worker_loop(
                worker,
                Arc::clone(&self.pipeline),
                ctx,
                self.settings.clone(),
                cancel.clone(),
            ));
        }

        let mut summary = ConsumerSummary::default();
        // Failed workers are reported as they die, not at shutdown.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = set.join_next() => match joined {
                    Some(joined) => summary.record(joined),
                    None => {
                        if !cancel.is_cancelled() {
                            error!("Every worker has exited, stopping");
                        }
                        break;
                    }
                },
            }
        }
        if cancel.is_cancelled() {
            info!(
                timeout_secs = self.settings.shutdown_timeout_secs,
                "Shutdown requested, waiting for in-flight messages"
            );
        }

        let drained = tokio::time::timeout(self.settings.shutdown_timeout(), async {
            while let Some(joined) = set.join_next().await {
                summary.record(joined);
            }
        })
        .await;

        if drained.is_err() {
            summary.abandoned_workers = set.len();
            warn!(
                abandoned = summary.abandoned_workers,
                "Shutdown timeout reached, leaving in-flight messages to redelivery"
            );
            set.detach_all();
        }
        info!(
            acked = summary.acked,
            nacked = summary.nacked,
            failed_workers = summary.failed_workers,
            "Consumer stopped"
        );
        Ok(summary)
    }
}

async fn worker_loop(
    worker: usize,
    pipeline: Arc<SyncPipeline>,
    ctx: WorkerContext,
    settings: ConsumerSettings,
    cancel: CancellationToken,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    debug!(worker, "Worker started");
    while !cancel.is_cancelled() {
        let pulled = tokio::select! {
            _ = cancel.cancelled() => break,
            pulled = ctx.source.pull(settings.max_messages.max(1)) => pulled,
        };
        let batch = match pulled {
            Ok(batch) => batch,
            Err(e) => {
                warn!(worker, error = %e, "Pull failed");
                idle(&cancel, settings.idle_backoff()).await;
                continue;
            }
        };
        if batch.is_empty() {
            idle(&cancel, settings.idle_backoff()).await;
            continue;
        }
        for msg in &batch {
            if pipeline.handle(&ctx, msg).await.should_ack() {
                stats.acked += 1;
            } else {
                stats.nacked += 1;
            }
        }
    }
    debug!(worker, acked = stats.acked, nacked = stats.nacked, "Worker stopped");
    stats
}

async fn idle(cancel: &CancellationToken, backoff: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(backoff) => {}
    }
}
