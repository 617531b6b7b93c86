/// # paper-sync CLI interface (module)
///
/// Command parsing and orchestration for the `paper-sync` binary. All
/// decisions about which files belong in the bucket live in
/// [`paper-sync-core`]; this module wires configuration, GCP adapters and
/// signal handling around them.
///
/// ## Subcommands
/// - `consume`: run the Pub/Sub consumer until SIGINT/SIGTERM
/// - `resolve`: print the expected file set of one event
/// - `sync`: resolve one event and reconcile it into a local bucket directory
///
/// For programmatic and integration use, call [`run`] with a constructed [`Cli`].
///
/// [`paper-sync-core`]: ../../paper_sync_core/
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use gcp_auth::TokenProvider;
use paper_sync_core::consumer::{ConsumerLoop, SyncPipeline, WorkerContext, WorkerFactory};
use paper_sync_core::contract::{BoxError, MessageSource};
use paper_sync_core::event::{PublishType, RawVersion, SubmissionEvent};
use paper_sync_core::file_state::{ExpectedFileSet, FileStateResolver};
use paper_sync_core::local_store::LocalObjectStore;
use paper_sync_core::reconcile::Reconciler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::gcp::{ApiClient, RetryPolicy};
use crate::gcs::GcsObjectStore;
use crate::load_config::{load_config, BrokerSection, PaperSyncConfig, StoreSection};
use crate::pubsub::PubSubSource;
use crate::webnode::HttpRenderClient;

pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Storage requests can carry whole tarballs.
const STORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// CLI for paper-sync: mirror legacy paper files into a bucket as they are published.
#[derive(Parser)]
#[clap(
    name = "paper-sync",
    version,
    about = "Mirror published paper files from the legacy filesystem into cloud storage"
)]
pub struct Cli {
    /// Log at debug level regardless of RUST_LOG
    #[clap(long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[clap(long, global = true)]
    pub json_log: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

/// One publish event given on the command line.
#[derive(clap::Args, Debug, Clone)]
pub struct EventArgs {
    /// Paper id, e.g. 1208.9998 or hep-th/9901001
    #[clap(long)]
    pub paper_id: String,

    /// Version being published
    #[clap(long)]
    pub version: String,

    /// Publish type: new, rep, wdr, cross or jref
    #[clap(long = "type", default_value = "new")]
    pub publish_type: String,

    /// Source file extension, e.g. .tar.gz; probed on the host when omitted
    #[clap(long)]
    pub src_ext: Option<String>,

    /// Source format, e.g. tex or pdf; read from the .abs file when omitted
    #[clap(long)]
    pub source_format: Option<String>,
}

impl EventArgs {
    pub fn to_event(&self) -> Result<SubmissionEvent> {
        let publish_type: PublishType = self.publish_type.parse().map_err(|e: String| anyhow!(e))?;
        Ok(SubmissionEvent {
            publish_type,
            paper_id: self.paper_id.clone(),
            version: Some(RawVersion::Text(self.version.clone())),
            src_ext: self.src_ext.clone().filter(|s| !s.is_empty()),
            source_format: self.source_format.clone().filter(|s| !s.is_empty()),
        })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume publish events and keep the bucket in sync until interrupted
    Consume {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,

        /// Use this directory as the bucket instead of GCS
        #[clap(long)]
        local_bucket: Option<PathBuf>,

        /// Pull one message, print its expected files, hand it back and exit
        #[clap(long)]
        test: bool,
    },
    /// Print the files one event expects in the bucket
    Resolve {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,

        #[clap(flatten)]
        event: EventArgs,
    },
    /// Resolve one event and reconcile it into a local bucket directory
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,

        #[clap(flatten)]
        event: EventArgs,

        /// Directory standing in for the bucket
        #[clap(long)]
        local_bucket: PathBuf,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Consume {
            config,
            local_bucket,
            test,
        } => {
            let config = load_config(config)?;
            consume(config, local_bucket, test).await
        }
        Commands::Resolve { config, event } => {
            let config = load_config(config)?;
            let expected = FileStateResolver::new(&config.legacy)
                .resolve_blocking(&event.to_event()?)
                .await
                .context("Could not resolve expected files")?;
            print_expected(&expected);
            Ok(())
        }
        Commands::Sync {
            config,
            event,
            local_bucket,
        } => {
            let config = load_config(config)?;
            let expected = FileStateResolver::new(&config.legacy)
                .resolve_blocking(&event.to_event()?)
                .await
                .context("Could not resolve expected files")?;
            let bucket = LocalObjectStore::new(local_bucket);
            let report = Reconciler::new(&bucket)
                .reconcile(&expected)
                .await
                .context("Reconcile failed")?;
            tracing::info!(command = "sync", ?report, "Sync complete");
            for key in &report.uploaded {
                println!("uploaded\t{key}");
            }
            for key in &report.unchanged {
                println!("unchanged\t{key}");
            }
            for key in &report.skipped {
                println!("skipped\t{key}");
            }
            for key in &report.trashed {
                println!("trashed\t{key}");
            }
            Ok(())
        }
    }
}

fn print_expected(expected: &ExpectedFileSet) {
    println!(
        "{} v{} ({}, {:?})",
        expected.paper,
        expected.versioned.version(),
        expected.publish_type,
        expected.state
    );
    for entry in expected.current().chain(expected.obsolete()) {
        println!(
            "{}\t{}\t{}\t{}",
            entry.status,
            entry.kind,
            entry.source_path.display(),
            entry.destination_key
        );
    }
}

/// Where a worker's objects go.
#[derive(Clone)]
enum StoreTarget {
    Gcs(StoreSection),
    Local(PathBuf),
}

/// Builds private Pub/Sub, storage and webnode clients for each worker.
struct GcpWorkerFactory {
    tokens: Arc<dyn TokenProvider>,
    broker: BrokerSection,
    store: StoreTarget,
}

impl GcpWorkerFactory {
    fn message_source(&self) -> Result<PubSubSource, BoxError> {
        // Leave room for the server-side long poll.
        let timeout = self.broker.pull_timeout() + Duration::from_secs(10);
        let api = ApiClient::new(
            self.tokens.clone(),
            RetryPolicy::with_attempts(self.broker.retry_attempts),
            timeout,
        )?;
        Ok(PubSubSource::new(api, self.broker.subscription_path()))
    }
}

#[async_trait]
impl WorkerFactory for GcpWorkerFactory {
    async fn build(&self, worker: usize) -> Result<WorkerContext, BoxError> {
        let store: Box<dyn paper_sync_core::contract::ObjectStore> = match &self.store {
            StoreTarget::Gcs(section) => {
                let api = ApiClient::new(
                    self.tokens.clone(),
                    RetryPolicy::with_attempts(section.retry_attempts),
                    STORE_REQUEST_TIMEOUT,
                )?;
                Box::new(GcsObjectStore::new(api, section.bucket.clone()))
            }
            StoreTarget::Local(root) => Box::new(LocalObjectStore::new(root.clone())),
        };
        tracing::debug!(worker, "Built worker clients");
        Ok(WorkerContext {
            source: Arc::new(self.message_source()?),
            store,
            render: Box::new(HttpRenderClient::new()?),
        })
    }
}

async fn consume(config: PaperSyncConfig, local_bucket: Option<PathBuf>, test: bool) -> Result<()> {
    let broker = config
        .broker
        .clone()
        .ok_or_else(|| anyhow!("config has no broker section"))?;

    let store = match local_bucket {
        Some(dir) => {
            info!(bucket = %dir.display(), "Using local directory as bucket");
            StoreTarget::Local(dir)
        }
        None => {
            if std::env::var_os(CREDENTIALS_ENV).is_none() {
                error!(env = CREDENTIALS_ENV, "No GCP credentials configured");
                bail!("{CREDENTIALS_ENV} must be set unless --local-bucket is given");
            }
            let section = config
                .store
                .clone()
                .ok_or_else(|| anyhow!("config has no store section"))?;
            StoreTarget::Gcs(section)
        }
    };

    let tokens = gcp_auth::provider()
        .await
        .context("Failed to initialize GCP auth")?;
    let factory = GcpWorkerFactory {
        tokens,
        broker,
        store,
    };
    let pipeline = Arc::new(SyncPipeline::new(
        config.legacy.clone(),
        config.webnodes.clone(),
        config.consumer.generation_timeout(),
    ));

    if test {
        let source = factory
            .message_source()
            .map_err(|e| anyhow!(e))
            .context("Failed to build Pub/Sub client")?;
        return inspect_one(&pipeline, &source).await;
    }

    let cancel = CancellationToken::new();
    cancel_on_signals(cancel.clone())?;
    let summary = ConsumerLoop::new(pipeline, config.consumer.clone())
        .run(&factory, cancel)
        .await
        .map_err(|e| anyhow!(e))
        .context("Consumer failed to start")?;
    info!(
        acked = summary.acked,
        nacked = summary.nacked,
        abandoned_workers = summary.abandoned_workers,
        failed_workers = summary.failed_workers,
        "Consumer exited"
    );
    Ok(())
}

async fn inspect_one(pipeline: &SyncPipeline, source: &dyn MessageSource) -> Result<()> {
    let inspected = pipeline
        .inspect_one(source)
        .await
        .map_err(|e| anyhow!(e))
        .context("Test pull failed")?;
    match inspected {
        None => println!("No message pending"),
        Some(msg) => match msg.resolution {
            Ok(expected) => {
                println!("message {}", msg.message_id);
                print_expected(&expected);
            }
            Err(e) => println!("message {}: {e}", msg.message_id),
        },
    }
    Ok(())
}

/// Cancels `cancel` on the first SIGTERM or SIGINT.
fn cancel_on_signals(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        cancel.cancel();
    });
    Ok(())
}
