/// `load_config` module: reads the YAML deployment config and applies environment overrides.
///
/// This is the only place where the config file is parsed. Everything it
/// produces is already typed: legacy prefixes and webnodes are core types, the
/// broker and store sections are consumed by the GCP adapters in this crate.
///
/// # Environment
/// - `PAPER_SYNC_BUCKET` replaces `store.bucket`
/// - `PAPER_SYNC_SUBSCRIPTION` replaces `broker.subscription`
///
/// Credentials never go in this file; `gcp_auth` finds them on its own.
///
/// # Errors
/// All errors use `anyhow::Error` with the offending path in context, and are
/// surfaced at the CLI boundary.
use anyhow::{Context, Result};
use paper_sync_core::config::{ConsumerSettings, LegacyLayout, Webnode};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

pub const BUCKET_ENV: &str = "PAPER_SYNC_BUCKET";
pub const SUBSCRIPTION_ENV: &str = "PAPER_SYNC_SUBSCRIPTION";

#[derive(Debug, Clone, Deserialize)]
pub struct PaperSyncConfig {
    #[serde(default)]
    pub legacy: LegacyLayout,
    #[serde(default)]
    pub broker: Option<BrokerSection>,
    #[serde(default)]
    pub store: Option<StoreSection>,
    #[serde(default)]
    pub webnodes: Vec<Webnode>,
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    pub project: String,
    pub subscription: String,
    /// How long one pull may wait on the server for messages.
    #[serde(default = "default_pull_timeout_secs")]
    pub pull_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

impl BrokerSection {
    pub fn subscription_path(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project, self.subscription
        )
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub bucket: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_pull_timeout_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    5
}

/// Loads `path` and applies the environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PaperSyncConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        e
    })
    .with_context(|| format!("Failed to read config file {}", path_ref.display()))?;

    let mut config: PaperSyncConfig = serde_yaml::from_str(&content)
        .map_err(|e| {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            e
        })
        .with_context(|| format!("Failed to parse config YAML {}", path_ref.display()))?;

    apply_env_overrides(&mut config);

    config.legacy.trace_loaded();
    config.consumer.trace_loaded();
    info!(
        webnodes = config.webnodes.len(),
        broker = config.broker.as_ref().map(|b| b.subscription_path()).unwrap_or_default(),
        bucket = config.store.as_ref().map(|s| s.bucket.as_str()).unwrap_or("-"),
        "Configuration loaded"
    );
    Ok(config)
}

fn apply_env_overrides(config: &mut PaperSyncConfig) {
    if let Ok(bucket) = env::var(BUCKET_ENV) {
        info!(bucket = %bucket, "Bucket overridden from environment");
        match config.store.as_mut() {
            Some(store) => store.bucket = bucket,
            None => {
                config.store = Some(StoreSection {
                    bucket,
                    retry_attempts: default_retry_attempts(),
                })
            }
        }
    }
    if let Ok(subscription) = env::var(SUBSCRIPTION_ENV) {
        match config.broker.as_mut() {
            Some(broker) => {
                info!(subscription = %subscription, "Subscription overridden from environment");
                broker.subscription = subscription;
            }
            None => warn!(
                env = SUBSCRIPTION_ENV,
                "Subscription override ignored, config has no broker section"
            ),
        }
    }
}
