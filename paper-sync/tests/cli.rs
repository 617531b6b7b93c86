use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;
use std::path::Path;
use tempfile::{tempdir, TempDir};

/// A legacy host with one replaced PDF paper, and a config pointing at it.
struct Setup {
    dir: TempDir,
    config: std::path::PathBuf,
}

fn touch(path: &Path, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    write(path, bytes).unwrap();
}

fn setup() -> Setup {
    let dir = tempdir().expect("Creating temp dir failed");
    let root = dir.path().join("legacy");
    touch(
        &root.join("data/ftp/arxiv/papers/1208/1208.9998.abs"),
        b"Date: Fri, 31 Aug 2012 12:00:00 GMT   (10kb)\n",
    );
    touch(&root.join("data/ftp/arxiv/papers/1208/1208.9998.pdf"), b"%PDF v2");
    touch(&root.join("data/orig/arxiv/papers/1208/1208.9998v1.abs"), b"Date: x\n");
    touch(&root.join("data/orig/arxiv/papers/1208/1208.9998v1.pdf"), b"%PDF v1");

    let config = dir.path().join("config.yaml");
    let yaml = format!(
        "legacy:\n  ftp_prefix: {root}/data/ftp\n  orig_prefix: {root}/data/orig\n  ps_cache_prefix: {root}/cache/ps_cache\nbroker:\n  project: test-project\n  subscription: test-sub\nstore:\n  bucket: test-bucket\nwebnodes:\n  - host: localhost:8080\n",
        root = root.display()
    );
    write(&config, yaml).expect("Writing temp config failed");
    Setup { dir, config }
}

fn paper_sync() -> Command {
    let mut cmd = Command::cargo_bin("paper-sync").expect("Binary exists");
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_every_subcommand() {
    paper_sync()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("consume")
                .and(predicate::str::contains("resolve"))
                .and(predicate::str::contains("sync")),
        );
}

#[test]
fn resolve_prints_current_and_obsolete_keys() {
    let setup = setup();
    paper_sync()
        .args(["resolve", "--config"])
        .arg(&setup.config)
        .args(["--paper-id", "1208.9998", "--version", "2", "--type", "rep", "--src-ext", ".pdf"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("ftp/arxiv/papers/1208/1208.9998.pdf")
                .and(predicate::str::contains("orig/arxiv/papers/1208/1208.9998v1.abs"))
                .and(predicate::str::contains("orig/arxiv/papers/1208/1208.9998v1.pdf"))
                .and(predicate::str::contains("obsolete")),
        );
}

#[test]
fn resolve_rejects_non_numeric_versions() {
    let setup = setup();
    paper_sync()
        .args(["resolve", "--config"])
        .arg(&setup.config)
        .args(["--paper-id", "1208.9998", "--version", "two"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a positive integer"));
}

#[test]
fn sync_into_local_bucket_is_idempotent() {
    let setup = setup();
    let bucket = setup.dir.path().join("bucket");
    let sync = || {
        let mut cmd = paper_sync();
        cmd.args(["sync", "--config"])
            .arg(&setup.config)
            .args(["--paper-id", "1208.9998", "--version", "2", "--type", "rep", "--src-ext", ".pdf"])
            .arg("--local-bucket")
            .arg(&bucket);
        cmd
    };

    sync()
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "uploaded\tftp/arxiv/papers/1208/1208.9998.pdf",
        ));
    assert!(bucket.join("orig/arxiv/papers/1208/1208.9998v1.pdf").exists());

    sync()
        .assert()
        .success()
        .stdout(
            predicate::str::contains("unchanged\tftp/arxiv/papers/1208/1208.9998.pdf")
                .and(predicate::str::contains("uploaded").not())
                .and(predicate::str::contains("trashed").not()),
        );
}

#[test]
fn consume_requires_credentials_without_local_bucket() {
    let setup = setup();
    paper_sync()
        .env_remove("GOOGLE_APPLICATION_CREDENTIALS")
        .args(["consume", "--config"])
        .arg(&setup.config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("GOOGLE_APPLICATION_CREDENTIALS"));
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*; // needed for .with()
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{event:?}"));
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use paper_sync::cli::{run, Cli, Commands, EventArgs};

    // A missing config file still gets past the first event.
    let cli = Cli {
        debug: false,
        json_log: false,
        command: Commands::Resolve {
            config: std::path::PathBuf::from("dummy.yaml"),
            event: EventArgs {
                paper_id: "1208.9998".to_string(),
                version: "1".to_string(),
                publish_type: "new".to_string(),
                src_ext: None,
                source_format: None,
            },
        },
    };

    let _ = run(cli).await;

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
