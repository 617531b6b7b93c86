use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

use paper_sync_core::config::{ConsumerSettings, LegacyLayout, Webnode};
use paper_sync_core::consumer::{
    ConsumerLoop, InspectError, MessageOutcome, SyncPipeline, WorkerContext, WorkerFactory,
};
use paper_sync_core::contract::{
    BoxError, MessageSource, MockMessageSource, MockObjectStore, MockRenderClient, ObjectStore,
    ReceivedMessage, RenderReceipt,
};
use paper_sync_core::identifier::PaperId;
use paper_sync_core::local_store::LocalObjectStore;

const TEX_EVENT: &str =
    r#"{"type":"new","paper_id":"1208.9998","version":1,"src_ext":".tar.gz","source_format":"tex"}"#;

fn message(data: &str) -> ReceivedMessage {
    ReceivedMessage {
        message_id: "m-1".to_string(),
        ack_id: "ack-1".to_string(),
        data: data.as_bytes().to_vec(),
    }
}

fn touch(path: &Path, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

struct Host {
    dir: TempDir,
    layout: LegacyLayout,
}

/// Legacy host with a tex paper whose PDF is not rendered yet.
fn host() -> Host {
    let dir = tempdir().unwrap();
    let layout = LegacyLayout::under(&dir.path().join("legacy"));
    let paper = PaperId::parse("1208.9998").unwrap();
    touch(&layout.source_path(&paper, ".abs"), b"Date: x (1kb)\n");
    touch(&layout.source_path(&paper, ".tar.gz"), b"tar");
    Host { dir, layout }
}

impl Host {
    fn render_pdf(&self) {
        let paper = PaperId::parse("1208.9998").unwrap();
        touch(&self.layout.pdf_cache_path(&paper.versioned(1)), b"%PDF");
    }

    fn pipeline(&self) -> SyncPipeline {
        SyncPipeline::new(
            self.layout.clone(),
            vec![Webnode {
                host: "web-1.example.org".to_string(),
                parallelism: 2,
            }],
            Duration::from_secs(2),
        )
    }
}

fn source_expecting(ack: bool) -> MockMessageSource {
    let mut source = MockMessageSource::new();
    if ack {
        source
            .expect_ack()
            .withf(|id: &str| id == "ack-1")
            .times(1)
            .returning(|_| Ok(()));
        source.expect_nack().times(0);
    } else {
        source
            .expect_nack()
            .withf(|id: &str| id == "ack-1")
            .times(1)
            .returning(|_| Ok(()));
        source.expect_ack().times(0);
    }
    source
}

fn untouched_store() -> MockObjectStore {
    let mut store = MockObjectStore::new();
    store.expect_list().times(0);
    store.expect_upload().times(0);
    store.expect_rename().times(0);
    store
}

fn idle_render() -> MockRenderClient {
    let mut render = MockRenderClient::new();
    render.expect_request_render().times(0);
    render
}

#[tokio::test]
async fn malformed_payload_is_nacked_without_side_effects() {
    let host = host();
    let ctx = WorkerContext {
        source: Arc::new(source_expecting(false)),
        store: Box::new(untouched_store()),
        render: Box::new(idle_render()),
    };
    let outcome = host.pipeline().handle(&ctx, &message("{oops")).await;
    assert!(matches!(outcome, MessageOutcome::Malformed(_)));
}

#[tokio::test]
async fn invalid_version_is_nacked() {
    let host = host();
    let ctx = WorkerContext {
        source: Arc::new(source_expecting(false)),
        store: Box::new(untouched_store()),
        render: Box::new(idle_render()),
    };
    let outcome = host
        .pipeline()
        .handle(
            &ctx,
            &message(r#"{"type":"new","paper_id":"1208.9998","version":0,"src_ext":".pdf"}"#),
        )
        .await;
    assert!(matches!(outcome, MessageOutcome::ResolveFailed { .. }));
}

#[tokio::test]
async fn missing_pdf_asks_a_webnode_then_nacks() {
    let host = host();
    let mut render = MockRenderClient::new();
    render
        .expect_request_render()
        .withf(|node: &Webnode, _, idv: &str, timeout: &Duration| {
            node.host == "web-1.example.org" && idv == "1208.9998v1" && *timeout == Duration::from_secs(2)
        })
        .times(1)
        .returning(|_, _, _, _| Err("timed out".into()));
    let ctx = WorkerContext {
        source: Arc::new(source_expecting(false)),
        store: Box::new(untouched_store()),
        render: Box::new(render),
    };

    let outcome = host.pipeline().handle(&ctx, &message(TEX_EVENT)).await;
    assert!(matches!(outcome, MessageOutcome::MissingGeneratedFile(_)));
}

#[tokio::test]
async fn generated_on_request_then_synced_and_acked() {
    let host = host();
    let bucket = LocalObjectStore::new(host.dir.path().join("bucket"));
    let pdf = host
        .layout
        .pdf_cache_path(&PaperId::parse("1208.9998").unwrap().versioned(1));
    let mut render = MockRenderClient::new();
    render
        .expect_request_render()
        .times(1)
        .returning(move |_, _, _, _| {
            touch(&pdf, b"%PDF");
            Ok(RenderReceipt {
                source_url: "https://web-1.example.org/pdf/1208.9998v1".to_string(),
                status: 200,
                duration: Duration::from_millis(40),
            })
        });
    let ctx = WorkerContext {
        source: Arc::new(source_expecting(true)),
        store: Box::new(bucket.clone()),
        render: Box::new(render),
    };

    let outcome = host.pipeline().handle(&ctx, &message(TEX_EVENT)).await;
    let report = match outcome {
        MessageOutcome::Synced(report) => report,
        other => panic!("expected a synced outcome, got {other:?}"),
    };
    assert_eq!(report.uploaded.len(), 3);
    assert!(bucket
        .list("ps_cache/")
        .await
        .unwrap()
        .contains(&"ps_cache/arxiv/pdf/1208/1208.9998v1.pdf".to_string()));
}

#[tokio::test]
async fn reconcile_failure_is_nacked() {
    let host = host();
    host.render_pdf();
    let mut store = MockObjectStore::new();
    store
        .expect_list()
        .returning(|_| Err("503 from storage".into()));
    let ctx = WorkerContext {
        source: Arc::new(source_expecting(false)),
        store: Box::new(store),
        render: Box::new(idle_render()),
    };

    let outcome = host.pipeline().handle(&ctx, &message(TEX_EVENT)).await;
    assert!(matches!(outcome, MessageOutcome::ReconcileFailed(_)));
}

#[tokio::test]
async fn inspect_one_resolves_and_hands_the_message_back() {
    let host = host();
    let mut source = source_expecting(false);
    source
        .expect_pull()
        .withf(|max: &usize| *max == 1)
        .times(1)
        .returning(|_| Ok(vec![message(TEX_EVENT)]));

    let inspected = host.pipeline().inspect_one(&source).await.unwrap().unwrap();
    assert_eq!(inspected.message_id, "m-1");
    let set = inspected.resolution.unwrap();
    assert_eq!(set.entries.len(), 3);

    let mut source = source_expecting(false);
    source
        .expect_pull()
        .returning(|_| Ok(vec![message("[]")]));
    let inspected = host.pipeline().inspect_one(&source).await.unwrap().unwrap();
    assert!(matches!(inspected.resolution, Err(InspectError::Malformed(_))));

    let mut empty = MockMessageSource::new();
    empty.expect_pull().returning(|_| Ok(vec![]));
    assert!(host.pipeline().inspect_one(&empty).await.unwrap().is_none());
}

/// Hands out each queued message once, then nothing.
struct QueueSource {
    queue: std::sync::Mutex<Vec<ReceivedMessage>>,
    acked: AtomicUsize,
    nacked: AtomicUsize,
    settle_delay: Duration,
}

impl QueueSource {
    fn new(messages: Vec<ReceivedMessage>, settle_delay: Duration) -> Self {
        Self {
            queue: std::sync::Mutex::new(messages),
            acked: AtomicUsize::new(0),
            nacked: AtomicUsize::new(0),
            settle_delay,
        }
    }

    async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }
}

#[async_trait]
impl MessageSource for QueueSource {
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, BoxError> {
        let mut queue = self.queue.lock().unwrap();
        let take = max_messages.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn ack(&self, _ack_id: &str) -> Result<(), BoxError> {
        self.settle().await;
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, _ack_id: &str) -> Result<(), BoxError> {
        self.settle().await;
        self.nacked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Factory {
    source: Arc<QueueSource>,
    bucket: LocalObjectStore,
    fail: AtomicBool,
}

#[async_trait]
impl WorkerFactory for Factory {
    async fn build(&self, _worker: usize) -> Result<WorkerContext, BoxError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("no credentials".into());
        }
        Ok(WorkerContext {
            source: self.source.clone(),
            store: Box::new(self.bucket.clone()),
            render: Box::new(idle_render()),
        })
    }
}

fn settings(workers: usize) -> ConsumerSettings {
    ConsumerSettings {
        workers,
        max_messages: 2,
        shutdown_timeout_secs: 1,
        generation_timeout_secs: 2,
        idle_backoff_ms: 10,
    }
}

#[tokio::test]
async fn loop_processes_until_cancelled() {
    let host = host();
    host.render_pdf();
    let source = Arc::new(QueueSource::new(
        vec![message(TEX_EVENT), message("not json"), message(TEX_EVENT)],
        Duration::ZERO,
    ));
    let factory = Factory {
        source: source.clone(),
        bucket: LocalObjectStore::new(host.dir.path().join("bucket")),
        fail: AtomicBool::new(false),
    };
    let consumer = ConsumerLoop::new(Arc::new(host.pipeline()), settings(2));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let summary = consumer.run(&factory, cancel).await.unwrap();
    assert_eq!(summary.acked, 2);
    assert_eq!(summary.nacked, 1);
    assert_eq!(summary.abandoned_workers, 0);
    assert_eq!(source.acked.load(Ordering::SeqCst), 2);
    assert_eq!(source.nacked.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stuck_workers_are_abandoned_after_the_shutdown_timeout() {
    let host = host();
    let source = Arc::new(QueueSource::new(
        vec![message("not json")],
        Duration::from_secs(3600),
    ));
    let factory = Factory {
        source: source.clone(),
        bucket: LocalObjectStore::new(host.dir.path().join("bucket")),
        fail: AtomicBool::new(false),
    };
    let consumer = ConsumerLoop::new(Arc::new(host.pipeline()), settings(1));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let summary = consumer.run(&factory, cancel).await.unwrap();
    assert_eq!(summary.abandoned_workers, 1);
    assert_eq!(source.nacked.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn in_flight_messages_finish_after_cancellation() {
    let host = host();
    let source = Arc::new(QueueSource::new(
        vec![message("not json")],
        Duration::from_millis(300),
    ));
    let factory = Factory {
        source: source.clone(),
        bucket: LocalObjectStore::new(host.dir.path().join("bucket")),
        fail: AtomicBool::new(false),
    };
    let consumer = ConsumerLoop::new(Arc::new(host.pipeline()), settings(1));

    // Cancelled while the nack is still on its way to the broker.
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let summary = consumer.run(&factory, cancel).await.unwrap();
    assert_eq!(summary.nacked, 1);
    assert_eq!(summary.abandoned_workers, 0);
    assert_eq!(source.nacked.load(Ordering::SeqCst), 1);
}

/// Every pull blows up the worker task.
struct PanickingSource;

#[async_trait]
impl MessageSource for PanickingSource {
    async fn pull(&self, _max_messages: usize) -> Result<Vec<ReceivedMessage>, BoxError> {
        panic!("broker client bug");
    }

    async fn ack(&self, _ack_id: &str) -> Result<(), BoxError> {
        Ok(())
    }

    async fn nack(&self, _ack_id: &str) -> Result<(), BoxError> {
        Ok(())
    }
}

struct PanickingFactory {
    bucket: LocalObjectStore,
}

#[async_trait]
impl WorkerFactory for PanickingFactory {
    async fn build(&self, _worker: usize) -> Result<WorkerContext, BoxError> {
        Ok(WorkerContext {
            source: Arc::new(PanickingSource),
            store: Box::new(self.bucket.clone()),
            render: Box::new(idle_render()),
        })
    }
}

#[tokio::test]
async fn dead_workers_are_noticed_without_a_shutdown() {
    let host = host();
    let factory = PanickingFactory {
        bucket: LocalObjectStore::new(host.dir.path().join("bucket")),
    };
    let consumer = ConsumerLoop::new(Arc::new(host.pipeline()), settings(2));

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        consumer.run(&factory, CancellationToken::new()),
    )
    .await
    .expect("run should return once every worker has died")
    .unwrap();
    assert_eq!(summary.failed_workers, 2);
    assert_eq!(summary.acked + summary.nacked, 0);
    assert_eq!(summary.abandoned_workers, 0);
}

#[tokio::test]
async fn failing_worker_setup_is_fatal() {
    let host = host();
    let factory = Factory {
        source: Arc::new(QueueSource::new(vec![], Duration::ZERO)),
        bucket: LocalObjectStore::new(host.dir.path().join("bucket")),
        fail: AtomicBool::new(true),
    };
    let consumer = ConsumerLoop::new(Arc::new(host.pipeline()), settings(3));
    let err = consumer
        .run(&factory, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no credentials");
}
