//! Loopback end-to-end: a real receiver on 127.0.0.1, a real transmitter,
//! and an in-memory broker. Covers both synchronization modes.

use sitesync::{
    BrokerConfig, ConfirmLevel, Directive, MemoryBroker, QueueConfig, RunningReceiver,
    SiteReceiver, SiteReceiverConfig, SyncConfig, SyncEvent, Synchroniser, TransmitterEndpoint,
};
use serial_test::serial;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

const QUEUE: &str = "usync_test.syncTest";

struct Harness {
    _watch_tmp: TempDir,
    _storage_tmp: TempDir,
    watch: PathBuf,
    storage: PathBuf,
    broker: MemoryBroker,
    sync: Synchroniser,
    running: RunningReceiver,
}

async fn setup(is_run_sync: bool, confirm: ConfirmLevel, max_payload: u64) -> Harness {
    let watch_tmp = TempDir::new().unwrap();
    let storage_tmp = TempDir::new().unwrap();
    let watch = watch_tmp.path().join("sites");
    std::fs::create_dir_all(&watch).unwrap();
    let storage = storage_tmp.path().to_path_buf();

    let receiver = SiteReceiver::new(SiteReceiverConfig::new(storage.clone(), max_payload));
    let running = receiver.bind("127.0.0.1:0").await.unwrap();

    let mut transmitters = HashMap::new();
    transmitters.insert(
        "reserve".into(),
        TransmitterEndpoint {
            address: "127.0.0.1".into(),
            port: running.local_addr().port(),
            storage_root: None,
            reconnect_delay_ms: 50,
            queue_prefix: "usync_test".into(),
        },
    );
    let config = SyncConfig {
        is_run_sync,
        confirm,
        origin: "test".into(),
        queue_name: "syncTest".into(),
        watch_dirs: vec![watch.clone()],
        broker: BrokerConfig {
            host: "localhost".into(),
            port: 5672,
            username: "guest".into(),
            password: "guest".into(),
            vhost: String::new(),
            heartbeat: 0,
            idle_close_ms: None,
            queue: QueueConfig::default(),
        },
        receivers: HashMap::new(),
        transmitters,
    };

    let broker = MemoryBroker::new();
    let sync = Synchroniser::start_with_broker(config, Arc::new(broker.clone()))
        .await
        .unwrap();

    Harness {
        _watch_tmp: watch_tmp,
        _storage_tmp: storage_tmp,
        watch,
        storage,
        broker,
        sync,
        running,
    }
}

#[tokio::test]
async fn sync_write_lands_in_site_storage() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let dir = h.watch.join("a/b/c/abc-sitename");
    fs.mkdirp(&dir).await.unwrap();
    fs.write_file(dir.join("tmpFile.txt"), "example text...")
        .await
        .unwrap();

    // Receipt mode: the receiver has applied before the call returned.
    let replicated = h.storage.join("a/b/c/abc-sitename/tmpFile.txt");
    assert_eq!(
        std::fs::read_to_string(replicated).unwrap(),
        "example text..."
    );

    // And the task metadata went out on the site queue.
    let bodies = h.broker.published(QUEUE);
    assert_eq!(bodies.len(), 2);
    let record: serde_json::Value = serde_json::from_slice(&bodies[1]).unwrap();
    assert_eq!(record["op"], "write");
    assert_eq!(record["origin"], "test");
    assert_eq!(record["seq"], 1);
}

#[tokio::test]
async fn override_directive_replaces_description() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let path = h.watch.join("custom.txt");
    fs.with(Directive::describe("custom write file"))
        .write_file(&path, "example text...")
        .await
        .unwrap();

    let bodies = h.broker.published(QUEUE);
    let record: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(record["description"], "custom write file");
}

#[tokio::test]
async fn skip_directive_suppresses_propagation() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let path = h.watch.join("skipped.txt");
    fs.with(Directive::skip())
        .write_file(&path, "local only")
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "local only");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.broker.published(QUEUE).is_empty());
    assert!(!h.storage.join("skipped.txt").exists());
}

#[tokio::test]
async fn close_channel_then_write_reconnects_and_delivers() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    fs.write_file(h.watch.join("before.txt"), "one")
        .await
        .unwrap();

    h.sync.channel().close().await.unwrap();

    fs.write_file(h.watch.join("after.txt"), "two")
        .await
        .unwrap();

    assert_eq!(h.broker.published(QUEUE).len(), 2);
    assert_eq!(h.broker.connect_count(), 2);
    assert_eq!(
        std::fs::read_to_string(h.storage.join("after.txt")).unwrap(),
        "two"
    );
}

#[tokio::test]
#[serial]
async fn async_transfer_failure_reaches_only_the_event_channel() {
    let h = setup(false, ConfirmLevel::Publish, 10 * 1024 * 1024).await;
    // Kill the receiver so every transfer fails.
    h.running.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut events = h.sync.subscribe();
    let fs = h.sync.fs();

    let path = h.watch.join("orphan.txt");
    // The caller's completion carries only the local outcome.
    fs.write_file(&path, "content").await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "content");

    let site = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.unwrap() {
                SyncEvent::PropagationError { site, .. } => break site,
                _ => continue,
            }
        }
    })
    .await
    .expect("no propagation event");
    assert_eq!(site, "reserve");
}

#[tokio::test]
async fn stream_write_replicates_on_clean_shutdown() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let path = h.watch.join("streamed.txt");
    let mut stream = fs.create_write_stream(&path).await.unwrap();
    stream.write_all(b"streamed ").await.unwrap();
    stream.write_all(b"content").await.unwrap();
    stream.shutdown().await.unwrap();

    assert_eq!(
        std::fs::read_to_string(h.storage.join("streamed.txt")).unwrap(),
        "streamed content"
    );
}

#[tokio::test]
async fn abandoned_stream_emits_no_task() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let path = h.watch.join("abandoned.txt");
    let mut stream = fs.create_write_stream(&path).await.unwrap();
    stream.write_all(b"partial").await.unwrap();
    drop(stream);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.broker.published(QUEUE).is_empty());
    assert!(!h.storage.join("abandoned.txt").exists());
}

#[tokio::test]
async fn stream_with_skip_directive_stays_local() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let path = h.watch.join("skipped_stream.txt");
    let mut stream = fs
        .with(Directive::skip())
        .create_write_stream(&path)
        .await
        .unwrap();
    stream.write_all(b"local only").await.unwrap();
    stream.shutdown().await.unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "local only");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.broker.published(QUEUE).is_empty());
}

#[tokio::test]
async fn same_path_operations_apply_in_submission_order() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let path = h.watch.join("ordered.txt");
    fs.write_file(&path, "one").await.unwrap();
    fs.write_file(&path, "two").await.unwrap();
    fs.write_file(&path, "three").await.unwrap();

    assert_eq!(
        std::fs::read_to_string(h.storage.join("ordered.txt")).unwrap(),
        "three"
    );
    let bodies = h.broker.published(QUEUE);
    let last: serde_json::Value = serde_json::from_slice(&bodies[2]).unwrap();
    assert_eq!(last["seq"], 3);
}

#[tokio::test]
async fn rename_replicates_as_rename() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let from = h.watch.join("from.txt");
    fs.write_file(&from, "payload").await.unwrap();
    fs.rename(&from, h.watch.join("to.txt")).await.unwrap();

    assert!(!h.storage.join("from.txt").exists());
    assert_eq!(
        std::fs::read_to_string(h.storage.join("to.txt")).unwrap(),
        "payload"
    );
}

#[tokio::test]
async fn unlink_removes_replica() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let path = h.watch.join("gone.txt");
    fs.write_file(&path, "short lived").await.unwrap();
    assert!(h.storage.join("gone.txt").exists());

    fs.unlink(&path).await.unwrap();
    assert!(!h.storage.join("gone.txt").exists());
}

#[tokio::test]
async fn copy_from_outside_the_tree_carries_content() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let outside = TempDir::new().unwrap();
    let src = outside.path().join("testfile.tmp");
    std::fs::write(&src, "example text...").unwrap();

    let fs = h.sync.fs();
    fs.copy(&src, h.watch.join("imported.txt")).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(h.storage.join("imported.txt")).unwrap(),
        "example text..."
    );
}

#[tokio::test]
async fn directory_copy_within_tree_replicates_recursively() {
    let h = setup(true, ConfirmLevel::Receipt, 10 * 1024 * 1024).await;
    let fs = h.sync.fs();

    let dir = h.watch.join("site_a");
    fs.mkdirp(dir.join("nested")).await.unwrap();
    fs.write_file(dir.join("nested/page.html"), "<html/>")
        .await
        .unwrap();
    fs.copy(&dir, h.watch.join("site_a_copy")).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(h.storage.join("site_a_copy/nested/page.html")).unwrap(),
        "<html/>"
    );
}

#[tokio::test]
#[serial]
async fn oversize_payload_fails_the_synchronous_call() {
    let h = setup(true, ConfirmLevel::Receipt, 8).await;
    let fs = h.sync.fs();

    let path = h.watch.join("big.txt");
    let err = fs
        .write_file(&path, "definitely more than eight bytes")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds"), "got: {err}");

    // Local write still happened; only propagation failed.
    assert!(path.exists());
    assert!(!h.storage.join("big.txt").exists());
}
