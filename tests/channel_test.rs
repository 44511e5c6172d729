//! Command channel behavior through the public API: outage parking,
//! reconnect-on-publish, async-mode error events.

use sitesync::{
    BrokerConfig, MemoryBroker, QueueConfig, SyncConfig, SyncError, SyncEvent, Synchroniser,
    TransmitterEndpoint,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const QUEUE: &str = "usync_test.syncTest";

fn config(watch: &Path, is_run_sync: bool) -> SyncConfig {
    let mut transmitters = HashMap::new();
    // Nothing listens here; these tests only exercise the control plane.
    transmitters.insert(
        "reserve".into(),
        TransmitterEndpoint {
            address: "127.0.0.1".into(),
            port: 9,
            storage_root: None,
            reconnect_delay_ms: 10_000,
            queue_prefix: "usync_test".into(),
        },
    );
    SyncConfig {
        is_run_sync,
        confirm: Default::default(),
        origin: "test".into(),
        queue_name: "syncTest".into(),
        watch_dirs: vec![watch.to_path_buf()],
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
    }
}

#[tokio::test]
async fn sync_mode_surfaces_publish_failure_and_recovers() {
    let tmp = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let sync = Synchroniser::start_with_broker(config(tmp.path(), true), Arc::new(broker.clone()))
        .await
        .unwrap();
    let fs = sync.fs();

    broker.set_down(true);
    let first = tmp.path().join("first.txt");
    match fs.write_file(&first, "one").await {
        Err(SyncError::Publish(_)) => {}
        other => panic!("expected Publish error, got {other:?}"),
    }
    // The local action is never skipped, even when propagation fails.
    assert_eq!(std::fs::read_to_string(&first).unwrap(), "one");
    assert!(broker.published(QUEUE).is_empty());

    broker.set_down(false);
    fs.write_file(tmp.path().join("second.txt"), "two")
        .await
        .unwrap();

    // The parked record is flushed before the new one.
    let bodies = broker.published(QUEUE);
    assert_eq!(bodies.len(), 2);
    let first_record: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert!(first_record["paths"][0]
        .as_str()
        .unwrap()
        .ends_with("first.txt"));
}

#[tokio::test]
async fn async_mode_reports_publish_failure_on_event_channel() {
    let tmp = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let sync = Synchroniser::start_with_broker(config(tmp.path(), false), Arc::new(broker.clone()))
        .await
        .unwrap();
    let mut events = sync.subscribe();
    let fs = sync.fs();

    broker.set_down(true);
    let path = tmp.path().join("async.txt");
    // The caller sees only the local outcome.
    fs.write_file(&path, "content").await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "content");

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                SyncEvent::PropagationError { site, error, .. } => break (site, error),
                _ => continue,
            }
        }
    })
    .await
    .expect("no propagation event");
    assert_eq!(event.0, "broker");
}

#[tokio::test]
async fn unwatched_paths_are_local_only() {
    let tmp = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    let sync = Synchroniser::start_with_broker(config(tmp.path(), true), Arc::new(broker.clone()))
        .await
        .unwrap();
    let fs = sync.fs();

    let path = outside.path().join("elsewhere.txt");
    fs.write_file(&path, "local only").await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "local only");
    assert!(broker.published(QUEUE).is_empty());
}
