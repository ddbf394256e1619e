mod common;

use common::{config, content, manager, token, MockStorage};
use resumable_uploader::batch::{BatchJob, BatchReport};
use resumable_uploader::uplog::{LockPolicy, UplogRecord};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

const MIB: usize = 1 << 20;

fn local_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn batch_ships_log(policy: LockPolicy) {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("uplog").join("uplog.log");
    let storage = MockStorage::new();
    storage.delay_uplog(Duration::from_millis(200));
    let config = config(dir.path())
        .uplog_enabled(true)
        .uplog_host("uplog.test")
        .uplog_path(&log_path)
        .uplog_upload_threshold(1)
        .uplog_lock_policy(policy)
        .build();
    let manager = manager(config, &storage);
    let batch = manager.batch_for(token("bucket")).thread_pool_size(8);

    for i in 0..8 {
        let size = if i % 2 == 0 { 2000 } else { 5 * MIB };
        let job = BatchJob::builder()
            .key(format!("logged/{}", i))
            .upload_bytes(content(size, 300 + i as u64));
        batch.submit(job).unwrap();
    }

    let report = tokio::time::timeout(Duration::from_secs(20), batch.start())
        .await
        .expect("batch stalled while the upload log was shipping");
    assert_eq!(report, BatchReport { succeeded: 8, failed: 0 }, "{:?}", policy);
    for i in 0..8 {
        assert!(storage.object(&format!("logged/{}", i)).is_some());
    }

    // every exchange is logged exactly once, either shipped or still on disk
    wait_for(|| storage.uplog_calls.load(Ordering::SeqCst) > 0).await;
    wait_for(|| storage.uplog_lines().len() + local_lines(&log_path) == storage.exchanges()).await;

    for line in storage.uplog_lines() {
        let record: UplogRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(record.status_code, Some(200));
    }
}

#[tokio::test]
async fn test_batch_with_shared_append_lock_ships_log() {
    batch_ships_log(LockPolicy::SharedAppendExclusiveUpload).await;
}

#[tokio::test]
async fn test_batch_with_exclusive_lock_ships_log() {
    batch_ships_log(LockPolicy::AlwaysExclusive).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_on_multi_thread_runtime_ships_log() {
    batch_ships_log(LockPolicy::AlwaysExclusive).await;
}
