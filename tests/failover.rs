mod common;

use common::{config, content, manager, manager_builder, token, MockStorage, HOST_A, HOST_B};
use resumable_uploader::domains::DomainsManager;
use resumable_uploader::error::{ErrorKind, RetryKind};
use resumable_uploader::time::{Clock, ManualClock};
use std::sync::Arc;
use std::time::Duration;

const FREEZE: Duration = Duration::from_secs(600);

#[tokio::test]
async fn test_failed_host_is_frozen_for_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let storage = MockStorage::new();
    let clock = ManualClock::default();
    let domains = Arc::new(
        DomainsManager::builder()
            .clock(Arc::new(clock.clone()))
            .freeze_duration(FREEZE)
            .build(),
    );
    let config = config(dir.path()).domain_freeze_duration(FREEZE).build();
    let manager = manager_builder(config, &storage)
        .domains(Arc::clone(&domains))
        .build()
        .unwrap();
    storage.break_host(HOST_A, 503);

    manager
        .upload_for(token("bucket"))
        .upload_bytes(content(64, 1))
        .await
        .unwrap();
    assert_eq!(storage.requests_to(HOST_A), 1);
    assert_eq!(storage.requests_to(HOST_B), 1);
    assert!(domains.is_frozen(HOST_A));
    assert!(!domains.is_frozen(HOST_B));

    // inside the window the frozen host is skipped entirely
    clock.advance(FREEZE - Duration::from_secs(1));
    manager
        .upload_for(token("bucket"))
        .upload_bytes(content(64, 2))
        .await
        .unwrap();
    assert_eq!(storage.requests_to(HOST_A), 1);
    assert_eq!(storage.requests_to(HOST_B), 2);

    // once it elapses the host is a candidate again
    clock.advance(Duration::from_secs(2));
    assert!(!domains.is_frozen(HOST_A));
    manager
        .upload_for(token("bucket"))
        .upload_bytes(content(64, 3))
        .await
        .unwrap();
    assert_eq!(storage.requests_to(HOST_A), 2);
    assert_eq!(storage.requests_to(HOST_B), 3);
}

#[tokio::test]
async fn test_all_hosts_down_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let storage = MockStorage::new();
    let manager = manager(config(dir.path()).retries(3).build(), &storage);
    storage.break_host(HOST_A, 503);
    storage.break_host(HOST_B, 503);

    let err = manager
        .upload_for(token("bucket"))
        .upload_bytes(content(64, 4))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResponseStatusCode);
    let decision = err.retry_decision().unwrap();
    assert_eq!(decision.retry_kind, RetryKind::HostUnretryable);
    assert_eq!(storage.requests().len(), 4);
    assert!(manager.domains().is_frozen(HOST_A));
    assert!(manager.domains().is_frozen(HOST_B));
}

#[tokio::test]
async fn test_retryable_status_rotates_without_freezing() {
    let dir = tempfile::tempdir().unwrap();
    let storage = MockStorage::new();
    let manager = manager(config(dir.path()).build(), &storage);
    storage.break_host(HOST_A, 500);

    manager
        .upload_for(token("bucket"))
        .upload_bytes(content(64, 5))
        .await
        .unwrap();

    assert_eq!(storage.requests_to(HOST_A), 1);
    assert_eq!(storage.requests_to(HOST_B), 1);
    assert!(!manager.domains().is_frozen(HOST_A));
}

#[tokio::test]
async fn test_unretryable_status_fails_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let storage = MockStorage::new();
    let manager = manager(config(dir.path()).build(), &storage);
    storage.break_host(HOST_A, 401);

    let err = manager
        .upload_for(token("bucket"))
        .upload_bytes(content(64, 6))
        .await
        .unwrap_err();

    assert_eq!(err.retry_decision().unwrap().retry_kind, RetryKind::Unretryable);
    assert_eq!(storage.requests().len(), 1);
    assert!(!manager.domains().is_frozen(HOST_A));
}

#[tokio::test]
async fn test_chunked_upload_fails_over_between_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let storage = MockStorage::new();
    let manager = manager(config(dir.path()).build(), &storage);
    storage.break_host(HOST_A, 502);

    let data = content(9 << 20, 7);
    let response = manager
        .upload_for(token("bucket"))
        .key("failover.bin")
        .max_concurrency(1)
        .upload_bytes(data.clone())
        .await
        .unwrap();

    assert_eq!(response.key(), Some("failover.bin"));
    // first block hits the broken host once, everything after goes to the healthy one
    assert_eq!(storage.requests_to(HOST_A), 1);
    assert_eq!(storage.requests_to(HOST_B), 4);
}

#[test]
fn test_manual_clock_drives_freeze_expiry() {
    let clock = ManualClock::default();
    let domains = DomainsManager::builder()
        .clock(Arc::new(clock.clone()))
        .build();
    let start = clock.now();

    domains.freeze(HOST_A, FREEZE);
    assert!(domains.is_frozen(HOST_A));
    clock.set(start + chrono::Duration::seconds(600));
    assert!(!domains.is_frozen(HOST_A));
}
