mod common;

use common::{TestPipeline, add_mapping, message, wait_until};
use fanout::store::AttemptStatus;
use std::time::Duration;

/// The test pipeline runs with a 1s retry interval; attempts become due for
/// a scan once their last touch is at least that old.
async fn let_attempts_age() {
    tokio::time::sleep(Duration::from_millis(1100)).await;
}

#[tokio::test]
async fn failed_delivery_is_retried_and_recovers() {
    let p = TestPipeline::new();
    let mapping_id = add_mapping(&p.store, "src-1", "chan-a");
    p.mock.fail_channel("chan-a");

    let worker = p.spawn_worker();
    p.queue.enqueue(&message("m1", "src-1")).await.unwrap();
    let store = p.store.clone();
    assert!(
        wait_until(
            || {
                store
                    .get_attempt("m1", mapping_id)
                    .ok()
                    .flatten()
                    .is_some_and(|a| a.status == AttemptStatus::PendingRetry)
            },
            Duration::from_secs(5)
        )
        .await
    );
    p.stop_worker(worker).await;
    assert_eq!(p.mock.call_count(), 1);

    // Destination back up: the next scan clears the attempt
    p.mock.heal();
    let_attempts_age().await;
    let retry = p.retry_service();
    assert_eq!(retry.scan_once().await.unwrap(), 1);
    assert_eq!(p.mock.call_count(), 2);
    assert!(p.store.get_attempt("m1", mapping_id).unwrap().is_none());
}

#[tokio::test]
async fn exhausted_attempts_turn_terminal_and_leave_the_scan() {
    let mut p = TestPipeline::new();
    p.config.max_retries = 2;
    let mapping_id = add_mapping(&p.store, "src-1", "chan-a");
    p.mock.fail_channel("chan-a");

    let worker = p.spawn_worker();
    p.queue.enqueue(&message("m1", "src-1")).await.unwrap();
    let store = p.store.clone();
    assert!(
        wait_until(
            || store.get_attempt("m1", mapping_id).ok().flatten().is_some(),
            Duration::from_secs(5)
        )
        .await
    );
    p.stop_worker(worker).await;

    let retry = p.retry_service();
    for expected_count in 1..=2u32 {
        let_attempts_age().await;
        assert_eq!(retry.scan_once().await.unwrap(), 0);
        let attempt = p.store.get_attempt("m1", mapping_id).unwrap().unwrap();
        assert_eq!(attempt.retry_count, expected_count);
    }

    let attempt = p.store.get_attempt("m1", mapping_id).unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::PermanentlyFailed);

    // Terminal rows are invisible to later scans even after healing
    p.mock.heal();
    let_attempts_age().await;
    assert_eq!(retry.scan_once().await.unwrap(), 0);
    assert_eq!(p.mock.call_count(), 3);
}
