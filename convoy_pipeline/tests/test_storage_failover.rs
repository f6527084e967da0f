use std::time::Duration;

use convoy_storage::{ErrorCode, StorageError};
use serde_json::json;

mod common;

use common::{
    assert_drained, create_storage, default_options, event, start_pipeline_with, state_rows,
    wait_until,
};
use convoy_pipeline::{PipelineError, test_utils::RecordingNotifier};

fn server_busy() -> StorageError {
    StorageError::service(503, ErrorCode::Other("ServerBusy".into()), "The server is busy.")
}

#[tokio::test(start_paused = true)]
async fn test_rejected_key_rotates_to_the_next_one() {
    let options = default_options().with_save_notified_blobs_records(true);
    let (storage, faults) = create_storage();
    storage.set_accepted_keys("account1", Some(vec!["key2".to_string()]));
    let test = start_pipeline_with(
        options.clone(),
        storage,
        faults,
        RecordingNotifier::new().into(),
    )
    .await;

    test.pipeline
        .client()
        .append(event(json!({"message": "rotated"})))
        .await
        .expect("append");

    wait_until("notification", || test.notifier.envelopes().len() == 1).await;

    let accounts = &test.pipeline.services().accounts;
    assert_eq!(accounts.valid_key_index("account1"), Some(1));
    assert!(accounts.is_account_on("account1"));

    let uploads: Vec<_> = test
        .faults
        .calls()
        .into_iter()
        .filter(|call| call.operation == "put_block")
        .collect();
    assert_eq!(uploads.last().map(|call| call.key.as_str()), Some("key2"));

    test.pipeline.shutdown().await.expect("shutdown");
    assert_drained(&test.pipeline);
    assert_eq!(state_rows(&test.storage, &options, "account1").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_account_fails_over() {
    let options = default_options()
        .with_account("account2", &["key1"])
        .with_save_notified_blobs_records(true);
    let (storage, faults) = create_storage();
    faults.fail("account1", "put_block", server_busy(), usize::MAX);
    let test = start_pipeline_with(
        options.clone(),
        storage,
        faults,
        RecordingNotifier::new().into(),
    )
    .await;

    test.pipeline
        .client()
        .append(event(json!({"message": "failover"})))
        .await
        .expect("append");

    wait_until("notification", || test.notifier.envelopes().len() == 1).await;
    wait_until("notified", || {
        test.pipeline.state().pending_notifications() == 0
    })
    .await;

    let rows = state_rows(&test.storage, &options, "account2").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1.storage_account.as_deref(), Some("account2"));
    assert_eq!(rows[0].1.uploaded_events_count, 1);

    test.pipeline.shutdown().await.expect("shutdown");
    assert_drained(&test.pipeline);
}

#[tokio::test(start_paused = true)]
async fn test_blocks_wait_for_a_dead_account_to_come_back() {
    let options = default_options()
        .with_resurrect_delay(Duration::from_secs(10))
        .with_side_queue_retry_delay(Duration::from_secs(5));
    let (storage, faults) = create_storage();
    // Every try of the first upload fails, taking the only account off.
    faults.fail(
        "account1",
        "put_block",
        server_busy(),
        options.io_max_tries() as usize,
    );
    let test = start_pipeline_with(options, storage, faults, RecordingNotifier::new().into()).await;

    test.pipeline
        .client()
        .append(event(json!({"message": "patient"})))
        .await
        .expect("append");

    let accounts = test.pipeline.services().accounts.clone();
    wait_until("account off", || !accounts.is_account_on("account1")).await;
    assert!(test.pipeline.state().bytes_in_memory() > 0);

    wait_until("account back on", || accounts.is_account_on("account1")).await;
    wait_until("notification", || test.notifier.envelopes().len() == 1).await;

    test.pipeline.shutdown().await.expect("shutdown");
    assert_drained(&test.pipeline);

    let create_container_calls = test
        .faults
        .operations("account1")
        .into_iter()
        .filter(|operation| *operation == "create_container")
        .count();
    assert!(create_container_calls >= 1, "the account was probed");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_storage_error_aborts_when_configured() {
    let options = default_options().with_stop_on_unknown_io_errors(true);
    let (storage, faults) = create_storage();
    let teapot = StorageError::service(418, ErrorCode::Other("Teapot".into()), "I'm a teapot");
    faults.fail("account1", "put_block", teapot, usize::MAX);
    let test = start_pipeline_with(options, storage, faults, RecordingNotifier::new().into()).await;

    test.pipeline
        .client()
        .append(event(json!({"message": "abort"})))
        .await
        .expect("append");

    let result = tokio::time::timeout(Duration::from_secs(60), test.pipeline.run())
        .await
        .expect("pipeline aborted");
    match result {
        Err(PipelineError::Fatal { message }) => {
            assert!(message.starts_with("unknown io error during upload"), "{message}");
        }
        other => panic!("expected an abort, got {other:?}"),
    }
    assert!(test.notifier.envelopes().is_empty());
}
