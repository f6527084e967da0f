use std::time::Duration;

use bytes::Bytes;
use convoy_notify::NotifyError;
use convoy_pipeline::{
    BlobContext, ChannelKey, EventFormat, LogState, PipelineOptions,
    test_utils::RecordingNotifier,
};
use convoy_storage::{InMemoryStorageFactory, StorageService};
use serde_json::json;

mod common;

use common::{
    assert_drained, create_storage, default_options, event, start_pipeline, start_pipeline_with,
    state_rows, wait_until,
};

const CONTAINER: &str = "convoy-2026-01-01";

fn left_over_blob(name: &str, log_state: LogState) -> BlobContext {
    let mut ctx = BlobContext::new("ikey-1", "default", EventFormat::Json, Duration::from_secs(60));
    ctx.storage_account = Some("account1".to_string());
    ctx.container_name = CONTAINER.to_string();
    ctx.blob_name = format!("convoy/ikey-ikey-1/schema-default/{name}_0001.json");
    ctx.log_state = log_state;
    ctx
}

async fn seed(
    service: &dyn StorageService,
    options: &PipelineOptions,
    ctx: &BlobContext,
    blocks: &[(&str, &str)],
) {
    for (block_id, data) in blocks {
        service
            .put_block(
                &ctx.container_name,
                &ctx.blob_name,
                block_id,
                Bytes::from(data.to_string()),
            )
            .await
            .expect("put block");
    }
    if ctx.log_state == LogState::Committed {
        service
            .commit_block_list(
                &ctx.container_name,
                &ctx.blob_name,
                &ctx.uploaded_block_ids,
                &ctx.blob_properties(),
            )
            .await
            .expect("commit");
    }
    service
        .insert_entity(
            &options.state_table_name(),
            &ctx.to_entity(&options.partition_key_prefix()),
        )
        .await
        .expect("insert entity");
}

#[tokio::test(start_paused = true)]
async fn test_startup_finishes_blobs_of_the_previous_run() {
    let options = default_options();
    let (storage, faults) = create_storage();
    let service = storage.service("account1");
    service.create_table(&options.state_table_name()).await.expect("create table");
    service.create_container(CONTAINER).await.expect("create container");

    let uncommitted = left_over_blob("uncommitted", LogState::Uploading);
    seed(
        service.as_ref(),
        &options,
        &uncommitted,
        &[("100000", "a\r\n"), ("100001", "b\r\n")],
    )
    .await;

    let mut committed = left_over_blob("committed", LogState::Committed);
    committed.uploaded_block_ids = vec!["100000".to_string()];
    committed.uploaded_events_count = 1;
    seed(service.as_ref(), &options, &committed, &[("100000", "c\r\n")]).await;

    let empty = left_over_blob("empty", LogState::Uploading);
    seed(service.as_ref(), &options, &empty, &[]).await;

    let test = start_pipeline_with(
        options.clone(),
        storage.clone(),
        faults,
        RecordingNotifier::new().into(),
    )
    .await;

    wait_until("notifications", || test.notifier.envelopes().len() == 2).await;
    wait_until("notified", || {
        test.pipeline.state().pending_notifications() == 0
    })
    .await;
    wait_until_rows_gone(&storage, &options).await;

    let data = service
        .get_blob(CONTAINER, &uncommitted.blob_name)
        .await
        .expect("committed blob");
    assert_eq!(&data[..], b"a\r\nb\r\n");

    let mut uris: Vec<String> = test
        .notifier
        .envelopes()
        .iter()
        .map(|envelope| envelope.blob_sas_uri().to_string())
        .collect();
    uris.sort();
    assert!(uris[0].contains("committed_0001.json"));
    assert!(uris[1].contains("uncommitted_0001.json"));

    test.pipeline.shutdown().await.expect("shutdown");
    assert_drained(&test.pipeline);
}

async fn wait_until_rows_gone(storage: &InMemoryStorageFactory, options: &PipelineOptions) {
    for _ in 0..120 {
        if state_rows(storage, options, "account1").await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("state rows were not cleaned up");
}

#[tokio::test(start_paused = true)]
async fn test_rejected_key_is_parked_in_a_side_queue() {
    let options = default_options().with_instrumentation_key("ikey-bad");
    let (storage, faults) = create_storage();
    let notifier = std::sync::Arc::new(RecordingNotifier::new());
    notifier.reject_instrumentation_key("ikey-bad");
    let test = start_pipeline_with(options.clone(), storage, faults, notifier).await;

    test.pipeline
        .client()
        .append(event(json!({"message": "rejected"})))
        .await
        .expect("append");

    let key = ChannelKey::new("ikey-bad", "default");
    let services = test.pipeline.services().clone();
    wait_until("side queue", || services.side_queues.len(&key) == 1).await;

    assert_eq!(services.state.pending_notifications(), 1);
    assert_eq!(services.state.pending_commits(), 0);
    assert!(test.notifier.envelopes().is_empty());
    assert!(services.notification_recovery.is_healthy());

    test.pipeline.shutdown().await.expect("shutdown");
    assert_drained(&test.pipeline);

    let rows = state_rows(&test.storage, &options, "account1").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1.log_state, LogState::Committed);
}

#[tokio::test(start_paused = true)]
async fn test_notifications_resume_when_endpoint_recovers() {
    let test = start_pipeline(default_options()).await;
    test.notifier.set_failure(Some(NotifyError::Response {
        status: 503,
        message: "Service Unavailable".to_string(),
    }));

    test.pipeline
        .client()
        .append(event(json!({"message": "delayed"})))
        .await
        .expect("append");

    let services = test.pipeline.services().clone();
    wait_until("endpoint marked down", || {
        !services.notification_recovery.is_healthy()
    })
    .await;
    assert_eq!(services.state.pending_notifications(), 1);
    assert!(test.notifier.envelopes().is_empty());

    test.notifier.set_failure(None);
    wait_until("notification", || test.notifier.envelopes().len() == 1).await;
    assert!(services.notification_recovery.is_healthy());

    test.pipeline.shutdown().await.expect("shutdown");
    assert_drained(&test.pipeline);
}
