#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use convoy_pipeline::{
    BlobContext, Event, Pipeline, PipelineOptions,
    test_utils::{FaultInjectingStorageFactory, RecordingNotifier},
};
use convoy_storage::{EntityFilter, InMemoryStorageFactory};
use serde_json::Value;

pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub storage: Arc<InMemoryStorageFactory>,
    pub faults: Arc<FaultInjectingStorageFactory>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn default_options() -> PipelineOptions {
    PipelineOptions::default()
        .with_account("account1", &["key1", "key2"])
        .with_instrumentation_key("ikey-1")
        .with_io_retry(Duration::from_secs(1), 2)
        .with_cleanup_disabled(true)
}

pub fn create_storage() -> (Arc<InMemoryStorageFactory>, Arc<FaultInjectingStorageFactory>) {
    let storage = Arc::new(InMemoryStorageFactory::new());
    let faults = Arc::new(FaultInjectingStorageFactory::new(storage.clone()));
    (storage, faults)
}

pub async fn start_pipeline(options: PipelineOptions) -> TestPipeline {
    let (storage, faults) = create_storage();
    start_pipeline_with(options, storage, faults, Arc::new(RecordingNotifier::new())).await
}

pub async fn start_pipeline_with(
    options: PipelineOptions,
    storage: Arc<InMemoryStorageFactory>,
    faults: Arc<FaultInjectingStorageFactory>,
    notifier: Arc<RecordingNotifier>,
) -> TestPipeline {
    let mut pipeline =
        Pipeline::new(options, faults.clone(), notifier.clone()).expect("create pipeline");
    pipeline.start().await.expect("start pipeline");

    TestPipeline {
        pipeline,
        storage,
        faults,
        notifier,
    }
}

pub fn event(value: Value) -> Event {
    match value {
        Value::Object(object) => object,
        other => panic!("event must be an object, got {other}"),
    }
}

/// Poll the condition every half second of (paused) time.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..1200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Blob contexts of the state table rows of the account.
pub async fn state_rows(
    storage: &InMemoryStorageFactory,
    options: &PipelineOptions,
    account: &str,
) -> Vec<(String, BlobContext)> {
    let service = storage.service(account);
    let Ok(page) = service
        .query_entities(&options.state_table_name(), &EntityFilter::all(), None)
        .await
    else {
        return Vec::new();
    };

    page.items
        .iter()
        .map(|entity| {
            let ctx = BlobContext::from_entity(entity).expect("valid state row");
            (entity.partition_key.clone(), ctx)
        })
        .collect()
}

pub fn assert_drained(pipeline: &Pipeline) {
    let state = pipeline.state();
    assert_eq!(state.bytes_in_memory(), 0, "bytes in memory");
    assert_eq!(state.pending_commits(), 0, "pending commits");
    assert_eq!(state.pending_notifications(), 0, "pending notifications");
}
