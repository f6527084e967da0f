//! Test doubles for the pipeline's collaborators.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use convoy_notify::{GUID_NULL, NotificationEnvelope, NotificationService, NotifyError};
use convoy_storage::{
    BlobProperties, BlockList, ContainerInfo, CopyStatus, EntityFilter, Page, StorageError,
    StorageService, StorageServiceFactory, TableEntity,
};
use tokio_util::sync::CancellationToken;

use crate::{config::PipelineOptions, services::PipelineServices};

/// Services without any background task running.
pub fn services_with(
    options: PipelineOptions,
    factory: Arc<dyn StorageServiceFactory>,
    notifier: Arc<dyn NotificationService>,
) -> Arc<PipelineServices> {
    let (services, _receivers) =
        PipelineServices::new(options, factory, notifier, CancellationToken::new());
    services
}

/// Records notifications, optionally rejecting some of them.
///
/// Probes, sent with the null key, are rejected like a live endpoint does and
/// never recorded.
#[derive(Default)]
pub struct RecordingNotifier {
    envelopes: Mutex<Vec<NotificationEnvelope>>,
    invalid_instrumentation_keys: Mutex<HashSet<String>>,
    failure: Mutex<Option<NotifyError>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer notifications for the key with "Invalid instrumentation key".
    pub fn reject_instrumentation_key(&self, instrumentation_key: impl Into<String>) {
        lock(&self.invalid_instrumentation_keys).insert(instrumentation_key.into());
    }

    /// Fail every notification with the error, until cleared with `None`.
    pub fn set_failure(&self, failure: Option<NotifyError>) {
        *lock(&self.failure) = failure;
    }

    /// Accepted notifications, in order.
    pub fn envelopes(&self) -> Vec<NotificationEnvelope> {
        lock(&self.envelopes).clone()
    }
}

#[async_trait::async_trait]
impl NotificationService for RecordingNotifier {
    async fn notify(&self, envelope: &NotificationEnvelope) -> convoy_notify::Result<()> {
        if let Some(failure) = lock(&self.failure).clone() {
            return Err(failure);
        }

        if envelope.ikey == GUID_NULL
            || lock(&self.invalid_instrumentation_keys).contains(&envelope.ikey)
        {
            return Err(NotifyError::Response {
                status: 400,
                message: format!("Invalid instrumentation key: {}", envelope.ikey),
            });
        }

        lock(&self.envelopes).push(envelope.clone());
        Ok(())
    }
}

/// Wraps a storage factory, recording calls and injecting failures.
pub struct FaultInjectingStorageFactory {
    inner: Arc<dyn StorageServiceFactory>,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct Faults {
    calls: Mutex<Vec<StorageCall>>,
    failures: Mutex<HashMap<(String, &'static str), (StorageError, usize)>>,
}

/// A storage operation seen by the factory's services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCall {
    pub account: String,
    pub key: String,
    pub operation: &'static str,
}

impl FaultInjectingStorageFactory {
    pub fn new(inner: Arc<dyn StorageServiceFactory>) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    /// Fail the next `times` calls of the operation on the account.
    pub fn fail(&self, account: &str, operation: &'static str, error: StorageError, times: usize) {
        lock(&self.faults.failures).insert((account.to_string(), operation), (error, times));
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        lock(&self.faults.calls).clone()
    }

    /// Operations called on the account, in order.
    pub fn operations(&self, account: &str) -> Vec<&'static str> {
        self.calls()
            .into_iter()
            .filter(|call| call.account == account)
            .map(|call| call.operation)
            .collect()
    }
}

#[async_trait::async_trait]
impl StorageServiceFactory for FaultInjectingStorageFactory {
    async fn create_storage_service(
        &self,
        account: &str,
        key: &str,
    ) -> convoy_storage::Result<Arc<dyn StorageService>> {
        let inner = self.inner.create_storage_service(account, key).await?;
        Ok(Arc::new(FaultInjectingStorage {
            inner,
            key: key.to_string(),
            faults: self.faults.clone(),
        }))
    }
}

struct FaultInjectingStorage {
    inner: Arc<dyn StorageService>,
    key: String,
    faults: Arc<Faults>,
}

impl FaultInjectingStorage {
    fn call(&self, operation: &'static str) -> convoy_storage::Result<()> {
        let account = self.inner.account().to_string();
        lock(&self.faults.calls).push(StorageCall {
            account: account.clone(),
            key: self.key.clone(),
            operation,
        });

        let mut failures = lock(&self.faults.failures);
        let Some((error, times)) = failures.get_mut(&(account, operation)) else {
            return Ok(());
        };
        if *times == 0 {
            return Ok(());
        }
        *times -= 1;
        Err(error.clone())
    }
}

#[async_trait::async_trait]
impl StorageService for FaultInjectingStorage {
    fn account(&self) -> &str {
        self.inner.account()
    }

    async fn create_container(&self, container: &str) -> convoy_storage::Result<()> {
        self.call("create_container")?;
        self.inner.create_container(container).await
    }

    async fn delete_container(&self, container: &str) -> convoy_storage::Result<()> {
        self.call("delete_container")?;
        self.inner.delete_container(container).await
    }

    async fn list_containers(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> convoy_storage::Result<Page<ContainerInfo>> {
        self.call("list_containers")?;
        self.inner.list_containers(prefix, continuation).await
    }

    async fn put_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: Bytes,
    ) -> convoy_storage::Result<()> {
        self.call("put_block")?;
        self.inner.put_block(container, blob, block_id, data).await
    }

    async fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        properties: &BlobProperties,
    ) -> convoy_storage::Result<()> {
        self.call("commit_block_list")?;
        self.inner
            .commit_block_list(container, blob, block_ids, properties)
            .await
    }

    async fn blob_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> convoy_storage::Result<BlobProperties> {
        self.call("blob_properties")?;
        self.inner.blob_properties(container, blob).await
    }

    async fn list_blocks(&self, container: &str, blob: &str) -> convoy_storage::Result<BlockList> {
        self.call("list_blocks")?;
        self.inner.list_blocks(container, blob).await
    }

    async fn get_blob(&self, container: &str, blob: &str) -> convoy_storage::Result<Bytes> {
        self.call("get_blob")?;
        self.inner.get_blob(container, blob).await
    }

    async fn copy_blob(
        &self,
        container: &str,
        blob: &str,
        source_container: &str,
        source_blob: &str,
    ) -> convoy_storage::Result<CopyStatus> {
        self.call("copy_blob")?;
        self.inner
            .copy_blob(container, blob, source_container, source_blob)
            .await
    }

    async fn copy_status(&self, container: &str, blob: &str) -> convoy_storage::Result<CopyStatus> {
        self.call("copy_status")?;
        self.inner.copy_status(container, blob).await
    }

    async fn create_table(&self, table: &str) -> convoy_storage::Result<()> {
        self.call("create_table")?;
        self.inner.create_table(table).await
    }

    async fn insert_entity(&self, table: &str, entity: &TableEntity) -> convoy_storage::Result<()> {
        self.call("insert_entity")?;
        self.inner.insert_entity(table, entity).await
    }

    async fn delete_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> convoy_storage::Result<()> {
        self.call("delete_entity")?;
        self.inner.delete_entity(table, partition_key, row_key).await
    }

    async fn query_entities(
        &self,
        table: &str,
        filter: &EntityFilter,
        continuation: Option<String>,
    ) -> convoy_storage::Result<Page<TableEntity>> {
        self.call("query_entities")?;
        self.inner.query_entities(table, filter, continuation).await
    }

    fn signed_read_url(
        &self,
        container: &str,
        blob: &str,
        expiry: DateTime<Utc>,
    ) -> convoy_storage::Result<String> {
        self.inner.signed_read_url(container, blob, expiry)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
