//! Blob and table storage used by the convoy pipeline.
//!
//! The pipeline only talks to storage through the [`StorageService`] trait. A
//! service is bound to one storage account and one access key; the
//! [`StorageServiceFactory`] creates a service for an `(account, key)` pair so
//! that callers can rotate keys and fail over between accounts at runtime.
//!
//! Blobs are written as append-style block objects: blocks are uploaded with
//! [`StorageService::put_block`] and only become visible once
//! [`StorageService::commit_block_list`] has been called with the ordered list
//! of block ids.

pub mod error;
pub mod local;
pub mod memory;
pub mod object;
pub mod sas;
pub mod types;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

pub use error::{ErrorCode, Result, StorageError};
pub use local::{LocalFileSystemStorageFactory, TemporaryFileSystemStorageFactory};
pub use memory::InMemoryStorageFactory;
pub use object::ObjectStoreStorage;
pub use types::{
    BlobProperties, BlockInfo, BlockList, ContainerInfo, CopyStatus, EntityFilter, Page, PropertyCondition,
    TableEntity,
};

/// Operations on a single storage account, authenticated with one key.
#[async_trait::async_trait]
pub trait StorageService: Send + Sync {
    /// The storage account this service is bound to.
    fn account(&self) -> &str;

    async fn create_container(&self, container: &str) -> Result<()>;

    async fn delete_container(&self, container: &str) -> Result<()>;

    /// List containers whose name starts with `prefix`, one page at a time.
    async fn list_containers(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<Page<ContainerInfo>>;

    /// Upload an uncommitted block of the blob.
    async fn put_block(&self, container: &str, blob: &str, block_id: &str, data: Bytes)
    -> Result<()>;

    /// Make the blob consist of exactly the given blocks, in order, served
    /// with the given properties.
    async fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        properties: &BlobProperties,
    ) -> Result<()>;

    /// Properties of a committed blob.
    async fn blob_properties(&self, container: &str, blob: &str) -> Result<BlobProperties>;

    async fn list_blocks(&self, container: &str, blob: &str) -> Result<BlockList>;

    async fn get_blob(&self, container: &str, blob: &str) -> Result<Bytes>;

    /// Start copying a committed blob, possibly from another container.
    async fn copy_blob(
        &self,
        container: &str,
        blob: &str,
        source_container: &str,
        source_blob: &str,
    ) -> Result<CopyStatus>;

    async fn copy_status(&self, container: &str, blob: &str) -> Result<CopyStatus>;

    async fn create_table(&self, table: &str) -> Result<()>;

    /// Insert a new entity. Fails with `EntityAlreadyExists` if the row exists.
    async fn insert_entity(&self, table: &str, entity: &TableEntity) -> Result<()>;

    async fn delete_entity(&self, table: &str, partition_key: &str, row_key: &str) -> Result<()>;

    async fn query_entities(
        &self,
        table: &str,
        filter: &EntityFilter,
        continuation: Option<String>,
    ) -> Result<Page<TableEntity>>;

    /// A URL granting read access to the blob until `expiry`.
    fn signed_read_url(&self, container: &str, blob: &str, expiry: DateTime<Utc>)
    -> Result<String>;
}

/// Creates [`StorageService`] instances for an account and key.
#[async_trait::async_trait]
pub trait StorageServiceFactory: Send + Sync {
    async fn create_storage_service(
        &self,
        account: &str,
        key: &str,
    ) -> Result<Arc<dyn StorageService>>;
}
