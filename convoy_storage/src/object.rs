//! [`StorageService`] implemented on top of an [`ObjectStore`].
//!
//! Layout inside the account's object store:
//!
//! - `<container>/.container`: container marker, its modification time is the
//!   container's.
//! - `<container>/<blob>.blocks/<block id>`: uncommitted blocks.
//! - `<container>/<blob>`: committed content, with its block list stored in
//!   `<container>/<blob>.blocklist` and its properties in
//!   `<container>/<blob>.properties`.
//! - `__tables/<table>/.table` and `__tables/<table>/<partition>/<row>.json`:
//!   table markers and entities.

use std::sync::{Arc, RwLock};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutPayload, path::Path};
use snafu::ResultExt;

use crate::{
    StorageService,
    error::{ErrorCode, ObjectStoreSnafu, Result, SerializationSnafu, StorageError},
    sas::BlobReadGrant,
    types::{BlobProperties, BlockInfo, BlockList, ContainerInfo, CopyStatus, EntityFilter, Page, TableEntity},
};

const TABLES_ROOT: &str = "__tables";
const CONTAINER_MARKER: &str = ".container";
const TABLE_MARKER: &str = ".table";
const BLOCKS_SUFFIX: &str = ".blocks";
const BLOCK_LIST_SUFFIX: &str = ".blocklist";
const PROPERTIES_SUFFIX: &str = ".properties";
const DEFAULT_PAGE_SIZE: usize = 1000;

/// The object store of one storage account, shared by all its services.
#[derive(Debug)]
pub struct AccountBackend {
    store: Arc<dyn ObjectStore>,
    accepted_keys: RwLock<Option<Vec<String>>>,
}

impl AccountBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            accepted_keys: RwLock::new(None),
        }
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Restrict the keys this account accepts. `None` accepts any key.
    pub fn set_accepted_keys(&self, keys: Option<Vec<String>>) {
        let mut accepted = self
            .accepted_keys
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        *accepted = keys;
    }

    pub fn accepts(&self, key: &str) -> bool {
        let accepted = self
            .accepted_keys
            .read()
            .unwrap_or_else(|poison| poison.into_inner());
        match accepted.as_ref() {
            None => true,
            Some(keys) => keys.iter().any(|k| k == key),
        }
    }
}

pub struct ObjectStoreStorage {
    account: String,
    key: String,
    backend: Arc<AccountBackend>,
    endpoint: String,
    page_size: usize,
}

impl ObjectStoreStorage {
    pub fn new(
        account: impl Into<String>,
        key: impl Into<String>,
        backend: Arc<AccountBackend>,
    ) -> Self {
        let account = account.into();
        let endpoint = format!("https://{account}.blob.core.windows.net");
        Self {
            account,
            key: key.into(),
            backend,
            endpoint,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Base URL used for signed read URLs.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Maximum number of items per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn store(&self) -> &dyn ObjectStore {
        self.backend.store.as_ref()
    }

    fn authorize(&self) -> Result<()> {
        if self.backend.accepts(&self.key) {
            return Ok(());
        }

        Err(StorageError::service(
            403,
            ErrorCode::AuthenticationFailed,
            "Server failed to authenticate the request.",
        ))
    }

    async fn head(&self, path: &Path) -> Result<Option<ObjectMeta>> {
        match self.store().head(path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err).context(ObjectStoreSnafu {
                message: "failed to read object metadata",
            }),
        }
    }

    async fn read(&self, path: &Path) -> Result<Option<Bytes>> {
        let result = match self.store().get(path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(err) => {
                return Err(err).context(ObjectStoreSnafu {
                    message: "failed to read object",
                });
            }
        };

        let bytes = result.bytes().await.context(ObjectStoreSnafu {
            message: "failed to read object content",
        })?;

        Ok(Some(bytes))
    }

    async fn list_all(&self, prefix: &Path) -> Result<Vec<ObjectMeta>> {
        let mut objects: Vec<ObjectMeta> = self
            .store()
            .list(Some(prefix))
            .try_collect()
            .await
            .context(ObjectStoreSnafu {
                message: "failed to list objects",
            })?;
        objects.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));
        Ok(objects)
    }

    async fn create_marker(&self, path: &Path, conflict: ErrorCode) -> Result<()> {
        let created = Utc::now().to_rfc3339();
        match self
            .store()
            .put_opts(path, PutPayload::from(created), PutMode::Create.into())
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => Err(StorageError::conflict(conflict)),
            Err(err) => Err(err).context(ObjectStoreSnafu {
                message: "failed to create marker",
            }),
        }
    }

    async fn ensure_container(&self, container: &str) -> Result<ObjectMeta> {
        self.head(&container_marker(container))
            .await?
            .ok_or_else(|| StorageError::not_found(ErrorCode::ContainerNotFound))
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        self.head(&table_marker(table))
            .await?
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(ErrorCode::TableNotFound))
    }

    async fn committed_blocks(&self, container: &str, blob: &str) -> Result<Option<Vec<BlockInfo>>> {
        let Some(manifest) = self.read(&manifest_path(container, blob)).await? else {
            return Ok(None);
        };

        let blocks = serde_json::from_slice(&manifest).context(SerializationSnafu {
            message: "invalid block list",
        })?;

        Ok(Some(blocks))
    }

    async fn uncommitted_blocks(&self, container: &str, blob: &str) -> Result<Vec<BlockInfo>> {
        let objects = self.list_all(&blocks_prefix(container, blob)).await?;
        Ok(objects
            .into_iter()
            .filter_map(|meta| {
                let name = meta.location.filename()?.to_string();
                Some(BlockInfo {
                    name,
                    size: meta.size,
                })
            })
            .collect())
    }

    async fn put(&self, path: &Path, data: Bytes) -> Result<()> {
        self.store()
            .put(path, PutPayload::from(data))
            .await
            .context(ObjectStoreSnafu {
                message: "failed to write object",
            })?;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        match self.store().delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err).context(ObjectStoreSnafu {
                message: "failed to delete object",
            }),
        }
    }
}

#[async_trait::async_trait]
impl StorageService for ObjectStoreStorage {
    fn account(&self) -> &str {
        &self.account
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        self.authorize()?;
        self.create_marker(
            &container_marker(container),
            ErrorCode::ContainerAlreadyExists,
        )
        .await
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        self.authorize()?;
        self.ensure_container(container).await?;

        for meta in self.list_all(&Path::from(container)).await? {
            self.delete(&meta.location).await?;
        }

        Ok(())
    }

    async fn list_containers(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<Page<ContainerInfo>> {
        self.authorize()?;

        let listing = self
            .store()
            .list_with_delimiter(None)
            .await
            .context(ObjectStoreSnafu {
                message: "failed to list containers",
            })?;

        let mut names: Vec<String> = listing
            .common_prefixes
            .iter()
            .map(|path| path.as_ref().to_string())
            .filter(|name| name.starts_with(prefix) && name != TABLES_ROOT)
            .filter(|name| continuation.as_ref().is_none_or(|after| name > after))
            .collect();
        names.sort();

        let has_more = names.len() > self.page_size;
        names.truncate(self.page_size);

        let mut items = Vec::with_capacity(names.len());
        for name in names {
            if let Some(marker) = self.head(&container_marker(&name)).await? {
                items.push(ContainerInfo {
                    name,
                    last_modified: marker.last_modified,
                });
            }
        }

        let continuation = if has_more {
            items.last().map(|c| c.name.clone())
        } else {
            None
        };

        Ok(Page {
            items,
            continuation,
        })
    }

    async fn put_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: Bytes,
    ) -> Result<()> {
        self.authorize()?;
        self.ensure_container(container).await?;
        self.put(&block_path(container, blob, block_id), data).await
    }

    async fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        properties: &BlobProperties,
    ) -> Result<()> {
        self.authorize()?;
        self.ensure_container(container).await?;

        let previous = self.committed_blocks(container, blob).await?;
        let previous_content = match previous {
            Some(_) => self.read(&blob_path(container, blob)).await?,
            None => None,
        };

        let mut content = BytesMut::new();
        let mut manifest = Vec::with_capacity(block_ids.len());

        for block_id in block_ids {
            let data = match self.read(&block_path(container, blob, block_id)).await? {
                Some(data) => data,
                None => committed_block(previous.as_deref(), previous_content.as_ref(), block_id)
                    .ok_or_else(|| {
                        StorageError::service(
                            400,
                            ErrorCode::InvalidBlockList,
                            format!("The specified block list is invalid: {block_id}"),
                        )
                    })?,
            };

            manifest.push(BlockInfo {
                name: block_id.clone(),
                size: data.len() as u64,
            });
            content.extend_from_slice(&data);
        }

        let manifest = serde_json::to_vec(&manifest).context(SerializationSnafu {
            message: "failed to encode block list",
        })?;
        let properties = serde_json::to_vec(properties).context(SerializationSnafu {
            message: "failed to encode blob properties",
        })?;

        self.put(&blob_path(container, blob), content.freeze()).await?;
        self.put(&manifest_path(container, blob), Bytes::from(manifest))
            .await?;
        self.put(&properties_path(container, blob), Bytes::from(properties))
            .await?;

        for block in self.list_all(&blocks_prefix(container, blob)).await? {
            self.delete(&block.location).await?;
        }

        Ok(())
    }

    async fn list_blocks(&self, container: &str, blob: &str) -> Result<BlockList> {
        self.authorize()?;
        self.ensure_container(container).await?;

        let committed = self.committed_blocks(container, blob).await?;
        let uncommitted = self.uncommitted_blocks(container, blob).await?;

        if committed.is_none() && uncommitted.is_empty() {
            return Err(StorageError::not_found(ErrorCode::BlobNotFound));
        }

        Ok(BlockList {
            committed: committed.unwrap_or_default(),
            uncommitted,
        })
    }

    async fn get_blob(&self, container: &str, blob: &str) -> Result<Bytes> {
        self.authorize()?;
        self.ensure_container(container).await?;

        self.read(&blob_path(container, blob))
            .await?
            .ok_or_else(|| StorageError::not_found(ErrorCode::BlobNotFound))
    }

    async fn blob_properties(&self, container: &str, blob: &str) -> Result<BlobProperties> {
        self.authorize()?;
        self.ensure_container(container).await?;

        if self.head(&blob_path(container, blob)).await?.is_none() {
            return Err(StorageError::not_found(ErrorCode::BlobNotFound));
        }

        match self.read(&properties_path(container, blob)).await? {
            Some(data) => serde_json::from_slice(&data).context(SerializationSnafu {
                message: "failed to decode blob properties",
            }),
            None => Ok(BlobProperties::default()),
        }
    }

    async fn copy_blob(
        &self,
        container: &str,
        blob: &str,
        source_container: &str,
        source_blob: &str,
    ) -> Result<CopyStatus> {
        self.authorize()?;
        self.ensure_container(container).await?;

        let source = blob_path(source_container, source_blob);
        if self.head(&source).await?.is_none() {
            return Err(StorageError::not_found(ErrorCode::BlobNotFound));
        }

        self.store()
            .copy(&source, &blob_path(container, blob))
            .await
            .context(ObjectStoreSnafu {
                message: "failed to copy blob",
            })?;

        let sidecars = [
            (
                manifest_path(source_container, source_blob),
                manifest_path(container, blob),
            ),
            (
                properties_path(source_container, source_blob),
                properties_path(container, blob),
            ),
        ];
        for (from, to) in sidecars {
            if self.head(&from).await?.is_some() {
                self.store()
                    .copy(&from, &to)
                    .await
                    .context(ObjectStoreSnafu {
                        message: "failed to copy blob metadata",
                    })?;
            }
        }

        Ok(CopyStatus::Success)
    }

    async fn copy_status(&self, container: &str, blob: &str) -> Result<CopyStatus> {
        self.authorize()?;

        match self.head(&blob_path(container, blob)).await? {
            Some(_) => Ok(CopyStatus::Success),
            None => Err(StorageError::not_found(ErrorCode::BlobNotFound)),
        }
    }

    async fn create_table(&self, table: &str) -> Result<()> {
        self.authorize()?;
        self.create_marker(&table_marker(table), ErrorCode::TableAlreadyExists)
            .await
    }

    async fn insert_entity(&self, table: &str, entity: &TableEntity) -> Result<()> {
        self.authorize()?;
        self.ensure_table(table).await?;

        let data = serde_json::to_vec(entity).context(SerializationSnafu {
            message: "failed to encode entity",
        })?;

        let path = entity_path(table, &entity.partition_key, &entity.row_key);
        match self
            .store()
            .put_opts(&path, PutPayload::from(data), PutMode::Create.into())
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => {
                Err(StorageError::conflict(ErrorCode::EntityAlreadyExists))
            }
            Err(err) => Err(err).context(ObjectStoreSnafu {
                message: "failed to insert entity",
            }),
        }
    }

    async fn delete_entity(&self, table: &str, partition_key: &str, row_key: &str) -> Result<()> {
        self.authorize()?;
        self.ensure_table(table).await?;

        let path = entity_path(table, partition_key, row_key);
        if self.head(&path).await?.is_none() {
            return Err(StorageError::not_found(ErrorCode::ResourceNotFound));
        }

        self.delete(&path).await
    }

    async fn query_entities(
        &self,
        table: &str,
        filter: &EntityFilter,
        continuation: Option<String>,
    ) -> Result<Page<TableEntity>> {
        self.authorize()?;
        self.ensure_table(table).await?;

        let prefix = match &filter.partition_key {
            Some(partition_key) => Path::from(format!("{TABLES_ROOT}/{table}/{partition_key}")),
            None => Path::from(format!("{TABLES_ROOT}/{table}")),
        };

        let objects = self.list_all(&prefix).await?;
        let candidates: Box<dyn Iterator<Item = &ObjectMeta> + Send + '_> = Box::new(
            objects
                .iter()
                .filter(|meta| meta.location.filename() != Some(TABLE_MARKER))
                .filter(|meta| {
                    continuation
                        .as_deref()
                        .is_none_or(|after| meta.location.as_ref() > after)
                }),
        );
        let mut candidates = candidates.peekable();

        let mut items = Vec::new();
        let mut last_location = None;
        while items.len() < self.page_size {
            let Some(meta) = candidates.next() else {
                break;
            };

            last_location = Some(meta.location.as_ref().to_string());

            let Some(data) = self.read(&meta.location).await? else {
                continue;
            };
            let entity: TableEntity =
                serde_json::from_slice(&data).context(SerializationSnafu {
                    message: "invalid entity",
                })?;

            if filter.matches(&entity) {
                items.push(entity);
            }
        }

        let continuation = if candidates.peek().is_some() {
            last_location
        } else {
            None
        };

        Ok(Page {
            items,
            continuation,
        })
    }

    fn signed_read_url(
        &self,
        container: &str,
        blob: &str,
        expiry: DateTime<Utc>,
    ) -> Result<String> {
        let query = BlobReadGrant {
            account: &self.account,
            container,
            blob,
            expiry,
        }
        .sign(&self.key)?;

        Ok(format!("{}/{container}/{blob}?{query}", self.endpoint))
    }
}

fn committed_block(
    manifest: Option<&[BlockInfo]>,
    content: Option<&Bytes>,
    block_id: &str,
) -> Option<Bytes> {
    let manifest = manifest?;
    let content = content?;

    let mut offset = 0usize;
    for block in manifest {
        let size = block.size as usize;
        if block.name == block_id {
            return content.get(offset..offset + size).map(Bytes::copy_from_slice);
        }
        offset += size;
    }

    None
}

fn container_marker(container: &str) -> Path {
    Path::from(format!("{container}/{CONTAINER_MARKER}"))
}

fn blob_path(container: &str, blob: &str) -> Path {
    Path::from(format!("{container}/{blob}"))
}

fn blocks_prefix(container: &str, blob: &str) -> Path {
    Path::from(format!("{container}/{blob}{BLOCKS_SUFFIX}"))
}

fn block_path(container: &str, blob: &str, block_id: &str) -> Path {
    Path::from(format!("{container}/{blob}{BLOCKS_SUFFIX}/{block_id}"))
}

fn manifest_path(container: &str, blob: &str) -> Path {
    Path::from(format!("{container}/{blob}{BLOCK_LIST_SUFFIX}"))
}

fn properties_path(container: &str, blob: &str) -> Path {
    Path::from(format!("{container}/{blob}{PROPERTIES_SUFFIX}"))
}

fn table_marker(table: &str) -> Path {
    Path::from(format!("{TABLES_ROOT}/{table}/{TABLE_MARKER}"))
}

fn entity_path(table: &str, partition_key: &str, row_key: &str) -> Path {
    Path::from(format!("{TABLES_ROOT}/{table}/{partition_key}/{row_key}.json"))
}
