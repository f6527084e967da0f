//! Local file system storage accounts.
//!
//! Each account gets its own subdirectory of the root path. The
//! `TemporaryFileSystemStorageFactory` places the root in a temporary directory
//! that is removed when the factory is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use object_store::local::LocalFileSystem;
use snafu::ResultExt;
use tempfile::TempDir;

use crate::{
    StorageService, StorageServiceFactory,
    error::{ObjectStoreSnafu, Result, StorageError},
    object::{AccountBackend, ObjectStoreStorage},
};

pub struct LocalFileSystemStorageFactory {
    root_path: PathBuf,
    accounts: DashMap<String, Arc<AccountBackend>>,
}

impl LocalFileSystemStorageFactory {
    pub fn new(root_path: impl AsRef<Path>) -> Result<Self> {
        let root_path =
            std::fs::canonicalize(root_path.as_ref()).map_err(|err| StorageError::Client {
                message: format!(
                    "invalid storage root {}: {err}",
                    root_path.as_ref().display()
                ),
            })?;

        Ok(Self {
            root_path,
            accounts: DashMap::new(),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn backend(&self, account: &str) -> Result<Arc<AccountBackend>> {
        if let Some(backend) = self.accounts.get(account) {
            return Ok(backend.clone());
        }

        let account_path = self.root_path.join(account);
        std::fs::create_dir_all(&account_path).map_err(|err| StorageError::Client {
            message: format!("failed to create {}: {err}", account_path.display()),
        })?;

        let store = LocalFileSystem::new_with_prefix(account_path).context(ObjectStoreSnafu {
            message: "failed to open local storage",
        })?;

        let backend = self
            .accounts
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(AccountBackend::new(Arc::new(store))))
            .clone();

        Ok(backend)
    }
}

#[async_trait::async_trait]
impl StorageServiceFactory for LocalFileSystemStorageFactory {
    async fn create_storage_service(
        &self,
        account: &str,
        key: &str,
    ) -> Result<Arc<dyn StorageService>> {
        let backend = self.backend(account)?;
        Ok(Arc::new(ObjectStoreStorage::new(account, key, backend)))
    }
}

pub struct TemporaryFileSystemStorageFactory {
    _temp_dir: TempDir,
    local_factory: LocalFileSystemStorageFactory,
}

impl TemporaryFileSystemStorageFactory {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().map_err(|err| StorageError::Client {
            message: format!("failed to create temporary directory: {err}"),
        })?;

        let local_factory = LocalFileSystemStorageFactory::new(temp_dir.path())?;

        Ok(Self {
            _temp_dir: temp_dir,
            local_factory,
        })
    }

    pub fn root_path(&self) -> &Path {
        self.local_factory.root_path()
    }
}

#[async_trait::async_trait]
impl StorageServiceFactory for TemporaryFileSystemStorageFactory {
    async fn create_storage_service(
        &self,
        account: &str,
        key: &str,
    ) -> Result<Arc<dyn StorageService>> {
        self.local_factory.create_storage_service(account, key).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::BlobProperties;

    use super::*;

    #[test]
    fn test_factory_creation_invalid_path() {
        let result = LocalFileSystemStorageFactory::new("/this/path/does/not/exist");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_accounts_get_their_own_directory() {
        let factory = TemporaryFileSystemStorageFactory::new().unwrap();
        let storage = factory
            .create_storage_service("account1", "key")
            .await
            .unwrap();

        storage.create_container("convoy-2024-05-01").await.unwrap();
        storage
            .put_block("convoy-2024-05-01", "a.json", "100001", Bytes::from("x"))
            .await
            .unwrap();
        storage
            .commit_block_list(
                "convoy-2024-05-01",
                "a.json",
                &["100001".to_string()],
                &BlobProperties::default(),
            )
            .await
            .unwrap();

        assert!(
            factory
                .root_path()
                .join("account1/convoy-2024-05-01/a.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_temporary_factory_cleanup() {
        let root_path = {
            let factory = TemporaryFileSystemStorageFactory::new().unwrap();
            let path = factory.root_path().to_path_buf();
            assert!(path.exists());
            path
        };

        assert!(!root_path.exists());
    }
}
