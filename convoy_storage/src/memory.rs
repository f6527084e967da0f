//! In-memory storage accounts, for tests and development.

use std::sync::Arc;

use dashmap::DashMap;
use object_store::{ObjectStore, memory::InMemory};

use crate::{
    StorageService, StorageServiceFactory,
    error::Result,
    object::{AccountBackend, ObjectStoreStorage},
};

/// Creates storage services backed by one [`InMemory`] store per account.
///
/// Accounts are created on first use. Any key is accepted unless restricted
/// with [`InMemoryStorageFactory::set_accepted_keys`].
#[derive(Default)]
pub struct InMemoryStorageFactory {
    accounts: DashMap<String, Arc<AccountBackend>>,
    page_size: Option<usize>,
}

impl InMemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn backend(&self, account: &str) -> Arc<AccountBackend> {
        self.accounts
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(AccountBackend::new(Arc::new(InMemory::new()))))
            .clone()
    }

    /// The raw object store of the account.
    pub fn object_store(&self, account: &str) -> Arc<dyn ObjectStore> {
        self.backend(account).store()
    }

    pub fn set_accepted_keys(&self, account: &str, keys: Option<Vec<String>>) {
        self.backend(account).set_accepted_keys(keys);
    }

    /// A service for the account that bypasses key checks.
    pub fn service(&self, account: &str) -> Arc<dyn StorageService> {
        let backend = Arc::new(AccountBackend::new(self.object_store(account)));
        Arc::new(self.storage(account, "", backend))
    }

    fn storage(&self, account: &str, key: &str, backend: Arc<AccountBackend>) -> ObjectStoreStorage {
        let storage = ObjectStoreStorage::new(account, key, backend);
        match self.page_size {
            Some(page_size) => storage.with_page_size(page_size),
            None => storage,
        }
    }
}

#[async_trait::async_trait]
impl StorageServiceFactory for InMemoryStorageFactory {
    async fn create_storage_service(
        &self,
        account: &str,
        key: &str,
    ) -> Result<Arc<dyn StorageService>> {
        let backend = self.backend(account);
        Ok(Arc::new(self.storage(account, key, backend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let factory = InMemoryStorageFactory::new();
        let first = factory.create_storage_service("a", "k").await.unwrap();
        let second = factory.create_storage_service("b", "k").await.unwrap();

        first.create_container("c").await.unwrap();
        second.create_container("c").await.unwrap();

        let again = factory.create_storage_service("a", "other").await.unwrap();
        assert!(again.create_container("c").await.is_err());
    }

    #[tokio::test]
    async fn test_accepted_keys_can_change() {
        let factory = InMemoryStorageFactory::new();
        factory.set_accepted_keys("a", Some(vec!["k2".to_string()]));

        let service = factory.create_storage_service("a", "k1").await.unwrap();
        assert_eq!(service.create_container("c").await.unwrap_err().status(), Some(403));

        factory.set_accepted_keys("a", None);
        service.create_container("c").await.unwrap();
    }
}
