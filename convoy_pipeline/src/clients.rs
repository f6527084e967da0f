//! Storage accounts, their keys, and their health.
//!
//! Every account keeps its list of keys and the index of the key that last
//! worked. Callers lease a client for an account; a lease may rotate to the
//! next key after an authentication failure, and the account remembers the
//! key once the lease is released. Accounts that keep failing are taken out
//! of the active set and probed in the background until they answer again.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use convoy_storage::{ErrorCode, StorageError, StorageService, StorageServiceFactory};
use rand::seq::SliceRandom;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use crate::{
    classify::{OperationError, Recovery},
    config::{PipelineOptions, StorageAccountOptions},
};

/// Maximum number of concurrent leases per account.
pub const CLIENT_POOL_SIZE: usize = 40;

struct Account {
    name: String,
    keys: Vec<String>,
    valid_index: AtomicUsize,
    pool: Arc<Semaphore>,
    services: Vec<OnceCell<Arc<dyn StorageService>>>,
    off_reasons: Mutex<Vec<Recovery>>,
}

impl Account {
    fn new(options: &StorageAccountOptions) -> Self {
        Self {
            name: options.name.clone(),
            keys: options.keys.clone(),
            valid_index: AtomicUsize::new(0),
            pool: Arc::new(Semaphore::new(CLIENT_POOL_SIZE)),
            services: options.keys.iter().map(|_| OnceCell::new()).collect(),
            off_reasons: Mutex::new(Vec::new()),
        }
    }
}

pub struct StorageAccounts {
    accounts: BTreeMap<String, Arc<Account>>,
    active: RwLock<BTreeSet<String>>,
    factory: Arc<dyn StorageServiceFactory>,
    resurrect_delay: Duration,
    test_container: String,
    ct: CancellationToken,
    tasks: TaskTracker,
}

/// A client of one account, bound to one of its keys.
pub struct StorageLease {
    account: Arc<Account>,
    key_index: usize,
    start_index: usize,
    _permit: OwnedSemaphorePermit,
    factory: Arc<dyn StorageServiceFactory>,
}

impl StorageAccounts {
    pub fn new(
        options: &PipelineOptions,
        factory: Arc<dyn StorageServiceFactory>,
        ct: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        let accounts: BTreeMap<_, _> = options
            .storage_accounts
            .iter()
            .map(|account| (account.name.clone(), Arc::new(Account::new(account))))
            .collect();
        let active = accounts.keys().cloned().collect();

        Self {
            accounts,
            active: RwLock::new(active),
            factory,
            resurrect_delay: options.resurrect_delay,
            test_container: options.test_container_name(),
            ct,
            tasks,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    fn active(&self) -> std::sync::RwLockReadGuard<'_, BTreeSet<String>> {
        self.active.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn active_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeSet<String>> {
        self.active.write().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn is_account_on(&self, name: &str) -> bool {
        self.active().contains(name)
    }

    pub fn has_active(&self) -> bool {
        !self.active().is_empty()
    }

    /// Index of the key currently used for the account.
    pub fn valid_key_index(&self, name: &str) -> Option<usize> {
        self.accounts
            .get(name)
            .map(|account| account.valid_index.load(Ordering::Acquire))
    }

    /// Pick an active account at random, ignoring `exclude`.
    pub fn get_random_active_storage(&self, exclude: &[String]) -> Option<String> {
        let active = self.active();
        let candidates: Vec<&String> = active
            .iter()
            .filter(|name| !exclude.contains(*name))
            .collect();

        candidates
            .choose(&mut rand::thread_rng())
            .map(|name| name.to_string())
    }

    /// Lease a client of the account.
    ///
    /// Without `force` the lease fails when no account at all is active.
    pub async fn lease(&self, name: &str, force: bool) -> Result<StorageLease, OperationError> {
        if !force && !self.has_active() {
            return Err(OperationError::AllAccountsDead);
        }

        let account = self.accounts.get(name).cloned().ok_or_else(|| {
            OperationError::from(StorageError::Client {
                message: format!("unknown storage account {name}"),
            })
        })?;

        let permit = account.pool.clone().acquire_owned().await.map_err(|_| {
            OperationError::from(StorageError::Client {
                message: format!("storage account {name} is closed"),
            })
        })?;

        let key_index = account.valid_index.load(Ordering::Acquire);

        Ok(StorageLease {
            account,
            key_index,
            start_index: key_index,
            _permit: permit,
            factory: self.factory.clone(),
        })
    }

    /// Record a failure of the account, taking it offline on the first one.
    pub fn failed_storage_account(self: &Arc<Self>, name: &str, reason: Recovery) {
        let Some(account) = self.accounts.get(name) else {
            return;
        };

        let first_failure = {
            let mut reasons = account
                .off_reasons
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            reasons.push(reason);
            reasons.len() == 1
        };

        if !first_failure {
            return;
        }

        self.active_mut().remove(name);
        warn!(account = %name, reason = ?reason, "storage account is off, probing until it recovers");

        let accounts = self.clone();
        let name = name.to_string();
        self.tasks.spawn(async move { accounts.resurrect(name).await });
    }

    async fn resurrect(self: Arc<Self>, name: String) {
        loop {
            tokio::select! {
                _ = self.ct.cancelled() => return,
                _ = tokio::time::sleep(self.resurrect_delay) => {}
            }

            match self.test_storage(&name).await {
                Ok(()) => break,
                Err(err) => {
                    warn!(account = %name, err = %err, "storage account is still off");
                }
            }
        }

        if let Some(account) = self.accounts.get(&name) {
            account
                .off_reasons
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .clear();
        }
        self.active_mut().insert(name.clone());
        info!(account = %name, "storage account is back on");
    }

    /// Probe the account by creating the test container with each key.
    ///
    /// Succeeds with the first key that works and makes it the valid key.
    pub async fn test_storage(&self, name: &str) -> Result<(), StorageError> {
        let account = self.accounts.get(name).ok_or_else(|| StorageError::Client {
            message: format!("unknown storage account {name}"),
        })?;

        let start = account.valid_index.load(Ordering::Acquire);
        let mut last_error = None;

        for offset in 0..account.keys.len() {
            let index = (start + offset) % account.keys.len();
            let service = match self
                .factory
                .create_storage_service(&account.name, &account.keys[index])
                .await
            {
                Ok(service) => service,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };

            match service.create_container(&self.test_container).await {
                Ok(()) => {}
                Err(err) if err.code() == Some(&ErrorCode::ContainerAlreadyExists) => {}
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            }

            account.valid_index.store(index, Ordering::Release);
            return Ok(());
        }

        Err(last_error.unwrap_or_else(|| StorageError::Client {
            message: format!("storage account {name} has no keys"),
        }))
    }
}

impl StorageLease {
    pub fn account(&self) -> &str {
        &self.account.name
    }

    pub fn key_index(&self) -> usize {
        self.key_index
    }

    /// The client for the lease's current key, created on first use.
    pub async fn service(&self) -> Result<Arc<dyn StorageService>, StorageError> {
        let index = self.key_index;
        let cell = &self.account.services[index];
        let service = cell
            .get_or_try_init(|| {
                self.factory
                    .create_storage_service(&self.account.name, &self.account.keys[index])
            })
            .await?;
        Ok(service.clone())
    }

    /// Rotate to the next key. Returns false once every key was tried.
    pub fn switch_key(&mut self) -> bool {
        let next = (self.key_index + 1) % self.account.keys.len();
        if next == self.start_index {
            return false;
        }

        self.key_index = next;
        true
    }
}

impl Drop for StorageLease {
    fn drop(&mut self) {
        if self.key_index != self.start_index {
            self.account
                .valid_index
                .store(self.key_index, Ordering::Release);
        }
    }
}
