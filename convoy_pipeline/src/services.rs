use std::sync::{Arc, OnceLock};

use convoy_notify::NotificationService;
use convoy_storage::StorageServiceFactory;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::error;

use crate::{
    block::BlockNumbers,
    clients::StorageAccounts,
    config::PipelineOptions,
    context::BlobContext,
    metrics::PipelineMetrics,
    recovery::{
        notification::NotificationRecovery,
        side_queue::NotifySideQueues,
        storage::{StorageRecovery, StorageRecoveryQueues},
    },
    state::PipelineState,
};

/// Everything the pipeline components share.
pub struct PipelineServices {
    pub options: PipelineOptions,
    pub state: Arc<PipelineState>,
    pub accounts: Arc<StorageAccounts>,
    pub notifier: Arc<dyn NotificationService>,
    pub storage_recovery: StorageRecovery,
    pub notification_recovery: NotificationRecovery,
    pub side_queues: NotifySideQueues,
    pub block_numbers: BlockNumbers,
    pub metrics: PipelineMetrics,
    /// Cancelled when the pipeline stops or aborts.
    pub root: CancellationToken,
    /// Cancelled once shutdown starts draining; recovery then gives up on
    /// work that cannot complete.
    pub stopping: CancellationToken,
    pub tasks: TaskTracker,
    pub table_name: String,
    pub partition_key_prefix: String,
    fatal: OnceLock<String>,
}

pub(crate) struct RecoveryReceivers {
    pub storage: StorageRecoveryQueues,
    pub notification: mpsc::UnboundedReceiver<BlobContext>,
    pub side_queue: mpsc::UnboundedReceiver<BlobContext>,
}

impl PipelineServices {
    pub(crate) fn new(
        options: PipelineOptions,
        factory: Arc<dyn StorageServiceFactory>,
        notifier: Arc<dyn NotificationService>,
        root: CancellationToken,
    ) -> (Arc<Self>, RecoveryReceivers) {
        let tasks = TaskTracker::new();
        let state = Arc::new(PipelineState::new());
        let accounts = Arc::new(StorageAccounts::new(
            &options,
            factory,
            root.clone(),
            tasks.clone(),
        ));

        let (storage_recovery, storage_queues) = StorageRecovery::new(&accounts.names());
        let (notification_recovery, notification_rx) = NotificationRecovery::new();
        let (side_queues, side_queue_rx) = NotifySideQueues::new();

        let services = Arc::new(Self {
            table_name: options.state_table_name(),
            partition_key_prefix: options.partition_key_prefix(),
            options,
            state,
            accounts,
            notifier,
            storage_recovery,
            notification_recovery,
            side_queues,
            block_numbers: BlockNumbers::new(),
            metrics: PipelineMetrics::default(),
            stopping: root.child_token(),
            root,
            tasks,
            fatal: OnceLock::new(),
        });

        let receivers = RecoveryReceivers {
            storage: storage_queues,
            notification: notification_rx,
            side_queue: side_queue_rx,
        };

        (services, receivers)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    /// Stop the whole pipeline after an unrecoverable error.
    pub fn abort(&self, message: String) {
        error!(message = %message, "aborting pipeline");
        let _ = self.fatal.set(message);
        self.root.cancel();
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.get().map(String::as_str)
    }
}
