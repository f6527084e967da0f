//! Per-account queues of blob operations waiting for storage to recover.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use crate::{
    blob,
    context::BlobContext,
    notification, recovery::give_up,
    services::PipelineServices,
    state_table,
};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    Commit,
    Notify,
    StateTableUpdate,
}

impl RecoveryAction {
    pub const ALL: [RecoveryAction; 3] = [
        RecoveryAction::Commit,
        RecoveryAction::Notify,
        RecoveryAction::StateTableUpdate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RecoveryAction::Commit => "commit",
            RecoveryAction::Notify => "notify",
            RecoveryAction::StateTableUpdate => "state_table_update",
        }
    }
}

type QueueKey = (RecoveryAction, String);

pub struct StorageRecovery {
    queues: HashMap<QueueKey, mpsc::UnboundedSender<BlobContext>>,
}

pub struct StorageRecoveryQueues {
    receivers: Vec<(QueueKey, mpsc::UnboundedReceiver<BlobContext>)>,
}

impl StorageRecovery {
    pub fn new(accounts: &[String]) -> (Self, StorageRecoveryQueues) {
        let mut queues = HashMap::new();
        let mut receivers = Vec::new();

        for account in accounts {
            for action in RecoveryAction::ALL {
                let (tx, rx) = mpsc::unbounded_channel();
                queues.insert((action, account.clone()), tx);
                receivers.push(((action, account.clone()), rx));
            }
        }

        (Self { queues }, StorageRecoveryQueues { receivers })
    }

    /// Queue the blob until its storage account can take the action.
    pub fn recover_later(
        &self,
        services: &PipelineServices,
        ctx: BlobContext,
        action: RecoveryAction,
    ) {
        if services.is_stopping() {
            give_up(services, &ctx, action);
            return;
        }

        let key = (action, ctx.account().to_string());
        let Some(queue) = self.queues.get(&key) else {
            warn!(account = %key.1, action = action.name(), blob = %ctx, "no recovery queue for account");
            give_up(services, &ctx, action);
            return;
        };

        debug!(action = action.name(), blob = %ctx, "queued for storage recovery");
        services.metrics.recovery_enqueued(action.name());

        if let Err(mpsc::error::SendError(ctx)) = queue.send(ctx) {
            give_up(services, &ctx, action);
        }
    }
}

pub(crate) fn spawn_storage_recovery(services: &Arc<PipelineServices>, queues: StorageRecoveryQueues) {
    for ((action, account), rx) in queues.receivers {
        services
            .tasks
            .spawn(run_queue(services.clone(), action, account, rx));
    }
}

async fn run_queue(
    services: Arc<PipelineServices>,
    action: RecoveryAction,
    account: String,
    mut rx: mpsc::UnboundedReceiver<BlobContext>,
) {
    let semaphore = Arc::new(Semaphore::new(services.options.recovery_concurrency));

    loop {
        let ctx = tokio::select! {
            _ = services.root.cancelled() => return,
            ctx = rx.recv() => match ctx {
                Some(ctx) => ctx,
                None => return,
            },
        };

        while !services.accounts.is_account_on(&account) && !services.is_stopping() {
            tokio::select! {
                _ = services.root.cancelled() => return,
                _ = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
            }
        }

        if !services.accounts.is_account_on(&account) {
            give_up(&services, &ctx, action);
            continue;
        }

        let permit = tokio::select! {
            _ = services.root.cancelled() => return,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let task_services = services.clone();
        services.tasks.spawn(async move {
            let _permit = permit;
            execute(task_services, action, ctx).await;
        });
    }
}

async fn execute(services: Arc<PipelineServices>, action: RecoveryAction, ctx: BlobContext) {
    match action {
        RecoveryAction::Commit => blob::commit(&services, ctx).await,
        RecoveryAction::Notify => notification::notify(&services, ctx).await,
        RecoveryAction::StateTableUpdate => state_table::update(&services, ctx).await,
    }
}
