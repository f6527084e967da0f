//! Recovery of blobs left unfinished by a previous run.
//!
//! Every account's state table is scanned once at startup. Blobs still being
//! uploaded are reconciled with the blocks the store actually holds; committed
//! blobs go straight to notification.

use std::{sync::Arc, time::Duration};

use convoy_storage::{BlockList, EntityFilter};
use tracing::{info, warn};

use crate::{
    classify::{Action, OperationError, Recovery},
    context::{BlobContext, LogState},
    recovery::storage::RecoveryAction,
    services::PipelineServices,
    state_table,
    storage_io::with_storage,
};

const RETRY_DELAY: Duration = Duration::from_secs(60);

/// What a blob found in the uploading phase needs next.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// The blocks were committed but the state row was not moved.
    Committed(BlobContext),
    /// Blocks were uploaded but never committed.
    Uncommitted(BlobContext),
    /// Nothing was uploaded; only the state row remains.
    Empty(BlobContext),
}

/// Rebuild the blob context from the blocks held by the store.
pub fn reconcile(mut ctx: BlobContext, blocks: BlockList) -> Reconciled {
    let (blocks, committed) = if blocks.uncommitted.is_empty() {
        (blocks.committed, true)
    } else {
        (blocks.uncommitted, false)
    };

    ctx.uploaded_block_ids = blocks.iter().map(|block| block.name.clone()).collect();
    ctx.uploaded_bytesize = blocks.iter().map(|block| block.size).sum();

    if ctx.uploaded_block_ids.is_empty() || ctx.uploaded_bytesize == 0 {
        Reconciled::Empty(ctx)
    } else if committed {
        ctx.log_state = LogState::Committed;
        Reconciled::Committed(ctx)
    } else {
        Reconciled::Uncommitted(ctx)
    }
}

pub(crate) fn spawn_startup_recovery(services: &Arc<PipelineServices>) {
    for account in services.accounts.names() {
        for log_state in [LogState::Uploading, LogState::Committed] {
            services
                .tasks
                .spawn(recover_partition(services.clone(), account.clone(), log_state));
        }
    }
}

/// Wait before retrying. Returns false if the pipeline stops meanwhile.
async fn wait_retry(services: &PipelineServices) -> bool {
    tokio::select! {
        _ = services.stopping.cancelled() => false,
        _ = tokio::time::sleep(RETRY_DELAY) => true,
    }
}

async fn recover_partition(services: Arc<PipelineServices>, account: String, log_state: LogState) {
    let filter = EntityFilter::partition(format!("{}-{log_state}", services.partition_key_prefix));
    let mut continuation = None;
    let mut reconciled = Vec::new();
    let mut notifications = 0usize;

    loop {
        let Some(page) =
            state_table::query(&services, &account, &filter, continuation.clone()).await
        else {
            warn!(account = %account, log_state = %log_state, "state table scan failed, retrying");
            if !wait_retry(&services).await {
                return;
            }
            continue;
        };

        for entity in page.items {
            let mut ctx = match BlobContext::from_entity(&entity) {
                Ok(ctx) => ctx,
                Err(err) => {
                    warn!(account = %account, err = %err, "skipping invalid state row");
                    continue;
                }
            };
            ctx.storage_account = Some(account.clone());

            match log_state {
                LogState::Committed | LogState::Notified => {
                    services.state.inc_pending_notifications();
                    services.notification_recovery.enqueue(ctx);
                    notifications += 1;
                }
                LogState::Uploading => loop {
                    if let Some(blocks) = list_blocks(&services, &ctx).await {
                        reconciled.push(reconcile(ctx, blocks));
                        break;
                    }

                    warn!(account = %account, blob = %ctx, "listing blocks failed, retrying");
                    if !wait_retry(&services).await {
                        return;
                    }
                },
            }
        }

        continuation = page.continuation;
        if continuation.is_none() {
            break;
        }
    }

    let found = reconciled.len() + notifications;
    for item in reconciled {
        match item {
            Reconciled::Committed(ctx) => {
                services.state.inc_pending_commits();
                services
                    .storage_recovery
                    .recover_later(&services, ctx, RecoveryAction::StateTableUpdate);
            }
            Reconciled::Uncommitted(ctx) => {
                services.state.inc_pending_commits();
                services
                    .storage_recovery
                    .recover_later(&services, ctx, RecoveryAction::Commit);
            }
            Reconciled::Empty(ctx) => {
                services
                    .storage_recovery
                    .recover_later(&services, ctx, RecoveryAction::StateTableUpdate);
            }
        }
    }

    info!(account = %account, log_state = %log_state, found, "startup recovery scan finished");
}

async fn list_blocks(services: &Arc<PipelineServices>, ctx: &BlobContext) -> Option<BlockList> {
    with_storage(
        services,
        Action::ListBlocks,
        ctx.account(),
        false,
        |service, last| async move {
            match last {
                Some(Recovery::CreateBlob) | Some(Recovery::CreateContainer) => {
                    Ok::<_, OperationError>(BlockList::default())
                }
                _ => Ok(service.list_blocks(&ctx.container_name, &ctx.blob_name).await?),
            }
        },
    )
    .await
    .ok()
}
