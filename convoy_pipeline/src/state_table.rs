//! The state table: one row per blob, in the partition of its phase.
//!
//! Phase changes insert the row of the next phase before deleting the row of
//! the previous one, so a crash never loses track of a blob.

use std::sync::Arc;

use convoy_storage::{EntityFilter, Page, TableEntity};
use tracing::debug;

use crate::{
    classify::{Action, OperationError, Recovery},
    context::{BlobContext, LogState},
    recovery::storage::RecoveryAction,
    services::PipelineServices,
    storage_io::with_storage,
};

/// Insert the row of the blob's current phase.
pub async fn insert(services: &Arc<PipelineServices>, ctx: &BlobContext) -> bool {
    let table = services.table_name.as_str();
    let entity = ctx.to_entity(&services.partition_key_prefix);

    let result = with_storage(
        services,
        Action::StateTableInsert,
        ctx.account(),
        false,
        |service, last| {
            let entity = &entity;
            async move {
                match last {
                    Some(Recovery::EntityExists) if ctx.log_state == LogState::Uploading => {
                        return Err(OperationError::NotRecoverable);
                    }
                    // A previous attempt already wrote the row.
                    Some(Recovery::EntityExists) => return Ok(()),
                    Some(Recovery::CreateTable) => service.create_table(table).await?,
                    _ => {}
                }
                service.insert_entity(table, entity).await?;
                Ok::<_, OperationError>(())
            }
        },
    )
    .await;

    match result {
        Ok(()) => {
            debug!(blob = %ctx, "state row inserted");
            true
        }
        Err(_) => false,
    }
}

/// Delete the row of the blob in the given phase.
pub async fn delete(services: &Arc<PipelineServices>, ctx: &BlobContext, log_state: LogState) -> bool {
    let table = services.table_name.as_str();
    let partition_key = ctx.partition_key(&services.partition_key_prefix, log_state);
    let row_key = ctx.row_key();

    let result = with_storage(
        services,
        Action::StateTableDelete,
        ctx.account(),
        false,
        |service, last| {
            let partition_key = partition_key.as_str();
            let row_key = row_key.as_str();
            async move {
                match last {
                    // Already gone.
                    Some(Recovery::CreateResource) => return Ok(()),
                    Some(Recovery::CreateTable) => service.create_table(table).await?,
                    _ => {}
                }
                service.delete_entity(table, partition_key, row_key).await?;
                Ok::<_, OperationError>(())
            }
        },
    )
    .await;

    result.is_ok()
}

/// Move the blob's row to its current phase, and hand the blob to the next
/// stage. Queued for storage recovery on failure.
pub async fn update(services: &Arc<PipelineServices>, ctx: BlobContext) {
    let done = match ctx.log_state {
        LogState::Uploading => delete(services, &ctx, LogState::Uploading).await,
        LogState::Committed => {
            insert(services, &ctx).await && delete(services, &ctx, LogState::Uploading).await
        }
        LogState::Notified => {
            (!services.options.save_notified_blobs_records || insert(services, &ctx).await)
                && delete(services, &ctx, LogState::Committed).await
        }
    };

    if !done {
        services
            .storage_recovery
            .recover_later(services, ctx, RecoveryAction::StateTableUpdate);
        return;
    }

    match ctx.log_state {
        LogState::Uploading => {
            debug!(blob = %ctx, "abandoned blob removed from state table");
        }
        LogState::Committed => {
            services.state.dec_pending_commits();
            services.state.inc_pending_notifications();
            services.metrics.blobs_committed.add(1, &[]);
            services.notification_recovery.enqueue(ctx);
        }
        LogState::Notified => {
            services.state.dec_pending_notifications();
            services.metrics.blobs_notified.add(1, &[]);
            debug!(blob = %ctx, "blob notified");
        }
    }
}

/// Fetch one page of rows of the account's state table.
pub async fn query(
    services: &Arc<PipelineServices>,
    account: &str,
    filter: &EntityFilter,
    continuation: Option<String>,
) -> Option<Page<TableEntity>> {
    let table = services.table_name.as_str();

    with_storage(
        services,
        Action::StateTableQuery,
        account,
        false,
        |service, last| {
            let continuation = continuation.clone();
            async move {
                if last == Some(Recovery::CreateTable) {
                    service.create_table(table).await?;
                }
                let page = service.query_entities(table, filter, continuation).await?;
                Ok::<_, OperationError>(page)
            }
        },
    )
    .await
    .ok()
}
