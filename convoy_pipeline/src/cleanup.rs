//! Removal of expired containers.
//!
//! Containers older than the retention time (plus a day of grace) are deleted.
//! Blobs that were never notified are first copied to the orphan container,
//! unless the pipeline is configured to drop them.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use convoy_storage::{CopyStatus, EntityFilter};
use tracing::{info, warn};

use crate::{
    classify::{Action, OperationError, Recovery},
    consts::CLEANUP_GRACE_DAYS,
    context::{BlobContext, LogState},
    services::PipelineServices,
    state_table,
    storage_io::with_storage,
};

const COPY_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn is_expired(last_modified: DateTime<Utc>, retention: Duration, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| last_modified.checked_add_signed(retention))
        .and_then(|t| t.checked_add_signed(chrono::Duration::days(CLEANUP_GRACE_DAYS)))
        .is_some_and(|expiry| expiry <= now)
}

pub(crate) fn spawn_storage_cleanup(services: &Arc<PipelineServices>) {
    if services.options.disable_cleanup {
        return;
    }

    for account in services.accounts.names() {
        services
            .tasks
            .spawn(run_cleanup(services.clone(), account));
    }
}

async fn run_cleanup(services: Arc<PipelineServices>, account: String) {
    loop {
        let deleted = cleanup_account(&services, &account).await;
        if deleted > 0 {
            info!(account = %account, deleted, "expired containers deleted");
        }

        tokio::select! {
            _ = services.stopping.cancelled() => return,
            _ = tokio::time::sleep(services.options.cleanup_interval) => {}
        }
    }
}

/// Delete the account's expired containers. Returns how many were deleted.
pub async fn cleanup_account(services: &Arc<PipelineServices>, account: &str) -> usize {
    let prefix = format!("{}-", services.options.container_prefix);
    let now = Utc::now();
    let mut continuation: Option<String> = None;
    let mut expired = Vec::new();

    loop {
        let page = with_storage(services, Action::Cleanup, account, false, |service, _| {
            let prefix = prefix.as_str();
            let continuation = continuation.clone();
            async move {
                Ok::<_, OperationError>(service.list_containers(prefix, continuation).await?)
            }
        })
        .await;

        let Ok(page) = page else {
            warn!(account, "failed to list containers");
            return 0;
        };

        expired.extend(
            page.items
                .into_iter()
                .filter(|c| is_expired(c.last_modified, services.options.blob_retention_time, now))
                .map(|c| c.name),
        );

        continuation = page.continuation;
        if continuation.is_none() {
            break;
        }
    }

    let mut deleted = 0;
    for container in expired {
        if cleanup_container(services, account, &container).await {
            deleted += 1;
        }
    }
    deleted
}

/// Delete a container, saving its not-notified blobs first when configured.
pub async fn cleanup_container(services: &Arc<PipelineServices>, account: &str, container: &str) -> bool {
    if !services.options.delete_not_notified_blobs
        && !quarantine_not_notified(services, account, container).await
    {
        warn!(account, container, "keeping container, not notified blobs could not be saved");
        return false;
    }

    let result = with_storage(services, Action::Cleanup, account, false, |service, last| async move {
        if last == Some(Recovery::CreateContainer) {
            // Already deleted.
            return Ok(());
        }
        Ok::<_, OperationError>(service.delete_container(container).await?)
    })
    .await;

    match result {
        Ok(()) => {
            info!(account, container, "expired container deleted");
            true
        }
        Err(recovery) => {
            warn!(account, container, recovery = ?recovery, "failed to delete expired container");
            false
        }
    }
}

async fn quarantine_not_notified(
    services: &Arc<PipelineServices>,
    account: &str,
    container: &str,
) -> bool {
    let orphan = services.options.orphan_container_name();
    let filter = EntityFilter::all()
        .property_eq("container_name", container)
        .property_ne("log_state", LogState::Notified.as_str());
    let mut continuation = None;

    loop {
        let Some(page) = state_table::query(services, account, &filter, continuation).await else {
            return false;
        };

        for entity in page.items {
            let ctx = match BlobContext::from_entity(&entity) {
                Ok(ctx) => ctx,
                Err(err) => {
                    warn!(account, err = %err, "skipping invalid state row");
                    continue;
                }
            };

            if !copy_to_orphans(services, account, &orphan, &ctx).await {
                return false;
            }

            if !state_table::delete(services, &ctx, ctx.log_state).await {
                return false;
            }
        }

        continuation = page.continuation;
        if continuation.is_none() {
            return true;
        }
    }
}

async fn copy_to_orphans(
    services: &Arc<PipelineServices>,
    account: &str,
    orphan: &str,
    ctx: &BlobContext,
) -> bool {
    let result = with_storage(services, Action::Cleanup, account, false, |service, last| async move {
        match last {
            // Never committed, nothing to keep.
            Some(Recovery::CreateBlob) => return Ok(CopyStatus::Success),
            Some(Recovery::CreateContainer) => service.create_container(orphan).await?,
            _ => {}
        }

        let mut status = service
            .copy_blob(orphan, &ctx.blob_name, &ctx.container_name, &ctx.blob_name)
            .await?;
        while status == CopyStatus::Pending {
            tokio::time::sleep(COPY_POLL_INTERVAL).await;
            status = service.copy_status(orphan, &ctx.blob_name).await?;
        }
        Ok::<_, OperationError>(status)
    })
    .await;

    match result {
        Ok(CopyStatus::Success) => {
            info!(account, blob = %ctx, orphan, "not notified blob moved to orphan container");
            true
        }
        Ok(status) => {
            warn!(account, blob = %ctx, status = ?status, "copy to orphan container failed");
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_expiry_includes_a_day_of_grace() {
        let last_modified = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let retention = Duration::from_secs(7 * 24 * 3600);

        let just_before = Utc.with_ymd_and_hms(2024, 5, 8, 23, 59, 59).unwrap();
        let at_expiry = Utc.with_ymd_and_hms(2024, 5, 9, 0, 0, 0).unwrap();

        assert!(!is_expired(last_modified, retention, just_before));
        assert!(is_expired(last_modified, retention, at_expiry));
    }
}
