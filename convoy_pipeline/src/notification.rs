//! Notifying the analytics endpoint about committed blobs.

use std::sync::Arc;

use chrono::Utc;
use convoy_notify::{NotificationEnvelope, NotifyError};
use tracing::{debug, warn};

use crate::{
    classify::{Action, OperationError, Recovery, classify},
    context::{BlobContext, LogState, SubState},
    recovery::storage::RecoveryAction,
    services::PipelineServices,
    state_table,
    storage_io::with_storage,
};

const PROBE_BLOB_URI: &str = "https://probe.invalid/convoy/probe";

/// Tell the endpoint the blob is ready, then mark it notified.
pub async fn notify(services: &Arc<PipelineServices>, mut ctx: BlobContext) {
    if !services.options.disable_notification {
        let expiry = Utc::now()
            + chrono::Duration::from_std(services.options.blob_access_expiry_time)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        let version = services.options.notification_version;
        let notifier = services.notifier.clone();

        let result = with_storage(
            services,
            Action::Notify,
            ctx.account(),
            true,
            |service, _last| {
                let ctx = &ctx;
                let notifier = notifier.clone();
                async move {
                    let blob_sas_uri =
                        service.signed_read_url(&ctx.container_name, &ctx.blob_name, expiry)?;
                    let envelope = NotificationEnvelope::new(
                        &ctx.instrumentation_key,
                        &ctx.schema_id,
                        blob_sas_uri,
                        version,
                        Utc::now(),
                    );
                    notifier.notify(&envelope).await?;
                    Ok::<_, OperationError>(())
                }
            },
        )
        .await;

        if let Err(recovery) = result {
            notify_retry_later(services, ctx, recovery);
            return;
        }
    }

    debug!(blob = %ctx, "notification accepted");
    ctx.log_state = LogState::Notified;
    ctx.sub_state = SubState::None;
    state_table::update(services, ctx).await;
}

fn notify_retry_later(services: &Arc<PipelineServices>, mut ctx: BlobContext, recovery: Recovery) {
    match recovery {
        Recovery::NotifyFailedBlobNotAccessible => {
            warn!(blob = %ctx, "blob not accessible to the endpoint, waiting for storage");
            ctx.sub_state = SubState::NotifyBlocked;
            services
                .storage_recovery
                .recover_later(services, ctx, RecoveryAction::Notify);
        }
        Recovery::InvalidInstrumentationKey | Recovery::InvalidSchemaId => {
            ctx.sub_state = if recovery == Recovery::InvalidInstrumentationKey {
                SubState::InvalidInstrumentationKey
            } else {
                SubState::InvalidSchemaId
            };
            warn!(
                blob = %ctx,
                instrumentation_key = %ctx.instrumentation_key,
                schema_id = %ctx.schema_id,
                sub_state = ?ctx.sub_state,
                "notification rejected, parking blob"
            );
            services.side_queues.divert(services, ctx);
        }
        _ => {
            services
                .notification_recovery
                .recover_later(services, ctx);
        }
    }
}

/// Post a notification with the null key.
///
/// The endpoint is up when it accepts it or rejects the key or schema.
pub async fn test_notification(services: &PipelineServices) -> Result<(), NotifyError> {
    let envelope = NotificationEnvelope::probe(
        PROBE_BLOB_URI,
        services.options.notification_version,
        Utc::now(),
    );

    match services.notifier.notify(&envelope).await {
        Ok(()) => Ok(()),
        Err(err) => match classify(&OperationError::from(err.clone())) {
            Recovery::InvalidInstrumentationKey | Recovery::InvalidSchemaId => Ok(()),
            _ => Err(err),
        },
    }
}
