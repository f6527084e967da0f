//! Runs storage operations with local recovery.

use std::{future::Future, sync::Arc};

use convoy_storage::StorageService;
use tracing::{error, warn};

use crate::{
    classify::{Action, OperationError, Recovery, classify},
    services::PipelineServices,
};

/// Consecutive identical create/exists recoveries tolerated before giving up.
const MAX_IMMEDIATE_RETRIES: u32 = 3;

/// Run `op` against `account`, recovering locally from what `action` allows.
///
/// `op` receives a client for the current key and the recovery that caused
/// the retry, if any, so it can create missing resources or accept an
/// "already exists" outcome. The returned `Recovery` describes the failure the
/// caller has to deal with.
pub async fn with_storage<T, F, Fut>(
    services: &Arc<PipelineServices>,
    action: Action,
    account: &str,
    force: bool,
    mut op: F,
) -> Result<T, Recovery>
where
    F: FnMut(Arc<dyn StorageService>, Option<Recovery>) -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
{
    let mut lease = match services.accounts.lease(account, force).await {
        Ok(lease) => lease,
        Err(err) => return Err(classify(&err)),
    };

    let mut last = None;
    let mut tries = 0;
    let mut immediate = 0;

    loop {
        let result = match lease.service().await {
            Ok(service) => op(service, last).await,
            Err(err) => Err(err.into()),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let recovery = classify(&err);

        if !action.can_recover(recovery) {
            report_unrecoverable(services, action, account, recovery, &err);
            return Err(recovery);
        }

        if last == Some(recovery) {
            immediate += 1;
        } else {
            immediate = 0;
        }
        last = Some(recovery);

        match recovery {
            Recovery::CreateContainer
            | Recovery::CreateTable
            | Recovery::CreateBlob
            | Recovery::CreateResource
            | Recovery::ContainerExists
            | Recovery::BlobExists
            | Recovery::TableExists
            | Recovery::EntityExists => {
                if immediate >= MAX_IMMEDIATE_RETRIES {
                    warn!(action = action.name(), account, err = %err, "giving up after repeated failures");
                    return Err(recovery);
                }
            }
            Recovery::InvalidStorageKey | Recovery::NotifyFailedBlobNotAccessible => {
                if lease.switch_key() {
                    warn!(action = action.name(), account, err = %err, "switching storage key");
                    continue;
                }

                warn!(action = action.name(), account, err = %err, "no storage key works");
                if recovery == Recovery::InvalidStorageKey {
                    drop(lease);
                    services.accounts.failed_storage_account(account, recovery);
                }
                return Err(recovery);
            }
            Recovery::TableBusy
            | Recovery::IoFailure
            | Recovery::ServiceUnavailable
            | Recovery::NotificationProcessDown
            | Recovery::InvalidInstrumentationKey
            | Recovery::InvalidSchemaId => {
                tries += 1;
                if tries < services.options.io_max_tries() {
                    warn!(
                        action = action.name(),
                        account,
                        err = %err,
                        try_number = tries,
                        "operation failed, retrying"
                    );
                    // A draining pipeline retries without waiting; a stopped
                    // one gives up.
                    tokio::select! {
                        _ = services.root.cancelled() => return Err(recovery),
                        _ = services.stopping.cancelled() => {}
                        _ = tokio::time::sleep(services.options.io_retry_delay) => {}
                    }
                    continue;
                }

                warn!(action = action.name(), account, err = %err, "operation failed, no retries left");
                let account_down = recovery == Recovery::IoFailure
                    || (recovery == Recovery::ServiceUnavailable && action != Action::Notify);
                if account_down {
                    drop(lease);
                    services.accounts.failed_storage_account(account, recovery);
                }
                return Err(recovery);
            }
            Recovery::AccessDenied
            | Recovery::AllAccountsDead
            | Recovery::NotRecoverable
            | Recovery::HttpUnknown
            | Recovery::Unknown => {
                report_unrecoverable(services, action, account, recovery, &err);
                return Err(recovery);
            }
        }
    }
}

/// Log a failure that cannot be recovered locally, aborting on unknown errors
/// when configured to.
pub fn report_unrecoverable(
    services: &PipelineServices,
    action: Action,
    account: &str,
    recovery: Recovery,
    err: &OperationError,
) {
    match recovery {
        Recovery::Unknown | Recovery::HttpUnknown => {
            error!(action = action.name(), account, err = %err, "unknown io error");
            if services.options.stop_on_unknown_io_errors {
                services.abort(format!("unknown io error during {}: {err}", action.name()));
            }
        }
        _ => {
            warn!(action = action.name(), account, recovery = ?recovery, err = %err, "operation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use convoy_storage::{ErrorCode, InMemoryStorageFactory, StorageError};

    use super::*;
    use crate::{
        config::PipelineOptions,
        test_utils::{FaultInjectingStorageFactory, RecordingNotifier, services_with},
    };

    fn services(options: PipelineOptions) -> (Arc<PipelineServices>, Arc<FaultInjectingStorageFactory>) {
        let faults = Arc::new(FaultInjectingStorageFactory::new(Arc::new(
            InMemoryStorageFactory::default(),
        )));
        let services = services_with(
            options.with_account("account1", &["key1"]),
            faults.clone(),
            Arc::new(RecordingNotifier::default()),
        );
        (services, faults)
    }

    async fn put_block(services: &Arc<PipelineServices>) -> Result<(), Recovery> {
        with_storage(services, Action::Upload, "account1", false, |service, last| async move {
            if last == Some(Recovery::CreateContainer) {
                service.create_container("container").await?;
            }
            service
                .put_block("container", "blob", "100001", Bytes::from_static(b"data"))
                .await?;
            Ok::<_, OperationError>(())
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_wait_ends_when_pipeline_stops() {
        let (services, faults) =
            services(PipelineOptions::default().with_io_retry(Duration::from_secs(60), 2));
        let busy = StorageError::service(503, ErrorCode::Other("ServerBusy".into()), "busy");
        faults.fail("account1", "put_block", busy, usize::MAX);

        let stopper = services.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.root.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), put_block(&services))
            .await
            .expect("retry wait was not cut short");
        assert_eq!(result, Err(Recovery::ServiceUnavailable));
        assert!(services.accounts.is_account_on("account1"));
        assert_eq!(faults.operations("account1"), vec!["put_block"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_draining_pipeline_retries_without_waiting() {
        let (services, faults) =
            services(PipelineOptions::default().with_io_retry(Duration::from_secs(60), 2));
        let busy = StorageError::service(503, ErrorCode::Other("ServerBusy".into()), "busy");
        faults.fail("account1", "put_block", busy, 1);
        services.stopping.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), put_block(&services))
            .await
            .expect("retried without waiting");
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_unknown_error_aborts_when_configured() {
        let (services, faults) =
            services(PipelineOptions::default().with_stop_on_unknown_io_errors(true));
        let teapot = StorageError::service(418, ErrorCode::Other("Teapot".into()), "teapot");
        faults.fail("account1", "put_block", teapot, 1);

        assert_eq!(put_block(&services).await, Err(Recovery::HttpUnknown));
        assert!(services.root.is_cancelled());
        assert!(
            services
                .fatal_error()
                .is_some_and(|message| message.starts_with("unknown io error during"))
        );
    }

    #[tokio::test]
    async fn test_unknown_error_is_only_logged_by_default() {
        let (services, faults) = services(PipelineOptions::default());
        let teapot = StorageError::service(418, ErrorCode::Other("Teapot".into()), "teapot");
        faults.fail("account1", "put_block", teapot, 1);

        assert_eq!(put_block(&services).await, Err(Recovery::HttpUnknown));
        assert!(!services.root.is_cancelled());
        assert!(services.fatal_error().is_none());
    }
}
