//! Notifications waiting for the endpoint.
//!
//! Committed blobs are notified through this queue. When a notification
//! fails for an endpoint-side reason the endpoint is marked unhealthy, and the
//! worker probes it before sending anything else.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

use crate::{
    context::BlobContext,
    notification::{self, test_notification},
    recovery::{give_up, storage::RecoveryAction},
    services::PipelineServices,
};

pub struct NotificationRecovery {
    tx: mpsc::UnboundedSender<BlobContext>,
    healthy: AtomicBool,
}

impl NotificationRecovery {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BlobContext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recovery = Self {
            tx,
            healthy: AtomicBool::new(true),
        };
        (recovery, rx)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Queue a committed blob for notification.
    pub fn enqueue(&self, ctx: BlobContext) {
        if let Err(mpsc::error::SendError(ctx)) = self.tx.send(ctx) {
            warn!(blob = %ctx, "notification queue is closed");
        }
    }

    /// Queue a blob whose notification failed, holding notifications until
    /// the endpoint answers again.
    pub fn recover_later(&self, services: &PipelineServices, ctx: BlobContext) {
        self.healthy.store(false, Ordering::Release);

        if services.is_stopping() {
            give_up(services, &ctx, RecoveryAction::Notify);
            return;
        }

        services.metrics.recovery_enqueued(RecoveryAction::Notify.name());
        self.enqueue(ctx);
    }
}

pub(crate) fn spawn_notification_recovery(
    services: &Arc<PipelineServices>,
    rx: mpsc::UnboundedReceiver<BlobContext>,
) {
    services.tasks.spawn(run_queue(services.clone(), rx));
}

async fn run_queue(services: Arc<PipelineServices>, mut rx: mpsc::UnboundedReceiver<BlobContext>) {
    let semaphore = Arc::new(Semaphore::new(services.options.recovery_concurrency));

    loop {
        let ctx = tokio::select! {
            _ = services.root.cancelled() => return,
            ctx = rx.recv() => match ctx {
                Some(ctx) => ctx,
                None => return,
            },
        };

        if !wait_until_healthy(&services).await {
            if services.root.is_cancelled() {
                return;
            }
            give_up(&services, &ctx, RecoveryAction::Notify);
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
            notification::notify(&task_services, ctx).await;
        });
    }
}

/// Returns false when the pipeline stops before the endpoint recovers.
async fn wait_until_healthy(services: &Arc<PipelineServices>) -> bool {
    let recovery = &services.notification_recovery;

    while !recovery.is_healthy() {
        match test_notification(services).await {
            Ok(()) => {
                info!("notification endpoint is back on");
                recovery.healthy.store(true, Ordering::Release);
                break;
            }
            Err(err) => {
                warn!(err = %err, "notification endpoint is still off");
            }
        }

        if services.is_stopping() {
            return false;
        }

        tokio::select! {
            _ = services.root.cancelled() => return false,
            _ = tokio::time::sleep(services.options.resurrect_delay) => {}
        }
    }

    true
}
