//! Notifications parked because the endpoint rejected their key or schema.
//!
//! Each instrumentation key and schema pair gets its own queue, retried at a
//! slow pace so that a misconfigured key never holds back the others.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    channel::ChannelKey,
    context::BlobContext,
    notification,
    recovery::{give_up, storage::RecoveryAction},
    services::PipelineServices,
};

pub struct NotifySideQueues {
    tx: mpsc::UnboundedSender<BlobContext>,
    lengths: DashMap<ChannelKey, usize>,
}

impl NotifySideQueues {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BlobContext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queues = Self {
            tx,
            lengths: DashMap::new(),
        };
        (queues, rx)
    }

    /// Number of blobs parked for the key and schema.
    pub fn len(&self, key: &ChannelKey) -> usize {
        self.lengths.get(key).map(|len| *len).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.iter().all(|len| *len == 0)
    }

    pub fn divert(&self, services: &PipelineServices, ctx: BlobContext) {
        if services.is_stopping() {
            give_up(services, &ctx, RecoveryAction::Notify);
            return;
        }

        let key = ChannelKey::of(&ctx);
        *self.lengths.entry(key.clone()).or_default() += 1;

        if let Err(mpsc::error::SendError(ctx)) = self.tx.send(ctx) {
            self.taken(&key);
            give_up(services, &ctx, RecoveryAction::Notify);
        }
    }

    fn taken(&self, key: &ChannelKey) {
        if let Some(mut len) = self.lengths.get_mut(key) {
            *len = len.saturating_sub(1);
        }
    }
}

pub(crate) fn spawn_side_queues(
    services: &Arc<PipelineServices>,
    rx: mpsc::UnboundedReceiver<BlobContext>,
) {
    services.tasks.spawn(dispatch(services.clone(), rx));
}

async fn dispatch(services: Arc<PipelineServices>, mut rx: mpsc::UnboundedReceiver<BlobContext>) {
    let mut queues: HashMap<ChannelKey, mpsc::UnboundedSender<BlobContext>> = HashMap::new();

    loop {
        let ctx = tokio::select! {
            _ = services.root.cancelled() => return,
            ctx = rx.recv() => match ctx {
                Some(ctx) => ctx,
                None => return,
            },
        };

        let key = ChannelKey::of(&ctx);
        let queue = queues.entry(key.clone()).or_insert_with(|| {
            info!(key = %key, "opening notification side queue");
            let (tx, rx) = mpsc::unbounded_channel();
            services.tasks.spawn(run_queue(services.clone(), key.clone(), rx));
            tx
        });

        if let Err(mpsc::error::SendError(ctx)) = queue.send(ctx) {
            services.side_queues.taken(&key);
            give_up(&services, &ctx, RecoveryAction::Notify);
        }
    }
}

async fn run_queue(
    services: Arc<PipelineServices>,
    key: ChannelKey,
    mut rx: mpsc::UnboundedReceiver<BlobContext>,
) {
    loop {
        let ctx = tokio::select! {
            _ = services.root.cancelled() => return,
            ctx = rx.recv() => match ctx {
                Some(ctx) => ctx,
                None => return,
            },
        };

        tokio::select! {
            _ = services.root.cancelled() => return,
            _ = services.stopping.cancelled() => {
                services.side_queues.taken(&key);
                give_up(&services, &ctx, RecoveryAction::Notify);
                continue;
            }
            _ = tokio::time::sleep(services.options.side_queue_retry_delay) => {}
        }

        services.side_queues.taken(&key);
        debug!(key = %key, blob = %ctx, "retrying parked notification");
        notification::notify(&services, ctx).await;
    }
}
