//! Graceful shutdown: drain memory, then commits, then notifications.

use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::{channels::Channels, services::PipelineServices};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Shutdown {
    services: Arc<PipelineServices>,
    channels: Arc<Channels>,
}

impl Shutdown {
    pub fn new(services: Arc<PipelineServices>, channels: Arc<Channels>) -> Self {
        Self { services, channels }
    }

    /// Drain the pipeline.
    ///
    /// Events are flushed and uploaded first. Recovery then switches to giving
    /// up on work that cannot complete, pipes commit their blobs, and the
    /// shutdown waits for every commit and notification in flight. Blobs given
    /// up stay in the state table for the next run.
    pub async fn submit(&self) {
        info!("shutting down pipeline");

        self.channels.close().await;
        self.wait_drained("uploading events", |services| {
            self.channels.flush_all();
            services.state.bytes_in_memory()
        })
        .await;

        self.services.stopping.cancel();
        self.channels.close_pipes();

        self.wait_drained("committing blobs", |services| {
            services.state.pending_commits()
        })
        .await;
        self.wait_drained("notifying blobs", |services| {
            services.state.pending_notifications()
        })
        .await;

        info!("pipeline drained");
    }

    async fn wait_drained(&self, stage: &str, remaining: impl Fn(&PipelineServices) -> i64) {
        let start = remaining(&self.services);

        loop {
            let left = remaining(&self.services);
            if left <= 0 || self.services.root.is_cancelled() {
                return;
            }

            let percent = if start > 0 {
                100 * (start - left).max(0) / start
            } else {
                0
            };
            info!(stage, left, percent, "waiting for shutdown to complete");

            tokio::select! {
                _ = self.services.root.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}
