//! A channel batches the events of one instrumentation key and schema.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    Event,
    block::{Appended, Block},
    config::ChannelOptions,
    context::BlobContext,
    serializer::{Serializer, serializer_for},
    services::PipelineServices,
    sub_channel::{ProducerId, SubChannel},
    upload_pipe::UploadPipe,
};

/// Routing key of a channel and of its blobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub instrumentation_key: String,
    pub schema_id: String,
}

impl ChannelKey {
    pub fn new(instrumentation_key: impl Into<String>, schema_id: impl Into<String>) -> Self {
        Self {
            instrumentation_key: instrumentation_key.into(),
            schema_id: schema_id.into(),
        }
    }

    pub fn of(ctx: &BlobContext) -> Self {
        Self::new(&ctx.instrumentation_key, &ctx.schema_id)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instrumentation_key, self.schema_id)
    }
}

pub struct Channel {
    key: ChannelKey,
    services: Arc<PipelineServices>,
    options: Arc<ChannelOptions>,
    serializer: Box<dyn Serializer>,
    separator: Bytes,
    sub_channels: DashMap<ProducerId, Arc<SubChannel>>,
    pipes: Mutex<Vec<UploadPipe>>,
    next_pipe_id: AtomicUsize,
    failed_tx: mpsc::UnboundedSender<Block>,
}

impl Channel {
    pub fn new(services: Arc<PipelineServices>, options: ChannelOptions) -> Arc<Self> {
        let key = ChannelKey::new(&options.instrumentation_key, &options.schema_id);
        let serializer = serializer_for(options.event_format, options.serializer.clone());
        let separator = Bytes::from(options.event_separator.clone());
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();

        let channel = Arc::new(Self {
            key,
            services: services.clone(),
            options: Arc::new(options),
            serializer,
            separator,
            sub_channels: DashMap::new(),
            pipes: Mutex::new(Vec::new()),
            next_pipe_id: AtomicUsize::new(1),
            failed_tx,
        });

        info!(channel = %channel.key, "channel opened");
        services
            .tasks
            .spawn(retry_failed_blocks(channel.clone(), failed_rx));

        channel
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    fn pipes(&self) -> MutexGuard<'_, Vec<UploadPipe>> {
        self.pipes.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Serialize the event into the producer's sub channel.
    pub fn append(&self, producer: ProducerId, event: &Event) {
        let metrics = &self.services.metrics;
        metrics.events_received.add(1, &[]);

        let Some(serialized) = self.serializer.serialize(event) else {
            warn!(channel = %self.key, "event has nothing to serialize, dropping it");
            metrics.events_dropped.add(1, &[]);
            return;
        };

        let sub_channel = self
            .sub_channels
            .entry(producer)
            .or_insert_with(|| {
                Arc::new(SubChannel::new(
                    self.separator.clone(),
                    self.services.state.clone(),
                ))
            })
            .clone();

        if sub_channel.append(&serialized) == Appended::Oversized {
            warn!(
                channel = %self.key,
                bytesize = serialized.len(),
                "event larger than a block, uploading it in a block of its own"
            );
            metrics.oversized_events.add(1, &[]);
        }
    }

    /// Hand every pending block to the upload pipes.
    ///
    /// Full blocks go as they are; the open blocks of all producers are merged
    /// into as few blocks as fit.
    pub fn flush(&self) {
        let sub_channels: Vec<Arc<SubChannel>> = self
            .sub_channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut ready = Vec::new();
        let mut tail: Option<Block> = None;

        for sub_channel in sub_channels {
            let mut blocks = sub_channel.take_blocks();
            let Some(last) = blocks.pop() else {
                continue;
            };
            ready.append(&mut blocks);

            tail = match tail.take() {
                None => Some(last),
                Some(mut merged) => match merged.concat(last) {
                    Ok(()) => Some(merged),
                    Err(last) => {
                        ready.push(merged);
                        Some(last)
                    }
                },
            };
        }
        ready.extend(tail);

        for mut block in ready {
            block.seal(&self.services.block_numbers);
            self.dispatch(block);
        }
    }

    /// Queue a sealed block on the least loaded pipe, opening a new pipe when
    /// all of them are backed up.
    ///
    /// Pipes that already stopped are dropped and the block goes to another
    /// one. Once shutdown is draining, the pipe is asked to commit right after
    /// the block.
    pub fn dispatch(&self, mut block: Block) {
        let mut pipes = self.pipes();
        pipes.retain(|pipe| !pipe.is_closed());

        loop {
            if self.services.root.is_cancelled() {
                error!(
                    channel = %self.key,
                    events = block.events_count(),
                    "pipeline stopped, block stays in memory"
                );
                return;
            }

            let index = self.pick_pipe(&mut pipes);
            match pipes[index].send(block) {
                Ok(()) => {
                    if self.services.is_stopping() {
                        pipes[index].close();
                    }
                    return;
                }
                Err(returned) => {
                    debug!(
                        channel = %self.key,
                        pipe = pipes[index].id(),
                        "upload pipe is closed, rerouting block"
                    );
                    pipes.swap_remove(index);
                    block = returned;
                }
            }
        }
    }

    fn pick_pipe(&self, pipes: &mut Vec<UploadPipe>) -> usize {
        let options = &self.services.options;
        let least_loaded = pipes
            .iter()
            .enumerate()
            .min_by_key(|(_, pipe)| pipe.load())
            .map(|(index, pipe)| {
                let backed_up = pipe.is_busy() && pipe.load() >= options.upload_pipe_threshold;
                (index, backed_up)
            });

        match least_loaded {
            Some((index, false)) => index,
            Some((index, true)) if pipes.len() >= options.max_upload_pipes => index,
            _ => {
                let id = self.next_pipe_id.fetch_add(1, Ordering::AcqRel);
                debug!(channel = %self.key, pipe = id, "opening upload pipe");
                pipes.push(UploadPipe::spawn(
                    self.services.clone(),
                    self.options.clone(),
                    id,
                    self.failed_tx.clone(),
                ));
                pipes.len() - 1
            }
        }
    }

    /// Ask every pipe to commit its blob and stop.
    pub fn close_pipes(&self) {
        for pipe in self.pipes().iter() {
            pipe.close();
        }
    }

    pub fn pipe_count(&self) -> usize {
        self.pipes().len()
    }
}

/// Upload blocks again once a storage account is back.
async fn retry_failed_blocks(channel: Arc<Channel>, mut rx: mpsc::UnboundedReceiver<Block>) {
    let services = channel.services.clone();

    loop {
        let block = tokio::select! {
            _ = services.root.cancelled() => return,
            block = rx.recv() => match block {
                Some(block) => block,
                None => return,
            },
        };

        while !services.accounts.has_active() {
            tokio::select! {
                _ = services.root.cancelled() => return,
                _ = tokio::time::sleep(services.options.side_queue_retry_delay) => {}
            }
        }

        debug!(channel = %channel.key, events = block.events_count(), "retrying block upload");
        channel.dispatch(block);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use convoy_storage::{ErrorCode, InMemoryStorageFactory, StorageError};
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        config::PipelineOptions,
        test_utils::{FaultInjectingStorageFactory, RecordingNotifier, services_with},
    };

    fn channel() -> (Arc<Channel>, Arc<PipelineServices>) {
        let options = PipelineOptions::default().with_account("account1", &["key1"]);
        let channel_options = options.channel_options("ikey-1", "default");
        let services = services_with(
            options,
            Arc::new(InMemoryStorageFactory::default()),
            Arc::new(RecordingNotifier::default()),
        );
        (Channel::new(services.clone(), channel_options), services)
    }

    /// A channel whose uploads hang in retries, keeping its pipes busy.
    fn stalled_channel(
        threshold: usize,
        max_pipes: usize,
    ) -> (Arc<Channel>, Arc<PipelineServices>) {
        let mut options = PipelineOptions::default()
            .with_account("account1", &["key1"])
            .with_io_retry(Duration::from_secs(3600), 3);
        options.upload_pipe_threshold = threshold;
        options.max_upload_pipes = max_pipes;
        let channel_options = options.channel_options("ikey-1", "default");

        let faults = Arc::new(FaultInjectingStorageFactory::new(Arc::new(
            InMemoryStorageFactory::default(),
        )));
        let busy = StorageError::service(503, ErrorCode::Other("ServerBusy".into()), "busy");
        faults.fail("account1", "put_block", busy, usize::MAX);

        let services = services_with(options, faults, Arc::new(RecordingNotifier::default()));
        (Channel::new(services.clone(), channel_options), services)
    }

    fn event(value: Value) -> Event {
        match value {
            Value::Object(object) => object,
            _ => panic!("not an object"),
        }
    }

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_block_for_a_stopped_pipe_goes_to_a_new_pipe() {
        let (channel, services) = channel();

        channel.append(1, &event(json!({"n": 1})));
        channel.flush();
        assert_eq!(channel.pipe_count(), 1);

        channel.close_pipes();
        wait_for("pipe stopped", || channel.pipes()[0].is_closed()).await;

        channel.append(1, &event(json!({"n": 2})));
        channel.flush();
        {
            let pipes = channel.pipes();
            assert_eq!(pipes.len(), 1);
            assert_eq!(pipes[0].id(), 2);
        }

        wait_for("block uploaded", || services.state.bytes_in_memory() == 0).await;
        // The first blob is committed, the second one is still open.
        wait_for("first blob committed", || {
            services.state.pending_commits() == 1
        })
        .await;
        assert_eq!(services.state.pending_notifications(), 1);
    }

    #[tokio::test]
    async fn test_blocks_dispatched_while_stopping_are_committed() {
        let (channel, services) = channel();
        services.stopping.cancel();

        channel.append(1, &event(json!({"n": 1})));
        channel.flush();

        wait_for("blob committed", || {
            services.state.bytes_in_memory() == 0 && services.state.pending_notifications() == 1
        })
        .await;
        assert_eq!(services.state.pending_commits(), 0);
        wait_for("pipe stopped", || channel.pipes()[0].is_closed()).await;
    }

    fn send(channel: &Channel, n: u64) {
        channel.append(1, &event(json!({"n": n})));
        channel.flush();
    }

    fn loads(channel: &Channel) -> Vec<usize> {
        channel.pipes().iter().map(|pipe| pipe.load()).collect()
    }

    #[tokio::test]
    async fn test_backed_up_pipes_grow_up_to_the_cap() {
        let (channel, services) = stalled_channel(2, 2);

        send(&channel, 1);
        wait_for("first pipe busy", || channel.pipes()[0].is_busy()).await;

        // Queued behind the stalled upload until the threshold is reached.
        send(&channel, 2);
        send(&channel, 3);
        assert_eq!(loads(&channel), vec![2]);

        send(&channel, 4);
        assert_eq!(channel.pipe_count(), 2);
        wait_for("second pipe busy", || channel.pipes()[1].is_busy()).await;

        send(&channel, 5);
        send(&channel, 6);
        assert_eq!(loads(&channel), vec![2, 2]);

        // Both pipes are backed up, but no pipe is added past the cap.
        send(&channel, 7);
        assert_eq!(channel.pipe_count(), 2);
        assert_eq!(loads(&channel), vec![3, 2]);

        services.root.cancel();
    }

    #[tokio::test]
    async fn test_idle_pipe_takes_blocks_without_growth() {
        let (channel, services) = stalled_channel(1, 4);

        // A pipe that is not uploading is never considered backed up.
        send(&channel, 1);
        send(&channel, 2);
        send(&channel, 3);
        assert_eq!(channel.pipe_count(), 1);

        services.root.cancel();
    }
}
