//! Upload pipes: tasks that fill one blob at a time from a queue of blocks.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use tokio::{
    sync::mpsc,
    time::{Instant, Sleep},
};
use tracing::debug;

use crate::{
    blob::{self, BlobWriter},
    block::Block,
    config::ChannelOptions,
    services::PipelineServices,
};

/// Far enough in the future to stand for a disarmed deadline.
const DISARMED: Duration = Duration::from_secs(86400 * 365);

enum PipeMessage {
    Block(Block),
    Close,
}

/// Handle of an upload pipe task.
pub struct UploadPipe {
    id: usize,
    tx: mpsc::UnboundedSender<PipeMessage>,
    queued: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
}

impl UploadPipe {
    pub fn spawn(
        services: Arc<PipelineServices>,
        options: Arc<ChannelOptions>,
        id: usize,
        failed_blocks: mpsc::UnboundedSender<Block>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicBool::new(false));

        let task = PipeTask {
            writer: BlobWriter::new(services.clone(), options, id, failed_blocks),
            services: services.clone(),
            rx,
            queued: queued.clone(),
            busy: busy.clone(),
            deadline: Box::pin(tokio::time::sleep(DISARMED)),
            armed: false,
        };
        services.tasks.spawn(task.run());

        Self {
            id,
            tx,
            queued,
            busy,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn send(&self, block: Block) -> Result<(), Block> {
        self.queued.fetch_add(1, Ordering::AcqRel);
        match self.tx.send(PipeMessage::Block(block)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(message)) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                match message {
                    PipeMessage::Block(block) => Err(block),
                    PipeMessage::Close => Ok(()),
                }
            }
        }
    }

    /// Commit the current blob and stop once queued blocks are uploaded.
    pub fn close(&self) {
        let _ = self.tx.send(PipeMessage::Close);
    }

    /// Blocks waiting in the queue.
    pub fn load(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether the pipe task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct PipeTask {
    writer: BlobWriter,
    services: Arc<PipelineServices>,
    rx: mpsc::UnboundedReceiver<PipeMessage>,
    queued: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
    deadline: std::pin::Pin<Box<Sleep>>,
    armed: bool,
}

impl PipeTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.services.root.cancelled() => return,
                message = self.rx.recv() => match message {
                    Some(PipeMessage::Block(block)) => {
                        self.queued.fetch_sub(1, Ordering::AcqRel);
                        self.busy.store(true, Ordering::Release);
                        let closing = self.handle(block).await;
                        self.busy.store(false, Ordering::Release);
                        if closing {
                            self.stop();
                            return;
                        }
                    }
                    Some(PipeMessage::Close) | None => {
                        self.stop();
                        return;
                    }
                },
                _ = &mut self.deadline, if self.armed => {
                    debug!(blob = %self.writer.context(), "blob max delay reached");
                    self.commit();
                }
            }
        }
    }

    /// Upload the block along with the blocks queued behind it. Returns true
    /// if a close request was found in the queue.
    async fn handle(&mut self, mut block: Block) -> bool {
        let mut next = None;
        let mut closing = false;

        while let Ok(message) = self.rx.try_recv() {
            match message {
                PipeMessage::Block(queued) => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    if !self.writer.fits_merged(&block, &queued) {
                        next = Some(queued);
                        break;
                    }
                    if let Err(queued) = block.concat(queued) {
                        next = Some(queued);
                        break;
                    }
                }
                PipeMessage::Close => {
                    closing = true;
                    break;
                }
            }
        }

        self.upload(block).await;
        if let Some(next) = next {
            self.upload(next).await;
        }

        closing
    }

    async fn upload(&mut self, block: Block) {
        if !self.writer.is_empty() && !self.writer.fits(&block) {
            self.commit();
        }

        if !self.writer.upload(block).await {
            return;
        }

        if self.writer.block_count() == 1 {
            self.arm_deadline();
        }

        if self.writer.is_full() {
            self.commit();
        }
    }

    fn arm_deadline(&mut self) {
        let ctx = self.writer.context();
        let oldest = ctx.oldest_event_time.unwrap_or_else(Utc::now);
        let max_delay =
            chrono::Duration::from_std(ctx.blob_max_delay).unwrap_or(chrono::Duration::zero());
        let due = oldest + max_delay;
        let remaining = (due - Utc::now()).to_std().unwrap_or_default();

        self.deadline.as_mut().reset(Instant::now() + remaining);
        self.armed = true;
    }

    /// Commit and refuse further blocks. Blocks queued behind the close
    /// request go back to the channel.
    fn stop(&mut self) {
        self.commit();
        self.rx.close();

        while let Ok(message) = self.rx.try_recv() {
            if let PipeMessage::Block(block) = message {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                self.writer.divert(block);
            }
        }
    }

    /// Hand the current blob to a commit task.
    fn commit(&mut self) {
        self.armed = false;
        self.deadline.as_mut().reset(Instant::now() + DISARMED);

        if let Some(ctx) = self.writer.take_for_commit() {
            let services = self.services.clone();
            self.services.tasks.spawn(async move {
                blob::commit(&services, ctx).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use convoy_storage::{EntityFilter, ErrorCode, InMemoryStorageFactory, StorageError};

    use super::*;
    use crate::{
        block::BlockNumbers,
        config::PipelineOptions,
        context::{BlobContext, LogState},
        test_utils::{FaultInjectingStorageFactory, RecordingNotifier, services_with},
    };

    struct TestPipe {
        pipe: UploadPipe,
        services: Arc<PipelineServices>,
        storage: Arc<InMemoryStorageFactory>,
        faults: Arc<FaultInjectingStorageFactory>,
        numbers: BlockNumbers,
        _failed: mpsc::UnboundedReceiver<Block>,
    }

    fn test_pipe() -> TestPipe {
        let options = PipelineOptions::default()
            .with_account("account1", &["key1"])
            .with_io_retry(Duration::from_secs(1), 3)
            .with_compression_disabled(true);
        let channel_options = Arc::new(options.channel_options("ikey-1", "default"));

        let storage = Arc::new(InMemoryStorageFactory::default());
        let faults = Arc::new(FaultInjectingStorageFactory::new(storage.clone()));
        let services = services_with(options, faults.clone(), Arc::new(RecordingNotifier::new()));
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        let pipe = UploadPipe::spawn(services.clone(), channel_options, 1, failed_tx);

        TestPipe {
            pipe,
            services,
            storage,
            faults,
            numbers: BlockNumbers::new(),
            _failed: failed_rx,
        }
    }

    impl TestPipe {
        fn send(&self, event: &str) {
            let mut block = Block::new(Bytes::from_static(b"\n"));
            block.append(event.as_bytes()).unwrap();
            block.seal(&self.numbers);
            self.pipe.send(block).unwrap();
        }

        fn put_blocks(&self) -> usize {
            self.faults
                .operations("account1")
                .iter()
                .filter(|op| **op == "put_block")
                .count()
        }

        async fn committed_rows(&self) -> Vec<BlobContext> {
            let service = self.storage.service("account1");
            let table = self.services.table_name.as_str();
            let page = service
                .query_entities(table, &EntityFilter::all(), None)
                .await
                .unwrap();
            page.items
                .iter()
                .map(|entity| BlobContext::from_entity(entity).unwrap())
                .filter(|ctx| ctx.log_state == LogState::Committed)
                .collect()
        }
    }

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_queued_behind_an_upload_go_out_merged() {
        let test = test_pipe();
        let busy = StorageError::service(503, ErrorCode::Other("ServerBusy".into()), "busy");
        test.faults.fail("account1", "put_block", busy, 1);

        test.send("a");
        wait_for("pipe busy", || test.pipe.is_busy()).await;

        test.send("b");
        test.send("c");
        test.send("d");
        assert_eq!(test.pipe.load(), 3);

        wait_for("queue drained", || {
            test.pipe.load() == 0 && !test.pipe.is_busy()
        })
        .await;
        // One failed attempt, the first block, then b, c and d as one block.
        assert_eq!(test.put_blocks(), 3);

        test.pipe.close();
        wait_for("blob committed", || {
            test.services.state.pending_commits() == 0
                && test.services.state.pending_notifications() == 1
        })
        .await;

        let rows = test.committed_rows().await;
        assert_eq!(rows.len(), 1);
        let ctx = &rows[0];
        assert_eq!(ctx.uploaded_block_ids, vec!["100001", "100002"]);
        assert_eq!(ctx.uploaded_block_numbers, vec![1, 2, 3, 4]);
        assert_eq!(ctx.uploaded_events_count, 4);

        let content = test
            .storage
            .service("account1")
            .get_blob(&ctx.container_name, &ctx.blob_name)
            .await
            .unwrap();
        assert_eq!(&content[..], b"a\nb\nc\nd\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_commits_and_refuses_blocks() {
        let test = test_pipe();

        test.send("a");
        wait_for("block uploaded", || test.put_blocks() == 1).await;

        test.pipe.close();
        wait_for("pipe stopped", || test.pipe.is_closed()).await;

        let mut block = Block::new(Bytes::from_static(b"\n"));
        block.append(b"b").unwrap();
        let returned = test.pipe.send(block).unwrap_err();
        assert_eq!(returned.events_count(), 1);
        assert_eq!(test.pipe.load(), 0);

        wait_for("blob committed", || {
            test.services.state.pending_commits() == 0
        })
        .await;
        assert_eq!(test.committed_rows().await.len(), 1);
    }
}
