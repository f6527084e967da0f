//! Writing blobs: uploading blocks, and committing the block list.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    block::Block,
    classify::{Action, OperationError, Recovery},
    compression::{GZIP_EXTENSION, gzip},
    config::ChannelOptions,
    consts::{BLOB_MAX_BLOCKS, BLOCK_ID_BASE},
    context::{BlobContext, LogState},
    recovery::storage::RecoveryAction,
    services::PipelineServices,
    state_table,
    storage_io::with_storage,
};

/// The blob an upload pipe is filling.
///
/// The writer owns the context until the blob is committed, at which point the
/// context is handed off by value and the writer starts a new blob.
pub struct BlobWriter {
    services: Arc<PipelineServices>,
    options: Arc<ChannelOptions>,
    pipe_id: usize,
    ctx: BlobContext,
    last_start: Option<DateTime<Utc>>,
    failed_blocks: mpsc::UnboundedSender<Block>,
}

impl BlobWriter {
    pub fn new(
        services: Arc<PipelineServices>,
        options: Arc<ChannelOptions>,
        pipe_id: usize,
        failed_blocks: mpsc::UnboundedSender<Block>,
    ) -> Self {
        let ctx = new_context(&options);
        Self {
            services,
            options,
            pipe_id,
            ctx,
            last_start: None,
            failed_blocks,
        }
    }

    pub fn context(&self) -> &BlobContext {
        &self.ctx
    }

    pub fn is_empty(&self) -> bool {
        self.ctx.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.ctx.uploaded_block_ids.len()
    }

    /// Whether the block can be added without exceeding any blob limit.
    pub fn fits(&self, block: &Block) -> bool {
        self.fits_counts(block.events_count(), block.bytesize())
    }

    /// Whether the two blocks, merged into one, can be added.
    pub fn fits_merged(&self, a: &Block, b: &Block) -> bool {
        self.fits_counts(
            a.events_count() + b.events_count(),
            a.bytesize() + b.bytesize(),
        )
    }

    fn fits_counts(&self, events: u64, bytesize: u64) -> bool {
        let ctx = &self.ctx;
        ctx.uploaded_block_ids.len() < BLOB_MAX_BLOCKS
            && ctx.uploaded_events_count + events <= self.services.options.blob_max_events
            && ctx.uploaded_bytesize + bytesize <= self.services.options.blob_max_bytesize.as_u64()
    }

    pub fn is_full(&self) -> bool {
        let ctx = &self.ctx;
        ctx.uploaded_block_ids.len() >= BLOB_MAX_BLOCKS
            || ctx.uploaded_events_count >= self.services.options.blob_max_events
            || ctx.uploaded_bytesize >= self.services.options.blob_max_bytesize.as_u64()
    }

    /// Hand off the blob for commit, if it holds anything.
    pub fn take_for_commit(&mut self) -> Option<BlobContext> {
        if self.ctx.is_empty() {
            return None;
        }
        Some(std::mem::replace(&mut self.ctx, new_context(&self.options)))
    }

    /// Upload the block to the current blob, starting a blob if needed.
    ///
    /// Returns false when no storage account could take the block, in which
    /// case the block waits in the channel until an account comes back.
    pub async fn upload(&mut self, block: Block) -> bool {
        let data = match self.payload(&block) {
            Ok(data) => data,
            Err(err) => {
                error!(blob = %self.ctx, err = %err, "failed to compress block, block waits for retry");
                self.divert(block);
                return false;
            }
        };
        let disable_upload = self.services.options.disable_blob_upload;
        let mut exclude = Vec::new();

        loop {
            if self.ctx.storage_account.is_none() && !self.start_blob(&mut exclude).await {
                warn!(blob = %self.ctx, "no storage account available, block waits for recovery");
                self.divert(block);
                return false;
            }

            let account = self.ctx.account().to_string();
            let container = self.ctx.container_name.clone();
            let blob = self.ctx.blob_name.clone();
            let block_id = format!("{}", BLOCK_ID_BASE + self.ctx.uploaded_block_ids.len());

            let result = with_storage(
                &self.services,
                Action::Upload,
                &account,
                false,
                |service, last| {
                    let (container, blob, block_id) = (&container, &blob, &block_id);
                    let data = data.clone();
                    async move {
                        if last == Some(Recovery::CreateContainer) {
                            service.create_container(container).await?;
                        }
                        if !disable_upload {
                            service.put_block(container, blob, block_id, data).await?;
                        }
                        Ok::<_, OperationError>(())
                    }
                },
            )
            .await;

            match result {
                Ok(()) => {
                    self.record(&block, block_id, data.len());
                    return true;
                }
                Err(recovery) => {
                    warn!(
                        blob = %self.ctx,
                        recovery = ?recovery,
                        "block upload failed, moving the blob to another account"
                    );
                    exclude.push(account);
                    self.release_failed_blob();

                    if recovery == Recovery::AllAccountsDead {
                        self.divert(block);
                        return false;
                    }
                }
            }
        }
    }

    /// The bytes sent for the block.
    fn payload(&self, block: &Block) -> std::io::Result<Bytes> {
        if self.options.compress {
            gzip(&block.bytes())
        } else {
            Ok(block.bytes())
        }
    }

    fn record(&mut self, block: &Block, block_id: String, uploaded: usize) {
        let ctx = &mut self.ctx;
        ctx.uploaded_block_ids.push(block_id);
        ctx.uploaded_block_numbers.extend_from_slice(block.block_numbers());
        ctx.uploaded_events_count += block.events_count();
        ctx.uploaded_bytesize += block.bytesize();
        ctx.oldest_event_time = match (ctx.oldest_event_time, block.oldest_event_time()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if ctx.uploaded_block_ids.len() == 1 {
            self.services.state.inc_pending_commits();
        }
        self.services.state.dec_bytes_in_memory(block.bytesize());

        let metrics = &self.services.metrics;
        metrics.blocks_uploaded.add(1, &[]);
        metrics.bytes_uploaded.add(uploaded as u64, &[]);

        debug!(blob = %self.ctx, block_numbers = ?block.block_numbers(), "block uploaded");
    }

    /// Pick an account and name a new blob, recording it in the state table
    /// before anything is uploaded.
    async fn start_blob(&mut self, exclude: &mut Vec<String>) -> bool {
        loop {
            let Some(account) = self.services.accounts.get_random_active_storage(exclude) else {
                return false;
            };

            self.ctx = new_context(&self.options);
            self.ctx.start_time = self.next_start_time();
            self.ctx.storage_account = Some(account.clone());
            self.ctx.container_name = format!(
                "{}-{}",
                self.services.options.container_prefix,
                self.ctx.start_time.format("%Y-%m-%d")
            );
            self.ctx.blob_name = format!(
                "{}/ikey-{}/schema-{}/{}_{:04}.{}",
                self.services.options.blob_prefix,
                self.ctx.instrumentation_key,
                self.ctx.schema_id,
                self.ctx.start_time.format("%Y-%m-%d-%H-%M-%S-%3f"),
                self.pipe_id,
                self.ctx.event_format.extension()
            );
            if self.options.compress {
                self.ctx.blob_name.push('.');
                self.ctx.blob_name.push_str(GZIP_EXTENSION);
            }

            if state_table::insert(&self.services, &self.ctx).await {
                return true;
            }

            warn!(account = %account, blob = %self.ctx, "cannot record blob, trying another account");
            exclude.push(account);
            self.release_failed_blob();
        }
    }

    /// Start times are unique per writer, so blob names never repeat.
    fn next_start_time(&mut self) -> DateTime<Utc> {
        let mut start = Utc::now().trunc_subsecs(3);
        if let Some(last) = self.last_start {
            if start <= last {
                start = last + chrono::Duration::milliseconds(1);
            }
        }
        self.last_start = Some(start);
        start
    }

    /// Give up on the current blob after a failure.
    ///
    /// Blocks already uploaded stay on their account and are committed through
    /// storage recovery; an empty blob only needs its state row removed.
    fn release_failed_blob(&mut self) {
        let ctx = std::mem::replace(&mut self.ctx, new_context(&self.options));
        let services = &self.services;

        if ctx.is_empty() {
            services
                .storage_recovery
                .recover_later(services, ctx, RecoveryAction::StateTableUpdate);
        } else {
            services
                .storage_recovery
                .recover_later(services, ctx, RecoveryAction::Commit);
        }
    }

    /// Hand the block back to its channel until an account is available.
    ///
    /// The channel only stops listening once the pipeline is stopped, in which
    /// case the block stays counted in memory.
    pub fn divert(&self, block: Block) {
        if let Err(mpsc::error::SendError(block)) = self.failed_blocks.send(block) {
            error!(
                blob = %self.ctx,
                events = block.events_count(),
                "pipeline stopped, block stays in memory"
            );
        }
    }
}

fn new_context(options: &ChannelOptions) -> BlobContext {
    BlobContext::new(
        &options.instrumentation_key,
        &options.schema_id,
        options.event_format,
        options.blob_max_delay,
    )
}

/// Commit the blob's block list and move it to the committed phase.
pub async fn commit(services: &Arc<PipelineServices>, mut ctx: BlobContext) {
    let disable_upload = services.options.disable_blob_upload;
    let properties = ctx.blob_properties();

    let result = with_storage(
        services,
        Action::Commit,
        ctx.account(),
        false,
        |service, _last| {
            let (ctx, properties) = (&ctx, &properties);
            async move {
                if !disable_upload {
                    service
                        .commit_block_list(
                            &ctx.container_name,
                            &ctx.blob_name,
                            &ctx.uploaded_block_ids,
                            properties,
                        )
                        .await?;
                }
                Ok::<_, OperationError>(())
            }
        },
    )
    .await;

    match result {
        Ok(()) => {
            info!(
                blob = %ctx,
                block_numbers = ?ctx.uploaded_block_numbers,
                "blob committed"
            );
            ctx.log_state = LogState::Committed;
            state_table::update(services, ctx).await;
        }
        Err(recovery) => {
            warn!(blob = %ctx, recovery = ?recovery, "commit failed, retrying later");
            if !is_transient(recovery) {
                // Pace retries of failures the account will not recover from.
                tokio::select! {
                    _ = services.stopping.cancelled() => {}
                    _ = tokio::time::sleep(services.options.io_retry_delay) => {}
                }
            }
            services
                .storage_recovery
                .recover_later(services, ctx, RecoveryAction::Commit);
        }
    }
}

fn is_transient(recovery: Recovery) -> bool {
    matches!(
        recovery,
        Recovery::InvalidStorageKey
            | Recovery::IoFailure
            | Recovery::ServiceUnavailable
            | Recovery::AllAccountsDead
    )
}
