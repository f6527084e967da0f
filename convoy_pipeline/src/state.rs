use std::sync::atomic::{AtomicI64, Ordering};

/// Counters of work the pipeline still owes.
///
/// `bytes_in_memory` covers serialized events not yet uploaded,
/// `pending_commits` blobs with uploaded blocks not yet committed, and
/// `pending_notifications` committed blobs not yet notified.
#[derive(Debug, Default)]
pub struct PipelineState {
    bytes_in_memory: AtomicI64,
    pending_commits: AtomicI64,
    pending_notifications: AtomicI64,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_in_memory(&self) -> i64 {
        self.bytes_in_memory.load(Ordering::Acquire)
    }

    pub fn pending_commits(&self) -> i64 {
        self.pending_commits.load(Ordering::Acquire)
    }

    pub fn pending_notifications(&self) -> i64 {
        self.pending_notifications.load(Ordering::Acquire)
    }

    pub fn inc_bytes_in_memory(&self, bytes: u64) {
        self.bytes_in_memory
            .fetch_add(bytes as i64, Ordering::AcqRel);
    }

    pub fn dec_bytes_in_memory(&self, bytes: u64) {
        self.bytes_in_memory
            .fetch_sub(bytes as i64, Ordering::AcqRel);
    }

    pub fn inc_pending_commits(&self) {
        self.pending_commits.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_pending_commits(&self) {
        self.pending_commits.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn inc_pending_notifications(&self) {
        self.pending_notifications.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_pending_notifications(&self) {
        self.pending_notifications.fetch_sub(1, Ordering::AcqRel);
    }
}
