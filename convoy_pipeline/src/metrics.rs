use convoy_observability::{Counter, KeyValue, meter};

/// Counters exported by the pipeline.
#[derive(Clone)]
pub struct PipelineMetrics {
    pub events_received: Counter<u64>,
    pub events_dropped: Counter<u64>,
    pub oversized_events: Counter<u64>,
    pub blocks_uploaded: Counter<u64>,
    pub bytes_uploaded: Counter<u64>,
    pub blobs_committed: Counter<u64>,
    pub blobs_notified: Counter<u64>,
    pub recovery_enqueued: Counter<u64>,
    pub recovery_abandoned: Counter<u64>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        let meter = meter("pipeline");

        Self {
            events_received: meter
                .u64_counter("pipeline.events.received")
                .with_unit("{event}")
                .with_description("The number of events received from producers")
                .build(),
            events_dropped: meter
                .u64_counter("pipeline.events.dropped")
                .with_unit("{event}")
                .with_description("The number of events without serializable content")
                .build(),
            oversized_events: meter
                .u64_counter("pipeline.events.oversized")
                .with_unit("{event}")
                .with_description("The number of events larger than a block")
                .build(),
            blocks_uploaded: meter
                .u64_counter("pipeline.blocks.uploaded")
                .with_unit("{block}")
                .with_description("The number of blocks uploaded")
                .build(),
            bytes_uploaded: meter
                .u64_counter("pipeline.blocks.uploaded.size")
                .with_unit("By")
                .with_description("The number of bytes uploaded")
                .build(),
            blobs_committed: meter
                .u64_counter("pipeline.blobs.committed")
                .with_unit("{blob}")
                .with_description("The number of blobs committed")
                .build(),
            blobs_notified: meter
                .u64_counter("pipeline.blobs.notified")
                .with_unit("{blob}")
                .with_description("The number of blobs notified")
                .build(),
            recovery_enqueued: meter
                .u64_counter("pipeline.recovery.enqueued")
                .with_unit("{blob}")
                .with_description("The number of blobs queued for recovery")
                .build(),
            recovery_abandoned: meter
                .u64_counter("pipeline.recovery.abandoned")
                .with_unit("{blob}")
                .with_description("The number of blobs given up during shutdown")
                .build(),
        }
    }
}

impl PipelineMetrics {
    pub fn recovery_enqueued(&self, action: &'static str) {
        self.recovery_enqueued
            .add(1, &[KeyValue::new("action", action)]);
    }

    pub fn recovery_abandoned(&self, action: &'static str) {
        self.recovery_abandoned
            .add(1, &[KeyValue::new("action", action)]);
    }
}
