use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::state::PipelineState;

/// Pauses producers while too many bytes wait in memory.
pub struct FlowControl {
    state: Arc<PipelineState>,
    suspend_bytes: i64,
    resume_bytes: i64,
    delay: std::time::Duration,
    mutex: Mutex<()>,
}

impl FlowControl {
    pub fn new(
        state: Arc<PipelineState>,
        suspend_bytes: u64,
        resume_bytes: u64,
        delay: std::time::Duration,
    ) -> Self {
        Self {
            state,
            suspend_bytes: suspend_bytes as i64,
            resume_bytes: resume_bytes as i64,
            delay,
            mutex: Mutex::new(()),
        }
    }

    /// Return once the pipeline can take more events.
    pub async fn pass_or_wait(&self) {
        if self.state.bytes_in_memory() <= self.resume_bytes {
            return;
        }

        let _guard = self.mutex.lock().await;

        if self.state.bytes_in_memory() <= self.suspend_bytes {
            return;
        }

        info!(
            bytes_in_memory = self.state.bytes_in_memory(),
            suspend_bytes = self.suspend_bytes,
            "suspending event intake, too many bytes in memory"
        );

        while self.state.bytes_in_memory() > self.resume_bytes {
            tokio::time::sleep(self.delay).await;
            if self.state.bytes_in_memory() > self.resume_bytes {
                info!(
                    bytes_in_memory = self.state.bytes_in_memory(),
                    resume_bytes = self.resume_bytes,
                    "event intake still suspended"
                );
            }
        }

        info!(
            bytes_in_memory = self.state.bytes_in_memory(),
            "resuming event intake"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pass_below_resume() {
        let state = Arc::new(PipelineState::new());
        state.inc_bytes_in_memory(10);
        let flow = FlowControl::new(state, 100, 50, Duration::from_secs(1));

        tokio::time::timeout(Duration::from_millis(1), flow.pass_or_wait())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_resume() {
        let state = Arc::new(PipelineState::new());
        state.inc_bytes_in_memory(150);
        let flow = Arc::new(FlowControl::new(
            state.clone(),
            100,
            50,
            Duration::from_secs(1),
        ));

        let waiter = tokio::spawn({
            let flow = flow.clone();
            async move { flow.pass_or_wait().await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        // Between resume and suspend producers are still held back.
        state.dec_bytes_in_memory(75);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        state.dec_bytes_in_memory(25);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(waiter.is_finished());
        waiter.await.unwrap();
    }
}
