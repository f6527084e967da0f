use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::{
    block::{Appended, Block},
    state::PipelineState,
};

/// Identifies a producer of events.
pub type ProducerId = u64;

/// Blocks built by a single producer for a channel.
///
/// Events from one producer keep their order across blocks.
pub struct SubChannel {
    separator: Bytes,
    state: Arc<PipelineState>,
    inner: Mutex<Inner>,
}

struct Inner {
    block: Block,
    blocks: Vec<Block>,
}

impl SubChannel {
    pub fn new(separator: Bytes, state: Arc<PipelineState>) -> Self {
        let inner = Inner {
            block: Block::new(separator.clone()),
            blocks: Vec::new(),
        };

        Self {
            separator,
            state,
            inner: Mutex::new(inner),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Add a serialized event. Its bytes count as in memory right away.
    pub fn append(&self, event: &[u8]) -> Appended {
        let mut inner = self.inner();

        let appended = match inner.block.append(event) {
            Ok(appended) => appended,
            Err(_) => {
                let full = std::mem::replace(&mut inner.block, Block::new(self.separator.clone()));
                inner.blocks.push(full);
                // An empty block accepts any event.
                match inner.block.append(event) {
                    Ok(appended) => appended,
                    Err(_) => Appended::Oversized,
                }
            }
        };

        if inner.block.is_full() {
            let full = std::mem::replace(&mut inner.block, Block::new(self.separator.clone()));
            inner.blocks.push(full);
        }

        self.state
            .inc_bytes_in_memory((event.len() + self.separator.len()) as u64);

        appended
    }

    /// Take every block, including the open one.
    pub fn take_blocks(&self) -> Vec<Block> {
        let mut inner = self.inner();

        if !inner.block.is_empty() {
            let open = std::mem::replace(&mut inner.block, Block::new(self.separator.clone()));
            inner.blocks.push(open);
        }

        let mut blocks = std::mem::take(&mut inner.blocks);
        drop(inner);

        for block in &mut blocks {
            block.partial_seal();
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::BLOCK_MAX_BYTESIZE;

    fn sub_channel() -> (SubChannel, Arc<PipelineState>) {
        let state = Arc::new(PipelineState::new());
        (SubChannel::new(Bytes::from_static(b"\n"), state.clone()), state)
    }

    #[test]
    fn test_append_reports_bytes() {
        let (sub_channel, state) = sub_channel();
        sub_channel.append(b"one");
        assert_eq!(state.bytes_in_memory(), 4);
        sub_channel.append(b"two");
        assert_eq!(state.bytes_in_memory(), 8);

        let blocks = sub_channel.take_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].bytes(), Bytes::from("one\ntwo\n"));
        assert_eq!(state.bytes_in_memory(), 8);

        assert!(sub_channel.take_blocks().is_empty());
    }

    #[test]
    fn test_overflow_rolls_to_a_new_block() {
        let (sub_channel, state) = sub_channel();
        let event = vec![b'x'; 1024 * 1024];
        for _ in 0..5 {
            assert_eq!(sub_channel.append(&event), Appended::Accepted);
        }

        let blocks = sub_channel.take_blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].events_count(), 3);
        assert_eq!(blocks[1].events_count(), 2);
        assert_eq!(state.bytes_in_memory(), 5 * (1024 * 1024 + 1));
    }

    #[test]
    fn test_oversized_event_gets_its_own_block() {
        let (sub_channel, _) = sub_channel();
        sub_channel.append(b"small");
        let oversized = vec![b'x'; BLOCK_MAX_BYTESIZE.as_u64() as usize + 1];
        assert_eq!(sub_channel.append(&oversized), Appended::Oversized);
        sub_channel.append(b"after");

        let blocks = sub_channel.take_blocks();
        let counts: Vec<u64> = blocks.iter().map(|b| b.events_count()).collect();
        assert_eq!(counts, vec![1, 1, 1]);
        assert!(blocks.iter().all(|b| b.is_sealed()));
    }
}
