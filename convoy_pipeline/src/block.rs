//! Blocks of serialized events.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use snafu::Snafu;

use crate::consts::{BLOCK_MAX_BYTESIZE, BLOCK_NUMBER_MODULO};

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum BlockError {
    #[snafu(display("block overflow: {bytesize} bytes would exceed {max_bytesize}"))]
    Overflow { bytesize: u64, max_bytesize: u64 },
}

/// How an event was accepted into a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Accepted,
    /// The event alone exceeds the block cap. It fills the block by itself.
    Oversized,
}

/// Sequence of block numbers shared by all channels of a pipeline.
#[derive(Debug, Default)]
pub struct BlockNumbers {
    last: AtomicU64,
}

impl BlockNumbers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the sequence after `last`.
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last % BLOCK_NUMBER_MODULO),
        }
    }

    pub fn next(&self) -> u64 {
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some((n + 1) % BLOCK_NUMBER_MODULO)
            })
            .unwrap_or_default();
        (previous + 1) % BLOCK_NUMBER_MODULO
    }
}

/// Events serialized back to back, each followed by the separator.
#[derive(Debug)]
pub struct Block {
    data: BytesMut,
    separator: Bytes,
    max_bytesize: u64,
    events_count: u64,
    oldest_event_time: Option<DateTime<Utc>>,
    done_time: Option<DateTime<Utc>>,
    block_numbers: Vec<u64>,
    sealed: bool,
}

impl Block {
    pub fn new(separator: Bytes) -> Self {
        Self::with_max_bytesize(separator, BLOCK_MAX_BYTESIZE.as_u64())
    }

    pub fn with_max_bytesize(separator: Bytes, max_bytesize: u64) -> Self {
        Self {
            data: BytesMut::new(),
            separator,
            max_bytesize,
            events_count: 0,
            oldest_event_time: None,
            done_time: None,
            block_numbers: Vec::new(),
            sealed: false,
        }
    }

    pub fn bytesize(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn events_count(&self) -> u64 {
        self.events_count
    }

    pub fn is_empty(&self) -> bool {
        self.events_count == 0
    }

    /// Whether the block reached the cap.
    pub fn is_full(&self) -> bool {
        self.bytesize() >= self.max_bytesize
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn oldest_event_time(&self) -> Option<DateTime<Utc>> {
        self.oldest_event_time
    }

    pub fn done_time(&self) -> Option<DateTime<Utc>> {
        self.done_time
    }

    pub fn block_numbers(&self) -> &[u64] {
        &self.block_numbers
    }

    pub fn append(&mut self, event: &[u8]) -> Result<Appended, BlockError> {
        let added = (event.len() + self.separator.len()) as u64;
        let bytesize = self.bytesize() + added;

        let appended = if bytesize <= self.max_bytesize {
            Appended::Accepted
        } else if self.is_empty() {
            Appended::Oversized
        } else {
            return Err(BlockError::Overflow {
                bytesize,
                max_bytesize: self.max_bytesize,
            });
        };

        self.data.extend_from_slice(event);
        self.data.extend_from_slice(&self.separator);
        self.events_count += 1;
        self.oldest_event_time.get_or_insert_with(Utc::now);

        Ok(appended)
    }

    /// Freezes the block and assigns it the next block number.
    pub fn seal(&mut self, numbers: &BlockNumbers) {
        self.block_numbers.push(numbers.next());
        self.partial_seal();
    }

    /// Freezes the block without numbering it.
    pub fn partial_seal(&mut self) {
        if !self.sealed {
            self.done_time = Some(Utc::now());
            self.sealed = true;
        }
    }

    /// Appends `other` to this block if both fit under the cap.
    ///
    /// On failure `other` is handed back untouched.
    pub fn concat(&mut self, other: Block) -> Result<(), Block> {
        if self.bytesize() + other.bytesize() > self.max_bytesize {
            return Err(other);
        }

        self.data.extend_from_slice(&other.data);
        self.events_count += other.events_count;
        self.oldest_event_time = match (self.oldest_event_time, other.oldest_event_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.done_time = match (self.done_time, other.done_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.block_numbers.extend(other.block_numbers);

        Ok(())
    }

    /// The serialized content of the block.
    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(max_bytesize: u64) -> Block {
        Block::with_max_bytesize(Bytes::from_static(b"\r\n"), max_bytesize)
    }

    #[test]
    fn test_sealed_content_keeps_order() {
        let numbers = BlockNumbers::new();
        let mut block = block(1024);
        for event in ["a", "bb", "ccc"] {
            assert_eq!(block.append(event.as_bytes()).unwrap(), Appended::Accepted);
        }
        block.seal(&numbers);

        assert!(block.is_sealed());
        assert_eq!(block.events_count(), 3);
        assert_eq!(block.block_numbers(), &[1]);
        assert_eq!(block.bytes(), Bytes::from("a\r\nbb\r\nccc\r\n"));
    }

    #[test]
    fn test_empty_block_has_no_bytes() {
        let mut block = block(1024);
        block.partial_seal();
        assert!(block.is_empty());
        assert_eq!(block.bytesize(), 0);
        assert!(block.block_numbers().is_empty());
    }

    #[test]
    fn test_overflow_unless_first_event() {
        let mut block = block(10);
        assert_eq!(block.append(b"0123").unwrap(), Appended::Accepted);
        let err = block.append(b"456789").unwrap_err();
        assert_eq!(
            err,
            BlockError::Overflow {
                bytesize: 14,
                max_bytesize: 10
            }
        );
        assert_eq!(block.events_count(), 1);

        let mut empty = self::block(10);
        assert_eq!(empty.append(b"0123456789abc").unwrap(), Appended::Oversized);
        assert!(empty.is_full());
        assert!(empty.append(b"x").is_err());
    }

    #[test]
    fn test_concat_when_sizes_fit() {
        let numbers = BlockNumbers::new();
        let mut a = block(12);
        a.append(b"abc").unwrap();
        a.seal(&numbers);
        let mut b = block(12);
        b.append(b"de").unwrap();
        b.append(b"f").unwrap();
        b.seal(&numbers);

        a.concat(b).unwrap();
        assert_eq!(a.events_count(), 3);
        assert_eq!(a.bytesize(), 12);
        assert_eq!(a.block_numbers(), &[1, 2]);
        assert_eq!(a.bytes(), Bytes::from("abc\r\nde\r\nf\r\n"));

        let mut c = block(12);
        c.append(b"g").unwrap();
        let c = a.concat(c).unwrap_err();
        assert_eq!(c.events_count(), 1);
        assert_eq!(a.events_count(), 3);
    }

    #[test]
    fn test_concat_keeps_oldest_time() {
        let mut a = block(100);
        a.append(b"late").unwrap();
        let mut b = block(100);
        b.append(b"early").unwrap();
        let early = b.oldest_event_time();
        b.oldest_event_time = early.map(|t| t - chrono::Duration::seconds(30));

        a.concat(b).unwrap();
        assert_eq!(
            a.oldest_event_time(),
            early.map(|t| t - chrono::Duration::seconds(30))
        );
    }

    #[test]
    fn test_block_numbers_wrap() {
        let numbers = BlockNumbers::starting_after(999_998);
        assert_eq!(numbers.next(), 999_999);
        assert_eq!(numbers.next(), 0);
        assert_eq!(numbers.next(), 1);
    }
}
