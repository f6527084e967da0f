//! Gzip encoding of uploaded blocks.
//!
//! Each block is compressed as a gzip member of its own. Concatenated members
//! form a valid gzip stream, so a committed blob decodes as a single file.

use std::io::Write;

use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};

pub const GZIP_EXTENSION: &str = "gz";
pub const GZIP_ENCODING: &str = "gzip";

pub fn gzip(data: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}
