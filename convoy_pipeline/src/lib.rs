//! Durable, at-least-once shipping of events to blob storage.
//!
//! Events are serialized into blocks per instrumentation key and schema, the
//! blocks are uploaded to blobs spread over several storage accounts, and each
//! committed blob is announced to the notification endpoint. Every blob is
//! tracked in a state table, so a restarted pipeline finishes the work of the
//! previous run.

pub mod blob;
pub mod block;
pub mod channel;
pub mod channels;
pub mod classify;
pub mod cleanup;
pub mod clients;
pub mod compression;
pub mod config;
pub mod consts;
pub mod context;
pub mod error;
pub mod flow_control;
pub mod metrics;
pub mod notification;
pub mod pipeline;
pub mod recovery;
pub mod serializer;
pub mod services;
pub mod shutdown;
pub mod state;
pub mod state_table;
pub mod storage_io;
pub mod sub_channel;
pub mod upload_pipe;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// An event, as a JSON object.
pub type Event = serde_json::Map<String, serde_json::Value>;

pub use block::{Block, BlockNumbers};
pub use channel::ChannelKey;
pub use config::{ChannelOptions, EventFormat, PipelineOptions, SchemaOptions};
pub use context::{BlobContext, LogState, SubState};
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineClient};
pub use state::PipelineState;
