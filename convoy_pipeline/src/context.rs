//! The persisted context of a remote blob.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use convoy_storage::{BlobProperties, TableEntity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DurationSeconds, serde_as};
use snafu::Snafu;

use crate::{
    compression::{GZIP_ENCODING, GZIP_EXTENSION},
    config::EventFormat,
    consts::BLOB_CONTEXT_VERSION,
};

/// Lifecycle phase of a blob. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogState {
    Uploading,
    Committed,
    Notified,
}

impl LogState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogState::Uploading => "uploading",
            LogState::Committed => "committed",
            LogState::Notified => "notified",
        }
    }
}

impl fmt::Display for LogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a committed blob is parked instead of being notified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubState {
    #[default]
    None,
    NotifyBlocked,
    InvalidInstrumentationKey,
    InvalidSchemaId,
}

#[derive(Debug, Snafu)]
pub enum ContextError {
    #[snafu(display("state entity {row_key} is not a blob context"))]
    InvalidEntity {
        row_key: String,
        source: serde_json::Error,
    },
    #[snafu(display("state entity {row_key} has unsupported version {version}"))]
    UnsupportedVersion { row_key: String, version: u32 },
}

/// Everything needed to resume work on a blob, in any phase.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobContext {
    pub version: u32,
    pub start_time: DateTime<Utc>,
    pub instrumentation_key: String,
    pub schema_id: String,
    pub storage_account: Option<String>,
    pub container_name: String,
    pub blob_name: String,
    pub uploaded_block_ids: Vec<String>,
    pub uploaded_block_numbers: Vec<u64>,
    pub uploaded_events_count: u64,
    pub uploaded_bytesize: u64,
    pub oldest_event_time: Option<DateTime<Utc>>,
    pub event_format: EventFormat,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub blob_max_delay: Duration,
    pub log_state: LogState,
    #[serde(default)]
    pub sub_state: SubState,
}

impl BlobContext {
    pub fn new(
        instrumentation_key: impl Into<String>,
        schema_id: impl Into<String>,
        event_format: EventFormat,
        blob_max_delay: Duration,
    ) -> Self {
        Self {
            version: BLOB_CONTEXT_VERSION,
            start_time: Utc::now(),
            instrumentation_key: instrumentation_key.into(),
            schema_id: schema_id.into(),
            storage_account: None,
            container_name: String::new(),
            blob_name: String::new(),
            uploaded_block_ids: Vec::new(),
            uploaded_block_numbers: Vec::new(),
            uploaded_events_count: 0,
            uploaded_bytesize: 0,
            oldest_event_time: None,
            event_format,
            blob_max_delay,
            log_state: LogState::Uploading,
            sub_state: SubState::None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uploaded_block_ids.is_empty()
    }

    /// Forget the uploaded blocks, starting a fresh blob.
    pub fn reset(&mut self) {
        self.uploaded_block_ids.clear();
        self.uploaded_block_numbers.clear();
        self.uploaded_events_count = 0;
        self.uploaded_bytesize = 0;
        self.oldest_event_time = None;
        self.log_state = LogState::Uploading;
        self.sub_state = SubState::None;
    }

    /// Row key of the blob in the state table.
    pub fn row_key(&self) -> String {
        self.blob_name.replace('/', "_")
    }

    pub fn partition_key(&self, partition_key_prefix: &str, log_state: LogState) -> String {
        format!("{partition_key_prefix}-{log_state}")
    }

    pub fn account(&self) -> &str {
        self.storage_account.as_deref().unwrap_or_default()
    }

    /// Whether the blob's blocks are gzip members, as told by its name.
    pub fn is_compressed(&self) -> bool {
        self.blob_name
            .strip_suffix(GZIP_EXTENSION)
            .is_some_and(|name| name.ends_with('.'))
    }

    /// Content headers the committed blob is served with.
    pub fn blob_properties(&self) -> BlobProperties {
        BlobProperties {
            content_type: Some(self.event_format.content_type().to_string()),
            content_encoding: self.is_compressed().then(|| GZIP_ENCODING.to_string()),
        }
    }

    pub fn to_entity(&self, partition_key_prefix: &str) -> TableEntity {
        let mut entity = TableEntity::new(
            self.partition_key(partition_key_prefix, self.log_state),
            self.row_key(),
        );

        if let Ok(Value::Object(properties)) = serde_json::to_value(self) {
            entity.properties = properties;
        }

        entity
    }

    pub fn from_entity(entity: &TableEntity) -> Result<Self, ContextError> {
        let context: BlobContext =
            serde_json::from_value(Value::Object(entity.properties.clone())).map_err(|source| {
                ContextError::InvalidEntity {
                    row_key: entity.row_key.clone(),
                    source,
                }
            })?;

        if context.version != BLOB_CONTEXT_VERSION {
            return Err(ContextError::UnsupportedVersion {
                row_key: entity.row_key.clone(),
                version: context.version,
            });
        }

        Ok(context)
    }
}

impl fmt::Display for BlobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({}, {} blocks, {} events, {} bytes)",
            self.container_name,
            self.blob_name,
            self.log_state,
            self.uploaded_block_ids.len(),
            self.uploaded_events_count,
            self.uploaded_bytesize
        )
    }
}
