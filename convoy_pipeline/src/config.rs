//! Pipeline options.
//!
//! Options are plain serde structs so they can be loaded from a TOML file, and
//! carry builder methods for programmatic use.

use std::{collections::BTreeMap, path::Path, time::Duration};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use snafu::ResultExt;

use crate::{
    consts::{BLOCK_MAX_BYTESIZE, ORPHAN_CONTAINER_SUFFIX, STATE_TABLE_SUFFIX, TEST_CONTAINER_SUFFIX},
    error::{ConfigurationFileSnafu, ConfigurationParseSnafu, PipelineError, Result},
};

pub const DEFAULT_PREFIX: &str = "convoy";
pub const DEFAULT_SCHEMA_ID: &str = "default";
pub const DEFAULT_NOTIFICATION_ENDPOINT: &str = convoy_notify::http::DEFAULT_NOTIFICATION_ENDPOINT;
pub const MAX_IO_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StorageAccountOptions {
    pub name: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventFormat {
    #[default]
    Json,
    Csv,
}

impl EventFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            EventFormat::Json => "json",
            EventFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            EventFormat::Json => "application/json",
            EventFormat::Csv => "text/csv",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    String,
    Number,
    Boolean,
    Datetime,
    Object,
    Array,
    Json,
    Dynamic,
}

impl ColumnType {
    /// Whether values of this column are written as JSON text in CSV rows.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            ColumnType::Object | ColumnType::Array | ColumnType::Json | ColumnType::Dynamic
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ColumnOptions {
    pub name: String,
    /// Event field to read, defaults to the column name.
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default, rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ColumnOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_name: None,
            column_type: ColumnType::default(),
            default: None,
        }
    }

    pub fn with_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = column_type;
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn field_name(&self) -> &str {
        self.field_name.as_deref().unwrap_or(&self.name)
    }
}

/// Per-schema overrides.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchemaOptions {
    pub instrumentation_key: Option<String>,
    pub event_format: Option<EventFormat>,
    pub event_separator: Option<String>,
    pub serialized_event_field: Option<String>,
    pub columns: Vec<ColumnOptions>,
    pub csv_separator: Option<String>,
    pub csv_default_value: Option<String>,
    pub case_insensitive_columns: Option<bool>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub blob_max_delay: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineOptions {
    pub storage_accounts: Vec<StorageAccountOptions>,
    pub instrumentation_key: Option<String>,
    pub schema_id: Option<String>,
    pub schemas: BTreeMap<String, SchemaOptions>,

    pub container_prefix: String,
    pub blob_prefix: String,
    pub table_prefix: String,

    pub event_format: EventFormat,
    pub event_separator: String,
    pub serialized_event_field: Option<String>,
    pub csv_separator: String,
    pub csv_default_value: String,
    pub case_insensitive_columns: bool,
    pub max_field_bytes: ByteSize,
    pub disable_truncation: bool,

    pub disable_compression: bool,
    pub blob_max_bytesize: ByteSize,
    pub blob_max_events: u64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub blob_max_delay: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub blob_retention_time: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub blob_access_expiry_time: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub resurrect_delay: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub io_retry_delay: Duration,
    pub io_max_retries: u32,
    pub stop_on_unknown_io_errors: bool,

    pub flow_control_suspend_bytes: ByteSize,
    pub flow_control_resume_bytes: ByteSize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub flow_control_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub flush_interval: Duration,

    pub recovery_concurrency: usize,
    pub max_upload_pipes: usize,
    pub upload_pipe_threshold: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub side_queue_retry_delay: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cleanup_interval: Duration,

    pub notification_endpoint: String,
    pub notification_version: u32,

    pub save_notified_blobs_records: bool,
    pub delete_not_notified_blobs: bool,
    pub disable_notification: bool,
    pub disable_blob_upload: bool,
    pub disable_cleanup: bool,
    pub validate_storage: bool,
    pub validate_notification: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            storage_accounts: Vec::new(),
            instrumentation_key: None,
            schema_id: None,
            schemas: BTreeMap::new(),
            container_prefix: DEFAULT_PREFIX.to_string(),
            blob_prefix: DEFAULT_PREFIX.to_string(),
            table_prefix: DEFAULT_PREFIX.to_string(),
            event_format: EventFormat::Json,
            event_separator: "\r\n".to_string(),
            serialized_event_field: None,
            csv_separator: ",".to_string(),
            csv_default_value: String::new(),
            case_insensitive_columns: false,
            max_field_bytes: ByteSize::mib(1),
            disable_truncation: false,
            disable_compression: false,
            blob_max_bytesize: ByteSize::gib(4),
            blob_max_events: 1_000_000,
            blob_max_delay: Duration::from_secs(60),
            blob_retention_time: Duration::from_secs(7 * 24 * 3600),
            blob_access_expiry_time: Duration::from_secs(24 * 3600),
            resurrect_delay: Duration::from_secs(10),
            io_retry_delay: Duration::from_secs(10),
            io_max_retries: 2,
            stop_on_unknown_io_errors: false,
            flow_control_suspend_bytes: ByteSize::mib(50),
            flow_control_resume_bytes: ByteSize::mib(40),
            flow_control_delay: Duration::from_secs(1),
            flush_interval: Duration::from_millis(500),
            recovery_concurrency: 10,
            max_upload_pipes: 40,
            upload_pipe_threshold: 3,
            side_queue_retry_delay: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            notification_endpoint: DEFAULT_NOTIFICATION_ENDPOINT.to_string(),
            notification_version: 1,
            save_notified_blobs_records: false,
            delete_not_notified_blobs: false,
            disable_notification: false,
            disable_blob_upload: false,
            disable_cleanup: false,
            validate_storage: false,
            validate_notification: false,
        }
    }
}

impl PipelineOptions {
    pub fn new(storage_accounts: Vec<StorageAccountOptions>) -> Self {
        Self {
            storage_accounts,
            ..Default::default()
        }
    }

    pub fn from_toml_str(path: &str, content: &str) -> Result<Self> {
        toml::from_str(content).context(ConfigurationParseSnafu { path })
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let display = path.as_ref().display().to_string();
        let content = std::fs::read_to_string(path.as_ref()).context(ConfigurationFileSnafu {
            path: display.clone(),
        })?;
        Self::from_toml_str(&display, &content)
    }

    pub fn with_account(mut self, name: impl Into<String>, keys: &[&str]) -> Self {
        self.storage_accounts.push(StorageAccountOptions {
            name: name.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        });
        self
    }

    pub fn with_instrumentation_key(mut self, instrumentation_key: impl Into<String>) -> Self {
        self.instrumentation_key = Some(instrumentation_key.into());
        self
    }

    pub fn with_schema_id(mut self, schema_id: impl Into<String>) -> Self {
        self.schema_id = Some(schema_id.into());
        self
    }

    pub fn with_schema(mut self, schema_id: impl Into<String>, options: SchemaOptions) -> Self {
        self.schemas.insert(schema_id.into(), options);
        self
    }

    pub fn with_blob_max_delay(mut self, delay: Duration) -> Self {
        self.blob_max_delay = delay;
        self
    }

    pub fn with_blob_max_events(mut self, events: u64) -> Self {
        self.blob_max_events = events;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_io_retry(mut self, delay: Duration, max_retries: u32) -> Self {
        self.io_retry_delay = delay;
        self.io_max_retries = max_retries;
        self
    }

    pub fn with_resurrect_delay(mut self, delay: Duration) -> Self {
        self.resurrect_delay = delay;
        self
    }

    pub fn with_flow_control(mut self, suspend: ByteSize, resume: ByteSize) -> Self {
        self.flow_control_suspend_bytes = suspend;
        self.flow_control_resume_bytes = resume;
        self
    }

    pub fn with_side_queue_retry_delay(mut self, delay: Duration) -> Self {
        self.side_queue_retry_delay = delay;
        self
    }

    pub fn with_save_notified_blobs_records(mut self, save: bool) -> Self {
        self.save_notified_blobs_records = save;
        self
    }

    pub fn with_compression_disabled(mut self, disabled: bool) -> Self {
        self.disable_compression = disabled;
        self
    }

    pub fn with_cleanup_disabled(mut self, disabled: bool) -> Self {
        self.disable_cleanup = disabled;
        self
    }

    pub fn with_stop_on_unknown_io_errors(mut self, stop: bool) -> Self {
        self.stop_on_unknown_io_errors = stop;
        self
    }

    pub fn default_schema_id(&self) -> &str {
        self.schema_id.as_deref().unwrap_or(DEFAULT_SCHEMA_ID)
    }

    /// Number of attempts of a transient operation.
    pub fn io_max_tries(&self) -> u32 {
        self.io_max_retries + 1
    }

    pub fn state_table_name(&self) -> String {
        format!("{}{STATE_TABLE_SUFFIX}", self.table_prefix)
    }

    /// Prefix of the state table partition keys.
    pub fn partition_key_prefix(&self) -> String {
        self.blob_prefix.replace('/', "")
    }

    pub fn orphan_container_name(&self) -> String {
        format!("{}-{ORPHAN_CONTAINER_SUFFIX}", self.container_prefix)
    }

    pub fn test_container_name(&self) -> String {
        format!("{}-{TEST_CONTAINER_SUFFIX}", self.container_prefix)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(message: impl Into<String>) -> Result<()> {
            Err(PipelineError::Configuration {
                message: message.into(),
            })
        }

        if self.storage_accounts.is_empty() {
            return invalid("at least one storage account is required");
        }

        for account in &self.storage_accounts {
            if account.name.is_empty() {
                return invalid("storage account name cannot be empty");
            }
            if account.keys.is_empty() || account.keys.iter().any(|k| k.is_empty()) {
                return invalid(format!(
                    "storage account {} needs at least one non empty key",
                    account.name
                ));
            }
        }

        if !is_valid_container_prefix(&self.container_prefix) {
            return invalid("container prefix must be lowercase alphanumeric or '-'");
        }

        if self.table_prefix.is_empty() || !self.table_prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return invalid("table prefix must be alphanumeric");
        }

        if self.io_max_retries > MAX_IO_RETRIES {
            return invalid(format!("io max retries cannot exceed {MAX_IO_RETRIES}"));
        }

        if self.flow_control_resume_bytes > self.flow_control_suspend_bytes {
            return invalid("flow control resume bytes cannot exceed suspend bytes");
        }

        if self.blob_max_bytesize < BLOCK_MAX_BYTESIZE {
            return invalid(format!("blob max bytesize must be at least {BLOCK_MAX_BYTESIZE}"));
        }

        if self.blob_max_events == 0 {
            return invalid("blob max events must be positive");
        }

        let at_least_a_second = [
            ("blob max delay", self.blob_max_delay),
            ("resurrect delay", self.resurrect_delay),
            ("io retry delay", self.io_retry_delay),
            ("flow control delay", self.flow_control_delay),
        ];
        for (name, value) in at_least_a_second {
            if value < Duration::from_secs(1) {
                return invalid(format!("{name} must be at least 1 second"));
            }
        }

        if self.blob_retention_time < Duration::from_secs(60)
            || self.blob_access_expiry_time < Duration::from_secs(60)
        {
            return invalid("blob retention and access expiry must be at least 60 seconds");
        }

        if self.flush_interval.is_zero() {
            return invalid("flush interval must be positive");
        }

        if self.recovery_concurrency == 0 || self.max_upload_pipes == 0 {
            return invalid("recovery concurrency and max upload pipes must be positive");
        }

        if self.event_separator.is_empty() {
            return invalid("event separator cannot be empty");
        }

        for (schema_id, schema) in &self.schemas {
            let format = schema.event_format.unwrap_or(self.event_format);
            if format == EventFormat::Csv && schema.columns.is_empty() {
                return invalid(format!("schema {schema_id} uses csv but has no columns"));
            }
        }

        if self.event_format == EventFormat::Csv
            && !self.schemas.contains_key(self.default_schema_id())
        {
            return invalid("csv format requires columns for the default schema");
        }

        Ok(())
    }

    /// Resolve the options of the channel for a key and schema.
    pub fn channel_options(&self, instrumentation_key: &str, schema_id: &str) -> ChannelOptions {
        let schema = self.schemas.get(schema_id).cloned().unwrap_or_default();

        ChannelOptions {
            instrumentation_key: instrumentation_key.to_string(),
            schema_id: schema_id.to_string(),
            event_format: schema.event_format.unwrap_or(self.event_format),
            event_separator: schema
                .event_separator
                .unwrap_or_else(|| self.event_separator.clone()),
            blob_max_delay: schema.blob_max_delay.unwrap_or(self.blob_max_delay),
            compress: !self.disable_compression,
            serializer: SerializerOptions {
                serialized_event_field: schema
                    .serialized_event_field
                    .or_else(|| self.serialized_event_field.clone()),
                columns: schema.columns,
                csv_separator: schema
                    .csv_separator
                    .unwrap_or_else(|| self.csv_separator.clone()),
                csv_default_value: schema
                    .csv_default_value
                    .unwrap_or_else(|| self.csv_default_value.clone()),
                case_insensitive_columns: schema
                    .case_insensitive_columns
                    .unwrap_or(self.case_insensitive_columns),
                max_field_bytes: self.max_field_bytes.as_u64() as usize,
                disable_truncation: self.disable_truncation,
            },
        }
    }

    /// The instrumentation key used for a schema when the event carries none.
    pub fn schema_instrumentation_key(&self, schema_id: &str) -> Option<&str> {
        self.schemas
            .get(schema_id)
            .and_then(|schema| schema.instrumentation_key.as_deref())
            .or(self.instrumentation_key.as_deref())
    }
}

fn is_valid_container_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && !prefix.starts_with('-')
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerializerOptions {
    pub serialized_event_field: Option<String>,
    pub columns: Vec<ColumnOptions>,
    pub csv_separator: String,
    pub csv_default_value: String,
    pub case_insensitive_columns: bool,
    pub max_field_bytes: usize,
    pub disable_truncation: bool,
}

/// Options of a single channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOptions {
    pub instrumentation_key: String,
    pub schema_id: String,
    pub event_format: EventFormat,
    pub event_separator: String,
    pub blob_max_delay: Duration,
    /// Gzip every block before upload.
    pub compress: bool,
    pub serializer: SerializerOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = PipelineOptions::default();
        assert_eq!(options.blob_max_bytesize, ByteSize::gib(4));
        assert_eq!(options.blob_max_delay, Duration::from_secs(60));
        assert_eq!(options.io_max_tries(), 3);
        assert_eq!(options.event_separator, "\r\n");
        assert_eq!(options.state_table_name(), "convoyBlobsState");
        assert_eq!(options.orphan_container_name(), "convoy-orphan-blobs");
        assert!(options.channel_options("ikey", "default").compress);
        assert!(
            !options
                .with_compression_disabled(true)
                .channel_options("ikey", "default")
                .compress
        );
    }

    #[test]
    fn test_parse_toml() {
        let content = r#"
            instrumentation-key = "ikey-1"
            blob-max-delay = 30
            flush-interval = 250
            flow-control-suspend-bytes = "10 MiB"
            flow-control-resume-bytes = "8 MiB"

            [[storage-accounts]]
            name = "account1"
            keys = ["key1", "key2"]

            [schemas.requests]
            event-format = "csv"
            blob-max-delay = 10

            [[schemas.requests.columns]]
            name = "id"
            type = "number"
            default = 0
        "#;

        let options = PipelineOptions::from_toml_str("test.toml", content).unwrap();
        options.validate().unwrap();

        assert_eq!(options.storage_accounts[0].keys, vec!["key1", "key2"]);
        assert_eq!(options.blob_max_delay, Duration::from_secs(30));
        assert_eq!(options.flush_interval, Duration::from_millis(250));
        assert_eq!(options.flow_control_suspend_bytes, ByteSize::mib(10));

        let channel = options.channel_options("ikey-1", "requests");
        assert_eq!(channel.event_format, EventFormat::Csv);
        assert_eq!(channel.blob_max_delay, Duration::from_secs(10));
        assert_eq!(channel.serializer.columns[0].column_type, ColumnType::Number);

        let channel = options.channel_options("ikey-1", "other");
        assert_eq!(channel.event_format, EventFormat::Json);
        assert_eq!(channel.blob_max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(PipelineOptions::default().validate().is_err());

        let options = PipelineOptions::default().with_account("a", &["k"]);
        options.validate().unwrap();

        let options = PipelineOptions::default()
            .with_account("a", &["k"])
            .with_io_retry(Duration::from_secs(1), 4);
        assert!(options.validate().is_err());

        let options = PipelineOptions::default()
            .with_account("a", &["k"])
            .with_flow_control(ByteSize::mib(1), ByteSize::mib(2));
        assert!(options.validate().is_err());

        let mut options = PipelineOptions::default().with_account("a", &["k"]);
        options.container_prefix = "Bad_Prefix".to_string();
        assert!(options.validate().is_err());
    }
}
