use std::sync::Arc;

use convoy_notify::NotifyError;
use convoy_storage::StorageError;
use snafu::Snafu;

/// Pipeline error types.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// The options are invalid.
    #[snafu(display("configuration error: {message}"))]
    Configuration { message: String },
    /// The configuration file could not be read.
    #[snafu(display("failed to read configuration file {path}"))]
    ConfigurationFile {
        path: String,
        #[snafu(source(from(std::io::Error, Arc::new)))]
        source: Arc<std::io::Error>,
    },
    /// The configuration file is not valid TOML.
    #[snafu(display("failed to parse configuration file {path}"))]
    ConfigurationParse {
        path: String,
        #[snafu(source(from(toml::de::Error, Arc::new)))]
        source: Arc<toml::de::Error>,
    },
    /// A storage account failed its startup probe.
    #[snafu(display("storage account {account} failed validation"))]
    StorageValidation {
        account: String,
        source: StorageError,
    },
    /// The notification endpoint failed its startup probe.
    #[snafu(display("notification endpoint failed validation"))]
    NotificationValidation { source: NotifyError },
    /// The pipeline stopped accepting events.
    #[snafu(display("pipeline is shutting down"))]
    ShuttingDown,
    /// The pipeline aborted after an unrecoverable error.
    #[snafu(display("pipeline aborted: {message}"))]
    Fatal { message: String },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
