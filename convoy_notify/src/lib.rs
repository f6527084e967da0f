//! Notifications telling the analytics endpoint that a blob is ready.

pub mod envelope;
pub mod http;

use std::sync::Arc;

use snafu::Snafu;

pub use envelope::{GUID_NULL, NotificationEnvelope};
pub use http::HttpNotificationClient;

#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum NotifyError {
    /// The request did not get a response.
    #[snafu(display("notification request error: {message}"))]
    Request {
        message: String,
        #[snafu(source(from(reqwest::Error, Arc::new)))]
        source: Arc<reqwest::Error>,
    },
    /// The endpoint answered with a non-success status.
    #[snafu(display("notification rejected: status={status}, message={message}"))]
    Response { status: u16, message: String },
    /// The envelope could not be encoded, so nothing was sent.
    #[snafu(display("failed to serialize notification envelope"))]
    Serialize {
        #[snafu(source(from(serde_json::Error, Arc::new)))]
        source: Arc<serde_json::Error>,
    },
}

pub type Result<T, E = NotifyError> = std::result::Result<T, E>;

impl NotifyError {
    pub fn status(&self) -> Option<u16> {
        match self {
            NotifyError::Response { status, .. } => Some(*status),
            NotifyError::Request { .. } | NotifyError::Serialize { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            NotifyError::Response { message, .. } => message,
            NotifyError::Request { message, .. } => message,
            NotifyError::Serialize { .. } => "invalid notification envelope",
        }
    }
}

/// Sends notifications to the analytics ingestion endpoint.
#[async_trait::async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, envelope: &NotificationEnvelope) -> Result<()>;
}
