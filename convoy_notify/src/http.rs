//! HTTP client for the analytics notification endpoint.

use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use snafu::ResultExt;
use tracing::debug;

use crate::{
    NotificationEnvelope, NotificationService, NotifyError, RequestSnafu, Result, SerializeSnafu,
};

pub const DEFAULT_NOTIFICATION_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";

#[derive(Debug, Clone)]
pub struct HttpNotificationClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotificationClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }
}

#[async_trait::async_trait]
impl NotificationService for HttpNotificationClient {
    async fn notify(&self, envelope: &NotificationEnvelope) -> Result<()> {
        let body = serde_json::to_vec(envelope).context(SerializeSnafu)?;

        let response = self
            .client
            .post(&self.endpoint)
            .headers(Self::headers())
            .body(body)
            .send()
            .await
            .context(RequestSnafu {
                message: "failed to send notification",
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(schema_id = %envelope.schema_id(), "notification accepted");
            return Ok(());
        }

        let message = response.text().await.context(RequestSnafu {
            message: "failed to read notification response",
        })?;

        Err(NotifyError::Response {
            status: status.as_u16(),
            message,
        })
    }
}
