use std::{fmt, sync::Arc};

use snafu::Snafu;

/// Service error codes the pipeline reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    ContainerNotFound,
    ContainerAlreadyExists,
    BlobNotFound,
    BlobAlreadyExists,
    TableNotFound,
    TableAlreadyExists,
    TableBeingDeleted,
    EntityAlreadyExists,
    ResourceNotFound,
    AuthenticationFailed,
    InvalidBlockList,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::ContainerNotFound => "ContainerNotFound",
            ErrorCode::ContainerAlreadyExists => "ContainerAlreadyExists",
            ErrorCode::BlobNotFound => "BlobNotFound",
            ErrorCode::BlobAlreadyExists => "BlobAlreadyExists",
            ErrorCode::TableNotFound => "TableNotFound",
            ErrorCode::TableAlreadyExists => "TableAlreadyExists",
            ErrorCode::TableBeingDeleted => "TableBeingDeleted",
            ErrorCode::EntityAlreadyExists => "EntityAlreadyExists",
            ErrorCode::ResourceNotFound => "ResourceNotFound",
            ErrorCode::AuthenticationFailed => "AuthenticationFailed",
            ErrorCode::InvalidBlockList => "InvalidBlockList",
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage error types.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// The storage service answered with an error status.
    #[snafu(display("storage service error: status={status}, code={code}, message={message}"))]
    Service {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    /// The backing object store failed.
    #[snafu(display("object store error: {message}"))]
    ObjectStore {
        message: &'static str,
        #[snafu(source(from(object_store::Error, Arc::new)))]
        source: Arc<object_store::Error>,
    },
    /// Stored data could not be (de)serialized.
    #[snafu(display("serialization error: {message}"))]
    Serialization {
        message: &'static str,
        #[snafu(source(from(serde_json::Error, Arc::new)))]
        source: Arc<serde_json::Error>,
    },
    /// Client side failure, such as a missing account.
    #[snafu(display("storage client error: {message}"))]
    Client { message: String },
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

impl StorageError {
    pub fn service(status: u16, code: ErrorCode, message: impl Into<String>) -> Self {
        StorageError::Service {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: ErrorCode) -> Self {
        let message = format!("The specified resource does not exist ({code}).");
        Self::service(404, code, message)
    }

    pub fn conflict(code: ErrorCode) -> Self {
        let message = format!("The specified resource already exists ({code}).");
        Self::service(409, code, message)
    }

    /// HTTP status code, when the error came from the service.
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            StorageError::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            StorageError::Service { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Whether the request never got an answer from the service.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore { .. } | StorageError::Client { .. }
        )
    }
}
