//! Classification of storage and notification failures.
//!
//! Every failure maps to exactly one [`Recovery`], and each [`Action`] lists
//! the recoveries it can handle locally. Anything else is reported to the
//! caller, which decides whether to queue the work for later.

use convoy_notify::NotifyError;
use convoy_storage::{ErrorCode, StorageError};
use snafu::Snafu;

/// Failure of a single storage or notification call.
#[derive(Debug, Clone, Snafu)]
pub enum OperationError {
    #[snafu(display("{source}"), context(false))]
    Storage { source: StorageError },
    #[snafu(display("{source}"), context(false))]
    Notify { source: NotifyError },
    #[snafu(display("no storage account is available"))]
    AllAccountsDead,
    #[snafu(display("operation cannot be recovered"))]
    NotRecoverable,
}

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recovery {
    CreateContainer,
    CreateTable,
    CreateBlob,
    CreateResource,
    ContainerExists,
    BlobExists,
    TableExists,
    TableBusy,
    EntityExists,
    InvalidStorageKey,
    NotifyFailedBlobNotAccessible,
    AccessDenied,
    InvalidInstrumentationKey,
    InvalidSchemaId,
    NotificationProcessDown,
    ServiceUnavailable,
    IoFailure,
    AllAccountsDead,
    NotRecoverable,
    HttpUnknown,
    Unknown,
}

/// The operation being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Upload,
    Commit,
    ListBlocks,
    StateTableInsert,
    StateTableDelete,
    StateTableQuery,
    Notify,
    TestStorage,
    Cleanup,
}

const BASE: &[Recovery] = &[
    Recovery::InvalidStorageKey,
    Recovery::IoFailure,
    Recovery::ServiceUnavailable,
];

const TABLE: &[Recovery] = &[
    Recovery::InvalidStorageKey,
    Recovery::IoFailure,
    Recovery::ServiceUnavailable,
    Recovery::TableExists,
    Recovery::CreateTable,
    Recovery::TableBusy,
];

const UPLOAD: &[Recovery] = &[
    Recovery::InvalidStorageKey,
    Recovery::IoFailure,
    Recovery::ServiceUnavailable,
    Recovery::ContainerExists,
    Recovery::CreateContainer,
];

const LIST_BLOCKS: &[Recovery] = &[
    Recovery::InvalidStorageKey,
    Recovery::IoFailure,
    Recovery::ServiceUnavailable,
    Recovery::ContainerExists,
    Recovery::CreateContainer,
    Recovery::CreateBlob,
];

const STATE_TABLE_INSERT: &[Recovery] = &[
    Recovery::InvalidStorageKey,
    Recovery::IoFailure,
    Recovery::ServiceUnavailable,
    Recovery::TableExists,
    Recovery::CreateTable,
    Recovery::TableBusy,
    Recovery::EntityExists,
];

const STATE_TABLE_DELETE: &[Recovery] = &[
    Recovery::InvalidStorageKey,
    Recovery::IoFailure,
    Recovery::ServiceUnavailable,
    Recovery::TableExists,
    Recovery::CreateTable,
    Recovery::TableBusy,
    Recovery::CreateResource,
];

const NOTIFY: &[Recovery] = &[
    Recovery::NotifyFailedBlobNotAccessible,
    Recovery::IoFailure,
    Recovery::ServiceUnavailable,
    Recovery::NotificationProcessDown,
    Recovery::InvalidInstrumentationKey,
    Recovery::InvalidSchemaId,
];

const TEST_STORAGE: &[Recovery] = &[
    Recovery::InvalidStorageKey,
    Recovery::IoFailure,
    Recovery::ServiceUnavailable,
    Recovery::ContainerExists,
];

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Upload => "upload",
            Action::Commit => "commit",
            Action::ListBlocks => "list_blocks",
            Action::StateTableInsert => "state_table_insert",
            Action::StateTableDelete => "state_table_delete",
            Action::StateTableQuery => "state_table_query",
            Action::Notify => "notify",
            Action::TestStorage => "test_storage",
            Action::Cleanup => "cleanup",
        }
    }

    /// Recoveries handled while performing this action.
    pub fn recoverable(&self) -> &'static [Recovery] {
        match self {
            Action::Upload => UPLOAD,
            Action::Commit => BASE,
            Action::ListBlocks | Action::Cleanup => LIST_BLOCKS,
            Action::StateTableInsert => STATE_TABLE_INSERT,
            Action::StateTableDelete => STATE_TABLE_DELETE,
            Action::StateTableQuery => TABLE,
            Action::Notify => NOTIFY,
            Action::TestStorage => TEST_STORAGE,
        }
    }

    pub fn can_recover(&self, recovery: Recovery) -> bool {
        self.recoverable().contains(&recovery)
    }
}

pub fn classify(error: &OperationError) -> Recovery {
    match error {
        OperationError::Storage { source } => match source {
            StorageError::Service {
                status,
                code,
                message,
            } => classify_status(*status, Some(code), message),
            StorageError::ObjectStore { .. } | StorageError::Client { .. } => Recovery::IoFailure,
            StorageError::Serialization { .. } => Recovery::Unknown,
        },
        OperationError::Notify { source } => match source {
            NotifyError::Response { status, message } => classify_status(*status, None, message),
            NotifyError::Request { .. } => Recovery::IoFailure,
            NotifyError::Serialize { .. } => Recovery::NotRecoverable,
        },
        OperationError::AllAccountsDead => Recovery::AllAccountsDead,
        OperationError::NotRecoverable => Recovery::NotRecoverable,
    }
}

fn classify_status(status: u16, code: Option<&ErrorCode>, message: &str) -> Recovery {
    match status {
        404 => match code {
            Some(ErrorCode::ContainerNotFound) => Recovery::CreateContainer,
            Some(ErrorCode::TableNotFound) => Recovery::CreateTable,
            Some(ErrorCode::BlobNotFound) => Recovery::CreateBlob,
            _ => Recovery::CreateResource,
        },
        409 => match code {
            Some(ErrorCode::ContainerAlreadyExists) => Recovery::ContainerExists,
            Some(ErrorCode::BlobAlreadyExists) => Recovery::BlobExists,
            Some(ErrorCode::TableAlreadyExists) => Recovery::TableExists,
            Some(ErrorCode::TableBeingDeleted) => Recovery::TableBusy,
            Some(ErrorCode::EntityAlreadyExists) => Recovery::EntityExists,
            _ => Recovery::HttpUnknown,
        },
        403 if code == Some(&ErrorCode::AuthenticationFailed) => Recovery::InvalidStorageKey,
        403 if message.contains("Blob does not exist or not accessible") => {
            Recovery::NotifyFailedBlobNotAccessible
        }
        403 => Recovery::AccessDenied,
        400 if message.contains("Invalid instrumentation key") => {
            Recovery::InvalidInstrumentationKey
        }
        400 if message.contains("Invalid schema") => Recovery::InvalidSchemaId,
        500 if message.contains("Processing error") => Recovery::NotificationProcessDown,
        503 => Recovery::ServiceUnavailable,
        _ => Recovery::HttpUnknown,
    }
}

#[cfg(test)]
mod tests {
    use snafu::IntoError;

    use super::*;

    fn storage(status: u16, code: ErrorCode) -> OperationError {
        StorageError::service(status, code, "").into()
    }

    fn notify(status: u16, message: &str) -> OperationError {
        NotifyError::Response {
            status,
            message: message.to_string(),
        }
        .into()
    }

    #[test]
    fn test_classify_storage_errors() {
        let cases = [
            (404, ErrorCode::ContainerNotFound, Recovery::CreateContainer),
            (404, ErrorCode::TableNotFound, Recovery::CreateTable),
            (404, ErrorCode::BlobNotFound, Recovery::CreateBlob),
            (404, ErrorCode::ResourceNotFound, Recovery::CreateResource),
            (409, ErrorCode::ContainerAlreadyExists, Recovery::ContainerExists),
            (409, ErrorCode::TableBeingDeleted, Recovery::TableBusy),
            (409, ErrorCode::EntityAlreadyExists, Recovery::EntityExists),
            (409, ErrorCode::Other("Lease".into()), Recovery::HttpUnknown),
            (403, ErrorCode::AuthenticationFailed, Recovery::InvalidStorageKey),
            (403, ErrorCode::Other("Denied".into()), Recovery::AccessDenied),
            (503, ErrorCode::Other("Busy".into()), Recovery::ServiceUnavailable),
            (418, ErrorCode::Other("Teapot".into()), Recovery::HttpUnknown),
        ];

        for (status, code, expected) in cases {
            assert_eq!(classify(&storage(status, code.clone())), expected, "{status} {code}");
        }

        let transport = StorageError::Client {
            message: "connection reset".to_string(),
        };
        assert_eq!(classify(&transport.into()), Recovery::IoFailure);
    }

    #[test]
    fn test_classify_notification_errors() {
        assert_eq!(
            classify(&notify(400, "Invalid instrumentation key")),
            Recovery::InvalidInstrumentationKey
        );
        assert_eq!(
            classify(&notify(400, "Invalid schema id")),
            Recovery::InvalidSchemaId
        );
        assert_eq!(
            classify(&notify(403, "Blob does not exist or not accessible.")),
            Recovery::NotifyFailedBlobNotAccessible
        );
        assert_eq!(
            classify(&notify(500, "Processing error")),
            Recovery::NotificationProcessDown
        );
        assert_eq!(classify(&notify(500, "Oops")), Recovery::HttpUnknown);

        let encoding = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let encoding = OperationError::from(convoy_notify::SerializeSnafu.into_error(encoding));
        assert_eq!(classify(&encoding), Recovery::NotRecoverable);
        assert!(!Action::Notify.can_recover(Recovery::NotRecoverable));
        assert_eq!(
            classify(&OperationError::AllAccountsDead),
            Recovery::AllAccountsDead
        );
    }

    #[test]
    fn test_actions_recover_their_own_failures() {
        assert!(Action::StateTableInsert.can_recover(Recovery::EntityExists));
        assert!(!Action::StateTableDelete.can_recover(Recovery::EntityExists));
        assert!(Action::StateTableDelete.can_recover(Recovery::CreateResource));
        assert!(Action::ListBlocks.can_recover(Recovery::CreateBlob));
        assert!(!Action::Commit.can_recover(Recovery::CreateContainer));
        assert!(Action::Notify.can_recover(Recovery::InvalidInstrumentationKey));
        assert!(!Action::Notify.can_recover(Recovery::InvalidStorageKey));
    }
}
