// Error taxonomy and the uniform result shape returned to callers
use serde::Serialize;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the replication controller.
///
/// Every variant is attributable to a single backend or mapping, or is
/// rejected synchronously at the API boundary. See [`Error::class`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backend '{0}' already exists")]
    DuplicateName(String),

    #[error("backend '{0}' not found")]
    NotFound(String),

    #[error("unknown backend type '{value}'; expected one of: {expected}")]
    InvalidType { value: String, expected: String },

    #[error("invalid configuration for backend '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("invalid CID '{value}': {reason}")]
    InvalidCid { value: String, reason: String },

    #[error("pin {cid} is not mapped on backend '{backend}'")]
    PinNotFound { backend: String, cid: String },

    #[error("artifact for {cid} not found on backend '{backend}'")]
    ArtifactNotFound { backend: String, cid: String },

    #[error("backend '{name}' still holds {count} pin mapping(s); pass force to remove it")]
    HasPendingMappings { name: String, count: i64 },

    #[error("backend '{backend}' holds the last synced copy of {cid}")]
    LastReplica { backend: String, cid: String },

    #[error("backend '{0}' is already syncing")]
    AlreadySyncing(String),

    #[error("backend '{0}' is disabled")]
    Disabled(String),

    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout { operation: String, timeout: Duration },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("connectivity failure: {0}")]
    Connectivity(String),

    #[error("integrity check failed for {cid}: expected {expected}, found {actual}")]
    Integrity {
        cid: String,
        expected: String,
        actual: String,
    },

    #[error("malformed artifact: {0}")]
    MalformedArtifact(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Configuration,
    Connectivity,
    TransientSync,
    DataIntegrity,
    Precondition,
    Storage,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::DuplicateName(_)
            | Error::NotFound(_)
            | Error::InvalidType { .. }
            | Error::InvalidConfig { .. }
            | Error::InvalidCid { .. }
            | Error::PinNotFound { .. }
            | Error::Disabled(_) => ErrorClass::Configuration,
            Error::Connectivity(_) | Error::ArtifactNotFound { .. } => ErrorClass::Connectivity,
            Error::Timeout { .. } | Error::Transient(_) | Error::AlreadySyncing(_) => {
                ErrorClass::TransientSync
            }
            Error::Integrity { .. } | Error::MalformedArtifact(_) => ErrorClass::DataIntegrity,
            Error::HasPendingMappings { .. } | Error::LastReplica { .. } => {
                ErrorClass::Precondition
            }
            Error::CorruptRecord(_)
            | Error::Database(_)
            | Error::Io(_)
            | Error::Serialization(_) => ErrorClass::Storage,
        }
    }

    /// Safe to retry later without operator intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Transient(_) | Error::AlreadySyncing(_)
        )
    }

    pub(crate) fn invalid_config(name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Error body of an [`Outcome`]
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// Uniform `{success, data | error}` shape for every exposed operation.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> Outcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(err: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.into()),
        }
    }
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Outcome::ok(data),
            Err(err) => Outcome::err(&err),
        }
    }
}
