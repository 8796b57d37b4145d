//! Error types for the fleet control plane
//!
//! One error enum covers the store, secret store, provider adapters and the
//! request surface. Handlers collapse it to a [`ClientStatus`] before anything
//! reaches a caller.

use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind}/{id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    // =========================================================================
    // Authorization Errors
    // =========================================================================
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid provider credential")]
    InvalidCredential,

    // =========================================================================
    // Key-Value Store Errors
    // =========================================================================
    #[error("Key-value store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Transaction rejected: {0}")]
    TransactionFailed(String),

    #[error("Stored value could not be decoded at {key}: {reason}")]
    InternalDecode { key: String, reason: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Provider error: {provider} - {operation}: {reason}")]
    UpstreamProvider {
        provider: String,
        operation: String,
        reason: String,
    },

    #[error("Secret store error: {operation} {path}: {reason}")]
    SecretStore {
        operation: String,
        path: String,
        reason: String,
    },

    #[error("Access control error: {0}")]
    AccessControl(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a caller is allowed to learn about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    PermissionDenied,
    /// Everything else; details stay in the server log
    Internal,
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &str, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn decode(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InternalDecode {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Collapse to the small set of statuses that may be disclosed
    pub fn client_status(&self) -> ClientStatus {
        match self {
            Error::NotFound { .. } => ClientStatus::NotFound,
            Error::AlreadyExists { .. } => ClientStatus::AlreadyExists,
            Error::InvalidArgument(_) => ClientStatus::InvalidArgument,
            Error::FailedPrecondition(_) => ClientStatus::FailedPrecondition,
            Error::PermissionDenied(_) | Error::InvalidCredential => {
                ClientStatus::PermissionDenied
            }
            _ => ClientStatus::Internal,
        }
    }

    /// Message safe to hand back to the caller
    pub fn client_message(&self) -> String {
        match self.client_status() {
            ClientStatus::Internal => "internal error".to_string(),
            ClientStatus::PermissionDenied => "permission denied".to_string(),
            _ => self.to_string(),
        }
    }

    /// Check if the caller may retry this error unchanged.
    ///
    /// Only transport-level failures qualify. Retrying a mutation is still
    /// unsafe in general because directory writes are last-writer-wins across
    /// processes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::UpstreamProvider { .. }
        )
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;
