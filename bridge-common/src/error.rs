//! Error taxonomy shared by every tier
//!
//! Errors cross tier boundaries inside reply envelopes, so the type is
//! serializable and cheap to clone.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which allow-list rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyKind {
    Origin,
    Destination,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Origin => write!(f, "origin"),
            PolicyKind::Destination => write!(f, "destination"),
        }
    }
}

/// Main error type for bridge operations
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BridgeError {
    #[error("{policy} not allowed: {target}")]
    PolicyRejected { policy: PolicyKind, target: String },

    #[error("Body too large: {size} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("The operation was aborted")]
    Aborted,

    #[error("Timeout: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Bridge unreachable: {reason}")]
    RelayUnreachable { reason: String },

    #[error("Upstream error: {message}")]
    Upstream { status: Option<u16>, message: String },

    #[error("Bridge is disabled for {origin}")]
    DomainDisabled { origin: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("Codec error: {reason}")]
    Codec { reason: String },

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Google error: {reason}")]
    Google { reason: String },
}

impl BridgeError {
    pub fn policy(policy: PolicyKind, target: impl Into<String>) -> Self {
        Self::PolicyRejected {
            policy,
            target: target.into(),
        }
    }

    pub fn timeout(operation: &str, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            duration_ms,
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::RelayUnreachable { reason: reason.into() }
    }

    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest { reason: reason.into() }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState { reason: reason.into() }
    }

    pub fn codec(reason: impl Into<String>) -> Self {
        Self::Codec { reason: reason.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol { reason: reason.into() }
    }

    pub fn google(reason: impl Into<String>) -> Self {
        Self::Google { reason: reason.into() }
    }

    /// Cooperative cancellation, never a failure
    pub fn is_abort(&self) -> bool {
        matches!(self, BridgeError::Aborted)
    }

    /// Fast policy-level rejection raised before any network activity
    pub fn is_policy(&self) -> bool {
        matches!(self, BridgeError::PolicyRejected { .. } | BridgeError::DomainDisabled { .. })
    }

    /// Check if the error is transient (the same call may succeed later)
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Timeout { .. } => true,
            BridgeError::RelayUnreachable { .. } => true,
            BridgeError::Upstream { .. } => true,

            BridgeError::PolicyRejected { .. } => false,
            BridgeError::BodyTooLarge { .. } => false,
            BridgeError::Aborted => false,
            BridgeError::DomainDisabled { .. } => false,
            BridgeError::InvalidRequest { .. } => false,
            BridgeError::InvalidState { .. } => false,
            BridgeError::Codec { .. } => false,
            BridgeError::Protocol { .. } => false,
            BridgeError::Google { .. } => false,
        }
    }
}
