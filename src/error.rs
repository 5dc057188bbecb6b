use thiserror::Error;

use crate::workflow::ChangeStatus;

pub type Result<T> = std::result::Result<T, AuditError>;

/// First point at which a replayed chain disagrees with what is stored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("chain integrity violated at index {index} (event id {event_id}): {reason}")]
pub struct ChainIntegrityError {
    pub index: usize,
    pub event_id: i64,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error(transparent)]
    ChainIntegrity(#[from] ChainIntegrityError),

    #[error("Out of order append for tenant {tenant}: expected previous hash {expected}, tail is {actual}")]
    OutOfOrder {
        tenant: String,
        expected: String,
        actual: String,
    },

    #[error("Export sink unavailable: {0}")]
    ExportUnavailable(String),

    #[error("Export rejected by sink: {0}")]
    ExportRejected(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: ChangeStatus, to: ChangeStatus },

    #[error("Query filter does not name a tenant")]
    MissingTenant,

    #[error("Tenant mismatch: handle bound to {bound}, filter names {requested}")]
    TenantMismatch { bound: String, requested: String },

    #[error("Invalid tenant id: {0:?}")]
    InvalidTenant(String),

    #[error("Invalid audit event: {0}")]
    InvalidEvent(String),

    #[error("Change request not found: {0}")]
    ChangeNotFound(String),

    #[error("User {user_id} with role {role} is not permitted to {permission}")]
    Unauthorized {
        user_id: String,
        role: String,
        permission: String,
    },

    #[error("Approval denied: {0}")]
    ApprovalDenied(String),

    #[error("Rollback trigger {0} is not armed for this change")]
    TriggerNotArmed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<config::ConfigError> for AuditError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl AuditError {
    /// Whether the caller may retry the same operation after refreshing state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuditError::OutOfOrder { .. } | AuditError::ExportUnavailable(_)
        )
    }

    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    pub fn invalid_transition(from: ChangeStatus, to: ChangeStatus) -> Self {
        Self::InvalidTransition { from, to }
    }
}
