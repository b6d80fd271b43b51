//! Error taxonomy for the sync subsystem.
//!
//! Storage and configuration helpers keep returning `anyhow::Result` with
//! context attached; anything they raise ends up in [`SyncError::Internal`]
//! once it crosses into the orchestrator.

use thiserror::Error;

use crate::records::ErrorCategory;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Target, collection, job or error row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target exists but is not approved or has no playlist id.
    #[error("podcast {0} is not eligible for sync")]
    NotEligible(i64),

    /// Upstream API or transport failure, carrying the upstream message.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// Upstream payload is missing required fields or is malformed.
    #[error("invalid upstream data: {0}")]
    Data(String),

    /// Local 90% cutoff, or the upstream API refusing with a quota reason.
    /// Upstream refusals carry no figures; the orchestrator reads them from
    /// the local tracker.
    #[error("API quota limit reached ({used}/{limit} units)")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("another sync is already running")]
    AlreadyRunning,

    #[error("{0}")]
    Disabled(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalService(message.into())
    }

    pub fn upstream_quota() -> Self {
        Self::QuotaExceeded { used: 0, limit: 0 }
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Category recorded on the `sync_errors` row when this error aborts a
    /// single target.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::QuotaExceeded { .. } => ErrorCategory::RateLimit,
            Self::Data(_) => ErrorCategory::InvalidData,
            _ => ErrorCategory::ApiError,
        }
    }
}
