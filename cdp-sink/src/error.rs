//! Error taxonomy for the data sink
//!
//! Every failure maps to a [`Disposition`] that decides what the ingestion
//! layer does with the integration result that produced it.

use thiserror::Error;

pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// How a failed result is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Malformed input: straight to ERROR, never retried
    Reject,
    /// Referenced entity is gone: acknowledged and skipped
    Skip,
    /// Explicitly unrepeatable: straight to ERROR
    Terminate,
    /// Transient or unknown: DELAYED with backoff until retries run out
    Retry,
}

#[derive(Debug, Error)]
pub enum SinkError {
    /// Unknown or mistyped attribute, malformed identity or payload
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced member, organization or result is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Retrying will never help
    #[error("Unrepeatable error: {0}")]
    Unrepeatable(String),

    /// Tenant has no platform priority array configured
    #[error("Priority array not configured")]
    PriorityArrayNotConfigured,

    /// Arbitration collaborator failed or returned an invalid answer
    #[error("Arbitration error: {0}")]
    Arbitration(String),

    /// Enrichment provider failure
    #[error("Provider '{source_name}' error: {message}")]
    Provider { source_name: String, message: String },

    /// Rate-limit lock could not be acquired in time
    #[error("Timed out acquiring lock '{0}'")]
    LockTimeout(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Common(#[from] cdp_common::Error),

    #[error("Invalid id: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Wraps a lower-level failure with the operation that was running
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: Box<SinkError>,
    },
}

impl SinkError {
    pub fn disposition(&self) -> Disposition {
        match self {
            SinkError::Validation(_) | SinkError::Uuid(_) | SinkError::Serialization(_) => {
                Disposition::Reject
            }
            SinkError::NotFound(_) => Disposition::Skip,
            SinkError::Common(cdp_common::Error::NotFound(_)) => Disposition::Skip,
            SinkError::Common(cdp_common::Error::InvalidInput(_)) => Disposition::Reject,
            SinkError::Unrepeatable(_) => Disposition::Terminate,
            SinkError::Context { source, .. } => source.disposition(),
            _ => Disposition::Retry,
        }
    }

    /// Short machine-friendly name used in stored diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            SinkError::Validation(_) => "validation",
            SinkError::NotFound(_) => "not_found",
            SinkError::Unrepeatable(_) => "unrepeatable",
            SinkError::PriorityArrayNotConfigured => "priority_array_not_configured",
            SinkError::Arbitration(_) => "arbitration",
            SinkError::Provider { .. } => "provider",
            SinkError::LockTimeout(_) => "lock_timeout",
            SinkError::Database(_) => "database",
            SinkError::Serialization(_) => "serialization",
            SinkError::Http(_) => "http",
            SinkError::Common(_) => "common",
            SinkError::Uuid(_) => "uuid",
            SinkError::Internal(_) => "internal",
            SinkError::Context { .. } => "application",
        }
    }

    /// True when SQLite reported lock contention anywhere in the chain
    pub fn is_database_locked(&self) -> bool {
        match self {
            SinkError::Database(e) => e.to_string().contains("database is locked"),
            SinkError::Common(e) => e.is_database_locked(),
            SinkError::Context { source, .. } => source.is_database_locked(),
            _ => false,
        }
    }
}

/// Attach an operation description to a failure
pub trait ResultExt<T> {
    fn context(self, message: impl Into<String>) -> SinkResult<T>;
}

impl<T, E: Into<SinkError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> SinkResult<T> {
        self.map_err(|e| SinkError::Context {
            message: message.into(),
            source: Box::new(e.into()),
        })
    }
}
