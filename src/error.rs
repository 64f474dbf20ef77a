//! Error types for the loadsheet sync engine.

use thiserror::Error;

/// Result type alias for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while syncing or reconciling a load sheet.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure reaching the ledger service.
    #[error("{0}")]
    Network(String),

    /// Non-success HTTP response from the ledger service.
    #[error("ledger service error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local cache (SQLite) error.
    #[error("local cache error: {0}")]
    Db(String),

    /// The product catalog collaborator could not provide data.
    #[error("product catalog unavailable: {0}")]
    MissingCatalog(String),

    /// The engine is missing configuration (base URL, API key).
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// Local edit rejected because the sheet is frozen (remote is the
    /// source of truth).
    #[error("sheet is frozen: {0}")]
    Frozen(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Db(e.to_string())
    }
}

impl SyncError {
    /// True when the failure is transient connectivity rather than a
    /// rejection — the caller may leave local state as-is and let the
    /// next edit or reconciliation pass converge.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Remote { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(SyncError::Network("connection refused".into()).is_connectivity());
        assert!(SyncError::Remote {
            status: 503,
            message: "unavailable".into()
        }
        .is_connectivity());
        assert!(!SyncError::Remote {
            status: 404,
            message: "not found".into()
        }
        .is_connectivity());
        assert!(!SyncError::NotConfigured("missing API key".into()).is_connectivity());
    }
}
