//! Error taxonomy for the admission engine
//!
//! Almost every failure in this crate is absorbed locally and converted
//! into a fail-open decision; these types exist so the absorption sites
//! can log precisely what went wrong and so the failover backend can
//! tell a timeout from a hard connection failure.

use std::time::Duration;
use thiserror::Error;

/// Failures talking to a counting backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend is unreachable or refused the operation.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The call exceeded its latency budget. Treated identically to
    /// [`BackendError::Unavailable`] by callers.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    /// A contract violation inside a backend (malformed script reply,
    /// poisoned entry, actor channel closed).
    #[error("backend internal error: {0}")]
    Internal(String),
}

/// Failures reading or writing the quota ledger.
///
/// The ledger is an accounting path, not an enforcement path: callers
/// log these and fail open.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("quota store unavailable: {0}")]
    Unavailable(String),

    #[error("quota query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                LedgerError::Unavailable(err.to_string())
            }
            other => LedgerError::Query(other.to_string()),
        }
    }
}
