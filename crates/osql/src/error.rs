//! Session error types.
//!
//! [`OsqlError`] is the closed set of outcomes a caller of the session
//! state machine can observe. Collaborator errors ([`SendError`],
//! [`CheckboardError`], [`ShadowError`]) never escape directly; they are
//! classified by the functions in this module.
//!
//! [`SendError`]: crate::transport::SendError
//! [`CheckboardError`]: crate::checkboard::CheckboardError
//! [`ShadowError`]: crate::shadow::ShadowError

use osql_types::{MasterErrorCode, TableName};
use thiserror::Error;

use crate::shadow::ShadowError;

/// Result type for session operations.
pub type OsqlResult<T> = Result<T, OsqlError>;

/// Stable integer codes handed back to clients.
pub mod codes {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const INTERNAL: i32 = 2;
    pub const ABORT: i32 = 4;
    pub const BUSY: i32 = 5;
    pub const TOO_BIG: i32 = 18;
    pub const SCHEMA_CHANGE: i32 = 240;
    pub const CHANGE_NODE: i32 = 401;
    pub const MASTER_TIMEOUT: i32 = -109;
    pub const RESTART_FAILED: i32 = -1;
}

/// Errors surfaced by a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OsqlError {
    /// Unclassified failure: missing identifier, exhausted per-op restarts,
    /// unregister failure on an otherwise clean outcome.
    #[error("internal error: {0}")]
    Internal(String),

    /// The transaction exceeded its operation limit.
    #[error("transaction too big")]
    TooBig,

    /// The transaction was aborted; details are in the session's error record.
    #[error("transaction aborted")]
    Abort,

    /// The client should reconnect to another node.
    #[error("master changed, reconnect to another node")]
    ChangeNode,

    /// The master timed out applying the transaction.
    #[error("master timed out applying the transaction")]
    MasterTimeout,

    /// No usable master could be reached; try elsewhere.
    #[error("busy: {0}")]
    Busy(String),

    /// A schema change conflicted with this transaction.
    #[error("schema change error: {0}")]
    SchemaChange(String),

    /// A local error was already recorded before commit.
    #[error("transaction failed locally before commit")]
    Error,

    /// DDL and DML were mixed on one table in a single transaction.
    #[error("table {0} mixes schema change and data change in one transaction")]
    DdlMisuse(TableName),

    /// Write access was denied.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Restart gave up after its retry budget.
    #[error("session restart failed after {attempts} attempts")]
    RestartFailed {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

impl OsqlError {
    /// Client-compatible integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Error | Self::DdlMisuse(_) => codes::ERROR,
            Self::Internal(_) => codes::INTERNAL,
            Self::Abort | Self::AccessDenied(_) => codes::ABORT,
            Self::Busy(_) => codes::BUSY,
            Self::TooBig => codes::TOO_BIG,
            Self::SchemaChange(_) => codes::SCHEMA_CHANGE,
            Self::ChangeNode => codes::CHANGE_NODE,
            Self::MasterTimeout => codes::MASTER_TIMEOUT,
            Self::RestartFailed { .. } => codes::RESTART_FAILED,
        }
    }

    /// Errors that abort a restart or replay immediately instead of retrying.
    pub fn is_fatal_to_restart(&self) -> bool {
        matches!(self, Self::TooBig | Self::SchemaChange(_))
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Maps the failure of a per-operation send (after restarts) to the
/// caller-visible set: too-big and schema-change pass through, everything
/// else becomes internal.
pub fn classify_send_failure(err: OsqlError) -> OsqlError {
    if err.is_fatal_to_restart() {
        err
    } else {
        OsqlError::Internal(err.to_string())
    }
}

/// Maps a master-reported commit outcome to the caller-visible set.
///
/// Too-big takes priority; master timeout and not-durable are
/// distinguished; everything else is a generic abort.
pub fn map_commit_outcome(code: MasterErrorCode) -> OsqlError {
    match code {
        MasterErrorCode::TOO_BIG => OsqlError::TooBig,
        MasterErrorCode::MASTER_TIMEOUT => OsqlError::MasterTimeout,
        MasterErrorCode::NOT_DURABLE => OsqlError::ChangeNode,
        _ => OsqlError::Abort,
    }
}

impl From<ShadowError> for OsqlError {
    fn from(err: ShadowError) -> Self {
        match err {
            ShadowError::TooBig { .. } => Self::TooBig,
            ShadowError::SchemaChange(msg) => Self::SchemaChange(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}
