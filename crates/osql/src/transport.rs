//! Transport gateway seam.
//!
//! A transport attempts to hand a typed message to a named host. Success
//! means the send was attempted, not that the master processed it; the
//! master's verdict arrives through the [`Checkboard`](crate::checkboard).

use osql_types::{HostName, SessionKey};
use thiserror::Error;

use crate::message::OsqlMessage;

/// Why a send could not be completed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The target is no longer the master.
    #[error("{host} is not the master")]
    WrongMaster { host: HostName },

    /// The send could not be attempted (unknown host, broken connection).
    #[error("transport error: {0}")]
    Transport(String),
}

impl SendError {
    pub fn is_wrong_master(&self) -> bool {
        matches!(self, Self::WrongMaster { .. })
    }
}

/// Point-to-point delivery of session messages.
pub trait Transport: Send + Sync {
    /// Sends `message` for session `key` to `host`.
    fn send(&self, host: &HostName, key: SessionKey, message: &OsqlMessage)
    -> Result<(), SendError>;
}
