use thiserror::Error;

use crate::ordering::OrderingError;

/// Failures talking to the authoritative store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("credential rejected by store")]
    Unauthorized,
    #[error("store answered {status}: {message}")]
    Status { status: u16, message: String },
    #[error("undecodable store response: {0}")]
    Decode(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
}

/// Error taxonomy shared by every synchronization component.
///
/// Only `InvalidArgument` and `StoreUnavailable` ever reach the user;
/// the rest are logged and swallowed where they occur.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("broadcast channel is not connected")]
    ChannelDisconnected,

    #[error("{kind} {id} is not in the local view")]
    StaleMerge { kind: &'static str, id: i64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session error: {0}")]
    Session(String),
}

impl From<OrderingError> for SyncError {
    fn from(e: OrderingError) -> Self {
        SyncError::InvalidArgument(e.to_string())
    }
}

impl SyncError {
    /// Whether this failure should be shown to the user.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, SyncError::InvalidArgument(_) | SyncError::StoreUnavailable(_))
    }
}
