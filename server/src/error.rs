use crate::config::ConfigError;
use crate::services::ServiceError;
use crate::store::StoreError;
use shared::packets::{
    ERROR_INVALID_CODE, ERROR_INVALID_TOKEN, ERROR_NOT_ADMITTED, ERROR_SERVER_FULL,
};
use thiserror::Error;

/// Authentication outcomes that are reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("invalid session token")]
    InvalidToken,
    #[error("identity not admitted")]
    NotAdmitted,
    #[error("invalid one-time code")]
    InvalidCode,
    #[error("server full")]
    ServerFull,
}

impl AuthFailure {
    /// Code carried by the `error` packet.
    pub fn code(self) -> u32 {
        match self {
            AuthFailure::InvalidToken => ERROR_INVALID_TOKEN,
            AuthFailure::NotAdmitted => ERROR_NOT_ADMITTED,
            AuthFailure::InvalidCode => ERROR_INVALID_CODE,
            AuthFailure::ServerFull => ERROR_SERVER_FULL,
        }
    }
}

/// Failure of a single packet's effect. Never escapes the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("failed to encode packet: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Auth(#[from] AuthFailure),
    #[error("rejected input: {0}")]
    Rejected(&'static str),
}

/// Process level failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lost subscription to {channel} after {attempts} attempts")]
    SubscriptionLost { channel: String, attempts: u32 },
}
