use crate::messages::ErrorCode;
use thiserror::Error;

/// Errors produced by the tether protocol and session layers.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session limit ({0}) reached")]
    SessionLimit(usize),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TetherError {
    /// Protocol error code reported to the client for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            TetherError::Codec(_) | TetherError::InvalidMessage(_) => ErrorCode::InvalidRequest,
            TetherError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            TetherError::SessionLimit(_) => ErrorCode::SessionLimit,
            TetherError::Spawn(_) => ErrorCode::SpawnFailed,
            _ => ErrorCode::Internal,
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        TetherError::Codec(e.to_string())
    }
}

pub type TetherResult<T> = Result<T, TetherError>;
