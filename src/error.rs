use thiserror::Error;

use crate::models::ClientId;
use crate::protocol::Reply;

/// Unified error type for command and callback failures.
///
/// Every variant except `ProtocolViolation` maps to a wire error reply; a
/// protocol violation is an internal inconsistency that is logged and never
/// sent to a client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR wrong number of arguments for '{command}' command")]
    BadArity { command: String },

    #[error("ERR invalid timeout")]
    InvalidTimeout,

    #[error("replay for client {client} on '{key}' but the head is {holder:?}")]
    ProtocolViolation {
        key: String,
        client: ClientId,
        holder: Option<ClientId>,
    },

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),
}

impl LockError {
    pub fn arity(command: &str) -> Self {
        LockError::BadArity {
            command: command.to_ascii_lowercase(),
        }
    }
}

impl From<LockError> for Reply {
    fn from(err: LockError) -> Self {
        match err {
            LockError::ProtocolViolation { .. } => Reply::Error("ERR internal lock inconsistency".to_string()),
            other => Reply::Error(other.to_string()),
        }
    }
}

/// Failures while reading a request frame off a connection.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Malformed(String),

    #[error("Protocol error: frame exceeds {0} bytes")]
    TooLarge(usize),
}

impl FrameError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        FrameError::Malformed(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
