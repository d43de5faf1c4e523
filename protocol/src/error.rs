//! Protocol error taxonomy.

use std::io;

use thiserror::Error;

/// Bad input from a client on an otherwise healthy connection.
///
/// Reported as `CLIENT_ERROR <text>`; the reader has already consumed the
/// offending bytes, so the command stream stays aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("too large key")]
    TooLargeKey,
    #[error("too large item")]
    TooLargeItem,
    #[error("invalid option")]
    InvalidOption,
    #[error("too many fields")]
    TooManyFields,
    #[error("more fields required")]
    MoreFieldsRequired,
    #[error("too large command")]
    TooLargeCommand,
    #[error("empty command")]
    EmptyCommand,
    #[error("fields parse error")]
    FieldsParse,
    #[error("invalid line separator")]
    InvalidLineSeparator,
    #[error("key contains invalid characters")]
    InvalidCharInKey,
}

/// Outcome channel of the reader: client errors keep the connection going,
/// everything else ends it.
#[derive(Debug, Error)]
pub enum ReadError {
    /// Recoverable bad input; respond and continue.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// Clean end of stream at a command boundary.
    #[error("connection closed")]
    Closed,
    /// The stream ended in the middle of a command or payload.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error(transparent)]
    Io(io::Error),
}

impl ReadError {
    /// The client-error slot, if this is recoverable bad input.
    pub fn client(&self) -> Option<ClientError> {
        match self {
            ReadError::Client(err) => Some(*err),
            _ => None,
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ReadError::UnexpectedEof
        } else {
            ReadError::Io(err)
        }
    }
}
