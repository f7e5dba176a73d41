//! Error types.

use std::io;

use thiserror::Error;

use crate::connection::{ConnectionId, ConnectionState};
use crate::notify::IoHandle;
use crate::stack::StackError;

/// Socket API return code for a generic failure
pub const ERR_GENERAL_FAILURE: i32 = -1;

/// Socket API return code when the operation would block
pub const ERR_WOULD_BLOCK: i32 = -11;

#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to spawn tap thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to create event notifier: {0}")]
    Notifier(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure of a socket API call.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("no network stack backend is active")]
    NoBackend,

    #[error("unknown connection {0}")]
    InvalidConnection(ConnectionId),

    #[error("unknown I/O handle {0}")]
    UnknownHandle(IoHandle),

    #[error("connection {id} is {state}, cannot {op}")]
    InvalidState {
        id: ConnectionId,
        state: ConnectionState,
        op: &'static str,
    },

    #[error("raw frame too short: {0} bytes")]
    InvalidFrame(usize),

    #[error(transparent)]
    Stack(#[from] StackError),
}

impl SocketError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, SocketError::Stack(StackError::WouldBlock))
    }

    /// Negative return code for the socket API.
    pub fn code(&self) -> i32 {
        if self.is_would_block() {
            ERR_WOULD_BLOCK
        } else {
            ERR_GENERAL_FAILURE
        }
    }
}
