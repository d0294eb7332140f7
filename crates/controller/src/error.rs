//! Typed errors for the board boundary, command dispatch and the fatal
//! transport path. Application seams wrap these in `anyhow`.

use thiserror::Error;

use crate::board::Channel;

/// Failure reported by a [`Board`](crate::board::Board) backend.
#[derive(Debug, Error)]
pub enum BoardError {
    /// A single read or write failed; the link itself is still usable.
    #[error("{channel} i/o failed: {detail}")]
    Io { channel: Channel, detail: String },

    /// The channel is not wired on this backend.
    #[error("{0} is not wired on this board")]
    Unwired(Channel),

    /// The link to the board is gone. Fatal for the control loop.
    #[error("board link lost: {0}")]
    Disconnected(String),
}

/// Rejected inbound command. Unknown topics and verbs are not errors; they
/// are ignored before dispatch.
#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("malformed {topic} payload {payload:?}: {reason}")]
    Malformed {
        topic: &'static str,
        payload: String,
        reason: String,
    },
}

/// Conditions that end the controller process.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),
}

impl From<BoardError> for ControllerError {
    fn from(e: BoardError) -> Self {
        Self::TransportDisconnected(e.to_string())
    }
}
