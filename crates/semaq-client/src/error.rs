//! Client error taxonomy.

use std::time::Duration;

use thiserror::Error;

use semaq_protocol::DecodeError;

/// Errors surfaced by the session state machine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connect or send failed. Recoverable: re-open before the next send.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// `send` was called on a session that is not open.
    #[error("session is not connected")]
    NotConnected,

    /// A task is already in flight on this session.
    #[error("a task is already in flight")]
    Busy,

    /// The agent asked a clarifying question; only an answer may be
    /// submitted until it is resolved.
    #[error("the agent is waiting for an answer to its question")]
    AwaitingAnswer,

    /// A single inbound frame was malformed. Swallowed at the decoder
    /// boundary in normal operation; exposed for direct decoder users.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// An outbound message could not be encoded.
    #[error("encoding outbound message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The backend reported a failure for one pipeline stage.
    #[error("stage {step} failed: {message}")]
    Stage { step: String, message: String },

    /// No terminal event arrived within the task deadline.
    #[error("task timed out after {0:?}")]
    TaskTimeout(Duration),

    /// The task was cancelled by the user.
    #[error("task was cancelled")]
    Cancelled,
}
