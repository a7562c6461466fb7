//! Canonical protocol types for Semaq agent communication.
//!
//! The agent backend speaks a message-oriented protocol over a single
//! WebSocket connection per task: the client sends a [`RunRequest`] (or a
//! [`ControlMessage`]) and receives a stream of [`AgentEvent`] frames until a
//! terminal event (`complete`, `error` or `cancelled`) arrives. These types
//! are the single source of truth for that wire contract; the state machines
//! that consume them live in `semaq-client`.

pub mod command;
pub mod convert;
pub mod event;
pub mod smq;

pub use command::{ControlMessage, LlmConfig, RunRequest};
pub use convert::{ConvertRequest, ConvertResponse};
pub use event::{AgentEvent, DecodeError, ResultBundle};
pub use smq::{QueryResultSet, SmqQuery};
