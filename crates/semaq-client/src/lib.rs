//! Session state machine for the Semaq agent console protocol.
//!
//! The agent backend streams heterogeneous events (`prompt`, `thought`,
//! `tool_call`, `tool_result`, `success`, `message`, `delta`, `error`,
//! `cancelled`, `complete`) over one WebSocket connection per task. This
//! crate reconstructs, from that stream:
//!
//! - a durable conversation transcript ([`transcript`]),
//! - an authoritative per-stage pipeline status board ([`pipeline`]),
//! - a paced, human-legible display board ([`display`]),
//!
//! with cancellation and deadline handling that race safely against
//! in-flight events ([`cancel`]). [`client::ConsoleClient`] wires the pieces
//! together behind one facade so every page-level view consumes the same
//! state machine instead of re-implementing it.
//!
//! Data flows one way: session → decoder → {transcript, pipeline} → display.
//! The transcript and the status board are each mutated by exactly one
//! logical writer; the display board is a derived, eventually-consistent
//! copy that never feeds back.

pub mod cancel;
pub mod client;
pub mod compare;
pub mod config;
pub mod convert;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod stages;
pub mod transcript;

pub use client::{ClientEvent, ConsoleClient, TaskOutcome};
pub use config::{ClientConfig, DisplayTiming};
pub use error::ClientError;
pub use session::{Session, SessionState};
