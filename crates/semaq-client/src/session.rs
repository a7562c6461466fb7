//! WebSocket transport session.
//!
//! One session owns one connection and one task at a time. The session does
//! not reconnect on its own; after a failure the caller opens a fresh
//! session on demand (the facade does this lazily before the next send).
//! Inbound frames are decoded exactly once, in arrival order, on a dedicated
//! reader task; a malformed frame is logged and skipped without ending the
//! stream. Ordering and de-duplication are the transport's guarantees, not
//! this layer's.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use semaq_protocol::AgentEvent;

use crate::error::ClientError;

/// Size of the outbound message buffer.
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Open => write!(f, "open"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// A live connection to the agent backend.
pub struct Session {
    outbound_tx: mpsc::Sender<Message>,
    state_tx: Arc<watch::Sender<SessionState>>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Session {
    /// Connect to `endpoint` and start the reader/writer tasks.
    ///
    /// Returns the session together with the receiver of decoded events.
    /// On failure no session exists; the caller owns surfacing the single
    /// closed-state notification.
    pub async fn open(
        endpoint: &str,
        event_buffer_size: usize,
    ) -> Result<(Self, mpsc::Receiver<AgentEvent>), ClientError> {
        let state_tx = Arc::new(watch::channel(SessionState::Connecting).0);

        let (stream, _response) = match connect_async(endpoint).await {
            Ok(ok) => ok,
            Err(err) => {
                state_tx.send_replace(SessionState::Closed);
                return Err(err.into());
            }
        };
        info!("session connected to {endpoint}");
        state_tx.send_replace(SessionState::Open);

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER_SIZE);
        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(event_buffer_size);

        let writer_state = Arc::clone(&state_tx);
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    warn!("outbound send failed: {err}");
                    writer_state.send_replace(SessionState::Closed);
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("session writer task ended");
        });

        let reader_state = Arc::clone(&state_tx);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match AgentEvent::parse(&text) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                debug!("event receiver dropped, ending reader");
                                break;
                            }
                        }
                        // One bad frame must not end the stream.
                        Err(err) => warn!("skipping malformed frame: {err}"),
                    },
                    Ok(Message::Close(_)) => {
                        info!("server closed the session");
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(other) => debug!("ignoring non-text frame: {other:?}"),
                    Err(err) => {
                        warn!("session read error: {err}");
                        break;
                    }
                }
            }
            reader_state.send_replace(SessionState::Closed);
        });

        Ok((
            Self {
                outbound_tx,
                state_tx,
                handles: vec![writer, reader],
            },
            event_rx,
        ))
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch connection-state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Send a message on the session.
    ///
    /// Fails with [`ClientError::NotConnected`] unless the session is open.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), ClientError> {
        if self.state() != SessionState::Open {
            return Err(ClientError::NotConnected);
        }
        let json = serde_json::to_string(message)?;
        self.outbound_tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Close the session. Idempotent: closing a closed session is a no-op.
    pub async fn close(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        // Best effort; the peer may already be gone.
        let _ = self.outbound_tx.send(Message::Close(None)).await;
        self.state_tx.send_replace(SessionState::Closed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish()
    }
}
