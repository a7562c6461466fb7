//! Console client facade.
//!
//! Wires the transport session, the conversation reducer, the pipeline
//! tracker, the display queue and the cancellation controller into the one
//! shared state machine every console page consumes. Data flows one way:
//! session -> decoder -> {reducer, tracker} -> display queue; the controller
//! gates the decoder/reducer boundary.
//!
//! One logical task is in flight per session at a time; a submission during
//! a running task is rejected with [`ClientError::Busy`] unless the agent is
//! waiting for an answer to its clarifying question.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use semaq_protocol::{AgentEvent, ControlMessage, RunRequest};

use crate::cancel::CancelController;
use crate::config::ClientConfig;
use crate::display::{DisplayBoard, DisplayQueue};
use crate::error::ClientError;
use crate::pipeline::{PipelineTracker, StageStatus};
use crate::session::{Session, SessionState};
use crate::transcript::{TranscriptReducer, Turn};

/// Size of the client notification channel.
const CLIENT_EVENT_BUFFER_SIZE: usize = 64;

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// Notifications to page-level views. Deliberately lightweight: renderers
/// read fresh snapshots through the accessors instead of carrying state in
/// the event.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The transcript changed.
    TurnUpdated,
    /// The authoritative status board changed.
    StatusUpdated { step: Option<String> },
    /// The in-flight task reached a terminal state. Always closes the
    /// "processing" UI state.
    TaskFinished { outcome: TaskOutcome },
    /// The transport connection changed state.
    SessionChanged { state: SessionState },
}

struct ClientInner {
    config: ClientConfig,
    session: Mutex<Option<Arc<Session>>>,
    transcript: StdMutex<TranscriptReducer>,
    tracker: StdMutex<PipelineTracker>,
    display: DisplayQueue,
    controller: CancelController,
    events_tx: broadcast::Sender<ClientEvent>,
    expiry_tx: mpsc::Sender<Uuid>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

/// One protocol state machine per active console page.
#[derive(Clone)]
pub struct ConsoleClient {
    inner: Arc<ClientInner>,
}

impl ConsoleClient {
    /// Build a client. Must be called inside a tokio runtime; the deadline
    /// monitor task starts immediately.
    pub fn new(config: ClientConfig) -> Self {
        let (events_tx, _) = broadcast::channel(CLIENT_EVENT_BUFFER_SIZE);
        let (expiry_tx, expiry_rx) = mpsc::channel(4);

        let client = Self {
            inner: Arc::new(ClientInner {
                transcript: StdMutex::new(TranscriptReducer::new(
                    config.suppress_delta_after_message,
                )),
                tracker: StdMutex::new(PipelineTracker::new()),
                display: DisplayQueue::new(config.timing),
                controller: CancelController::new(config.task_deadline),
                session: Mutex::new(None),
                events_tx,
                expiry_tx,
                pump: StdMutex::new(None),
                monitor: StdMutex::new(None),
                config,
            }),
        };

        let monitor = tokio::spawn({
            let client = client.clone();
            async move {
                client.deadline_monitor(expiry_rx).await;
            }
        });
        *client.inner.monitor.lock().expect("monitor slot poisoned") = Some(monitor);

        client
    }

    // ========================================================================
    // Task lifecycle
    // ========================================================================

    /// Open the transport eagerly. Optional: `submit` opens lazily.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.ensure_session().await.map(|_| ())
    }

    /// Start a new task, or answer the agent's clarifying question when one
    /// is pending.
    ///
    /// Rejected with [`ClientError::Busy`] while a task is in flight and no
    /// question is pending: one logical task per session, no pipelining.
    pub async fn submit(&self, request: RunRequest) -> Result<(), ClientError> {
        let answering = self.is_waiting_for_answer();
        if self.inner.controller.has_active_task() && !answering {
            return Err(ClientError::Busy);
        }

        let session = self.ensure_session().await?;

        if answering {
            // Continuation of the same exchange: keep the boards, give the
            // answered task a fresh deadline.
            info!("submitting answer to the agent's question");
            self.inner
                .tracker
                .lock()
                .expect("tracker poisoned")
                .clear_waiting();
            self.inner
                .transcript
                .lock()
                .expect("transcript poisoned")
                .begin_user_turn(&request.message);
        } else {
            self.inner
                .transcript
                .lock()
                .expect("transcript poisoned")
                .begin_user_turn(&request.message);
            self.inner
                .tracker
                .lock()
                .expect("tracker poisoned")
                .reset();
            self.inner.display.reset();
        }
        self.inner
            .controller
            .begin_task(self.inner.expiry_tx.clone());
        self.emit(ClientEvent::TurnUpdated);

        if let Err(err) = session.send(&request).await {
            warn!("submit failed: {err}");
            self.inner
                .transcript
                .lock()
                .expect("transcript poisoned")
                .close_failed_locally("Error: failed to send the request");
            self.inner.controller.release();
            self.emit(ClientEvent::TurnUpdated);
            return Err(err);
        }
        Ok(())
    }

    /// Cancel the in-flight task.
    ///
    /// Fire-and-forget: the wire signal is sent when the transport is open,
    /// no acknowledgement is awaited, and every later event of the task is
    /// discarded. Returns `false` when no task was cancellable (already
    /// finished, or none running).
    pub async fn cancel(&self) -> bool {
        if !self.inner.controller.request_cancel() {
            return false;
        }

        if let Some(session) = self.current_session().await {
            if let Err(err) = session.send(&ControlMessage::Cancel).await {
                debug!("cancel signal not sent: {err}");
            }
        }

        self.inner
            .transcript
            .lock()
            .expect("transcript poisoned")
            .close_cancelled("Task was cancelled.");
        // Stop pending display animation; timers must not outlive the task.
        self.inner.display.shutdown();

        self.emit(ClientEvent::TurnUpdated);
        self.emit(ClientEvent::TaskFinished {
            outcome: TaskOutcome::Cancelled,
        });
        true
    }

    /// Tear the client down: close the transport and cancel every timer.
    pub async fn close(&self) {
        if let Some(session) = self.inner.session.lock().await.take() {
            session.close().await;
        }
        self.inner.display.shutdown();
        self.inner.controller.release();
        if let Some(pump) = self.inner.pump.lock().expect("pump slot poisoned").take() {
            pump.abort();
        }
        if let Some(monitor) = self
            .inner
            .monitor
            .lock()
            .expect("monitor slot poisoned")
            .take()
        {
            monitor.abort();
        }
    }

    // ========================================================================
    // Snapshots and subscriptions
    // ========================================================================

    /// The conversation so far.
    pub fn transcript(&self) -> Vec<Turn> {
        self.inner
            .transcript
            .lock()
            .expect("transcript poisoned")
            .turns()
            .to_vec()
    }

    /// Authoritative stage statuses (detail view; unaffected by pacing).
    pub fn stage_statuses(&self) -> HashMap<String, StageStatus> {
        self.inner
            .tracker
            .lock()
            .expect("tracker poisoned")
            .statuses()
            .clone()
    }

    /// The paced display board.
    pub fn display_board(&self) -> DisplayBoard {
        self.inner.display.board()
    }

    /// Watch display-board changes.
    pub fn subscribe_display(&self) -> watch::Receiver<DisplayBoard> {
        self.inner.display.subscribe()
    }

    /// Subscribe to client notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events_tx.subscribe()
    }

    /// True while a task is in flight.
    pub fn is_running(&self) -> bool {
        self.inner.controller.has_active_task()
    }

    /// True while the agent waits for an answer to its question.
    pub fn is_waiting_for_answer(&self) -> bool {
        self.inner
            .tracker
            .lock()
            .expect("tracker poisoned")
            .has_waiting()
    }

    /// Transport state; `Closed` when no session was opened yet.
    pub async fn session_state(&self) -> SessionState {
        match self.inner.session.lock().await.as_ref() {
            Some(session) => session.state(),
            None => SessionState::Closed,
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// The open session, re-opened on demand. A dead session is replaced
    /// lazily here rather than by an automatic reconnect loop.
    async fn ensure_session(&self) -> Result<Arc<Session>, ClientError> {
        let mut slot = self.inner.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.state() == SessionState::Open {
                return Ok(Arc::clone(session));
            }
            debug!("previous session is {}, reopening", session.state());
        }

        match Session::open(&self.inner.config.endpoint, self.inner.config.event_buffer_size).await
        {
            Ok((session, event_rx)) => {
                let session = Arc::new(session);
                *slot = Some(Arc::clone(&session));
                drop(slot);

                let pump = tokio::spawn({
                    let client = self.clone();
                    async move {
                        client.event_pump(event_rx).await;
                    }
                });
                if let Some(previous) = self
                    .inner
                    .pump
                    .lock()
                    .expect("pump slot poisoned")
                    .replace(pump)
                {
                    previous.abort();
                }

                self.emit(ClientEvent::SessionChanged {
                    state: SessionState::Open,
                });
                Ok(session)
            }
            Err(err) => {
                // Exactly one closed notification per failed open.
                self.inner
                    .transcript
                    .lock()
                    .expect("transcript poisoned")
                    .note_system(&format!("Connection failed: {err}"));
                self.emit(ClientEvent::SessionChanged {
                    state: SessionState::Closed,
                });
                self.emit(ClientEvent::TurnUpdated);
                Err(err)
            }
        }
    }

    async fn current_session(&self) -> Option<Arc<Session>> {
        self.inner.session.lock().await.clone()
    }

    /// Consume decoded events for one session in arrival order.
    async fn event_pump(&self, mut event_rx: mpsc::Receiver<AgentEvent>) {
        while let Some(event) = event_rx.recv().await {
            self.route_event(event);
        }
        debug!("event pump ended");
        self.emit(ClientEvent::SessionChanged {
            state: SessionState::Closed,
        });
    }

    fn route_event(&self, event: AgentEvent) {
        if matches!(event, AgentEvent::Unknown) {
            debug!("ignoring unknown event type");
            return;
        }
        if !self.inner.controller.admits_events() {
            // Cancelled or already resolved: discard, do not buffer.
            debug!("discarding event after terminal resolution");
            return;
        }

        let turn_changed = self
            .inner
            .transcript
            .lock()
            .expect("transcript poisoned")
            .apply(&event);
        let items = self
            .inner
            .tracker
            .lock()
            .expect("tracker poisoned")
            .apply(&event);

        let status_changed = !items.is_empty() || matches!(event, AgentEvent::ToolCall { .. });
        if !items.is_empty() {
            self.inner.display.push(items);
        }

        if turn_changed {
            self.emit(ClientEvent::TurnUpdated);
        }
        if status_changed {
            self.emit(ClientEvent::StatusUpdated {
                step: event.step().map(str::to_string),
            });
        }

        if event.is_terminal() && self.inner.controller.resolve_terminal() {
            let outcome = match &event {
                AgentEvent::Complete { .. } => TaskOutcome::Completed,
                AgentEvent::Error { .. } => TaskOutcome::Failed,
                _ => TaskOutcome::Cancelled,
            };
            self.emit(ClientEvent::TaskFinished { outcome });
        }
    }

    async fn deadline_monitor(&self, mut expiry_rx: mpsc::Receiver<Uuid>) {
        while let Some(task_id) = expiry_rx.recv().await {
            if !self.inner.controller.resolve_timeout(task_id) {
                continue;
            }
            let deadline = self.inner.controller.deadline();
            warn!("task {task_id} timed out after {deadline:?}");

            self.inner
                .transcript
                .lock()
                .expect("transcript poisoned")
                .close_failed_locally(&format!(
                    "Error: request timed out after {}s",
                    deadline.as_secs()
                ));
            self.inner
                .tracker
                .lock()
                .expect("tracker poisoned")
                .fail_running("request timed out");
            self.inner.display.shutdown();

            self.emit(ClientEvent::TurnUpdated);
            self.emit(ClientEvent::StatusUpdated { step: None });
            self.emit(ClientEvent::TaskFinished {
                outcome: TaskOutcome::TimedOut,
            });
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine; views subscribe when they care.
        let _ = self.inner.events_tx.send(event);
    }
}

impl std::fmt::Debug for ConsoleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleClient")
            .field("endpoint", &self.inner.config.endpoint)
            .field("running", &self.is_running())
            .finish()
    }
}
