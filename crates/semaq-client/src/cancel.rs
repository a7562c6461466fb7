//! Cancellation controller.
//!
//! Tracks one task's cancel-ability and its hard deadline. Exactly one
//! terminal resolution is permitted per task — user cancel, local timeout or
//! a server terminal event — the first to occur wins and the rest are
//! no-ops. After resolution the controller stops admitting events for the
//! task: anything still in flight is discarded, not buffered.
//!
//! Cancellation is cooperative. Nothing is force-killed; the deadline timer
//! and the event pump consult this state before touching shared state.

use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Why a task reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The server sent `complete`, `error` or `cancelled`.
    ServerTerminal,
    /// The user cancelled locally.
    CancelledByUser,
    /// No terminal event arrived within the deadline.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlPhase {
    Idle,
    CancelRequested,
}

struct ControlState {
    task_id: Option<Uuid>,
    phase: ControlPhase,
    resolution: Option<Resolution>,
    deadline_timer: Option<JoinHandle<()>>,
}

/// Per-session cancellation and deadline state.
pub struct CancelController {
    state: Mutex<ControlState>,
    deadline: Duration,
}

impl CancelController {
    pub fn new(deadline: Duration) -> Self {
        Self {
            state: Mutex::new(ControlState {
                task_id: None,
                phase: ControlPhase::Idle,
                resolution: None,
                deadline_timer: None,
            }),
            deadline,
        }
    }

    /// Arm the controller for a new task. The previous deadline timer, if
    /// any, is cancelled; when the new deadline expires the task id is sent
    /// on `expiry_tx` and the owner decides whether it still matters.
    pub fn begin_task(&self, expiry_tx: mpsc::Sender<Uuid>) -> Uuid {
        let task_id = Uuid::new_v4();
        let deadline = self.deadline;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = expiry_tx.send(task_id).await;
        });

        let mut state = self.state.lock().expect("cancel state poisoned");
        if let Some(previous) = state.deadline_timer.replace(timer) {
            previous.abort();
        }
        state.task_id = Some(task_id);
        state.phase = ControlPhase::Idle;
        state.resolution = None;
        debug!("task {task_id} armed with deadline {deadline:?}");
        task_id
    }

    /// Whether events for the current task may still mutate state.
    pub fn admits_events(&self) -> bool {
        let state = self.state.lock().expect("cancel state poisoned");
        state.task_id.is_some()
            && state.resolution.is_none()
            && state.phase == ControlPhase::Idle
    }

    /// Request cancellation. Returns `true` when this call won the terminal
    /// resolution (the caller then sends the wire signal and closes the
    /// turn); `false` when the task already resolved some other way.
    pub fn request_cancel(&self) -> bool {
        let mut state = self.state.lock().expect("cancel state poisoned");
        if state.task_id.is_none() || state.resolution.is_some() {
            return false;
        }
        state.phase = ControlPhase::CancelRequested;
        state.resolution = Some(Resolution::CancelledByUser);
        if let Some(timer) = state.deadline_timer.take() {
            timer.abort();
        }
        info!("task {:?} cancelled by user", state.task_id);
        true
    }

    /// Record the server's terminal event. First resolution wins.
    pub fn resolve_terminal(&self) -> bool {
        let mut state = self.state.lock().expect("cancel state poisoned");
        if state.task_id.is_none() || state.resolution.is_some() {
            return false;
        }
        state.resolution = Some(Resolution::ServerTerminal);
        if let Some(timer) = state.deadline_timer.take() {
            timer.abort();
        }
        true
    }

    /// Handle a deadline expiry signal. Stale signals (an older task, or a
    /// task that already resolved) are no-ops.
    pub fn resolve_timeout(&self, task_id: Uuid) -> bool {
        let mut state = self.state.lock().expect("cancel state poisoned");
        if state.task_id != Some(task_id) || state.resolution.is_some() {
            return false;
        }
        state.resolution = Some(Resolution::TimedOut);
        state.deadline_timer = None;
        info!("task {task_id} hit its deadline");
        true
    }

    /// How the current task ended, if it has.
    pub fn resolution(&self) -> Option<Resolution> {
        self.state.lock().expect("cancel state poisoned").resolution
    }

    /// True while a task is armed and unresolved.
    pub fn has_active_task(&self) -> bool {
        let state = self.state.lock().expect("cancel state poisoned");
        state.task_id.is_some() && state.resolution.is_none()
    }

    /// The task deadline this controller arms.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Drop task state and cancel the deadline timer (session teardown).
    pub fn release(&self) {
        let mut state = self.state.lock().expect("cancel state poisoned");
        if let Some(timer) = state.deadline_timer.take() {
            timer.abort();
        }
        state.task_id = None;
        state.phase = ControlPhase::Idle;
        state.resolution = None;
    }
}

impl std::fmt::Debug for CancelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("cancel state poisoned");
        f.debug_struct("CancelController")
            .field("task_id", &state.task_id)
            .field("phase", &state.phase)
            .field("resolution", &state.resolution)
            .finish()
    }
}
