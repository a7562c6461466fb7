//! Side-by-side comparison runs.
//!
//! Sends the same question to two provider configurations at once, each on
//! its own session and client, and collects each side's status board and
//! final answer. Sides are independent: one failing or timing out never
//! aborts the other.

use std::collections::HashMap;

use log::warn;
use tokio::sync::broadcast;

use semaq_protocol::RunRequest;

use crate::client::{ClientEvent, ConsoleClient, TaskOutcome};
use crate::config::ClientConfig;
use crate::pipeline::StageStatus;
use crate::transcript::{Role, Turn};

/// One contender in a comparison.
#[derive(Debug, Clone)]
pub struct CompareSide {
    /// Display label (e.g. the provider name).
    pub label: String,
    pub config: ClientConfig,
    pub request: RunRequest,
}

impl CompareSide {
    pub fn new(label: impl Into<String>, config: ClientConfig, request: RunRequest) -> Self {
        Self {
            label: label.into(),
            config,
            request,
        }
    }
}

/// What one side produced.
#[derive(Debug, Clone)]
pub struct CompareOutcome {
    pub label: String,
    /// How the task ended; `None` when it never started.
    pub outcome: Option<TaskOutcome>,
    /// Authoritative stage board at the end of the run.
    pub statuses: HashMap<String, StageStatus>,
    /// The closing assistant (or error) turn.
    pub final_turn: Option<Turn>,
    /// Failure description when the side did not complete.
    pub error: Option<String>,
}

/// Run both sides concurrently and return their outcomes in order.
pub async fn run_side_by_side(
    left: CompareSide,
    right: CompareSide,
) -> (CompareOutcome, CompareOutcome) {
    tokio::join!(run_side(left), run_side(right))
}

async fn run_side(side: CompareSide) -> CompareOutcome {
    let label = side.label;
    let client = ConsoleClient::new(side.config);
    // Subscribe before submitting so the terminal notification cannot be
    // missed.
    let mut events = client.subscribe();

    let (outcome, submit_error) = match client.submit(side.request).await {
        Ok(()) => (wait_for_terminal(&mut events).await, None),
        Err(err) => {
            warn!("compare side {label} failed to start: {err}");
            (None, Some(err.to_string()))
        }
    };

    let statuses = client.stage_statuses();
    let final_turn = client
        .transcript()
        .into_iter()
        .rev()
        .find(|turn| turn.is_closed() && matches!(turn.role, Role::Assistant | Role::Error));

    let error = submit_error.or_else(|| match outcome {
        Some(TaskOutcome::Completed) => None,
        Some(_) | None => final_turn.as_ref().map(|turn| turn.content.clone()),
    });

    client.close().await;

    CompareOutcome {
        label,
        outcome,
        statuses,
        final_turn,
        error,
    }
}

/// Block until the task reaches a terminal state. The task deadline
/// guarantees this returns even when the backend goes silent.
async fn wait_for_terminal(
    events: &mut broadcast::Receiver<ClientEvent>,
) -> Option<TaskOutcome> {
    loop {
        match events.recv().await {
            Ok(ClientEvent::TaskFinished { outcome }) => return Some(outcome),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("compare watcher lagged by {skipped} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
