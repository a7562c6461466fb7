//! Conversation reducer.
//!
//! Folds the decoded event stream into an ordered transcript of turns. Per
//! task the reducer moves `Idle -> AwaitingResponse -> Idle`; exactly one
//! turn is open (still receiving deltas) at a time and closing a turn is
//! final.
//!
//! Some backend stages emit a full chunk via `success`/`message` *and*
//! re-stream the same text as trailing `delta` frames. The reducer therefore
//! sets a suppression flag on the first non-empty `success`/`message` and
//! ignores deltas until the turn closes; without it the final answer renders
//! twice.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use serde_json::Value;

use semaq_protocol::{AgentEvent, ResultBundle};

/// Who a transcript turn belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Error,
}

/// Kind of a recorded intermediate step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thought,
    ToolCall,
    ToolResult,
    Success,
    Message,
}

/// One intermediate step attached to an assistant turn, kept for the
/// expandable detail view.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub kind: StepKind,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// One entry in the conversation transcript.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub steps: Vec<StepRecord>,
    pub results: ResultBundle,
    pub created_at: DateTime<Utc>,
    closed: bool,
}

impl Turn {
    fn new(role: Role, content: impl Into<String>, closed: bool) -> Self {
        Self {
            role,
            content: content.into(),
            steps: Vec::new(),
            results: ResultBundle::default(),
            created_at: Utc::now(),
            closed,
        }
    }

    /// A closed turn never changes again.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingResponse,
}

/// Folds decoded events into the transcript. Single logical writer: only
/// the session pump mutates it, renderers read snapshots.
#[derive(Debug)]
pub struct TranscriptReducer {
    turns: Vec<Turn>,
    phase: Phase,
    suppress_delta: bool,
    suppression_enabled: bool,
}

impl TranscriptReducer {
    pub fn new(suppression_enabled: bool) -> Self {
        Self {
            turns: Vec::new(),
            phase: Phase::Idle,
            suppress_delta: false,
            suppression_enabled,
        }
    }

    /// The transcript so far, oldest first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// True between a user submission and the task's terminal event.
    pub fn is_awaiting_response(&self) -> bool {
        self.phase == Phase::AwaitingResponse
    }

    /// Record a user submission and open the provisional assistant turn.
    pub fn begin_user_turn(&mut self, text: &str) {
        if let Some(open) = self.open_turn_mut() {
            // Happens when an answer to a clarifying question continues the
            // task; never leave a dangling open turn behind.
            debug!("closing open turn before new submission");
            open.closed = true;
        }
        self.turns.push(Turn::new(Role::User, text, true));
        self.turns.push(Turn::new(Role::Assistant, "", false));
        self.phase = Phase::AwaitingResponse;
        self.suppress_delta = false;
    }

    /// Append a closed system-role notice (transport failures and the like).
    pub fn note_system(&mut self, text: &str) {
        self.turns.push(Turn::new(Role::System, text, true));
    }

    /// Drop the whole transcript (new task from a clean slate).
    pub fn clear(&mut self) {
        self.turns.clear();
        self.phase = Phase::Idle;
        self.suppress_delta = false;
    }

    /// Fold one event. Returns whether the transcript changed.
    pub fn apply(&mut self, event: &AgentEvent) -> bool {
        match event {
            AgentEvent::Delta { content } => {
                if self.phase != Phase::AwaitingResponse || self.suppress_delta {
                    return false;
                }
                let Some(fragment) = content.as_deref() else {
                    return false;
                };
                match self.open_turn_mut() {
                    Some(turn) => {
                        turn.content.push_str(fragment);
                        true
                    }
                    None => false,
                }
            }

            AgentEvent::Success {
                content, results, ..
            } => self.apply_chunk(StepKind::Success, content.as_deref(), results),

            AgentEvent::Message {
                content, results, ..
            } => self.apply_chunk(StepKind::Message, content.as_deref(), results),

            AgentEvent::Thought {
                content, details, ..
            } => self.record_step(StepRecord {
                kind: StepKind::Thought,
                content: content.clone(),
                tool: None,
                args: None,
                details: details.clone(),
            }),

            AgentEvent::ToolCall {
                content,
                tool,
                args,
                details,
                ..
            } => self.record_step(StepRecord {
                kind: StepKind::ToolCall,
                content: content.clone(),
                tool: tool.clone(),
                args: args.clone(),
                details: details.clone(),
            }),

            AgentEvent::ToolResult {
                content, details, ..
            } => self.record_step(StepRecord {
                kind: StepKind::ToolResult,
                content: content.clone(),
                tool: None,
                args: None,
                details: details.clone(),
            }),

            AgentEvent::Complete {
                content, results, ..
            } => self.close_complete(content.as_deref(), results),

            AgentEvent::Error { content, .. } => {
                let message = content.as_deref().unwrap_or("unknown error");
                self.close_failed(&format!("Error: {message}"))
            }

            AgentEvent::Cancelled { content } => {
                self.close_cancelled(content.as_deref().unwrap_or("Task was cancelled."))
            }

            // Pipeline-only and unknown events leave the transcript alone.
            AgentEvent::Prompt { .. } | AgentEvent::Unknown => false,
        }
    }

    /// Close the open turn with a locally synthesized failure (deadline
    /// expiry, send errors). Same shape as a server `error` event.
    pub fn close_failed_locally(&mut self, message: &str) -> bool {
        self.close_failed(message)
    }

    /// Close the open turn with a cancellation notice (local cancel path;
    /// the server's `cancelled` event takes the same route).
    pub fn close_cancelled(&mut self, notice: &str) -> bool {
        let Some(turn) = self.open_turn_mut() else {
            return false;
        };
        if turn.content.is_empty() {
            turn.content = notice.to_string();
        } else {
            // Keep whatever streamed before the cancel, but mark the cut.
            turn.content.push_str("\n\n");
            turn.content.push_str(notice);
        }
        turn.closed = true;
        self.finish_task();
        true
    }

    fn apply_chunk(
        &mut self,
        kind: StepKind,
        content: Option<&str>,
        results: &ResultBundle,
    ) -> bool {
        if self.phase != Phase::AwaitingResponse {
            return false;
        }
        let suppression_enabled = self.suppression_enabled;
        let mut suppress = false;
        let changed = match self.open_turn_mut() {
            Some(turn) => {
                if let Some(text) = content.filter(|text| !text.is_empty()) {
                    if turn.content.is_empty() {
                        turn.content.push_str(text);
                    } else {
                        turn.content.push_str("\n\n");
                        turn.content.push_str(text);
                    }
                    // The same text follows as trailing deltas; ignore them.
                    suppress = suppression_enabled;
                }
                turn.results.merge(results);
                turn.steps.push(StepRecord {
                    kind,
                    content: content.map(str::to_string),
                    tool: None,
                    args: None,
                    details: None,
                });
                true
            }
            None => false,
        };
        if suppress {
            self.suppress_delta = true;
        }
        changed
    }

    fn record_step(&mut self, step: StepRecord) -> bool {
        if self.phase != Phase::AwaitingResponse {
            return false;
        }
        match self.open_turn_mut() {
            Some(turn) => {
                turn.steps.push(step);
                true
            }
            None => false,
        }
    }

    fn close_complete(&mut self, content: Option<&str>, results: &ResultBundle) -> bool {
        let Some(turn) = self.open_turn_mut() else {
            // Replayed terminal: the turn is already closed, nothing to do.
            return false;
        };
        // Prefer the accumulated streamed text; the event's content is a
        // duplicate of it in the common case. Fall back to the event when
        // nothing was streamed.
        if turn.content.is_empty() {
            turn.content = content.unwrap_or("Task completed.").to_string();
        }
        turn.results.merge(results);
        turn.closed = true;
        self.finish_task();
        true
    }

    fn close_failed(&mut self, message: &str) -> bool {
        let Some(turn) = self.open_turn_mut() else {
            return false;
        };
        turn.role = Role::Error;
        turn.content = message.to_string();
        turn.closed = true;
        self.finish_task();
        true
    }

    fn finish_task(&mut self) {
        self.phase = Phase::Idle;
        self.suppress_delta = false;
    }

    fn open_turn_mut(&mut self) -> Option<&mut Turn> {
        self.turns.last_mut().filter(|turn| !turn.closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> AgentEvent {
        AgentEvent::Delta {
            content: Some(text.to_string()),
        }
    }

    fn success(text: &str) -> AgentEvent {
        AgentEvent::Success {
            step: Some("respondent".to_string()),
            content: Some(text.to_string()),
            results: ResultBundle::default(),
        }
    }

    fn complete(text: &str) -> AgentEvent {
        AgentEvent::Complete {
            content: Some(text.to_string()),
            steps: None,
            results: ResultBundle::default(),
        }
    }

    fn open_turn(reducer: &TranscriptReducer) -> &Turn {
        reducer.turns().last().expect("no turns")
    }

    #[test]
    fn submission_opens_exactly_one_turn() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("show revenue by region");

        assert_eq!(reducer.turns().len(), 2);
        assert_eq!(reducer.turns()[0].role, Role::User);
        assert!(reducer.turns()[0].is_closed());
        assert_eq!(open_turn(&reducer).role, Role::Assistant);
        assert!(!open_turn(&reducer).is_closed());
        assert!(reducer.is_awaiting_response());
    }

    #[test]
    fn deltas_accumulate_into_the_open_turn() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        assert!(reducer.apply(&delta("Hel")));
        assert!(reducer.apply(&delta("lo")));
        assert_eq!(open_turn(&reducer).content, "Hello");
    }

    #[test]
    fn success_suppresses_trailing_deltas() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        assert!(reducer.apply(&success("partial")));
        assert!(!reducer.apply(&delta("ignored")));
        assert_eq!(open_turn(&reducer).content, "partial");
    }

    #[test]
    fn suppression_can_be_disabled() {
        let mut reducer = TranscriptReducer::new(false);
        reducer.begin_user_turn("q");
        reducer.apply(&success("partial"));
        assert!(reducer.apply(&delta("!")));
        assert_eq!(open_turn(&reducer).content, "partial!");
    }

    #[test]
    fn chunks_are_separated_by_a_blank_line() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        reducer.apply(&delta("first"));
        reducer.apply(&success("second"));
        assert_eq!(open_turn(&reducer).content, "first\n\nsecond");
    }

    #[test]
    fn suppression_resets_on_next_submission() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("one");
        reducer.apply(&success("answer"));
        reducer.apply(&complete("answer"));

        reducer.begin_user_turn("two");
        assert!(reducer.apply(&delta("fresh")));
        assert_eq!(open_turn(&reducer).content, "fresh");
    }

    #[test]
    fn complete_closes_and_prefers_accumulated_content() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        reducer.apply(&delta("streamed answer"));
        assert!(reducer.apply(&complete("short")));

        let turn = open_turn(&reducer);
        assert!(turn.is_closed());
        assert_eq!(turn.content, "streamed answer");
        assert!(!reducer.is_awaiting_response());
    }

    #[test]
    fn complete_falls_back_to_event_content() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        reducer.apply(&complete("done"));
        assert_eq!(open_turn(&reducer).content, "done");
    }

    #[test]
    fn replayed_complete_is_a_no_op() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        assert!(reducer.apply(&complete("done")));
        let turns_before = reducer.turns().len();
        assert!(!reducer.apply(&complete("done")));
        assert_eq!(reducer.turns().len(), turns_before);
    }

    #[test]
    fn error_closes_the_turn_with_a_marked_failure() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        assert!(reducer.apply(&AgentEvent::Error {
            step: Some("smq2sql".to_string()),
            content: Some("no such metric".to_string()),
        }));

        let turn = open_turn(&reducer);
        assert!(turn.is_closed());
        assert_eq!(turn.role, Role::Error);
        assert_eq!(turn.content, "Error: no such metric");
    }

    #[test]
    fn cancelled_closes_with_a_notice() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        assert!(reducer.apply(&AgentEvent::Cancelled { content: None }));
        let turn = open_turn(&reducer);
        assert!(turn.is_closed());
        assert_eq!(turn.content, "Task was cancelled.");
    }

    #[test]
    fn steps_are_recorded_in_order() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        reducer.apply(&AgentEvent::Thought {
            step: Some("classifyJoy".to_string()),
            content: Some("question_type=metric".to_string()),
            details: None,
            postprocess_result: None,
        });
        reducer.apply(&AgentEvent::ToolCall {
            step: Some("smq2sql".to_string()),
            content: None,
            tool: Some("SemanticModelQuery.convertSmqToSql".to_string()),
            args: None,
            details: None,
        });
        reducer.apply(&AgentEvent::ToolResult {
            step: Some("smq2sql".to_string()),
            content: Some("{\"success\":true}".to_string()),
            details: None,
        });

        let kinds: Vec<StepKind> = open_turn(&reducer)
            .steps
            .iter()
            .map(|step| step.kind)
            .collect();
        assert_eq!(
            kinds,
            [StepKind::Thought, StepKind::ToolCall, StepKind::ToolResult]
        );
    }

    #[test]
    fn terminal_events_without_an_open_turn_do_nothing() {
        let mut reducer = TranscriptReducer::new(true);
        assert!(!reducer.apply(&complete("late")));
        assert!(!reducer.apply(&AgentEvent::Cancelled { content: None }));
        assert!(reducer.turns().is_empty());
    }

    #[test]
    fn dangling_open_turn_is_closed_by_next_submission() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("one");
        reducer.begin_user_turn("two");

        let open: Vec<&Turn> = reducer
            .turns()
            .iter()
            .filter(|turn| !turn.is_closed())
            .collect();
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn timeout_closes_the_turn_as_an_error() {
        let mut reducer = TranscriptReducer::new(true);
        reducer.begin_user_turn("q");
        assert!(reducer.close_failed_locally("Error: request timed out after 300s"));
        let turn = open_turn(&reducer);
        assert_eq!(turn.role, Role::Error);
        assert!(turn.is_closed());
        assert!(!reducer.is_awaiting_response());
    }
}
