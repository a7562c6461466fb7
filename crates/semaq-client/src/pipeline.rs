//! Pipeline status tracker.
//!
//! Authoritative per-stage state, a pure function of the event history and
//! independent of display timing: the detail view reads this board and must
//! never be affected by display pacing. Stages move
//! `idle -> running -> {complete | error}` and never regress; only a new
//! `prompt` may restart a finished stage.
//!
//! Applying an event returns the queue items the visual presentation layer
//! should animate; `tool_call` tracks state but never emits.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use serde_json::Value;

use semaq_protocol::{AgentEvent, ResultBundle};

use crate::stages::{self, COMPLETE_STAGE, POSTPROCESS_STAGE, RE_QUESTION_TOOL};

/// Lifecycle phase of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Idle,
    Running,
    /// Human-in-the-loop sub-status: the stage asked a clarifying question
    /// and blocks new submissions until answered.
    Waiting,
    Complete,
    Error,
}

impl StagePhase {
    /// True once the stage reached a final state.
    pub fn is_finished(self) -> bool {
        matches!(self, StagePhase::Complete | StagePhase::Error)
    }

    fn is_active(self) -> bool {
        matches!(self, StagePhase::Running | StagePhase::Waiting)
    }
}

/// Captured artifacts of one pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub phase: StagePhase,
    /// The stage's rendered input, set on `prompt`.
    pub prompt: Option<String>,
    /// The stage's output, set on completion-class events.
    pub result: Option<String>,
    /// Structured tool payload, parsed from `tool_result` content.
    pub tool_result: Option<Value>,
    /// Stage-specific extraction payload.
    pub details: Option<Value>,
    /// Result-bundle fields delivered with `success`/`message`.
    pub results: ResultBundle,
}

impl StageStatus {
    fn new(phase: StagePhase) -> Self {
        Self {
            phase,
            prompt: None,
            result: None,
            tool_result: None,
            details: None,
            results: ResultBundle::default(),
        }
    }
}

/// Display class of a queued transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// A stage started running.
    Prompt,
    /// A stage finished (`thought`, `tool_result`, `success`, `message`).
    Completion,
    /// A stage failed.
    Error,
    /// Terminal: the whole task finished.
    Complete,
}

/// One status transition awaiting visual presentation.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub step: String,
    pub kind: QueueKind,
    pub content: Option<String>,
    pub tool_result: Option<Value>,
    pub details: Option<Value>,
    pub results: ResultBundle,
    pub timestamp: DateTime<Utc>,
}

impl QueueItem {
    fn new(step: impl Into<String>, kind: QueueKind) -> Self {
        Self {
            step: step.into(),
            kind,
            content: None,
            tool_result: None,
            details: None,
            results: ResultBundle::default(),
            timestamp: Utc::now(),
        }
    }
}

/// Folds pipeline-scoped events into the authoritative stage map.
#[derive(Debug, Default)]
pub struct PipelineTracker {
    stages: HashMap<String, StageStatus>,
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The authoritative stage map.
    pub fn statuses(&self) -> &HashMap<String, StageStatus> {
        &self.stages
    }

    pub fn get(&self, step: &str) -> Option<&StageStatus> {
        self.stages.get(step)
    }

    /// Stages sorted by canonical pipeline position, unknown stages last.
    pub fn ordered(&self) -> Vec<(&str, &StageStatus)> {
        let mut entries: Vec<(&str, &StageStatus)> = self
            .stages
            .iter()
            .map(|(step, status)| (step.as_str(), status))
            .collect();
        entries.sort_by_key(|(step, _)| stages::stage_sort_key(step));
        entries
    }

    /// True while a stage waits for a human answer.
    pub fn has_waiting(&self) -> bool {
        self.stages
            .values()
            .any(|status| status.phase == StagePhase::Waiting)
    }

    /// The answer was submitted; waiting stages resume running.
    pub fn clear_waiting(&mut self) {
        for status in self.stages.values_mut() {
            if status.phase == StagePhase::Waiting {
                status.phase = StagePhase::Running;
            }
        }
    }

    /// Locally fail every active stage (task deadline expired). Returns the
    /// affected stage ids.
    pub fn fail_running(&mut self, message: &str) -> Vec<String> {
        let mut failed = Vec::new();
        for (step, status) in &mut self.stages {
            if status.phase.is_active() {
                status.phase = StagePhase::Error;
                status.result = Some(message.to_string());
                failed.push(step.clone());
            }
        }
        failed
    }

    /// Drop all stage state (new task).
    pub fn reset(&mut self) {
        self.stages.clear();
    }

    /// Fold one event; returns the display transitions it produced.
    pub fn apply(&mut self, event: &AgentEvent) -> Vec<QueueItem> {
        match event {
            AgentEvent::Prompt { step, content } => {
                let status = self.entry(step);
                // A fresh prompt is the one legitimate restart of a
                // finished stage.
                status.phase = StagePhase::Running;
                status.prompt = content.clone();

                let mut item = QueueItem::new(step, QueueKind::Prompt);
                item.content = content.clone();
                vec![item]
            }

            AgentEvent::Thought {
                step: Some(step),
                content,
                details,
                postprocess_result,
            } => {
                let override_result =
                    step.as_str() == POSTPROCESS_STAGE && postprocess_result.is_some();
                let display = if override_result {
                    postprocess_result.clone()
                } else {
                    content.clone()
                };
                self.finish_stage(step, display, None, details.clone(), None)
            }

            AgentEvent::ToolCall { step, tool, .. } => {
                if tool.as_deref() == Some(RE_QUESTION_TOOL) {
                    self.enter_waiting(step.as_deref());
                } else if let Some(step) = step {
                    // Track only; no queue emission for tool calls.
                    self.entry(step);
                }
                Vec::new()
            }

            AgentEvent::ToolResult {
                step: Some(step),
                content,
                details,
            } => {
                let parsed = content.as_deref().map(parse_tool_payload);
                self.finish_stage(step, content.clone(), parsed, details.clone(), None)
            }

            AgentEvent::Success {
                step: Some(step),
                content,
                results,
            }
            | AgentEvent::Message {
                step: Some(step),
                content,
                results,
            } => self.finish_stage(step, content.clone(), None, None, Some(results)),

            AgentEvent::Error {
                step: Some(step),
                content,
            } => {
                let status = self.entry(step);
                status.phase = StagePhase::Error;
                status.result = content.clone();

                let mut item = QueueItem::new(step, QueueKind::Error);
                item.content = content.clone();
                vec![item]
            }

            AgentEvent::Complete {
                content, results, ..
            } => {
                // Any stage still active is force-finished by the terminal.
                for status in self.stages.values_mut() {
                    if status.phase.is_active() {
                        status.phase = StagePhase::Complete;
                    }
                }

                let status = self.entry(COMPLETE_STAGE);
                status.phase = StagePhase::Complete;
                status.result = content.clone();
                status.results.merge(results);

                let mut item = QueueItem::new(COMPLETE_STAGE, QueueKind::Complete);
                item.content = content.clone();
                item.results = results.clone();
                vec![item]
            }

            // Step-less stage events and session-level events leave the
            // board alone.
            _ => Vec::new(),
        }
    }

    fn finish_stage(
        &mut self,
        step: &str,
        result: Option<String>,
        tool_result: Option<Value>,
        details: Option<Value>,
        results: Option<&ResultBundle>,
    ) -> Vec<QueueItem> {
        let status = self.entry(step);
        if status.phase == StagePhase::Error {
            // Finished-with-error is final for a stage; a completion for it
            // afterwards is out of order.
            warn!("ignoring completion for errored stage {step}");
            return Vec::new();
        }
        status.phase = StagePhase::Complete;
        if result.is_some() {
            status.result = result.clone();
        }
        if tool_result.is_some() {
            status.tool_result = tool_result.clone();
        }
        if details.is_some() {
            status.details = details.clone();
        }
        if let Some(bundle) = results {
            status.results.merge(bundle);
        }

        let mut item = QueueItem::new(step, QueueKind::Completion);
        item.content = result;
        item.tool_result = tool_result;
        item.details = details;
        if let Some(bundle) = results {
            item.results = bundle.clone();
        }
        vec![item]
    }

    fn enter_waiting(&mut self, step: Option<&str>) {
        if let Some(step) = step {
            let status = self.entry(step);
            if !status.phase.is_finished() {
                status.phase = StagePhase::Waiting;
            }
            return;
        }
        // Step-less re-question: the currently running stage owns it.
        if let Some(status) = self
            .stages
            .values_mut()
            .find(|status| status.phase == StagePhase::Running)
        {
            status.phase = StagePhase::Waiting;
        }
    }

    fn entry(&mut self, step: &str) -> &mut StageStatus {
        self.stages
            .entry(step.to_string())
            .or_insert_with(|| StageStatus::new(StagePhase::Running))
    }
}

/// Tool payloads are frequently JSON-encoded strings; fall back to the raw
/// text when they are not.
fn parse_tool_payload(content: &str) -> Value {
    serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_string()))
}
