//! Server-to-client event frames.
//!
//! Every inbound frame is a JSON object discriminated by a `type` field.
//! Pipeline-scoped events carry a `step` (stage id); session-level events
//! (`cancelled`, step-less `error`, `complete`) do not. Frames are decoded
//! once, consumed immediately and never mutated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::smq::QueryResultSet;

/// A single inbound frame could not be parsed as structured data.
///
/// Non-fatal by contract: callers log and continue without tearing down the
/// stream. One malformed frame must not end the session.
#[derive(Debug, Error)]
#[error("malformed event frame: {source}")]
pub struct DecodeError {
    #[from]
    source: serde_json::Error,
}

/// Structured result fields attached to completion-class events.
///
/// The backend spreads these directly onto the event object, so they are
/// flattened into the owning variant on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
    /// Sample rows produced by the query-execution stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_result: Option<QueryResultSet>,

    /// Raw output of the SQL-conversion stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_result: Option<Value>,

    /// The generated SQL text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,

    /// The generated SMQ. Kept opaque: depending on the agent this is a
    /// single query object or a list of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smq: Option<Value>,
}

impl ResultBundle {
    /// True when no result field is present.
    pub fn is_empty(&self) -> bool {
        self.query_result.is_none()
            && self.sql_result.is_none()
            && self.sql_query.is_none()
            && self.smq.is_none()
    }

    /// Overlay `other` onto `self`, keeping existing fields where `other`
    /// has none. Later events win for fields they carry.
    pub fn merge(&mut self, other: &ResultBundle) {
        if other.query_result.is_some() {
            self.query_result = other.query_result.clone();
        }
        if other.sql_result.is_some() {
            self.sql_result = other.sql_result.clone();
        }
        if other.sql_query.is_some() {
            self.sql_query = other.sql_query.clone();
        }
        if other.smq.is_some() {
            self.smq = other.smq.clone();
        }
    }
}

/// Events sent from the agent backend to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental text fragment of the streamed assistant response.
    Delta {
        #[serde(default)]
        content: Option<String>,
    },

    /// A pipeline stage started; `content` is the stage's rendered input.
    Prompt {
        step: String,
        #[serde(default)]
        content: Option<String>,
    },

    /// Reasoning output of a stage. Marks the stage complete.
    Thought {
        #[serde(default)]
        step: Option<String>,
        #[serde(default)]
        content: Option<String>,
        /// Stage-specific extraction payload (metrics, filters, order-by).
        #[serde(default)]
        details: Option<Value>,
        /// Post-processing stages report their rewritten output here; when
        /// present it supersedes `content` as the stage result.
        #[serde(default)]
        postprocess_result: Option<String>,
    },

    /// The agent invoked a tool.
    ToolCall {
        #[serde(default)]
        step: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        args: Option<Value>,
        #[serde(default)]
        details: Option<Value>,
    },

    /// Output of a tool invocation. `content` is frequently JSON-encoded.
    ToolResult {
        #[serde(default)]
        step: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        details: Option<Value>,
    },

    /// A stage produced its final chunk. The same text may be re-streamed as
    /// trailing `delta` frames afterwards.
    Success {
        #[serde(default)]
        step: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(flatten)]
        results: ResultBundle,
    },

    /// Like [`AgentEvent::Success`], emitted by conversational agents.
    Message {
        #[serde(default)]
        step: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(flatten)]
        results: ResultBundle,
    },

    /// A stage (with `step`) or the whole task (without) failed.
    Error {
        #[serde(default)]
        step: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },

    /// The backend acknowledged a cancel request.
    Cancelled {
        #[serde(default)]
        content: Option<String>,
    },

    /// Terminal event: the task finished and the final answer is attached.
    Complete {
        #[serde(default)]
        content: Option<String>,
        /// Recorded step entries, echoed back for transcript recovery.
        #[serde(default)]
        steps: Option<Vec<Value>>,
        #[serde(flatten)]
        results: ResultBundle,
    },

    /// Any `type` this client does not know. Downstream components must
    /// ignore it without error.
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Decode one inbound frame.
    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The pipeline stage this event belongs to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            AgentEvent::Prompt { step, .. } => Some(step.as_str()),
            AgentEvent::Thought { step, .. }
            | AgentEvent::ToolCall { step, .. }
            | AgentEvent::ToolResult { step, .. }
            | AgentEvent::Success { step, .. }
            | AgentEvent::Message { step, .. }
            | AgentEvent::Error { step, .. } => step.as_deref(),
            _ => None,
        }
    }

    /// True for events that end the task (`complete`, `error`, `cancelled`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::Complete { .. } | AgentEvent::Error { .. } | AgentEvent::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prompt_event() {
        let raw = r#"{"type":"prompt","step":"classifyJoy","content":"classify this"}"#;
        let event = AgentEvent::parse(raw).unwrap();
        match event {
            AgentEvent::Prompt { step, content } => {
                assert_eq!(step, "classifyJoy");
                assert_eq!(content.as_deref(), Some("classify this"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_complete_with_flattened_results() {
        let raw = r#"{
            "type": "complete",
            "content": "done",
            "sql_query": "SELECT 1",
            "query_result": {"columns": ["n"], "rows": [{"n": 1}]},
            "smq": {"metrics": ["orders.count"]}
        }"#;
        let event = AgentEvent::parse(raw).unwrap();
        match event {
            AgentEvent::Complete {
                content, results, ..
            } => {
                assert_eq!(content.as_deref(), Some("done"));
                assert_eq!(results.sql_query.as_deref(), Some("SELECT 1"));
                let rows = &results.query_result.unwrap().rows;
                assert_eq!(rows.len(), 1);
                assert!(results.smq.is_some());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let raw = r#"{"type":"heartbeat_v2","content":"??"}"#;
        let event = AgentEvent::parse(raw).unwrap();
        assert!(matches!(event, AgentEvent::Unknown));
        assert!(!event.is_terminal());
        assert_eq!(event.step(), None);
    }

    #[test]
    fn malformed_frame_is_a_decode_error() {
        assert!(AgentEvent::parse("not json at all").is_err());
        assert!(AgentEvent::parse(r#"{"content":"missing tag"}"#).is_err());
    }

    #[test]
    fn step_is_absent_on_session_level_events() {
        let cancelled = AgentEvent::parse(r#"{"type":"cancelled"}"#).unwrap();
        assert_eq!(cancelled.step(), None);
        assert!(cancelled.is_terminal());

        let error = AgentEvent::parse(r#"{"type":"error","content":"boom"}"#).unwrap();
        assert_eq!(error.step(), None);
        assert!(error.is_terminal());
    }

    #[test]
    fn bundle_merge_keeps_existing_fields() {
        let mut bundle = ResultBundle {
            sql_query: Some("SELECT 1".to_string()),
            ..Default::default()
        };
        let incoming = ResultBundle {
            smq: Some(serde_json::json!({"metrics": []})),
            ..Default::default()
        };
        bundle.merge(&incoming);
        assert_eq!(bundle.sql_query.as_deref(), Some("SELECT 1"));
        assert!(bundle.smq.is_some());
        assert!(!bundle.is_empty());
    }
}
