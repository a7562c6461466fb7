//! Client-to-server messages.
//!
//! A task is started (or continued, for re-question answers) by sending a
//! [`RunRequest`]; a running task is cancelled with
//! [`ControlMessage::Cancel`]. Both are plain JSON objects; only control
//! messages carry a `type` tag.

use serde::{Deserialize, Serialize};

/// Start or continue a task on the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// The user's message.
    pub message: String,

    /// Prompt preset the backend should load for single-agent runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_type: Option<String>,

    /// Which agent runs the task (e.g. `"semantic"`, `"smq"`, `"langgraph"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,

    /// Provider override for self-hosted model backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<LlmConfig>,
}

impl RunRequest {
    /// A bare request with backend defaults for everything but the message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            prompt_type: None,
            agent_type: None,
            llm_config: None,
        }
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_prompt_type(mut self, prompt_type: impl Into<String>) -> Self {
        self.prompt_type = Some(prompt_type.into());
        self
    }

    pub fn with_llm_config(mut self, llm_config: LlmConfig) -> Self {
        self.llm_config = Some(llm_config);
        self
    }
}

/// Inference-provider settings forwarded verbatim to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the inference server.
    pub url: String,
    /// Model identifier or local checkpoint path.
    pub model_name: String,
    /// Serving stack (e.g. `"vllm"`).
    pub model_type: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Session control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Cancel the in-flight task. Fire-and-forget: no acknowledgement is
    /// required before the client treats the task as cancelled.
    Cancel,
}
