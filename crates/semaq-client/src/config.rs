//! Client configuration.

use std::time::Duration;

/// Minimum time a stage is shown as running before the display advances.
pub const DEFAULT_MIN_DISPLAY: Duration = Duration::from_millis(1000);

/// Settle delay after flipping a displayed stage to complete.
pub const DEFAULT_COMPLETION_DEBOUNCE: Duration = Duration::from_millis(50);

/// How long an errored stage stays on the board before eviction.
pub const DEFAULT_ERROR_LINGER: Duration = Duration::from_secs(3);

/// Safety eviction for a completed stage when no next stage ever starts.
pub const DEFAULT_COMPLETE_LINGER: Duration = Duration::from_secs(10);

/// Hard ceiling on a task with no terminal event.
pub const DEFAULT_TASK_DEADLINE: Duration = Duration::from_secs(300);

/// Buffer size for the decoded-event channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// Pacing constants for the visual presentation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTiming {
    pub min_display: Duration,
    pub completion_debounce: Duration,
    pub error_linger: Duration,
    pub complete_linger: Duration,
}

impl Default for DisplayTiming {
    fn default() -> Self {
        Self {
            min_display: DEFAULT_MIN_DISPLAY,
            completion_debounce: DEFAULT_COMPLETION_DEBOUNCE,
            error_linger: DEFAULT_ERROR_LINGER,
            complete_linger: DEFAULT_COMPLETE_LINGER,
        }
    }
}

/// Configuration for a [`crate::client::ConsoleClient`].
///
/// One instance parameterizes everything the five console pages used to
/// hard-code locally: the endpoint, the suppression rule and the display
/// timing constants.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the agent backend.
    pub endpoint: String,

    /// Display pacing.
    pub timing: DisplayTiming,

    /// Hard ceiling after which a task with no terminal event is failed
    /// locally.
    pub task_deadline: Duration,

    /// Capacity of the decoded-event channel between session and pump.
    pub event_buffer_size: usize,

    /// Ignore `delta` frames after a `success`/`message` already delivered
    /// the same text. The backend re-streams final chunks as deltas; without
    /// suppression they would render twice.
    pub suppress_delta_after_message: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8000/ws/chat".to_string(),
            timing: DisplayTiming::default(),
            task_deadline: DEFAULT_TASK_DEADLINE,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            suppress_delta_after_message: true,
        }
    }
}

impl ClientConfig {
    /// Config pointed at a specific endpoint, defaults elsewhere.
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }
}
