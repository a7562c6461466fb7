//! Visual presentation queue.
//!
//! A single-consumer FIFO that replays status-tracker transitions as timed
//! display updates, so a bursty event stream still reads as a legible
//! animation. This board is a derived, eventually-consistent copy of the
//! tracker; the tracker stays the source of truth for detail views and is
//! never affected by pacing.
//!
//! The queue is re-entrant safe: a `processing` latch keeps overlapping
//! timer callbacks from double-advancing, and every scheduled callback
//! carries the generation it was armed under so callbacks from a previous
//! task cannot touch a reset board. Terminal ordering is preserved: a
//! `complete` item flushes every running stage and stops the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use semaq_protocol::ResultBundle;

use crate::config::DisplayTiming;
use crate::pipeline::{QueueItem, QueueKind};
use crate::stages;

/// Displayed lifecycle of a stage. Coarser than the tracker's: `waiting` is
/// shown as running, `idle` is not shown at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayPhase {
    Running,
    Complete,
    Error,
}

/// One stage as currently shown.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayedStage {
    pub phase: DisplayPhase,
    pub prompt: Option<String>,
    pub result: Option<String>,
    pub tool_result: Option<Value>,
    pub details: Option<Value>,
    pub results: ResultBundle,
}

/// The stages currently on screen.
#[derive(Debug, Clone, Default)]
pub struct DisplayBoard {
    stages: HashMap<String, DisplayedStage>,
}

impl DisplayBoard {
    pub fn get(&self, step: &str) -> Option<&DisplayedStage> {
        self.stages.get(step)
    }

    pub fn contains(&self, step: &str) -> bool {
        self.stages.contains_key(step)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Stages in canonical pipeline order, unknown stages last.
    pub fn ordered(&self) -> Vec<(&str, &DisplayedStage)> {
        let mut entries: Vec<(&str, &DisplayedStage)> = self
            .stages
            .iter()
            .map(|(step, stage)| (step.as_str(), stage))
            .collect();
        entries.sort_by_key(|(step, _)| stages::stage_sort_key(step));
        entries
    }
}

/// What the pump does after handling one item.
enum Advance {
    /// Release the latch after a pause, then continue.
    After(Duration),
    /// Release the latch and continue with the next item at once.
    Now,
    /// Terminal reached: stop consuming.
    Stop,
}

struct State {
    queue: VecDeque<QueueItem>,
    board: DisplayBoard,
    /// Re-entrancy latch; held while an item is on screen for its minimum
    /// interval.
    processing: bool,
    stopped: bool,
    /// Bumped on reset; stale timer callbacks check it and bail.
    generation: u64,
    advance_timer: Option<JoinHandle<()>>,
    evict_timers: HashMap<String, JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    board_tx: watch::Sender<DisplayBoard>,
    timing: DisplayTiming,
}

/// The pacing layer between tracker updates and the rendered status board.
#[derive(Clone)]
pub struct DisplayQueue {
    shared: Arc<Shared>,
}

impl DisplayQueue {
    pub fn new(timing: DisplayTiming) -> Self {
        let (board_tx, _) = watch::channel(DisplayBoard::default());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    board: DisplayBoard::default(),
                    processing: false,
                    stopped: false,
                    generation: 0,
                    advance_timer: None,
                    evict_timers: HashMap::new(),
                }),
                board_tx,
                timing,
            }),
        }
    }

    /// Watch board changes.
    pub fn subscribe(&self) -> watch::Receiver<DisplayBoard> {
        self.shared.board_tx.subscribe()
    }

    /// Snapshot of the current board.
    pub fn board(&self) -> DisplayBoard {
        self.shared.state.lock().expect("display state poisoned").board.clone()
    }

    /// True when nothing is queued or being paced.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock().expect("display state poisoned");
        state.queue.is_empty() && !state.processing
    }

    /// Enqueue tracker transitions for presentation.
    pub fn push(&self, items: impl IntoIterator<Item = QueueItem>) {
        {
            let mut state = self.shared.state.lock().expect("display state poisoned");
            if state.stopped {
                debug!("display queue stopped, dropping transitions");
                return;
            }
            state.queue.extend(items);
        }
        self.pump();
    }

    /// Clear board, queue and timers for a new task.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock().expect("display state poisoned");
        state.generation += 1;
        if let Some(timer) = state.advance_timer.take() {
            timer.abort();
        }
        for (_, timer) in state.evict_timers.drain() {
            timer.abort();
        }
        state.queue.clear();
        state.board = DisplayBoard::default();
        state.processing = false;
        state.stopped = false;
        self.shared.board_tx.send_replace(state.board.clone());
    }

    /// Cancel every scheduled callback. Called on session teardown.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().expect("display state poisoned");
        state.generation += 1;
        if let Some(timer) = state.advance_timer.take() {
            timer.abort();
        }
        for (_, timer) in state.evict_timers.drain() {
            timer.abort();
        }
        state.queue.clear();
        state.stopped = true;
    }

    /// Drain the queue head as far as pacing allows. Safe to call from any
    /// path; the latch serializes overlapping invocations.
    fn pump(&self) {
        loop {
            let advance = {
                let mut state = self.shared.state.lock().expect("display state poisoned");
                if state.processing || state.stopped {
                    return;
                }
                let Some(item) = state.queue.pop_front() else {
                    return;
                };
                state.processing = true;
                let advance = self.handle(&mut state, item);
                self.shared.board_tx.send_replace(state.board.clone());
                advance
            };

            match advance {
                Advance::Now => {
                    let mut state = self.shared.state.lock().expect("display state poisoned");
                    state.processing = false;
                }
                Advance::After(delay) => {
                    self.schedule_advance(delay);
                    return;
                }
                Advance::Stop => {
                    let mut state = self.shared.state.lock().expect("display state poisoned");
                    state.processing = false;
                    state.stopped = true;
                    return;
                }
            }
        }
    }

    fn handle(&self, state: &mut State, item: QueueItem) -> Advance {
        match item.kind {
            QueueKind::Prompt => {
                // The next stage starting supersedes everything already
                // finished on the board: immediate swap.
                let swept: Vec<String> = state
                    .board
                    .stages
                    .iter()
                    .filter(|(step, stage)| {
                        stage.phase != DisplayPhase::Running
                            && step.as_str() != stages::COMPLETE_STAGE
                            && step.as_str() != item.step
                    })
                    .map(|(step, _)| step.clone())
                    .collect();
                for step in swept {
                    if let Some(timer) = state.evict_timers.remove(&step) {
                        timer.abort();
                    }
                    state.board.stages.remove(&step);
                }

                state.board.stages.insert(
                    item.step.clone(),
                    DisplayedStage {
                        phase: DisplayPhase::Running,
                        prompt: item.content,
                        result: None,
                        tool_result: None,
                        details: None,
                        results: ResultBundle::default(),
                    },
                );
                // Keep the stage on screen long enough to be readable.
                Advance::After(self.shared.timing.min_display)
            }

            QueueKind::Completion => {
                let Some(stage) = state.board.stages.get_mut(&item.step) else {
                    // Finished before its prompt was ever displayed: no
                    // visible transition, advance without delay.
                    return Advance::Now;
                };
                if stage.phase != DisplayPhase::Running {
                    return Advance::Now;
                }
                stage.phase = DisplayPhase::Complete;
                stage.result = item.content;
                if item.tool_result.is_some() {
                    stage.tool_result = item.tool_result;
                }
                if item.details.is_some() {
                    stage.details = item.details;
                }
                stage.results.merge(&item.results);

                self.schedule_eviction(
                    state,
                    &item.step,
                    self.shared.timing.complete_linger,
                    true,
                );
                Advance::After(self.shared.timing.completion_debounce)
            }

            QueueKind::Error => {
                state.board.stages.insert(
                    item.step.clone(),
                    DisplayedStage {
                        phase: DisplayPhase::Error,
                        prompt: None,
                        result: item.content,
                        tool_result: None,
                        details: None,
                        results: ResultBundle::default(),
                    },
                );
                self.schedule_eviction(state, &item.step, self.shared.timing.error_linger, false);
                Advance::Now
            }

            QueueKind::Complete => {
                let forced: Vec<String> = state
                    .board
                    .stages
                    .iter_mut()
                    .filter_map(|(step, stage)| {
                        if stage.phase == DisplayPhase::Running {
                            stage.phase = DisplayPhase::Complete;
                            Some(step.clone())
                        } else {
                            None
                        }
                    })
                    .collect();
                for step in forced {
                    self.schedule_eviction(state, &step, self.shared.timing.complete_linger, true);
                }

                state.board.stages.insert(
                    stages::COMPLETE_STAGE.to_string(),
                    DisplayedStage {
                        phase: DisplayPhase::Complete,
                        prompt: None,
                        result: item.content,
                        tool_result: None,
                        details: None,
                        results: item.results,
                    },
                );
                Advance::Stop
            }
        }
    }

    fn schedule_advance(&self, delay: Duration) {
        let queue = self.clone();
        let generation = {
            let state = self.shared.state.lock().expect("display state poisoned");
            state.generation
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = queue.shared.state.lock().expect("display state poisoned");
                if state.generation != generation {
                    return;
                }
                state.processing = false;
                state.advance_timer = None;
            }
            queue.pump();
        });

        let mut state = self.shared.state.lock().expect("display state poisoned");
        if let Some(previous) = state.advance_timer.replace(handle) {
            previous.abort();
        }
    }

    /// Arm the safety eviction for a finished stage. With `keep_if_running`
    /// the stage survives while a successor is still on screen; the
    /// successor's own lifecycle removes it instead.
    fn schedule_eviction(
        &self,
        state: &mut State,
        step: &str,
        delay: Duration,
        keep_if_running: bool,
    ) {
        let queue = self.clone();
        let step_owned = step.to_string();
        let generation = state.generation;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = queue.shared.state.lock().expect("display state poisoned");
            if state.generation != generation {
                return;
            }
            state.evict_timers.remove(&step_owned);
            if keep_if_running {
                let successor_running = state
                    .board
                    .stages
                    .iter()
                    .any(|(other, stage)| {
                        other.as_str() != step_owned && stage.phase == DisplayPhase::Running
                    });
                if successor_running {
                    return;
                }
            }
            if state.board.stages.remove(&step_owned).is_some() {
                let board = state.board.clone();
                drop(state);
                queue.shared.board_tx.send_replace(board);
            }
        });

        if let Some(previous) = state.evict_timers.insert(step.to_string(), handle) {
            previous.abort();
        }
    }
}

impl std::fmt::Debug for DisplayQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().expect("display state poisoned");
        f.debug_struct("DisplayQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing)
            .field("stopped", &state.stopped)
            .finish()
    }
}
