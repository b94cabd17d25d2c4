//! Pipeline state and progress reporting
//!
//! Progress is published on a `watch` channel so any number of observers
//! (the HTTP `/progress` endpoint, tests) can read the latest value without
//! taking part in the extraction.

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    LoadingMetadata,
    Capturing,
    Decoding,
    Encoding,
    Ready,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Ready | PipelineState::Failed)
    }

    /// Legal edges of the pipeline state machine.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal() && *from != Idle,
            (Idle, LoadingMetadata) => true,
            (LoadingMetadata, Capturing) => true,
            (Capturing, Decoding) | (Capturing, Ready) => true,
            (Decoding, Encoding) => true,
            (Encoding, Ready) => true,
            _ => false,
        }
    }
}

/// Checkpoint values
pub const METADATA_LOADED: u8 = 25;
pub const CONTEXT_READY: u8 = 50;
pub const CAPTURE_STARTED: u8 = 75;
pub const COMPLETE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub state: PipelineState,
    pub percent: u8,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            percent: 0,
        }
    }
}

/// Owner side of the progress channel
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<Progress>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Progress::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Progress {
        *self.tx.borrow()
    }

    /// Start a fresh invocation from `Idle`.
    pub fn reset(&self) {
        self.tx.send_replace(Progress::default());
    }

    /// Move to `next`. Illegal edges are logged and ignored.
    pub fn transition(&self, next: PipelineState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|p| {
            if !p.state.can_transition_to(next) {
                tracing::warn!(from = ?p.state, to = ?next, "Ignoring illegal pipeline transition");
                return false;
            }
            tracing::info!(from = ?p.state, to = ?next, "Pipeline state");
            p.state = next;
            match next {
                PipelineState::Ready => p.percent = COMPLETE,
                PipelineState::Failed => p.percent = 0,
                _ => {}
            }
            applied = true;
            true
        });
        applied
    }

    /// Raise the percentage to a checkpoint; never lowers it.
    pub fn checkpoint(&self, percent: u8) {
        self.tx.send_if_modified(|p| {
            if p.state.is_terminal() || percent <= p.percent {
                return false;
            }
            p.percent = percent.min(COMPLETE);
            true
        });
    }

    /// Move to `Failed` and zero the progress.
    pub fn fail(&self) {
        if !self.transition(PipelineState::Failed) {
            self.tx.send_modify(|p| {
                p.state = PipelineState::Failed;
                p.percent = 0;
            });
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
