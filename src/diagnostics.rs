//! Stage-tagged diagnostics
//!
//! Every extraction carries a [`Trace`] that records what each pipeline stage
//! did, independent of control flow. Entries are mirrored to `tracing` as they
//! are recorded. Stage results that succeed with a caveat are expressed as
//! [`Staged::Degraded`] carrying a [`Warning`].

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::encode::OutputFormat;

/// Pipeline stage a trace entry or error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    LoadMetadata,
    Capture,
    Decode,
    Encode,
    Pipeline,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::LoadMetadata => "metadata load",
            Stage::Capture => "capture",
            Stage::Decode => "decode",
            Stage::Encode => "encode",
            Stage::Pipeline => "pipeline",
        };
        f.write_str(name)
    }
}

/// A non-fatal condition attached to a successful result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// The probed prefix of the decoded audio had zero peak amplitude
    SilentInput,
    /// The requested encoder failed; the captured container was returned instead
    EncoderFallback {
        requested: OutputFormat,
        reason: String,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::SilentInput => f.write_str("audio appears to be silent"),
            Warning::EncoderFallback { requested, reason } => write!(
                f,
                "{} encoding failed ({}), returned webm capture instead",
                requested, reason
            ),
        }
    }
}

/// Outcome of a stage that did not fail outright
#[derive(Debug)]
pub enum Staged<T> {
    Complete(T),
    Degraded { value: T, warning: Warning },
}

impl<T> Staged<T> {
    /// Split into the value and the optional warning.
    pub fn into_parts(self) -> (T, Option<Warning>) {
        match self {
            Staged::Complete(value) => (value, None),
            Staged::Degraded { value, warning } => (value, Some(warning)),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Staged::Degraded { .. })
    }

    pub fn value(&self) -> &T {
        match self {
            Staged::Complete(value) => value,
            Staged::Degraded { value, .. } => value,
        }
    }
}

/// One recorded diagnostic
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub stage: Stage,
    /// Time since the extraction started
    pub elapsed: Duration,
    pub message: String,
}

/// Ordered diagnostics of one extraction
#[derive(Debug, Clone)]
pub struct Trace {
    started: Instant,
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    /// Record an entry and mirror it to the log.
    pub fn record(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%stage, "{}", message);
        self.entries.push(TraceEntry {
            stage,
            elapsed: self.started.elapsed(),
            message,
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Entries recorded for one stage, in order.
    pub fn for_stage(&self, stage: Stage) -> impl Iterator<Item = &TraceEntry> + '_ {
        self.entries.iter().filter(move |e| e.stage == stage)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}
