//! Capture completion arbiter
//!
//! Decides the single moment a capture stops. Three triggers race on the
//! async timeline and the first one to fire wins:
//!
//! - a poll of the playback position every `poll_interval`, which fires once
//!   the position is within `end_epsilon` of the duration or the source
//!   raised its ended signal,
//! - a deadline armed at capture start for `duration / playback_rate + margin`,
//! - the caller's cancellation token.
//!
//! Losing triggers are dropped with the `select!`, so nothing outlives the
//! decision.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::CaptureConfig;

/// Why a capture stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// Playback reached the end of the source
    EndOfStream,
    /// The fallback deadline fired first
    Deadline,
    /// Playback or recording failed
    Error,
    /// The caller cancelled the extraction
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::EndOfStream => "end-of-stream",
            StopReason::Deadline => "deadline",
            StopReason::Error => "error",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What the arbiter observes of a running capture
pub trait PlaybackStatus: Send + Sync {
    /// Current playback position in seconds of media time.
    fn position(&self) -> f64;
    /// Declared duration of the source in seconds.
    fn duration(&self) -> f64;
    /// One-shot end-of-stream signal.
    fn has_ended(&self) -> bool;
    /// Set once if playback or recording failed.
    fn failure(&self) -> Option<String>;
}

/// Timing of one arbitration
#[derive(Debug, Clone, Copy)]
pub struct ArbiterTiming {
    pub poll_interval: Duration,
    pub end_epsilon: f64,
    pub deadline: Duration,
}

impl ArbiterTiming {
    pub fn new(config: &CaptureConfig, duration_secs: f64) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            end_epsilon: config.end_epsilon_secs,
            deadline: config.fallback_deadline(duration_secs),
        }
    }
}

/// Wait until one trigger fires and report which.
pub async fn await_completion(
    status: &dyn PlaybackStatus,
    timing: ArbiterTiming,
    cancel: &CancellationToken,
) -> StopReason {
    let start = Instant::now();
    let deadline = sleep(timing.deadline);
    tokio::pin!(deadline);

    let mut poll = interval_at(start + timing.poll_interval, timing.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Cancelled,
            _ = &mut deadline => break StopReason::Deadline,
            _ = poll.tick() => {
                if status.failure().is_some() {
                    break StopReason::Error;
                }
                if status.has_ended()
                    || status.position() >= status.duration() - timing.end_epsilon
                {
                    break StopReason::EndOfStream;
                }
            }
        }
    };

    tracing::debug!(
        %reason,
        position = status.position(),
        duration = status.duration(),
        waited_ms = start.elapsed().as_millis() as u64,
        "Capture completion decided"
    );
    reason
}
