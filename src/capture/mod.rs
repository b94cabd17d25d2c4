//! Real-time audio capture
//!
//! - `source`: loads the input and replays its audio against a clock
//! - `recorder`: encodes the replayed audio into timesliced WebM chunks
//! - `arbiter`: decides when the capture stops
//! - `context`: the shared, exclusively-leased capture context
//! - `session`: ties one capture run together

pub mod arbiter;
pub mod context;
pub mod recorder;
pub mod session;
pub mod source;

pub use arbiter::{await_completion, ArbiterTiming, PlaybackStatus, StopReason};
pub use context::{CaptureContext, CaptureLease, SharedCaptureContext};
pub use session::{CaptureSession, CaptureState};
pub use source::{LoadedSource, SourceMedia};
