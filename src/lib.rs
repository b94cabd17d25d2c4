//! Audio extraction service
//!
//! Plays a video's audio track through a real-time capture session into
//! WebM/Opus chunks, then hands the capture back as-is or re-encodes it to
//! WAV or MP3.

pub mod capture;
pub mod config;
pub mod config_file;
pub mod diagnostics;
pub mod encode;
pub mod error;
pub mod ffmpeg;
pub mod http;
pub mod pipeline;
pub mod progress;
pub mod state;
pub mod transcode;

#[cfg(test)]
pub(crate) mod integration;

pub use capture::{SharedCaptureContext, SourceMedia, StopReason};
pub use config::{ExtractorConfig, ServerConfig};
pub use diagnostics::{Stage, Trace, Warning};
pub use encode::{EncodedOutput, OutputFormat};
pub use error::{ExtractError, FfmpegError, Result};
pub use ffmpeg::version_info as ffmpeg_version_info;
pub use ffmpeg::{init, install_log_filter};
pub use pipeline::{ExtractionReport, Extractor};
pub use progress::{PipelineState, Progress};
