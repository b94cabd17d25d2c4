//! Shared capture context
//!
//! The context is created lazily on first use and reused for the lifetime of
//! the process. It is not reentrant, so an invocation must hold it through a
//! [`CaptureLease`] for as long as it captures, decodes and encodes. A second
//! invocation that finds the lease taken is rejected with `Busy` instead of
//! queueing behind a capture that runs in real time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{ExtractError, Result};
use crate::transcode::encoder::{find_mp3_encoder, find_opus_encoder};

/// Resolved codec capabilities of this FFmpeg build
#[derive(Debug, Clone)]
pub struct CaptureContext {
    /// Name of the Opus encoder the recorder opens
    pub opus_encoder: String,
    /// Name of the MP3 encoder, if the build has one
    pub mp3_encoder: Option<String>,
    pub ffmpeg_version: String,
    pub created_at: DateTime<Utc>,
}

impl CaptureContext {
    fn create() -> Result<Self> {
        crate::ffmpeg::init().map_err(|e| ExtractError::Capture(e.to_string()))?;

        let opus_encoder = find_opus_encoder()
            .map(|c| c.name().to_string())
            .ok_or_else(|| {
                ExtractError::Capture("this FFmpeg build has no Opus encoder".into())
            })?;
        let mp3_encoder = find_mp3_encoder().map(|c| c.name().to_string());

        let context = Self {
            opus_encoder,
            mp3_encoder,
            ffmpeg_version: crate::ffmpeg::version_info(),
            created_at: Utc::now(),
        };
        tracing::info!(
            opus = %context.opus_encoder,
            mp3 = ?context.mp3_encoder,
            version = %context.ffmpeg_version,
            "Capture context created"
        );
        Ok(context)
    }
}

/// Injectable handle to the process-wide capture context
#[derive(Clone, Default)]
pub struct SharedCaptureContext {
    inner: Arc<Mutex<Option<CaptureContext>>>,
}

impl SharedCaptureContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive use of the context, or fail with `Busy`.
    pub fn acquire(&self) -> Result<CaptureLease> {
        let guard = Arc::clone(&self.inner)
            .try_lock_owned()
            .map_err(|_| ExtractError::Busy)?;
        Ok(CaptureLease { guard })
    }

    /// Whether an invocation currently holds the context.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Exclusive use of the capture context; released on drop
pub struct CaptureLease {
    guard: OwnedMutexGuard<Option<CaptureContext>>,
}

impl CaptureLease {
    /// The context, created on first use.
    pub fn ensure_ready(&mut self) -> Result<&CaptureContext> {
        if self.guard.is_none() {
            *self.guard = Some(CaptureContext::create()?);
        }
        self.guard
            .as_ref()
            .ok_or_else(|| ExtractError::Capture("capture context unavailable".into()))
    }

    /// Whether the context already existed when this lease was taken.
    pub fn is_initialized(&self) -> bool {
        self.guard.is_some()
    }
}
