//! Capture session
//!
//! One real-time capture: playback and recorder workers, the chunks they
//! produce, and why the capture stopped. A session is never reused; dropping
//! it stops any workers still running.

use std::sync::mpsc::sync_channel;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::arbiter::{PlaybackStatus, StopReason};
use crate::capture::context::CaptureContext;
use crate::capture::recorder::{run_recorder, RecorderLink, RecorderParams};
use crate::capture::source::{
    playback_channels, run_playback, LoadedSource, PlaybackClock, PlaybackParams,
};
use crate::config::CaptureConfig;
use crate::error::{ExtractError, Result};

/// Blocks buffered between playback and the recorder
const BLOCK_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Loading,
    Capturing,
    Stopped,
    Failed,
}

pub struct CaptureSession {
    state: CaptureState,
    chunks: Vec<Bytes>,
    started_at: Option<DateTime<Utc>>,
    stop_reason: Option<StopReason>,
    stop: CancellationToken,
    clock: Option<Arc<PlaybackClock>>,
    chunk_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    playback: Option<JoinHandle<()>>,
    recorder: Option<JoinHandle<usize>>,
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            state: CaptureState::Idle,
            chunks: Vec::new(),
            started_at: None,
            stop_reason: None,
            stop: CancellationToken::new(),
            clock: None,
            chunk_rx: None,
            playback: None,
            recorder: None,
        }
    }

    /// Start recording `source`.
    ///
    /// Fails with `ExtractError::Capture` if the source has no audio track or
    /// the recorder cannot start.
    pub async fn start(
        &mut self,
        source: &LoadedSource,
        context: &CaptureContext,
        config: &CaptureConfig,
    ) -> Result<()> {
        if self.state != CaptureState::Idle {
            return Err(ExtractError::Capture(format!(
                "session cannot start from {:?}",
                self.state
            )));
        }
        self.state = CaptureState::Loading;

        let Some(track) = source.audio.as_ref() else {
            self.state = CaptureState::Failed;
            return Err(ExtractError::Capture("source has no audio track".into()));
        };

        let clock = Arc::new(PlaybackClock::new(source.duration_secs));
        let (block_tx, block_rx) = sync_channel(BLOCK_QUEUE_DEPTH);
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = oneshot::channel();

        let params = RecorderParams {
            encoder_name: context.opus_encoder.clone(),
            sample_rate: config.sample_rate,
            channels: playback_channels(track),
            bit_rate: config.opus_bitrate,
            timeslice: config.timeslice(),
        };
        let link = RecorderLink {
            blocks: block_rx,
            chunks: chunk_tx,
            started: started_tx,
            clock: Arc::clone(&clock),
            stop: self.stop.clone(),
        };
        self.recorder = Some(tokio::task::spawn_blocking(move || {
            run_recorder(params, link)
        }));
        self.chunk_rx = Some(chunk_rx);

        match started_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                self.state = CaptureState::Failed;
                return Err(ExtractError::Capture(format!(
                    "recorder failed to start: {}",
                    message
                )));
            }
            Err(_) => {
                self.state = CaptureState::Failed;
                return Err(ExtractError::Capture("recorder exited during startup".into()));
            }
        }

        let source = source.clone();
        let playback = PlaybackParams {
            sample_rate: config.sample_rate,
            playback_rate: config.playback_rate,
        };
        let worker_clock = Arc::clone(&clock);
        let stop = self.stop.clone();
        self.playback = Some(tokio::task::spawn_blocking(move || {
            run_playback(&source, &playback, block_tx, worker_clock, stop)
        }));

        self.clock = Some(clock);
        self.started_at = Some(Utc::now());
        self.state = CaptureState::Capturing;
        tracing::info!(
            channels = track.channels,
            source_rate = track.sample_rate,
            capture_rate = config.sample_rate,
            "Capture started"
        );
        Ok(())
    }

    /// What the arbiter watches; `None` before `start`.
    pub fn status(&self) -> Option<Arc<PlaybackClock>> {
        self.clock.clone()
    }

    /// Stop both workers and assemble the chunks in emission order.
    pub async fn stop(&mut self, reason: StopReason) -> Result<Bytes> {
        if self.state != CaptureState::Capturing {
            return Err(ExtractError::Capture(format!(
                "session cannot stop from {:?}",
                self.state
            )));
        }
        self.stop_reason = Some(reason);
        self.stop.cancel();

        if let Some(playback) = self.playback.take() {
            playback.await?;
        }
        let emitted = match self.recorder.take() {
            Some(recorder) => recorder.await?,
            None => 0,
        };
        if let Some(mut rx) = self.chunk_rx.take() {
            while let Ok(chunk) = rx.try_recv() {
                self.chunks.push(chunk);
            }
        }

        let failure = self.clock.as_ref().and_then(|c| c.failure());
        if reason == StopReason::Error || failure.is_some() {
            self.state = CaptureState::Failed;
            return Err(ExtractError::Capture(
                failure.unwrap_or_else(|| "capture failed".into()),
            ));
        }
        if self.chunks.is_empty() {
            self.state = CaptureState::Failed;
            return Err(ExtractError::Capture(
                "capture produced no audio chunks".into(),
            ));
        }

        let total = self.chunks.iter().map(Bytes::len).sum();
        let mut assembled = BytesMut::with_capacity(total);
        for chunk in &self.chunks {
            assembled.extend_from_slice(chunk);
        }
        self.state = CaptureState::Stopped;

        tracing::info!(
            %reason,
            chunks = self.chunks.len(),
            emitted,
            bytes = total,
            position = self.clock.as_ref().map_or(0.0, |c| c.position()),
            "Capture stopped"
        );
        Ok(assembled.freeze())
    }

    /// Stop the workers without assembling anything.
    pub async fn abort(&mut self) {
        self.stop.cancel();
        if let Some(playback) = self.playback.take() {
            let _ = playback.await;
        }
        if let Some(recorder) = self.recorder.take() {
            let _ = recorder.await;
        }
        self.state = CaptureState::Failed;
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::arbiter::{await_completion, ArbiterTiming};
    use crate::capture::context::SharedCaptureContext;
    use crate::capture::source::{load, SourceMedia};
    use crate::integration::fixtures;

    fn fast_config() -> CaptureConfig {
        CaptureConfig {
            playback_rate: 10.0,
            poll_interval_ms: 10,
            timeslice_ms: 30,
            ..CaptureConfig::default()
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let shared = SharedCaptureContext::new();
        let mut lease = shared.acquire().unwrap();
        let context = lease.ensure_ready().unwrap().clone();
        let source = load(SourceMedia::new(fixtures::video_with_audio(44100, 1.0), "a.mkv")).unwrap();
        let config = fast_config();

        let mut session = CaptureSession::new();
        assert_eq!(session.state(), CaptureState::Idle);
        session.start(&source, &context, &config).await.unwrap();
        assert_eq!(session.state(), CaptureState::Capturing);
        assert!(session.started_at().is_some());

        let status = session.status().unwrap();
        let reason = await_completion(
            status.as_ref(),
            ArbiterTiming::new(&config, source.duration_secs),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(reason, StopReason::EndOfStream);

        let bytes = session.stop(reason).await.unwrap();
        assert_eq!(session.state(), CaptureState::Stopped);
        assert_eq!(session.stop_reason(), Some(StopReason::EndOfStream));
        assert!(session.chunk_count() >= 2);
        assert_eq!(
            bytes.len(),
            session.chunks().iter().map(Bytes::len).sum::<usize>()
        );
        assert!(status.position() >= source.duration_secs - 0.1 - 1e-9);
    }

    #[tokio::test]
    async fn test_no_audio_track_is_capture_error() {
        let shared = SharedCaptureContext::new();
        let mut lease = shared.acquire().unwrap();
        let context = lease.ensure_ready().unwrap().clone();
        let source = load(SourceMedia::new(fixtures::video_only(0.5), "v.mkv")).unwrap();

        let mut session = CaptureSession::new();
        let err = session
            .start(&source, &context, &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Capture(_)));
        assert_eq!(session.state(), CaptureState::Failed);
    }

    #[tokio::test]
    async fn test_bad_encoder_is_capture_error() {
        let shared = SharedCaptureContext::new();
        let mut lease = shared.acquire().unwrap();
        let mut context = lease.ensure_ready().unwrap().clone();
        context.opus_encoder = "missing-opus".into();
        let source = load(SourceMedia::new(fixtures::video_with_audio(48000, 0.5), "a.mkv")).unwrap();

        let mut session = CaptureSession::new();
        let err = session
            .start(&source, &context, &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Capture(_)));
    }
}
