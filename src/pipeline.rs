//! Extraction pipeline
//!
//! `load → capture (arbitrated) → [passthrough | decode → encode] → output`,
//! with the shared capture context leased for the whole run and progress
//! published at each checkpoint.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::capture::arbiter::{await_completion, ArbiterTiming, StopReason};
use crate::capture::context::{CaptureLease, SharedCaptureContext};
use crate::capture::session::CaptureSession;
use crate::capture::source::{self, SourceMedia};
use crate::config::ExtractorConfig;
use crate::diagnostics::{Stage, Staged, Trace, Warning};
use crate::encode::{encode_lossy, encode_wav, EncodedOutput, LossyEncoderFactory, Mp3EncoderFactory, OutputFormat};
use crate::error::{ExtractError, Result};
use crate::progress::{
    PipelineState, Progress, ProgressReporter, CAPTURE_STARTED, CONTEXT_READY, METADATA_LOADED,
};
use crate::transcode::pcm::decode_pcm;

/// Result of one successful extraction
#[derive(Debug)]
pub struct ExtractionReport {
    pub id: Uuid,
    pub output: EncodedOutput,
    pub stop_reason: StopReason,
    pub chunk_count: usize,
    /// Length of the assembled capture
    pub captured_bytes: usize,
    pub source_duration_secs: f64,
    pub trace: Trace,
}

/// Runs extractions against one shared capture context
pub struct Extractor {
    config: ExtractorConfig,
    context: SharedCaptureContext,
    progress: Arc<ProgressReporter>,
    lossy: Arc<dyn LossyEncoderFactory>,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            context: SharedCaptureContext::new(),
            progress: Arc::new(ProgressReporter::new()),
            lossy: Arc::new(Mp3EncoderFactory),
        })
    }

    /// Use an existing capture context instead of a private one.
    pub fn with_context(mut self, context: SharedCaptureContext) -> Self {
        self.context = context;
        self
    }

    /// Replace the MP3 encoder.
    pub fn with_lossy_encoder(mut self, factory: Arc<dyn LossyEncoderFactory>) -> Self {
        self.lossy = factory;
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn current_progress(&self) -> Progress {
        self.progress.current()
    }

    pub fn is_busy(&self) -> bool {
        self.context.is_busy()
    }

    pub async fn extract(&self, source: SourceMedia, format: OutputFormat) -> Result<ExtractionReport> {
        self.extract_with_cancel(source, format, CancellationToken::new())
            .await
    }

    /// Extract the audio of `source` as `format`; cancelling `cancel` stops
    /// the capture and fails with `ExtractError::Cancelled`.
    pub async fn extract_with_cancel(
        &self,
        source: SourceMedia,
        format: OutputFormat,
        cancel: CancellationToken,
    ) -> Result<ExtractionReport> {
        // A busy context belongs to another invocation, progress included
        let mut invocation = Invocation {
            lease: self.context.acquire()?,
            progress: Arc::clone(&self.progress),
            settled: false,
        };

        let id = Uuid::new_v4();
        let span = tracing::info_span!(
            "extract",
            %id,
            %format,
            name = source.display_name(),
            bytes = source.byte_len()
        );

        async move {
            self.progress.reset();
            let mut trace = Trace::new();

            let result = self
                .run(id, &mut invocation.lease, source, format, &cancel, &mut trace)
                .await;
            invocation.settled = true;
            match result {
                Ok(report) => {
                    tracing::info!(
                        stop_reason = %report.stop_reason,
                        output_bytes = report.output.byte_len(),
                        degraded = report.output.is_degraded(),
                        elapsed_ms = report.trace.elapsed().as_millis() as u64,
                        "Extraction finished"
                    );
                    Ok(report)
                }
                Err(e) => {
                    self.progress.fail();
                    trace.record(e.stage(), e.user_message());
                    tracing::error!(kind = e.kind(), "{}", e.user_message());
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        id: Uuid,
        lease: &mut CaptureLease,
        media: SourceMedia,
        format: OutputFormat,
        cancel: &CancellationToken,
        trace: &mut Trace,
    ) -> Result<ExtractionReport> {
        let progress = &self.progress;
        progress.transition(PipelineState::LoadingMetadata);

        let soft_limit = self.config.limits.soft_source_limit_bytes();
        if media.byte_len() > soft_limit {
            tracing::warn!(
                bytes = media.byte_len(),
                limit = soft_limit,
                "Source exceeds the recommended size"
            );
            trace.record(
                Stage::Setup,
                format!(
                    "source is {} bytes, above the recommended {} bytes",
                    media.byte_len(),
                    soft_limit
                ),
            );
        }

        let display_name = media.display_name().to_string();
        let loaded = tokio::task::spawn_blocking(move || source::load(media)).await??;
        check_cancelled(cancel)?;
        trace.record(
            Stage::LoadMetadata,
            format!(
                "duration {:.3}s, {} stream(s), audio {}",
                loaded.duration_secs,
                loaded.stream_count,
                loaded
                    .audio
                    .as_ref()
                    .map_or("none".to_string(), |a| format!(
                        "{} {} Hz x{}",
                        a.codec, a.sample_rate, a.channels
                    ))
            ),
        );
        progress.checkpoint(METADATA_LOADED);

        let context = lease.ensure_ready()?.clone();
        trace.record(
            Stage::Setup,
            format!("capture context ready ({})", context.opus_encoder),
        );
        progress.checkpoint(CONTEXT_READY);

        progress.transition(PipelineState::Capturing);
        let capture_config = &self.config.capture;
        let mut session = CaptureSession::new();
        session.start(&loaded, &context, capture_config).await?;
        trace.record(Stage::Capture, "capture started");
        progress.checkpoint(CAPTURE_STARTED);

        let status = session
            .status()
            .ok_or_else(|| ExtractError::Capture("capture has no playback status".into()))?;
        let reason = await_completion(
            status.as_ref(),
            ArbiterTiming::new(capture_config, loaded.duration_secs),
            cancel,
        )
        .await;
        if reason == StopReason::Cancelled {
            session.abort().await;
            return Err(ExtractError::Cancelled);
        }

        let assembled = session.stop(reason).await?;
        trace.record(
            Stage::Capture,
            format!(
                "stopped by {}, {} chunk(s), {} bytes",
                reason,
                session.chunk_count(),
                assembled.len()
            ),
        );

        let output = if format.is_passthrough() {
            EncodedOutput::new(format, assembled.clone(), &display_name)
        } else {
            progress.transition(PipelineState::Decoding);
            let bytes = assembled.clone();
            let sample_rate = loaded
                .audio
                .as_ref()
                .map(|a| a.sample_rate)
                .filter(|&rate| rate > 0)
                .unwrap_or(capture_config.sample_rate);
            let decoded =
                tokio::task::spawn_blocking(move || decode_pcm(&bytes, sample_rate)).await??;
            trace.record(
                Stage::Decode,
                format!(
                    "{} frames at {} Hz x{}",
                    decoded.frame_count(),
                    decoded.sample_rate(),
                    decoded.channel_count()
                ),
            );
            check_cancelled(cancel)?;

            progress.transition(PipelineState::Encoding);
            let factory = Arc::clone(&self.lossy);
            let encode_config = self.config.encode.clone();
            let encoded = tokio::task::spawn_blocking(move || match format {
                OutputFormat::Wav => encode_wav(&decoded).map(Staged::Complete),
                _ => encode_lossy(&decoded, factory.as_ref(), &encode_config),
            })
            .await?;

            self.finish_encode(format, encoded, assembled.clone(), &display_name, trace)?
        };

        progress.transition(PipelineState::Ready);

        Ok(ExtractionReport {
            id,
            output,
            stop_reason: reason,
            chunk_count: session.chunk_count(),
            captured_bytes: assembled.len(),
            source_duration_secs: loaded.duration_secs,
            trace: std::mem::take(trace),
        })
    }

    /// Turn the encoder's outcome into the output, falling back to the
    /// captured container when the encoder fails.
    fn finish_encode(
        &self,
        format: OutputFormat,
        encoded: Result<Staged<Bytes>>,
        assembled: Bytes,
        display_name: &str,
        trace: &mut Trace,
    ) -> Result<EncodedOutput> {
        match encoded {
            Ok(staged) => {
                let (bytes, warning) = staged.into_parts();
                trace.record(Stage::Encode, format!("{} bytes of {}", bytes.len(), format));
                let output = EncodedOutput::new(format, bytes, display_name);
                Ok(match warning {
                    Some(warning) => {
                        trace.record(Stage::Encode, warning.to_string());
                        output.with_warning(warning)
                    }
                    None => output,
                })
            }
            Err(ExtractError::Encode(reason)) => {
                tracing::warn!(%format, "Encoder failed, returning captured webm: {}", reason);
                let warning = Warning::EncoderFallback {
                    requested: format,
                    reason,
                };
                trace.record(Stage::Encode, warning.to_string());
                Ok(EncodedOutput::new(OutputFormat::Webm, assembled, display_name)
                    .with_warning(warning))
            }
            Err(e) => Err(e),
        }
    }
}

/// The lease of one `extract` call. Dropping it before the call settled
/// (the caller went away mid-run) marks progress failed before the context
/// is released.
struct Invocation {
    lease: CaptureLease,
    progress: Arc<ProgressReporter>,
    settled: bool,
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Extraction dropped before it finished");
            self.progress.fail();
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ExtractError::Cancelled);
    }
    Ok(())
}
