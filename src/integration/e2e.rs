//! End-to-end extraction tests
//!
//! Every test runs the whole pipeline on a synthesized source, replayed
//! faster than real time so the suite stays quick.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::capture::{SourceMedia, StopReason};
use crate::config::ExtractorConfig;
use crate::diagnostics::{Stage, Warning};
use crate::encode::{FrameEncoder, LossyEncoderFactory, OutputFormat};
use crate::error::{ExtractError, FfmpegError};
use crate::integration::fixtures::{self, AudioSpec};
use crate::pipeline::Extractor;
use crate::progress::{PipelineState, Progress};
use crate::transcode::encoder::find_mp3_encoder;

fn fast_config() -> ExtractorConfig {
    let mut config = ExtractorConfig::default();
    config.capture.playback_rate = 10.0;
    config.capture.poll_interval_ms = 10;
    config.capture.timeslice_ms = 30;
    config
}

fn extractor() -> Extractor {
    Extractor::new(fast_config()).unwrap()
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Encoder that never opens
struct BrokenEncoder;

impl LossyEncoderFactory for BrokenEncoder {
    fn name(&self) -> &str {
        "broken"
    }

    fn open(&self, _: u32, _: u16, _: u32) -> Result<Box<dyn FrameEncoder>, FfmpegError> {
        Err(FfmpegError::EncoderNotFound("broken".into()))
    }
}

#[tokio::test]
async fn test_wav_extraction_from_stereo_video() {
    let extractor = extractor();
    let source = SourceMedia::new(fixtures::video_with_audio(44100, 1.0), "holiday.mp4");

    let report = extractor.extract(source, OutputFormat::Wav).await.unwrap();
    let output = &report.output;

    assert_eq!(output.format, OutputFormat::Wav);
    assert_eq!(output.mime_type, "audio/wav");
    assert_eq!(output.suggested_filename, "holiday_audio.wav");
    assert!(!output.is_degraded());
    assert_eq!(report.stop_reason, StopReason::EndOfStream);

    let bytes = &output.bytes;
    assert_eq!(&bytes[0..4], b"RIFF");
    assert_eq!(&bytes[8..12], b"WAVE");
    assert_eq!(le_u16(bytes, 22), 2);
    assert_eq!(le_u32(bytes, 24), 44100);
    assert_eq!(le_u16(bytes, 34), 16);

    let data_len = le_u32(bytes, 40) as usize;
    assert_eq!(bytes.len(), 44 + data_len);
    assert_eq!(le_u32(bytes, 4) as usize, 36 + data_len);

    let frames = data_len / 4;
    let expected = 44100.0 * report.source_duration_secs;
    assert!(
        frames as f64 >= expected * 0.8 && frames as f64 <= expected * 1.1,
        "{} frames for {:.3}s",
        frames,
        report.source_duration_secs
    );

    // Sine content survived the capture
    let peak = bytes[44..]
        .chunks_exact(2)
        .map(|s| i16::from_le_bytes([s[0], s[1]]).unsigned_abs())
        .max()
        .unwrap();
    assert!(peak > 1000, "peak {}", peak);
}

#[tokio::test]
async fn test_wav_of_five_second_44k_source_keeps_source_rate() {
    let extractor = extractor();
    let source = SourceMedia::new(fixtures::video_with_audio(44100, 5.0), "scenario.mp4");

    let report = extractor.extract(source, OutputFormat::Wav).await.unwrap();
    let bytes = &report.output.bytes;

    assert!((report.source_duration_secs - 5.0).abs() < 0.05);
    assert_eq!(le_u32(bytes, 24), 44100);
    assert_eq!(le_u32(bytes, 28), 44100 * 4);
    assert_eq!(le_u16(bytes, 32), 4);

    let frames = le_u32(bytes, 40) as usize / 4;
    assert_eq!(bytes.len(), 44 + frames * 4);
    // 882044 bytes for the full 220500 frames, less what the end epsilon cuts
    let full = 44100 * 5;
    assert!(
        frames as f64 >= full as f64 * 0.9 && frames as f64 <= full as f64 * 1.02,
        "{} frames, expected about {}",
        frames,
        full
    );
}

#[tokio::test]
async fn test_mp3_extraction() {
    let extractor = extractor();
    let source = SourceMedia::new(fixtures::video_with_audio(48000, 1.0), "talk.final.mkv");

    let report = extractor.extract(source, OutputFormat::Mp3).await.unwrap();
    let output = &report.output;
    assert!(!output.bytes.is_empty());

    if find_mp3_encoder().is_some() {
        assert_eq!(output.format, OutputFormat::Mp3);
        assert_eq!(output.mime_type, "audio/mpeg");
        assert_eq!(output.suggested_filename, "talk.final_audio.mp3");
        // MPEG audio frame sync
        assert_eq!(output.bytes[0], 0xFF);
        assert_eq!(output.bytes[1] & 0xE0, 0xE0);
    } else {
        assert_eq!(output.format, OutputFormat::Webm);
        assert!(output.is_degraded());
    }
}

#[tokio::test]
async fn test_webm_passthrough_returns_capture() {
    let extractor = extractor();
    let source = SourceMedia::new(fixtures::video_with_audio(48000, 0.8), "clip.mov");

    let report = extractor.extract(source, OutputFormat::Webm).await.unwrap();
    let output = &report.output;

    assert_eq!(output.format, OutputFormat::Webm);
    assert_eq!(output.mime_type, "audio/webm");
    assert_eq!(output.suggested_filename, "clip_audio.webm");
    assert_eq!(output.byte_len(), report.captured_bytes);
    assert!(report.chunk_count >= 1);
    // EBML magic
    assert_eq!(&output.bytes[0..4], &[0x1A, 0x45, 0xDF, 0xA3]);

    assert!(report.trace.for_stage(Stage::Capture).count() >= 2);
    assert_eq!(report.trace.for_stage(Stage::Decode).count(), 0);
}

#[tokio::test]
async fn test_video_without_audio_fails_capture() {
    let extractor = extractor();
    let source = SourceMedia::new(fixtures::video_only(0.5), "silent-film.mp4");

    let err = extractor
        .extract(source, OutputFormat::Mp3)
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::Capture(_)), "{:?}", err);
    assert!(err.user_message().starts_with("capture failed"));
    assert_eq!(
        extractor.current_progress(),
        Progress {
            state: PipelineState::Failed,
            percent: 0
        }
    );
    assert!(!extractor.is_busy());
}

#[tokio::test]
async fn test_garbage_input_fails_media_load() {
    let extractor = extractor();
    let source = SourceMedia::new(vec![0x42u8; 4096], "not-a-video.mp4");

    let err = extractor
        .extract(source, OutputFormat::Wav)
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::MediaLoad(_)), "{:?}", err);
    assert_eq!(extractor.current_progress().state, PipelineState::Failed);
}

#[tokio::test]
async fn test_encoder_failure_falls_back_to_webm() {
    let extractor = extractor().with_lossy_encoder(Arc::new(BrokenEncoder));
    let source = SourceMedia::new(fixtures::video_with_audio(48000, 0.8), "lecture.mp4");

    let report = extractor.extract(source, OutputFormat::Mp3).await.unwrap();
    let output = &report.output;

    assert_eq!(output.format, OutputFormat::Webm);
    assert_eq!(output.mime_type, "audio/webm");
    assert_eq!(output.suggested_filename, "lecture_audio.webm");
    assert_eq!(output.byte_len(), report.captured_bytes);
    assert!(output.is_degraded());
    assert!(matches!(
        &output.warnings[0],
        Warning::EncoderFallback {
            requested: OutputFormat::Mp3,
            ..
        }
    ));
    assert_eq!(extractor.current_progress().state, PipelineState::Ready);
}

#[tokio::test]
async fn test_mono_source_stays_mono() {
    let extractor = extractor();
    let spec = AudioSpec {
        channels: 1,
        ..AudioSpec::stereo_sine(22050)
    };
    let bytes = fixtures::matroska_source(Some(spec), false, 0.6);

    let report = extractor
        .extract(SourceMedia::new(bytes, "mono.mka"), OutputFormat::Wav)
        .await
        .unwrap();
    assert_eq!(le_u16(&report.output.bytes, 22), 1);
    assert_eq!(le_u32(&report.output.bytes, 24), 22050);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_completes() {
    let extractor = extractor();
    let mut rx = extractor.progress();
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let progress = *rx.borrow_and_update();
            seen.push(progress);
            if progress.state.is_terminal() {
                break;
            }
        }
        seen
    });

    let source = SourceMedia::new(fixtures::video_with_audio(48000, 0.6), "p.mkv");
    extractor.extract(source, OutputFormat::Wav).await.unwrap();

    let seen = watcher.await.unwrap();
    assert!(seen.windows(2).all(|w| w[0].percent <= w[1].percent), "{:?}", seen);
    assert_eq!(
        seen.last().copied(),
        Some(Progress {
            state: PipelineState::Ready,
            percent: 100
        })
    );
    assert_eq!(extractor.current_progress().percent, 100);
}

#[tokio::test]
async fn test_concurrent_extraction_is_busy() {
    let extractor = extractor();
    let first = SourceMedia::new(fixtures::video_with_audio(48000, 0.6), "a.mkv");
    let second = SourceMedia::new(fixtures::video_with_audio(48000, 0.6), "b.mkv");

    let (a, b) = tokio::join!(
        extractor.extract(first, OutputFormat::Webm),
        extractor.extract(second, OutputFormat::Webm)
    );
    assert!(a.is_ok());
    assert!(matches!(b, Err(ExtractError::Busy)));
    // The rejected call leaves the winner's progress alone
    assert_eq!(extractor.current_progress().state, PipelineState::Ready);

    // The context is free again and reused
    let third = SourceMedia::new(fixtures::video_with_audio(48000, 0.6), "c.mkv");
    assert!(extractor.extract(third, OutputFormat::Webm).await.is_ok());
}

#[tokio::test]
async fn test_cancellation_stops_extraction() {
    let mut config = fast_config();
    config.capture.playback_rate = 1.0;
    let extractor = Extractor::new(config).unwrap();
    let source = SourceMedia::new(fixtures::video_with_audio(48000, 5.0), "long.mkv");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = extractor
        .extract_with_cancel(source, OutputFormat::Wav, cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::Cancelled), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(
        extractor.current_progress(),
        Progress {
            state: PipelineState::Failed,
            percent: 0
        }
    );
    assert!(!extractor.is_busy());
}

#[tokio::test]
async fn test_dropped_extraction_marks_progress_failed() {
    let mut config = fast_config();
    config.capture.playback_rate = 1.0;
    let extractor = Extractor::new(config).unwrap();
    let source = SourceMedia::new(fixtures::video_with_audio(48000, 5.0), "abandoned.mkv");

    let outcome = tokio::time::timeout(
        Duration::from_millis(300),
        extractor.extract(source, OutputFormat::Wav),
    )
    .await;
    assert!(outcome.is_err(), "extraction finished before the timeout");

    assert_eq!(
        extractor.current_progress(),
        Progress {
            state: PipelineState::Failed,
            percent: 0
        }
    );
    assert!(!extractor.is_busy());

    // A later call starts from scratch on the released context
    let next = SourceMedia::new(fixtures::video_with_audio(48000, 0.3), "next.mkv");
    let report = extractor.extract(next, OutputFormat::Webm).await.unwrap();
    assert_eq!(report.output.format, OutputFormat::Webm);
    assert_eq!(extractor.current_progress().state, PipelineState::Ready);
}
