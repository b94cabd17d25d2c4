//! Lossy encoder wrapper
//!
//! Quantizes decoded audio to 16-bit PCM, feeds it to a frame encoder in
//! fixed-size frames (the last one zero-padded), and concatenates whatever
//! the encoder emits plus its flushed tail. The encoder itself sits behind
//! [`LossyEncoderFactory`] so the wrapper does not care which codec runs.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::config::EncodeConfig;
use crate::diagnostics::{Staged, Warning};
use crate::encode::quantize_i16;
use crate::error::{ExtractError, FfmpegError, Result};
use crate::ffmpeg::helpers::{audio_plane_data_mut, plane_as_i16_mut};
use crate::transcode::encoder::{find_mp3_encoder, mp3_params, AudioEncoder};
use crate::transcode::pcm::DecodedAudioBuffer;

/// One open encoder instance
pub trait FrameEncoder: Send {
    /// Encode one frame of per-channel samples; may return no bytes while
    /// the encoder buffers.
    fn encode_frame(&mut self, planes: &[&[i16]]) -> std::result::Result<Vec<u8>, FfmpegError>;

    /// Emit everything still buffered.
    fn flush(&mut self) -> std::result::Result<Vec<u8>, FfmpegError>;
}

/// Opens frame encoders
pub trait LossyEncoderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn open(
        &self,
        sample_rate: u32,
        channels: u16,
        bitrate_kbps: u32,
    ) -> std::result::Result<Box<dyn FrameEncoder>, FfmpegError>;
}

/// Encode `buffer` through an encoder from `factory`.
///
/// Fails with `ExtractError::Encode` if the encoder does not open or nothing
/// at all comes out. A silent prefix yields `Staged::Degraded` with
/// `Warning::SilentInput`.
pub fn encode_lossy(
    buffer: &DecodedAudioBuffer,
    factory: &dyn LossyEncoderFactory,
    config: &EncodeConfig,
) -> Result<Staged<Bytes>> {
    let frame_samples = config.mp3_frame_samples.max(1);

    let probe = config.silence_probe_samples.min(buffer.frame_count());
    let peak = buffer
        .channels()
        .iter()
        .flat_map(|c| c[..probe].iter())
        .fold(0f32, |m, s| m.max(s.abs()));
    let silent = peak == 0.0;
    if silent {
        tracing::warn!(probe, "Audio buffer appears to be silent");
    }

    let quantized: Vec<Vec<i16>> = buffer
        .channels()
        .iter()
        .map(|c| c.iter().copied().map(quantize_i16).collect())
        .collect();

    let mut encoder = factory
        .open(
            buffer.sample_rate(),
            buffer.channel_count() as u16,
            config.mp3_bitrate_kbps,
        )
        .map_err(|e| ExtractError::Encode(format!("{}: {}", factory.name(), e)))?;

    let mut out = BytesMut::new();
    let mut padded: Vec<Vec<i16>> = vec![vec![0; frame_samples]; quantized.len()];
    let frame_count = buffer.frame_count().div_ceil(frame_samples);
    let mut failed_frames = 0usize;

    for index in 0..frame_count {
        let start = index * frame_samples;
        let end = (start + frame_samples).min(buffer.frame_count());

        let planes: Vec<&[i16]> = if end - start == frame_samples {
            quantized.iter().map(|c| &c[start..end]).collect()
        } else {
            for (dst, src) in padded.iter_mut().zip(&quantized) {
                dst.fill(0);
                dst[..end - start].copy_from_slice(&src[start..end]);
            }
            padded.iter().map(Vec::as_slice).collect()
        };

        match encoder.encode_frame(&planes) {
            Ok(bytes) => out.extend_from_slice(&bytes),
            Err(e) => {
                failed_frames += 1;
                tracing::warn!(frame = index, "Skipping frame the encoder rejected: {}", e);
            }
        }
    }

    match encoder.flush() {
        Ok(bytes) => out.extend_from_slice(&bytes),
        Err(e) => tracing::warn!("Encoder flush failed: {}", e),
    }

    if out.is_empty() {
        return Err(ExtractError::Encode(format!(
            "{} produced no output ({} of {} frames rejected)",
            factory.name(),
            failed_frames,
            frame_count
        )));
    }

    tracing::debug!(
        encoder = factory.name(),
        frames = frame_count,
        failed_frames,
        bytes = out.len(),
        "Lossy encode finished"
    );

    let bytes = out.freeze();
    Ok(if silent {
        Staged::Degraded {
            value: bytes,
            warning: Warning::SilentInput,
        }
    } else {
        Staged::Complete(bytes)
    })
}

/// MP3 through FFmpeg's libmp3lame
#[derive(Debug, Default, Clone, Copy)]
pub struct Mp3EncoderFactory;

impl LossyEncoderFactory for Mp3EncoderFactory {
    fn name(&self) -> &str {
        "mp3"
    }

    fn open(
        &self,
        sample_rate: u32,
        channels: u16,
        bitrate_kbps: u32,
    ) -> std::result::Result<Box<dyn FrameEncoder>, FfmpegError> {
        let codec = find_mp3_encoder().ok_or_else(|| {
            FfmpegError::EncoderNotFound("MP3 encoder not found in this FFmpeg build".into())
        })?;
        let encoder = AudioEncoder::open(codec, &mp3_params(sample_rate, channels, bitrate_kbps))?;
        Ok(Box::new(FfmpegFrameEncoder {
            pending: vec![VecDeque::new(); channels as usize],
            encoder,
            pts: 0,
        }))
    }
}

/// Adapts caller-sized frames to the codec's own frame size.
struct FfmpegFrameEncoder {
    encoder: AudioEncoder,
    pending: Vec<VecDeque<i16>>,
    pts: i64,
}

impl FfmpegFrameEncoder {
    fn pending_samples(&self) -> usize {
        self.pending.first().map_or(0, VecDeque::len)
    }

    fn send(&mut self, samples: usize) -> std::result::Result<Vec<u8>, FfmpegError> {
        let mut frame = self.encoder.alloc_frame(samples);
        for (ch, queue) in self.pending.iter_mut().enumerate() {
            let plane = plane_as_i16_mut(audio_plane_data_mut(&mut frame, ch), samples)
                .ok_or_else(|| FfmpegError::EncodeFrame("misaligned frame plane".into()))?;
            for (dst, src) in plane.iter_mut().zip(queue.drain(..samples)) {
                *dst = src;
            }
        }
        frame.set_pts(Some(self.pts));
        self.pts += samples as i64;
        self.encoder.send_frame(&frame)?;
        Ok(packet_bytes(self.encoder.receive_packets()?))
    }
}

impl FrameEncoder for FfmpegFrameEncoder {
    fn encode_frame(&mut self, planes: &[&[i16]]) -> std::result::Result<Vec<u8>, FfmpegError> {
        if planes.len() != self.pending.len() {
            return Err(FfmpegError::EncodeFrame(format!(
                "expected {} channels, got {}",
                self.pending.len(),
                planes.len()
            )));
        }
        for (queue, plane) in self.pending.iter_mut().zip(planes) {
            queue.extend(plane.iter().copied());
        }

        let frame_size = self.encoder.frame_size();
        let mut out = Vec::new();
        while self.pending_samples() >= frame_size {
            out.extend(self.send(frame_size)?);
        }
        Ok(out)
    }

    fn flush(&mut self) -> std::result::Result<Vec<u8>, FfmpegError> {
        let mut out = Vec::new();
        let remainder = self.pending_samples();
        if remainder > 0 {
            out.extend(self.send(remainder)?);
        }
        out.extend(packet_bytes(self.encoder.flush()?));
        Ok(out)
    }
}

fn packet_bytes(packets: Vec<ffmpeg_next::codec::packet::Packet>) -> Vec<u8> {
    packets
        .iter()
        .filter_map(|p| p.data())
        .flat_map(|d| d.iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records frame sizes; emits `len` bytes per frame unless told to fail.
    #[derive(Clone, Default)]
    struct Recording {
        frames: Arc<Mutex<Vec<Vec<Vec<i16>>>>>,
        fail_every_frame: bool,
        fail_frame: Option<usize>,
        fail_open: bool,
    }

    struct RecordingEncoder {
        log: Recording,
    }

    impl FrameEncoder for RecordingEncoder {
        fn encode_frame(
            &mut self,
            planes: &[&[i16]],
        ) -> std::result::Result<Vec<u8>, FfmpegError> {
            let mut frames = self.log.frames.lock();
            let index = frames.len();
            frames.push(planes.iter().map(|p| p.to_vec()).collect());
            if self.log.fail_every_frame || self.log.fail_frame == Some(index) {
                return Err(FfmpegError::EncodeFrame("rejected".into()));
            }
            Ok(vec![index as u8; 4])
        }

        fn flush(&mut self) -> std::result::Result<Vec<u8>, FfmpegError> {
            if self.log.fail_every_frame {
                return Ok(Vec::new());
            }
            Ok(b"END".to_vec())
        }
    }

    impl LossyEncoderFactory for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn open(
            &self,
            _sample_rate: u32,
            _channels: u16,
            _bitrate_kbps: u32,
        ) -> std::result::Result<Box<dyn FrameEncoder>, FfmpegError> {
            if self.fail_open {
                return Err(FfmpegError::EncoderCreate("bad channel count".into()));
            }
            Ok(Box::new(RecordingEncoder { log: self.clone() }))
        }
    }

    fn sine(frames: usize, channels: usize) -> DecodedAudioBuffer {
        let plane: Vec<f32> = (0..frames).map(|i| (i as f32 * 0.06).sin() * 0.8).collect();
        DecodedAudioBuffer::new(44100, vec![plane; channels]).unwrap()
    }

    #[test]
    fn test_frames_are_chunked_and_padded() {
        let factory = Recording::default();
        let buffer = sine(1152 * 2 + 100, 2);
        let out = encode_lossy(&buffer, &factory, &EncodeConfig::default()).unwrap();

        let frames = factory.frames.lock();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 2 && f[0].len() == 1152));
        // Last frame carries 100 real samples then zeros
        assert_eq!(frames[2][0][99], quantize_i16(buffer.channel(0)[2403]));
        assert!(frames[2][0][100..].iter().all(|&s| s == 0));

        let (bytes, warning) = out.into_parts();
        assert!(warning.is_none());
        assert_eq!(&bytes[..], b"\0\0\0\0\x01\x01\x01\x01\x02\x02\x02\x02END");
    }

    #[test]
    fn test_rejected_frame_is_skipped() {
        let factory = Recording {
            fail_frame: Some(1),
            ..Recording::default()
        };
        let out = encode_lossy(&sine(1152 * 3, 1), &factory, &EncodeConfig::default()).unwrap();
        let (bytes, _) = out.into_parts();
        assert_eq!(&bytes[..], b"\0\0\0\0\x02\x02\x02\x02END");
    }

    #[test]
    fn test_no_output_is_encode_error() {
        let factory = Recording {
            fail_every_frame: true,
            ..Recording::default()
        };
        let err = encode_lossy(&sine(5000, 2), &factory, &EncodeConfig::default()).unwrap_err();
        assert!(matches!(err, ExtractError::Encode(_)));
    }

    #[test]
    fn test_open_failure_is_encode_error() {
        let factory = Recording {
            fail_open: true,
            ..Recording::default()
        };
        let err = encode_lossy(&sine(5000, 2), &factory, &EncodeConfig::default()).unwrap_err();
        assert!(matches!(err, ExtractError::Encode(_)));
    }

    #[test]
    fn test_silence_is_degraded_not_error() {
        let buffer = DecodedAudioBuffer::new(44100, vec![vec![0.0; 3000]; 2]).unwrap();
        let out = encode_lossy(&buffer, &Recording::default(), &EncodeConfig::default()).unwrap();
        assert!(out.is_degraded());
        let (bytes, warning) = out.into_parts();
        assert!(!bytes.is_empty());
        assert_eq!(warning, Some(Warning::SilentInput));
    }

    #[test]
    fn test_mp3_of_stereo_sine() {
        crate::ffmpeg::init().unwrap();
        if find_mp3_encoder().is_none() {
            return;
        }
        let buffer = sine(44100, 2);
        let config = EncodeConfig::default();
        let out = encode_lossy(&buffer, &Mp3EncoderFactory, &config).unwrap();
        assert!(!out.is_degraded());
        let (bytes, _) = out.into_parts();
        // MPEG audio frame sync
        assert!(bytes.len() > 1000);
        assert_eq!(bytes[0], 0xff);
        assert_eq!(bytes[1] & 0xe0, 0xe0);
    }
}
