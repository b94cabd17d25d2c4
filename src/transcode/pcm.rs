//! PCM decoder
//!
//! Turns the assembled capture container back into per-channel float samples.
//! The capture always runs at an Opus rate, so the decoder is given the rate
//! of the source track and converts to it once; nothing downstream resamples
//! or remixes.

use bytes::Bytes;
use ffmpeg_next as ffmpeg;

use crate::error::{ExtractError, Result};
use crate::ffmpeg::helpers::fltp_frame_to_planes;
use crate::ffmpeg::io::MemoryInput;
use crate::transcode::decoder::AudioDecoder;
use crate::transcode::resampler::{working_channels, AudioResampler, PLANAR_F32};

/// Decoded multichannel audio
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl DecodedAudioBuffer {
    /// Build a buffer from one sample vector per channel.
    ///
    /// Requires a non-zero rate and one or two channels of equal length.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if sample_rate == 0 {
            return Err(ExtractError::Decode("sample rate is zero".into()));
        }
        if !(1..=2).contains(&channels.len()) {
            return Err(ExtractError::Decode(format!(
                "expected 1 or 2 channels, got {}",
                channels.len()
            )));
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(ExtractError::Decode("channel lengths differ".into()));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn frame_count(&self) -> usize {
        self.channels[0].len()
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn duration_secs(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }
}

/// Decode the first audio stream of `bytes` into float samples at
/// `sample_rate` Hz.
///
/// Fails with `ExtractError::Decode` when the buffer is empty, is not a
/// recognised container, has no audio stream, or yields no samples.
pub fn decode_pcm(bytes: &Bytes, sample_rate: u32) -> Result<DecodedAudioBuffer> {
    if bytes.is_empty() {
        return Err(ExtractError::Decode("no captured audio to decode".into()));
    }
    if sample_rate == 0 {
        return Err(ExtractError::Decode("sample rate is zero".into()));
    }

    let mut input =
        MemoryInput::open(bytes.clone()).map_err(|e| ExtractError::Decode(e.to_string()))?;

    let (stream_index, mut decoder) = {
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Audio)
            .ok_or_else(|| ExtractError::Decode("container has no audio stream".into()))?;
        let decoder =
            AudioDecoder::open(&stream).map_err(|e| ExtractError::Decode(e.to_string()))?;
        (stream.index(), decoder)
    };

    let mut sink = PlaneSink::new(sample_rate);

    for (stream, packet) in input.packets() {
        if stream.index() != stream_index {
            continue;
        }
        decoder
            .send_packet(&packet)
            .map_err(|e| ExtractError::Decode(e.to_string()))?;
        while let Some(frame) = decoder
            .receive_frame()
            .map_err(|e| ExtractError::Decode(e.to_string()))?
        {
            sink.push(&frame)?;
        }
    }

    for frame in decoder
        .drain()
        .map_err(|e| ExtractError::Decode(e.to_string()))?
    {
        sink.push(&frame)?;
    }

    let buffer = sink.finish()?;
    tracing::debug!(
        sample_rate = buffer.sample_rate(),
        channels = buffer.channel_count(),
        frames = buffer.frame_count(),
        "Decoded capture"
    );
    Ok(buffer)
}

/// Collects resampled planar frames.
struct PlaneSink {
    sample_rate: u32,
    resampler: Option<AudioResampler>,
    planes: Vec<Vec<f32>>,
}

impl PlaneSink {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            resampler: None,
            planes: Vec::new(),
        }
    }

    fn push(&mut self, frame: &ffmpeg::util::frame::Audio) -> Result<()> {
        if self.resampler.is_none() {
            let channels = working_channels(crate::ffmpeg::helpers::frame_channels(frame) as u16);
            let resampler = AudioResampler::new(frame, PLANAR_F32, self.sample_rate, channels)
                .map_err(|e| ExtractError::Decode(e.to_string()))?;
            self.planes = vec![Vec::new(); channels as usize];
            self.resampler = Some(resampler);
        }
        if let Some(resampler) = self.resampler.as_mut() {
            let frames = resampler
                .convert(frame)
                .map_err(|e| ExtractError::Decode(e.to_string()))?;
            append(&mut self.planes, &frames)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<DecodedAudioBuffer> {
        let Some(mut resampler) = self.resampler.take() else {
            return Err(ExtractError::Decode("no audio frames decoded".into()));
        };
        let tail = resampler
            .flush()
            .map_err(|e| ExtractError::Decode(e.to_string()))?;
        append(&mut self.planes, &tail)?;

        if self.planes.first().map_or(true, Vec::is_empty) {
            return Err(ExtractError::Decode("no audio samples decoded".into()));
        }
        DecodedAudioBuffer::new(resampler.output_rate(), self.planes)
    }
}

fn append(planes: &mut [Vec<f32>], frames: &[ffmpeg::util::frame::Audio]) -> Result<()> {
    for frame in frames {
        let data = fltp_frame_to_planes(frame)
            .ok_or_else(|| ExtractError::Decode("misaligned sample plane".into()))?;
        for (dst, src) in planes.iter_mut().zip(data) {
            dst.extend_from_slice(&src);
        }
    }
    Ok(())
}
