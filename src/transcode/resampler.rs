//! Audio resampler
//!
//! Converts decoded PCM frames to the sample format, rate and channel count a
//! consumer asks for. Capture uses it to feed the Opus encoder; the PCM
//! decoder uses it to normalise whatever the capture decodes to planar float.

use crate::error::FfmpegError;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::software::resampling;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::sample::Sample;

/// Planar 32-bit float, the working format of the whole pipeline
pub const PLANAR_F32: Sample = Sample::F32(ffmpeg::util::format::sample::Type::Planar);

/// Audio resampler wrapping FFmpeg's `SwrContext`
pub struct AudioResampler {
    context: resampling::Context,
    output_format: Sample,
    output_rate: u32,
    output_channels: u16,
}

impl AudioResampler {
    /// Create a resampler that converts frames shaped like `src_frame` into
    /// `format` at `rate` with `channels` (1 or 2) channels.
    pub fn new(
        src_frame: &ffmpeg::util::frame::Audio,
        format: Sample,
        rate: u32,
        channels: u16,
    ) -> Result<Self, FfmpegError> {
        let src_layout = if src_frame.channel_layout().bits() == 0 {
            // No channel layout set; fall back based on channel count
            match crate::ffmpeg::helpers::frame_channels(src_frame) {
                1 => ChannelLayout::MONO,
                _ => ChannelLayout::STEREO,
            }
        } else {
            src_frame.channel_layout()
        };
        let dst_layout = if channels == 1 {
            ChannelLayout::MONO
        } else {
            ChannelLayout::STEREO
        };

        let context = resampling::Context::get(
            src_frame.format(),
            src_layout,
            src_frame.rate(),
            format,
            dst_layout,
            rate,
        )
        .map_err(|e| {
            FfmpegError::ResamplerCreate(format!("Failed to create resampling context: {}", e))
        })?;

        Ok(Self {
            context,
            output_format: format,
            output_rate: rate,
            output_channels: channels,
        })
    }

    /// Convert one input PCM frame into zero or one resampled output frames.
    ///
    /// Returns an empty `Vec` when the resampler needs more input to produce
    /// output (can happen at stream start/end with certain sample rates).
    pub fn convert(
        &mut self,
        frame: &ffmpeg::util::frame::Audio,
    ) -> Result<Vec<ffmpeg::util::frame::Audio>, FfmpegError> {
        // Size the output for everything the SwrContext can emit, otherwise
        // upsampling leaves a growing backlog inside it.
        // SAFETY: the context pointer is valid for the lifetime of `self`.
        let capacity = unsafe {
            ffmpeg::ffi::swr_get_out_samples(
                self.context.as_mut_ptr(),
                frame.samples() as std::ffi::c_int,
            )
        };
        let mut out = if capacity > 0 {
            let layout = if self.output_channels == 1 {
                ChannelLayout::MONO
            } else {
                ChannelLayout::STEREO
            };
            ffmpeg::util::frame::Audio::new(self.output_format, capacity as usize, layout)
        } else {
            ffmpeg::util::frame::Audio::empty()
        };

        self.context
            .run(frame, &mut out)
            .map_err(|e| FfmpegError::Resample(format!("Resampling error: {}", e)))?;

        if out.samples() == 0 {
            return Ok(vec![]);
        }

        Ok(vec![out])
    }

    /// Flush any remaining samples from the internal resampler buffer.
    ///
    /// When source and output rates match the SwrContext has nothing
    /// buffered and `flush()` errors; that is treated as empty.
    pub fn flush(&mut self) -> Result<Vec<ffmpeg::util::frame::Audio>, FfmpegError> {
        let mut out = ffmpeg::util::frame::Audio::empty();
        if let Err(e) = self.context.flush(&mut out) {
            tracing::debug!("Resampler flush returned non-fatal error: {}", e);
            return Ok(vec![]);
        }

        if out.samples() == 0 {
            return Ok(vec![]);
        }

        Ok(vec![out])
    }

    pub fn output_format(&self) -> Sample {
        self.output_format
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn output_channels(&self) -> u16 {
        self.output_channels
    }
}

/// Channel count the pipeline keeps for a source with `source_channels`:
/// mono stays mono, everything else is downmixed to stereo.
pub fn working_channels(source_channels: u16) -> u16 {
    if source_channels == 1 {
        1
    } else {
        2
    }
}
