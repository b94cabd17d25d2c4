//! Audio encoder
//!
//! Wraps an FFmpeg `AVCodecContext` to encode PCM frames into compressed
//! packets. The same wrapper drives the Opus encoder behind the live recorder
//! and the MP3 encoder behind lossy output.

use crate::error::FfmpegError;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::sample::{Sample, Type};

/// Frame size used when a codec accepts variable-sized frames
pub const DEFAULT_FRAME_SIZE: usize = 1024;

/// Parameters for [`AudioEncoder::open`]
#[derive(Debug, Clone)]
pub struct EncoderParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bitrate in bps
    pub bit_rate: u64,
    /// Sample formats in order of preference; the first one the codec
    /// supports is used
    pub formats: Vec<Sample>,
    /// Private codec options passed to `avcodec_open2`
    pub options: Vec<(String, String)>,
}

/// Audio encoder backed by a real FFmpeg codec context
pub struct AudioEncoder {
    encoder: ffmpeg::encoder::Audio,
    name: String,
    format: Sample,
    frame_size: usize,
    sample_rate: u32,
    channels: u16,
    pts: i64,
}

impl AudioEncoder {
    /// Open `codec` with the given parameters.
    pub fn open(codec: ffmpeg::Codec, params: &EncoderParams) -> Result<Self, FfmpegError> {
        let name = codec.name().to_string();
        let format = pick_format(codec, &params.formats).ok_or_else(|| {
            FfmpegError::EncoderCreate(format!(
                "{} supports none of the sample formats {:?}",
                name, params.formats
            ))
        })?;

        let ch_layout = if params.channels == 1 {
            ChannelLayout::MONO
        } else {
            ChannelLayout::STEREO
        };

        // Build context and configure the audio encoder BEFORE opening
        let mut context = codec::Context::new_with_codec(codec);
        context.set_time_base(ffmpeg::Rational::new(1, params.sample_rate as i32));

        let mut audio_enc = context.encoder().audio().map_err(|e| {
            FfmpegError::EncoderCreate(format!("Cannot get audio encoder handle: {}", e))
        })?;

        audio_enc.set_rate(params.sample_rate as i32);
        audio_enc.set_format(format);
        audio_enc.set_channel_layout(ch_layout);
        audio_enc.set_bit_rate(params.bit_rate as usize);

        let mut options = ffmpeg::Dictionary::new();
        for (key, value) in &params.options {
            options.set(key, value);
        }

        let encoder = audio_enc.open_as_with(codec, options).map_err(|e| {
            FfmpegError::EncoderCreate(format!("Failed to open {} encoder: {}", name, e))
        })?;

        let frame_size = match encoder.frame_size() as usize {
            0 => DEFAULT_FRAME_SIZE,
            n => n,
        };

        tracing::debug!(
            encoder = %name,
            ?format,
            sample_rate = params.sample_rate,
            channels = params.channels,
            frame_size,
            "Encoder opened"
        );

        Ok(Self {
            encoder,
            name,
            format,
            frame_size,
            sample_rate: params.sample_rate,
            channels: params.channels,
            pts: 0,
        })
    }

    /// Allocate an input frame of `samples` samples in the encoder's format.
    pub fn alloc_frame(&self, samples: usize) -> ffmpeg::util::frame::Audio {
        let ch_layout = if self.channels == 1 {
            ChannelLayout::MONO
        } else {
            ChannelLayout::STEREO
        };
        let mut frame = ffmpeg::util::frame::Audio::new(self.format, samples, ch_layout);
        frame.set_rate(self.sample_rate);
        frame
    }

    /// Send one PCM frame to the encoder.
    pub fn send_frame(&mut self, frame: &ffmpeg::util::frame::Audio) -> Result<(), FfmpegError> {
        self.encoder.send_frame(frame).map_err(|e| {
            FfmpegError::EncodeFrame(format!("{} send_frame error: {}", self.name, e))
        })
    }

    /// Send EOF to flush the encoder's buffered output.
    pub fn send_eof(&mut self) -> Result<(), FfmpegError> {
        match self.encoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(FfmpegError::EncodeFrame(format!(
                "{} send_eof error: {}",
                self.name, e
            ))),
        }
    }

    /// Receive one encoded packet, or `None` if the encoder needs more input.
    pub fn receive_packet(&mut self) -> Result<Option<ffmpeg::codec::packet::Packet>, FfmpegError> {
        let mut packet = ffmpeg::codec::packet::Packet::empty();
        match self.encoder.receive_packet(&mut packet) {
            Ok(()) => {
                if packet.pts().is_none() {
                    packet.set_pts(Some(self.pts));
                    packet.set_dts(Some(self.pts));
                }
                self.pts += self.frame_size as i64;
                Ok(Some(packet))
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(None),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(FfmpegError::EncodeFrame(format!(
                "{} receive_packet error: {}",
                self.name, e
            ))),
        }
    }

    /// Collect every packet the encoder has ready.
    pub fn receive_packets(&mut self) -> Result<Vec<ffmpeg::codec::packet::Packet>, FfmpegError> {
        let mut packets = Vec::new();
        while let Some(p) = self.receive_packet()? {
            packets.push(p);
        }
        Ok(packets)
    }

    /// Flush any remaining buffered packets after sending EOF.
    pub fn flush(&mut self) -> Result<Vec<ffmpeg::codec::packet::Packet>, FfmpegError> {
        self.send_eof()?;
        self.receive_packets()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> Sample {
        self.format
    }

    /// The number of samples per channel the encoder expects per frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// The encoder timebase (1 / sample_rate).
    pub fn time_base(&self) -> ffmpeg::Rational {
        ffmpeg::Rational::new(1, self.sample_rate as i32)
    }

    /// Codec parameters for the encoded stream (for muxer stream setup).
    pub fn codec_parameters(&self) -> ffmpeg::codec::Parameters {
        crate::ffmpeg::helpers::encoder_codec_parameters(&self.encoder)
    }
}

fn pick_format(codec: ffmpeg::Codec, preferred: &[Sample]) -> Option<Sample> {
    let audio = codec.audio().ok()?;
    match audio.formats() {
        Some(formats) => {
            let supported: Vec<Sample> = formats.collect();
            preferred.iter().copied().find(|f| supported.contains(f))
        }
        None => preferred.first().copied(),
    }
}

/// Find an Opus encoder, preferring libopus over FFmpeg's native one.
pub fn find_opus_encoder() -> Option<ffmpeg::Codec> {
    codec::encoder::find_by_name("libopus").or_else(|| codec::encoder::find(codec::Id::OPUS))
}

/// Find an MP3 encoder (libmp3lame in standard builds).
pub fn find_mp3_encoder() -> Option<ffmpeg::Codec> {
    codec::encoder::find(codec::Id::MP3)
}

/// Parameters for the capture encoder.
///
/// libopus takes packed float, the native encoder planar float. The native
/// encoder is flagged experimental, hence `strict`.
pub fn opus_params(sample_rate: u32, channels: u16, bit_rate: u64) -> EncoderParams {
    EncoderParams {
        sample_rate,
        channels,
        bit_rate,
        formats: vec![Sample::F32(Type::Planar), Sample::F32(Type::Packed)],
        options: vec![("strict".to_string(), "experimental".to_string())],
    }
}

/// Parameters for the MP3 encoder, fed 16-bit planar PCM.
pub fn mp3_params(sample_rate: u32, channels: u16, bitrate_kbps: u32) -> EncoderParams {
    EncoderParams {
        sample_rate,
        channels,
        bit_rate: bitrate_kbps as u64 * 1000,
        formats: vec![Sample::I16(Type::Planar)],
        options: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_encoder_opens() {
        crate::ffmpeg::init().unwrap();
        let codec = find_opus_encoder().expect("an Opus encoder");
        let enc = AudioEncoder::open(codec, &opus_params(48000, 2, 128_000)).unwrap();
        assert_eq!(enc.frame_size(), 960);
        assert_eq!(enc.time_base(), ffmpeg::Rational::new(1, 48000));
        assert!(matches!(enc.format(), Sample::F32(_)));
    }

    #[test]
    fn test_mp3_encoder_opens() {
        crate::ffmpeg::init().unwrap();
        let Some(codec) = find_mp3_encoder() else {
            return;
        };
        let enc = AudioEncoder::open(codec, &mp3_params(44100, 1, 128)).unwrap();
        assert_eq!(enc.frame_size(), 1152);
        assert_eq!(enc.format(), Sample::I16(Type::Planar));
    }

    #[test]
    fn test_opus_rejects_bad_rate() {
        crate::ffmpeg::init().unwrap();
        let codec = find_opus_encoder().expect("an Opus encoder");
        assert!(AudioEncoder::open(codec, &opus_params(44100, 2, 128_000)).is_err());
    }

    #[test]
    fn test_encode_silence_produces_packets() {
        crate::ffmpeg::init().unwrap();
        let codec = find_opus_encoder().expect("an Opus encoder");
        let mut enc = AudioEncoder::open(codec, &opus_params(48000, 1, 64_000)).unwrap();

        for i in 0..10 {
            let mut frame = enc.alloc_frame(enc.frame_size());
            for d in crate::ffmpeg::helpers::audio_plane_data_mut(&mut frame, 0) {
                *d = 0;
            }
            frame.set_pts(Some(i * enc.frame_size() as i64));
            enc.send_frame(&frame).unwrap();
            enc.receive_packets().unwrap();
        }
        let tail = enc.flush().unwrap();
        assert!(tail.iter().all(|p| p.size() > 0));
    }
}
