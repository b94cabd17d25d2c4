//! Test fixtures for integration tests
//!
//! Synthesizes small Matroska sources in memory so no media files need to be
//! checked in: a sine tone as 16-bit PCM, an optional grey MPEG-4 video track,
//! or video alone.

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::format::sample::{Sample, Type};

use crate::ffmpeg::helpers::{audio_plane_data_mut, plane_as_i16_mut, stream_reset_codec_tag};
use crate::ffmpeg::io::MemoryOutput;
use crate::transcode::encoder::{AudioEncoder, EncoderParams};

const VIDEO_WIDTH: u32 = 64;
const VIDEO_HEIGHT: u32 = 48;
const VIDEO_FPS: i32 = 10;
const AUDIO_CHUNK: usize = 1024;

/// Shape of the synthesized audio track
#[derive(Debug, Clone, Copy)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub frequency: f32,
    pub amplitude: f32,
}

impl AudioSpec {
    pub fn stereo_sine(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 2,
            frequency: 440.0,
            amplitude: 0.5,
        }
    }

    pub fn silent(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            frequency: 440.0,
            amplitude: 0.0,
        }
    }
}

/// Build a Matroska file of `duration_secs` with the requested tracks.
pub fn matroska_source(audio: Option<AudioSpec>, video: bool, duration_secs: f64) -> Bytes {
    crate::ffmpeg::init().unwrap();
    let mut out = MemoryOutput::new("matroska", true).unwrap();

    let mut audio_track = audio.map(|spec| {
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::PCM_S16LE).unwrap();
        let encoder = AudioEncoder::open(
            codec,
            &EncoderParams {
                sample_rate: spec.sample_rate,
                channels: spec.channels,
                bit_rate: 0,
                formats: vec![Sample::I16(Type::Packed)],
                options: Vec::new(),
            },
        )
        .unwrap();
        let mut stream = out.add_stream(codec).unwrap();
        stream.set_parameters(encoder.codec_parameters());
        stream_reset_codec_tag(&mut stream);
        stream.set_time_base(encoder.time_base());
        (spec, encoder, stream.index())
    });

    let mut video_track = video.then(|| {
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4).unwrap();
        let mut context = ffmpeg::codec::Context::new_with_codec(codec);
        context.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        let mut enc = context.encoder().video().unwrap();
        enc.set_width(VIDEO_WIDTH);
        enc.set_height(VIDEO_HEIGHT);
        enc.set_format(ffmpeg::format::Pixel::YUV420P);
        enc.set_time_base(ffmpeg::Rational::new(1, VIDEO_FPS));
        enc.set_frame_rate(Some(ffmpeg::Rational::new(VIDEO_FPS, 1)));
        let encoder = enc.open_as(codec).unwrap();
        let mut stream = out.add_stream(codec).unwrap();
        stream.set_parameters(&encoder);
        stream_reset_codec_tag(&mut stream);
        stream.set_time_base(ffmpeg::Rational::new(1, VIDEO_FPS));
        (encoder, stream.index())
    });

    out.write_header().unwrap();

    if let Some((spec, encoder, index)) = audio_track.as_mut() {
        let total = (duration_secs * spec.sample_rate as f64).round() as usize;
        let channels = spec.channels as usize;
        let step = 2.0 * std::f32::consts::PI * spec.frequency / spec.sample_rate as f32;
        let mut written = 0usize;
        while written < total {
            let n = AUDIO_CHUNK.min(total - written);
            let mut frame = encoder.alloc_frame(n);
            let data = plane_as_i16_mut(audio_plane_data_mut(&mut frame, 0), n * channels).unwrap();
            for i in 0..n {
                let v = spec.amplitude * ((written + i) as f32 * step).sin();
                let s = (v * 32767.0).round() as i16;
                for ch in 0..channels {
                    data[i * channels + ch] = s;
                }
            }
            frame.set_pts(Some(written as i64));
            encoder.send_frame(&frame).unwrap();
            write_packets(&mut out, encoder.receive_packets().unwrap(), encoder.time_base(), *index);
            written += n;
        }
        let tail = encoder.flush().unwrap();
        write_packets(&mut out, tail, encoder.time_base(), *index);
    }

    if let Some((encoder, index)) = video_track.as_mut() {
        let tb = ffmpeg::Rational::new(1, VIDEO_FPS);
        let frames = (duration_secs * VIDEO_FPS as f64).round() as i64;
        for i in 0..frames {
            let mut frame =
                ffmpeg::util::frame::Video::new(ffmpeg::format::Pixel::YUV420P, VIDEO_WIDTH, VIDEO_HEIGHT);
            for plane in 0..3 {
                frame.data_mut(plane).fill(128);
            }
            frame.set_pts(Some(i));
            encoder.send_frame(&frame).unwrap();
            write_packets(&mut out, receive_video(encoder), tb, *index);
        }
        encoder.send_eof().unwrap();
        write_packets(&mut out, receive_video(encoder), tb, *index);
    }

    out.write_trailer().unwrap();
    Bytes::from(out.data())
}

fn receive_video(encoder: &mut ffmpeg::encoder::Video) -> Vec<ffmpeg::codec::packet::Packet> {
    let mut packets = Vec::new();
    let mut packet = ffmpeg::codec::packet::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packets.push(packet.clone());
    }
    packets
}

fn write_packets(
    out: &mut MemoryOutput,
    packets: Vec<ffmpeg::codec::packet::Packet>,
    from: ffmpeg::Rational,
    index: usize,
) {
    let to = out.stream(index).unwrap().time_base();
    for mut packet in packets {
        packet.set_stream(index);
        packet.rescale_ts(from, to);
        packet.write_interleaved(out).unwrap();
    }
}

/// Stereo sine with a grey video track.
pub fn video_with_audio(sample_rate: u32, duration_secs: f64) -> Bytes {
    matroska_source(Some(AudioSpec::stereo_sine(sample_rate)), true, duration_secs)
}

/// Grey video with no audio track.
pub fn video_only(duration_secs: f64) -> Bytes {
    matroska_source(None, true, duration_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::io::MemoryInput;

    #[test]
    fn test_fixture_probes_with_duration() {
        let bytes = video_with_audio(44100, 1.0);
        let input = MemoryInput::open(bytes).unwrap();
        assert!(input.streams().best(ffmpeg::media::Type::Audio).is_some());
        assert!(input.streams().best(ffmpeg::media::Type::Video).is_some());
        let secs = input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
        assert!((secs - 1.0).abs() < 0.2, "duration {}", secs);
    }

    #[test]
    fn test_video_only_fixture() {
        let input = MemoryInput::open(video_only(0.5)).unwrap();
        assert!(input.streams().best(ffmpeg::media::Type::Audio).is_none());
    }
}
