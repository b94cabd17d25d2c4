//! Capture source adapter
//!
//! Loads the source container from memory, reports its duration and audio
//! track, and replays the audio in real time (scaled by `playback_rate`) as a
//! side channel that drives the recorder. Position, the one-shot ended signal
//! and failures are published through a [`PlaybackClock`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::capture::arbiter::PlaybackStatus;
use crate::error::{ExtractError, FfmpegError, Result};
use crate::ffmpeg::helpers::{codec_params_channels, codec_params_sample_rate, fltp_frame_to_planes};
use crate::ffmpeg::io::MemoryInput;
use crate::transcode::decoder::AudioDecoder;
use crate::transcode::resampler::{working_channels, AudioResampler, PLANAR_F32};

/// Length of the silence blocks played after the audio track runs out
const SILENCE_BLOCK_SECS: f64 = 0.02;

/// Opaque handle to the input bytes
#[derive(Debug, Clone)]
pub struct SourceMedia {
    bytes: Bytes,
    name: String,
}

impl SourceMedia {
    pub fn new(bytes: impl Into<Bytes>, name: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            name: name.into(),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn display_name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

/// The audio stream playback will follow
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub stream_index: usize,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// A source whose metadata has been read
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub media: SourceMedia,
    pub duration_secs: f64,
    pub audio: Option<AudioTrack>,
    pub stream_count: usize,
}

/// Probe the container and read its duration and audio track.
///
/// Blocking; run it inside `spawn_blocking`.
pub fn load(media: SourceMedia) -> Result<LoadedSource> {
    if media.byte_len() == 0 {
        return Err(ExtractError::MediaLoad("source is empty".into()));
    }

    let input = MemoryInput::open(media.bytes().clone())
        .map_err(|e| ExtractError::MediaLoad(e.to_string()))?;

    let stream_count = input.streams().count();
    if stream_count == 0 {
        return Err(ExtractError::MediaLoad("container has no streams".into()));
    }

    let audio = input.streams().best(ffmpeg::media::Type::Audio).map(|stream| {
        let params = stream.parameters();
        AudioTrack {
            stream_index: stream.index(),
            codec: format!("{:?}", params.id()),
            sample_rate: codec_params_sample_rate(&params),
            channels: codec_params_channels(&params),
        }
    });

    let duration_secs = container_duration(&input)
        .or_else(|| {
            audio
                .as_ref()
                .and_then(|a| stream_duration(&input, a.stream_index))
        })
        .ok_or_else(|| ExtractError::MediaLoad("source duration is unknown".into()))?;

    tracing::debug!(
        name = media.display_name(),
        bytes = media.byte_len(),
        duration_secs,
        streams = stream_count,
        audio = ?audio,
        "Source loaded"
    );

    Ok(LoadedSource {
        media,
        duration_secs,
        audio,
        stream_count,
    })
}

fn container_duration(input: &ffmpeg::format::context::Input) -> Option<f64> {
    let duration = input.duration();
    (duration > 0).then(|| duration as f64 / ffmpeg::ffi::AV_TIME_BASE as f64)
}

fn stream_duration(input: &ffmpeg::format::context::Input, index: usize) -> Option<f64> {
    let stream = input.stream(index)?;
    let duration = stream.duration();
    (duration > 0).then(|| duration as f64 * f64::from(stream.time_base()))
}

/// A block of planar float samples at the capture rate
#[derive(Debug, Clone)]
pub struct PcmBlock {
    pub planes: Vec<Vec<f32>>,
}

impl PcmBlock {
    pub fn frames(&self) -> usize {
        self.planes.first().map_or(0, Vec::len)
    }
}

/// Shared state of a running capture
#[derive(Debug)]
pub struct PlaybackClock {
    position_bits: AtomicU64,
    duration: f64,
    ended: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl PlaybackClock {
    pub fn new(duration: f64) -> Self {
        Self {
            position_bits: AtomicU64::new(0f64.to_bits()),
            duration,
            ended: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Advance the position; never moves backwards.
    pub fn advance_to(&self, position: f64) {
        let _ = self
            .position_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (position > f64::from_bits(bits)).then(|| position.to_bits())
            });
    }

    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }

    /// Record a failure; the first one wins.
    pub fn fail(&self, message: impl Into<String>) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(message.into());
        }
    }
}

impl PlaybackStatus for PlaybackClock {
    fn position(&self) -> f64 {
        f64::from_bits(self.position_bits.load(Ordering::Acquire))
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

/// Parameters of one playback run
#[derive(Debug, Clone)]
pub struct PlaybackParams {
    pub sample_rate: u32,
    pub playback_rate: f64,
}

/// Channel count playback delivers for `track`.
pub fn playback_channels(track: &AudioTrack) -> u16 {
    working_channels(track.channels)
}

/// Replay the audio track of `source` in real time, sending each block to
/// `sink`. Runs until the declared duration has been delivered, `stop` is
/// cancelled, or the receiver goes away. Blocking.
pub fn run_playback(
    source: &LoadedSource,
    params: &PlaybackParams,
    sink: SyncSender<PcmBlock>,
    clock: Arc<PlaybackClock>,
    stop: CancellationToken,
) {
    let Some(track) = source.audio.clone() else {
        clock.fail("source has no audio track");
        return;
    };

    let mut player = Player {
        sink,
        clock: Arc::clone(&clock),
        stop,
        sample_rate: params.sample_rate,
        channels: playback_channels(&track),
        playback_rate: params.playback_rate,
        total_frames: (source.duration_secs * params.sample_rate as f64).round() as u64,
        delivered: 0,
        started: Instant::now(),
    };

    match player.play(source.media.bytes().clone(), &track) {
        Ok(()) => {
            if player.delivered >= player.total_frames {
                clock.mark_ended();
            }
        }
        Err(e) => {
            tracing::warn!("Playback failed: {}", e);
            clock.fail(e.to_string());
        }
    }

    tracing::debug!(
        delivered_frames = player.delivered,
        total_frames = player.total_frames,
        "Playback finished"
    );
}

struct Player {
    sink: SyncSender<PcmBlock>,
    clock: Arc<PlaybackClock>,
    stop: CancellationToken,
    sample_rate: u32,
    channels: u16,
    playback_rate: f64,
    total_frames: u64,
    delivered: u64,
    started: Instant,
}

impl Player {
    fn play(&mut self, bytes: Bytes, track: &AudioTrack) -> std::result::Result<(), FfmpegError> {
        let mut input = MemoryInput::open(bytes)?;
        let mut decoder = {
            let stream = input.stream(track.stream_index).ok_or_else(|| {
                FfmpegError::OpenInput(format!("stream {} disappeared", track.stream_index))
            })?;
            AudioDecoder::open(&stream)?
        };
        let mut resampler: Option<AudioResampler> = None;

        for (stream, packet) in input.packets() {
            if stream.index() != track.stream_index {
                continue;
            }
            decoder.send_packet(&packet)?;
            while let Some(frame) = decoder.receive_frame()? {
                if !self.deliver_frame(&frame, &mut resampler)? {
                    return Ok(());
                }
            }
        }

        for frame in decoder.drain()? {
            if !self.deliver_frame(&frame, &mut resampler)? {
                return Ok(());
            }
        }
        if let Some(resampler) = resampler.as_mut() {
            for out in resampler.flush()? {
                if !self.deliver_planes(planes_of(&out)?) {
                    return Ok(());
                }
            }
        }

        // The clock keeps running past the end of the audio track
        let block = ((SILENCE_BLOCK_SECS * self.sample_rate as f64) as usize).max(1);
        while self.delivered < self.total_frames {
            let planes = vec![vec![0f32; block]; self.channels as usize];
            if !self.deliver_planes(planes) {
                return Ok(());
            }
        }
        Ok(())
    }

    fn deliver_frame(
        &mut self,
        frame: &ffmpeg::util::frame::Audio,
        resampler: &mut Option<AudioResampler>,
    ) -> std::result::Result<bool, FfmpegError> {
        if resampler.is_none() {
            *resampler = Some(AudioResampler::new(
                frame,
                PLANAR_F32,
                self.sample_rate,
                self.channels,
            )?);
        }
        let Some(resampler) = resampler.as_mut() else {
            return Ok(false);
        };
        for out in resampler.convert(frame)? {
            if !self.deliver_planes(planes_of(&out)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Pace, send and publish one block. Returns false once playback should end.
    fn deliver_planes(&mut self, mut planes: Vec<Vec<f32>>) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        let remaining = self.total_frames.saturating_sub(self.delivered) as usize;
        if remaining == 0 {
            return false;
        }
        for plane in planes.iter_mut() {
            plane.truncate(remaining);
        }
        let frames = planes.first().map_or(0, Vec::len) as u64;

        let due = self.started
            + Duration::from_secs_f64(
                self.delivered as f64 / self.sample_rate as f64 / self.playback_rate,
            );
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }

        if self.sink.send(PcmBlock { planes }).is_err() {
            return false;
        }
        self.delivered += frames;
        self.clock
            .advance_to(self.delivered as f64 / self.sample_rate as f64);
        self.delivered < self.total_frames
    }
}

fn planes_of(frame: &ffmpeg::util::frame::Audio) -> std::result::Result<Vec<Vec<f32>>, FfmpegError> {
    fltp_frame_to_planes(frame)
        .ok_or_else(|| FfmpegError::Resample("misaligned sample plane".into()))
}
