//! Chunked stream recorder
//!
//! Encodes the PCM blocks coming from playback to Opus and muxes them into a
//! non-seekable WebM stream. Every `timeslice` the bytes muxed so far are cut
//! off as a chunk; empty chunks are dropped. Because the sink never seeks, the
//! chunks concatenated in emission order form one valid container.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::capture::source::{PcmBlock, PlaybackClock};
use crate::error::FfmpegError;
use crate::ffmpeg::helpers::{audio_plane_data_mut, fltp_plane_as_f32_mut, stream_reset_codec_tag};
use crate::ffmpeg::io::MemoryOutput;
use crate::transcode::encoder::{opus_params, AudioEncoder};

/// Container the recorder produces
pub const CAPTURE_FORMAT: &str = "webm";

/// Recorder parameters
#[derive(Debug, Clone)]
pub struct RecorderParams {
    /// Encoder to open, by FFmpeg name
    pub encoder_name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u64,
    pub timeslice: Duration,
}

/// Opus encoder + WebM muxer writing to memory
pub struct Recorder {
    encoder: AudioEncoder,
    output: MemoryOutput,
    stream_time_base: ffmpeg::Rational,
    pending: Vec<VecDeque<f32>>,
    pts: i64,
}

impl Recorder {
    /// Open the encoder and muxer and write the container header.
    pub fn open(params: &RecorderParams) -> Result<Self, FfmpegError> {
        let codec = ffmpeg::encoder::find_by_name(&params.encoder_name).ok_or_else(|| {
            FfmpegError::EncoderNotFound(format!("{} is not available", params.encoder_name))
        })?;
        let encoder = AudioEncoder::open(
            codec,
            &opus_params(params.sample_rate, params.channels, params.bit_rate),
        )?;

        let mut output = MemoryOutput::new(CAPTURE_FORMAT, false)?;
        {
            let mut stream = output
                .add_stream(codec)
                .map_err(|e| FfmpegError::StreamConfig(format!("add_stream: {}", e)))?;
            stream.set_parameters(encoder.codec_parameters());
            stream_reset_codec_tag(&mut stream);
            stream.set_time_base(encoder.time_base());
        }
        output
            .write_header()
            .map_err(|e| FfmpegError::WriteHeader(format!("write_header: {}", e)))?;

        let stream_time_base = output
            .stream(0)
            .map(|s| s.time_base())
            .ok_or_else(|| FfmpegError::StreamConfig("output stream missing".into()))?;

        Ok(Self {
            pending: vec![VecDeque::new(); params.channels as usize],
            encoder,
            output,
            stream_time_base,
            pts: 0,
        })
    }

    /// Queue a block and encode every complete frame.
    pub fn push(&mut self, block: &PcmBlock) -> Result<(), FfmpegError> {
        for (queue, plane) in self.pending.iter_mut().zip(&block.planes) {
            queue.extend(plane.iter().copied());
        }
        let frame_size = self.encoder.frame_size();
        while self.pending_frames() >= frame_size {
            self.encode_frame(frame_size)?;
        }
        Ok(())
    }

    /// Cut off everything muxed since the previous chunk.
    pub fn take_chunk(&mut self) -> Bytes {
        Bytes::from(self.output.take())
    }

    /// Pad and encode the remainder, flush the encoder, write the trailer and
    /// return the final chunk.
    pub fn finish(mut self) -> Result<Bytes, FfmpegError> {
        let remainder = self.pending_frames();
        if remainder > 0 {
            let frame_size = self.encoder.frame_size();
            for queue in self.pending.iter_mut() {
                queue.resize(frame_size, 0.0);
            }
            self.encode_frame(frame_size)?;
        }
        let packets = self.encoder.flush()?;
        self.write_packets(packets)?;
        self.output
            .write_trailer()
            .map_err(|e| FfmpegError::WriteTrailer(format!("write_trailer: {}", e)))?;
        Ok(self.take_chunk())
    }

    fn pending_frames(&self) -> usize {
        self.pending.first().map_or(0, VecDeque::len)
    }

    fn encode_frame(&mut self, samples: usize) -> Result<(), FfmpegError> {
        let mut frame = self.encoder.alloc_frame(samples);
        let channels = self.pending.len();

        if self.encoder.format().is_planar() {
            for (ch, queue) in self.pending.iter_mut().enumerate() {
                let plane = fltp_plane_as_f32_mut(audio_plane_data_mut(&mut frame, ch), samples)
                    .ok_or_else(|| FfmpegError::EncodeFrame("misaligned frame plane".into()))?;
                for (dst, src) in plane.iter_mut().zip(queue.drain(..samples)) {
                    *dst = src;
                }
            }
        } else {
            let data =
                fltp_plane_as_f32_mut(audio_plane_data_mut(&mut frame, 0), samples * channels)
                    .ok_or_else(|| FfmpegError::EncodeFrame("misaligned frame buffer".into()))?;
            for (ch, queue) in self.pending.iter_mut().enumerate() {
                for (i, s) in queue.drain(..samples).enumerate() {
                    data[i * channels + ch] = s;
                }
            }
        }

        frame.set_pts(Some(self.pts));
        self.pts += samples as i64;
        self.encoder.send_frame(&frame)?;
        let packets = self.encoder.receive_packets()?;
        self.write_packets(packets)
    }

    fn write_packets(
        &mut self,
        packets: Vec<ffmpeg::codec::packet::Packet>,
    ) -> Result<(), FfmpegError> {
        for mut packet in packets {
            packet.set_stream(0);
            packet.rescale_ts(self.encoder.time_base(), self.stream_time_base);
            packet
                .write(&mut self.output)
                .map_err(|e| FfmpegError::WritePacket(format!("write: {}", e)))?;
        }
        Ok(())
    }
}

/// Channels connecting the recorder worker to the session
pub struct RecorderLink {
    pub blocks: Receiver<PcmBlock>,
    pub chunks: mpsc::UnboundedSender<Bytes>,
    pub started: oneshot::Sender<Result<(), String>>,
    pub clock: Arc<PlaybackClock>,
    pub stop: CancellationToken,
}

/// Recorder worker body. Blocking.
///
/// Reports startup through `link.started`, then records until playback hangs
/// up or `link.stop` is cancelled. Returns the number of chunks emitted.
pub fn run_recorder(params: RecorderParams, link: RecorderLink) -> usize {
    let mut recorder = match Recorder::open(&params) {
        Ok(r) => r,
        Err(e) => {
            let _ = link.started.send(Err(e.to_string()));
            return 0;
        }
    };
    if link.started.send(Ok(())).is_err() {
        return 0;
    }

    let mut emitted = 0usize;
    let mut emit = |chunk: Bytes| {
        if chunk.is_empty() {
            return;
        }
        tracing::debug!(index = emitted, bytes = chunk.len(), "Chunk emitted");
        if link.chunks.send(chunk).is_ok() {
            emitted += 1;
        }
    };

    let mut next_cut = Instant::now() + params.timeslice;
    let result: Result<(), FfmpegError> = loop {
        let wait = next_cut.saturating_duration_since(Instant::now());
        match link.blocks.recv_timeout(wait) {
            Ok(block) => {
                if let Err(e) = recorder.push(&block) {
                    break Err(e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
        if link.stop.is_cancelled() {
            break Ok(());
        }
        if Instant::now() >= next_cut {
            emit(recorder.take_chunk());
            next_cut += params.timeslice;
        }
    };

    let result = result.and_then(|()| {
        // Blocks already handed over belong to this capture
        while let Ok(block) = link.blocks.try_recv() {
            recorder.push(&block)?;
        }
        recorder.finish()
    });

    match result {
        Ok(last) => emit(last),
        Err(e) => {
            tracing::warn!("Recorder failed: {}", e);
            link.clock.fail(e.to_string());
        }
    }
    emitted
}
