//! Audio decoder
//!
//! Wraps an FFmpeg `AVCodecContext` to decode compressed audio packets
//! (Opus, AAC, MP3, PCM, …) into raw PCM `AVFrame`s.

use crate::error::FfmpegError;
use ffmpeg_next as ffmpeg;

/// Real audio decoder backed by a FFmpeg codec context
pub struct AudioDecoder {
    decoder: ffmpeg::decoder::Audio,
    /// Stream index in the source container
    stream_index: usize,
}

impl AudioDecoder {
    /// Open a decoder for the given stream.
    ///
    /// Uses the stream's own codec parameters to initialise the context so no
    /// external configuration is needed.
    pub fn open(stream: &ffmpeg::format::stream::Stream) -> Result<Self, FfmpegError> {
        let stream_index = stream.index();
        let context =
            ffmpeg::codec::Context::from_parameters(stream.parameters()).map_err(|e| {
                FfmpegError::DecoderCreate(format!(
                    "Failed to create codec context for stream {}: {}",
                    stream_index, e
                ))
            })?;

        let decoder = context.decoder().audio().map_err(|e| {
            FfmpegError::DecoderCreate(format!(
                "Failed to open audio decoder for stream {}: {}",
                stream_index, e
            ))
        })?;

        Ok(Self {
            decoder,
            stream_index,
        })
    }

    /// Send a compressed packet to the decoder.
    ///
    /// `AVERROR_INVALIDDATA` is non-fatal: the packet is skipped with a debug
    /// log so one damaged packet does not abort the whole capture.
    pub fn send_packet(&mut self, packet: &ffmpeg::codec::packet::Packet) -> Result<(), FfmpegError> {
        match self.decoder.send_packet(packet) {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::InvalidData) => {
                tracing::debug!(
                    stream_index = self.stream_index,
                    "send_packet: skipping invalid packet"
                );
                Ok(())
            }
            Err(e) => Err(FfmpegError::DecodePacket(format!(
                "send_packet error on stream {}: {}",
                self.stream_index, e
            ))),
        }
    }

    /// Send EOF to flush the decoder's internal buffers.
    ///
    /// EAGAIN and EOF responses mean the decoder has nothing buffered or is
    /// already finished.
    pub fn send_eof(&mut self) -> Result<(), FfmpegError> {
        match self.decoder.send_eof() {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(()),
            Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(FfmpegError::DecodePacket(format!(
                "send_eof error on stream {}: {}",
                self.stream_index, e
            ))),
        }
    }

    /// Receive one decoded PCM frame, or `None` if the decoder needs more
    /// input.
    pub fn receive_frame(&mut self) -> Result<Option<ffmpeg::util::frame::Audio>, FfmpegError> {
        let mut frame = ffmpeg::util::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(frame)),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(None),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(FfmpegError::DecodePacket(format!(
                "receive_frame error on stream {}: {}",
                self.stream_index, e
            ))),
        }
    }

    /// Send EOF and collect every frame still buffered.
    pub fn drain(&mut self) -> Result<Vec<ffmpeg::util::frame::Audio>, FfmpegError> {
        self.send_eof()?;
        let mut frames = Vec::new();
        while let Some(frame) = self.receive_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// The source stream index.
    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    /// Sample rate of decoded frames.
    pub fn sample_rate(&self) -> u32 {
        self.decoder.rate()
    }

    /// Sample format of decoded frames.
    pub fn format(&self) -> ffmpeg::util::format::sample::Sample {
        self.decoder.format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_decoder_registered() {
        crate::ffmpeg::init().unwrap();
        let decoder = ffmpeg::codec::decoder::find(ffmpeg::codec::Id::OPUS);
        assert!(decoder.is_some());
    }

    #[test]
    fn test_pcm_decoder_registered() {
        crate::ffmpeg::init().unwrap();
        let decoder = ffmpeg::codec::decoder::find(ffmpeg::codec::Id::PCM_S16LE);
        assert_eq!(decoder.unwrap().id(), ffmpeg::codec::Id::PCM_S16LE);
    }
}
