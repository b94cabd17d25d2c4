//! WAV encoder: 44-byte RIFF header followed by interleaved 16-bit
//! little-endian PCM.

use bytes::{BufMut, Bytes, BytesMut};

use crate::encode::quantize_i16;
use crate::error::{ExtractError, Result};
use crate::transcode::pcm::DecodedAudioBuffer;

pub const WAV_HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = 16;
const BYTES_PER_SAMPLE: u32 = 2;
const FORMAT_PCM: u16 = 1;

/// Encode `buffer` as a canonical PCM WAV file.
///
/// Only fails when the data would not fit the 32-bit RIFF size fields.
pub fn encode_wav(buffer: &DecodedAudioBuffer) -> Result<Bytes> {
    let channels = buffer.channel_count();
    let frames = buffer.frame_count();
    let sample_rate = buffer.sample_rate();

    let data_len = (frames as u64) * (channels as u64) * BYTES_PER_SAMPLE as u64;
    let riff_len = 36 + data_len;
    if riff_len > u32::MAX as u64 {
        return Err(ExtractError::Encode(format!(
            "{} bytes of PCM exceed the WAV size limit",
            data_len
        )));
    }
    let data_len = data_len as u32;

    let mut out = BytesMut::with_capacity(WAV_HEADER_LEN + data_len as usize);
    out.put_slice(b"RIFF");
    out.put_u32_le(riff_len as u32);
    out.put_slice(b"WAVE");
    out.put_slice(b"fmt ");
    out.put_u32_le(16);
    out.put_u16_le(FORMAT_PCM);
    out.put_u16_le(channels as u16);
    out.put_u32_le(sample_rate);
    out.put_u32_le(sample_rate * channels as u32 * BYTES_PER_SAMPLE);
    out.put_u16_le(channels as u16 * BYTES_PER_SAMPLE as u16);
    out.put_u16_le(BITS_PER_SAMPLE);
    out.put_slice(b"data");
    out.put_u32_le(data_len);

    for i in 0..frames {
        for channel in buffer.channels() {
            out.put_i16_le(quantize_i16(channel[i]));
        }
    }

    tracing::debug!(frames, channels, sample_rate, bytes = out.len(), "WAV encoded");
    Ok(out.freeze())
}
