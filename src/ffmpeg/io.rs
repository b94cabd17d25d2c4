//! Custom AVIOContext for in-memory demuxing and muxing
//!
//! `MemoryInput` opens a container straight from a byte buffer and
//! `MemoryOutput` muxes into a growable `Vec<u8>`, so neither the source media
//! nor the captured recording ever touches the filesystem.
//!
//! # Thread safety
//! `MemoryWriter` and `MemoryReader` are NOT thread-safe. Each context is
//! created and consumed on a single thread (inside `spawn_blocking`). FFmpeg
//! can call `seek_packet` from within `write_packet` (e.g. during
//! `write_trailer`), so the buffer is a plain `Vec<u8>` rather than anything
//! behind a lock.

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use std::ffi::{c_int, c_void, CString};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr;

use crate::error::FfmpegError;

const AVIO_BUFFER_SIZE: usize = 4096;
const AVSEEK_SIZE: c_int = 0x10000;

/// Custom IO context that writes to an in-memory buffer.
/// Single-threaded use only: one instance per muxer, never shared across threads.
pub struct MemoryWriter {
    buffer: Vec<u8>,
    position: u64,
}

impl MemoryWriter {
    /// Create a new memory writer
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(AVIO_BUFFER_SIZE),
            position: 0,
        }
    }

    /// Get a copy of the written data
    pub fn data(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    /// Move everything written so far out of the writer.
    ///
    /// Only meaningful for append-only sinks; a seekable muxer may still want
    /// to patch bytes that have already been taken.
    pub fn take(&mut self) -> Vec<u8> {
        self.position = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.position = 0;
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let pos = self.position as usize;
        let end = pos + buf.len();

        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }

        self.buffer[pos..end].copy_from_slice(buf);
        self.position += buf.len() as u64;

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryWriter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let buffer_len = self.buffer.len() as i64;

        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(p) => self.position as i64 + p,
            SeekFrom::End(p) => buffer_len + p,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of buffer",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl Default for MemoryWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only cursor over a shared byte buffer.
pub struct MemoryReader {
    data: Bytes,
    position: usize,
}

impl MemoryReader {
    pub fn new(data: Bytes) -> Self {
        Self { data, position: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.data.len() {
            return Ok(0);
        }
        let n = (self.data.len() - self.position).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

impl Seek for MemoryReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.data.len() as i64;
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(p) => self.position as i64 + p,
            SeekFrom::End(p) => len + p,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of buffer",
            ));
        }
        self.position = new_pos as usize;
        Ok(new_pos as u64)
    }
}

// C-compatible callbacks for FFmpeg

unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    let writer = &mut *(opaque as *mut MemoryWriter);
    let slice = std::slice::from_raw_parts(buf, buf_size as usize);
    match writer.write(slice) {
        Ok(n) => n as c_int,
        Err(_) => -1,
    }
}

unsafe extern "C" fn seek_write_packet(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let writer = &mut *(opaque as *mut MemoryWriter);

    if whence & AVSEEK_SIZE != 0 {
        return writer.buffer.len() as i64;
    }

    match seek_from(offset, whence).map(|pos| writer.seek(pos)) {
        Some(Ok(pos)) => pos as i64,
        _ => -1,
    }
}

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    let reader = &mut *(opaque as *mut MemoryReader);
    let slice = std::slice::from_raw_parts_mut(buf, buf_size as usize);
    match reader.read(slice) {
        Ok(0) => ffmpeg::ffi::AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(_) => -1,
    }
}

unsafe extern "C" fn seek_read_packet(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let reader = &mut *(opaque as *mut MemoryReader);

    if whence & AVSEEK_SIZE != 0 {
        return reader.len() as i64;
    }

    match seek_from(offset, whence).map(|pos| reader.seek(pos)) {
        Some(Ok(pos)) => pos as i64,
        _ => -1,
    }
}

/// Map C `whence` to `SeekFrom`.
fn seek_from(offset: i64, whence: c_int) -> Option<SeekFrom> {
    // AVSEEK_FORCE may be or-ed in; it carries no meaning for a memory buffer
    match whence & !0x20000 {
        0 => Some(SeekFrom::Start(offset.max(0) as u64)),
        1 => Some(SeekFrom::Current(offset)),
        2 => Some(SeekFrom::End(offset)),
        _ => None,
    }
}

/// Release an AVIOContext created with `avio_alloc_context`, including the
/// internal buffer (which FFmpeg may have reallocated since we handed it over).
unsafe fn free_avio(mut avio: *mut ffmpeg::ffi::AVIOContext) {
    if avio.is_null() {
        return;
    }
    ffmpeg::ffi::av_freep(&mut (*avio).buffer as *mut *mut u8 as *mut c_void);
    ffmpeg::ffi::avio_context_free(&mut avio);
}

/// Demuxer reading from an in-memory buffer.
///
/// Dereferences to `ffmpeg::format::context::Input`, so it is used exactly
/// like a file-backed input.
pub struct MemoryInput {
    input: ManuallyDrop<ffmpeg::format::context::Input>,
    avio: *mut ffmpeg::ffi::AVIOContext,
    reader: *mut MemoryReader,
}

// SAFETY: the raw pointers are owned exclusively by this value and only
// touched from whichever thread currently owns it.
unsafe impl Send for MemoryInput {}

impl MemoryInput {
    /// Probe and open the container held in `data`.
    pub fn open(data: Bytes) -> Result<Self, FfmpegError> {
        if data.is_empty() {
            return Err(FfmpegError::OpenInput("input buffer is empty".to_string()));
        }

        unsafe {
            let reader_ptr = Box::into_raw(Box::new(MemoryReader::new(data)));

            let buffer = ffmpeg::ffi::av_malloc(AVIO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(reader_ptr));
                return Err(FfmpegError::OpenInput(
                    "Failed to allocate AVIO buffer".to_string(),
                ));
            }

            let avio = ffmpeg::ffi::avio_alloc_context(
                buffer,
                AVIO_BUFFER_SIZE as c_int,
                0,
                reader_ptr as *mut c_void,
                Some(read_packet),
                None,
                Some(seek_read_packet),
            );
            if avio.is_null() {
                ffmpeg::ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(reader_ptr));
                return Err(FfmpegError::OpenInput(
                    "Failed to allocate AVIO context".to_string(),
                ));
            }

            let mut ctx = ffmpeg::ffi::avformat_alloc_context();
            if ctx.is_null() {
                free_avio(avio);
                drop(Box::from_raw(reader_ptr));
                return Err(FfmpegError::OpenInput(
                    "Failed to allocate format context".to_string(),
                ));
            }
            (*ctx).pb = avio;
            (*ctx).flags |= ffmpeg::ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

            // On failure avformat_open_input frees ctx but leaves our pb alone
            let ret = ffmpeg::ffi::avformat_open_input(
                &mut ctx,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            );
            if ret < 0 {
                free_avio(avio);
                drop(Box::from_raw(reader_ptr));
                return Err(FfmpegError::OpenInput(format!(
                    "avformat_open_input failed: {}",
                    ffmpeg::Error::from(ret)
                )));
            }

            let ret = ffmpeg::ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                ffmpeg::ffi::avformat_close_input(&mut ctx);
                free_avio(avio);
                drop(Box::from_raw(reader_ptr));
                return Err(FfmpegError::FindStreamInfo(format!(
                    "avformat_find_stream_info failed: {}",
                    ffmpeg::Error::from(ret)
                )));
            }

            Ok(Self {
                input: ManuallyDrop::new(ffmpeg::format::context::Input::wrap(ctx)),
                avio,
                reader: reader_ptr,
            })
        }
    }
}

impl Deref for MemoryInput {
    type Target = ffmpeg::format::context::Input;

    fn deref(&self) -> &Self::Target {
        &self.input
    }
}

impl DerefMut for MemoryInput {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.input
    }
}

impl Drop for MemoryInput {
    fn drop(&mut self) {
        // Input closes the format context but not a CUSTOM_IO pb, so the AVIO
        // context and reader go after it.
        unsafe {
            ManuallyDrop::drop(&mut self.input);
            free_avio(self.avio);
            drop(Box::from_raw(self.reader));
        }
    }
}

/// Muxer writing into an in-memory buffer.
///
/// A non-seekable output never rewrites earlier bytes, so everything drained
/// with [`MemoryOutput::take`] is final and chunks can be concatenated.
pub struct MemoryOutput {
    output: ManuallyDrop<ffmpeg::format::context::Output>,
    avio: *mut ffmpeg::ffi::AVIOContext,
    writer: *mut MemoryWriter,
}

// SAFETY: see MemoryInput.
unsafe impl Send for MemoryOutput {}

impl MemoryOutput {
    /// Create an output context for the named muxer (e.g. `"webm"`).
    pub fn new(format_name: &str, seekable: bool) -> Result<Self, FfmpegError> {
        let format_name = CString::new(format_name)
            .map_err(|e| FfmpegError::MuxerCreate(format!("invalid format name: {}", e)))?;

        unsafe {
            let writer_ptr = Box::into_raw(Box::new(MemoryWriter::new()));

            let buffer = ffmpeg::ffi::av_malloc(AVIO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(writer_ptr));
                return Err(FfmpegError::MuxerCreate(
                    "Failed to allocate AVIO buffer".to_string(),
                ));
            }

            let seek: Option<unsafe extern "C" fn(*mut c_void, i64, c_int) -> i64> = if seekable {
                Some(seek_write_packet)
            } else {
                None
            };

            let avio = ffmpeg::ffi::avio_alloc_context(
                buffer,
                AVIO_BUFFER_SIZE as c_int,
                1,
                writer_ptr as *mut c_void,
                None,
                Some(write_packet),
                seek,
            );
            if avio.is_null() {
                ffmpeg::ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(writer_ptr));
                return Err(FfmpegError::MuxerCreate(
                    "Failed to allocate AVIO context".to_string(),
                ));
            }

            let mut output_ptr: *mut ffmpeg::ffi::AVFormatContext = ptr::null_mut();
            let ret = ffmpeg::ffi::avformat_alloc_output_context2(
                &mut output_ptr,
                ptr::null_mut(),
                format_name.as_ptr(),
                ptr::null(),
            );
            if ret < 0 || output_ptr.is_null() {
                free_avio(avio);
                drop(Box::from_raw(writer_ptr));
                return Err(FfmpegError::MuxerCreate(format!(
                    "Failed to create {:?} output context",
                    format_name
                )));
            }

            (*output_ptr).pb = avio;
            (*output_ptr).flags |= ffmpeg::ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

            Ok(Self {
                output: ManuallyDrop::new(ffmpeg::format::context::Output::wrap(output_ptr)),
                avio,
                writer: writer_ptr,
            })
        }
    }

    /// Flush the muxer (closing any open cluster) and the AVIO buffer, then
    /// drain every byte produced so far.
    pub fn take(&mut self) -> Vec<u8> {
        unsafe {
            let ctx = self.output.as_mut_ptr();
            // A null packet asks muxers that support it to flush queued data
            ffmpeg::ffi::av_write_frame(ctx, ptr::null_mut());
            ffmpeg::ffi::avio_flush(self.avio);
            (*self.writer).take()
        }
    }

    /// Flush the AVIO buffer and copy everything written so far.
    pub fn data(&mut self) -> Vec<u8> {
        unsafe {
            ffmpeg::ffi::avio_flush(self.avio);
            (*self.writer).data()
        }
    }
}

impl Deref for MemoryOutput {
    type Target = ffmpeg::format::context::Output;

    fn deref(&self) -> &Self::Target {
        &self.output
    }
}

impl DerefMut for MemoryOutput {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.output
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        // Output's own Drop would avio_close() our pb; detach it first.
        unsafe {
            crate::ffmpeg::helpers::detach_avio(&mut self.output);
            ManuallyDrop::drop(&mut self.output);
            free_avio(self.avio);
            drop(Box::from_raw(self.writer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_writer() {
        let mut writer = MemoryWriter::new();
        writer.write_all(b"test").unwrap();
        assert_eq!(writer.data(), b"test");
    }

    #[test]
    fn test_memory_writer_seek_overwrites() {
        let mut writer = MemoryWriter::new();
        writer.write_all(b"abcdef").unwrap();
        writer.seek(SeekFrom::Start(2)).unwrap();
        writer.write_all(b"XY").unwrap();
        assert_eq!(writer.data(), b"abXYef");
        assert!(writer.seek(SeekFrom::Current(-10)).is_err());
    }

    #[test]
    fn test_memory_writer_take_drains() {
        let mut writer = MemoryWriter::new();
        writer.write_all(b"first").unwrap();
        assert_eq!(writer.take(), b"first");
        assert!(writer.is_empty());
        writer.write_all(b"second").unwrap();
        assert_eq!(writer.take(), b"second");
    }

    #[test]
    fn test_memory_reader_reads_to_end() {
        let mut reader = MemoryReader::new(Bytes::from_static(b"hello world"));
        let mut buf = [0u8; 5];
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        reader.seek(SeekFrom::End(-5)).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"world");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_memory_input_rejects_empty() {
        crate::ffmpeg::init().unwrap();
        assert!(matches!(
            MemoryInput::open(Bytes::new()),
            Err(FfmpegError::OpenInput(_))
        ));
    }

    #[test]
    fn test_memory_input_rejects_garbage() {
        crate::ffmpeg::init().unwrap();
        let garbage = Bytes::from(vec![0x5au8; 2048]);
        assert!(MemoryInput::open(garbage).is_err());
    }

    #[test]
    fn test_memory_output_create_and_drop() {
        crate::ffmpeg::init().unwrap();
        let out = MemoryOutput::new("webm", false);
        assert!(out.is_ok(), "webm muxer should exist: {:?}", out.err());
        assert!(MemoryOutput::new("no-such-muxer", true).is_err());
    }
}
