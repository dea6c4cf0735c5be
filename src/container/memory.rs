//! In-memory `Write + Seek` target for the MP4 muxer
//!
//! The muxer owns one handle and the container writer keeps a clone, so the
//! bytes written so far can be sliced out while the muxer is still alive.
//! The `mp4` writer seeks back to patch the `mdat` size, so positions
//! before the end of the buffer may be overwritten until it is finalized.

use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

/// Seekable byte sink backed by a shared `Vec<u8>`.
#[derive(Debug, Clone)]
pub struct MemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
    position: u64,
}

impl MemoryWriter {
    /// Create a new memory writer
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::with_capacity(4096))),
            position: 0,
        }
    }

    /// Total bytes in the buffer
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Copy of `start..end`, clamped to the buffer
    pub fn slice(&self, start: usize, end: usize) -> Bytes {
        let buffer = self.buffer.lock();
        let end = end.min(buffer.len());
        let start = start.min(end);
        Bytes::copy_from_slice(&buffer[start..end])
    }

    /// Copy of everything from `start` to the end
    pub fn tail(&self, start: usize) -> Bytes {
        self.slice(start, usize::MAX)
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self.buffer.lock();
        let pos = self.position as usize;
        let end = pos + buf.len();

        if end > buffer.len() {
            buffer.resize(end, 0);
        }

        buffer[pos..end].copy_from_slice(buf);
        self.position += buf.len() as u64;

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryWriter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let buffer_len = self.buffer.lock().len() as i64;

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
