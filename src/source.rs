//! Byte-stream input.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::error::{ClipError, Result};

/// Default read size for `ReaderSource`
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Sequential asynchronous chunk reader. `Ok(None)` means end of data.
#[async_trait]
pub trait ByteSource: Send + 'static {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Adapts any `AsyncRead` (file, socket, pipe) into a `ByteSource`.
pub struct ReaderSource<R> {
    reader: R,
    chunk_size: usize,
}

impl<R> ReaderSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, READ_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl<R> ByteSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let n = self
            .reader
            .read_buf(&mut buf)
            .await
            .map_err(|e| ClipError::Stream(format!("read failed: {}", e)))?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(buf.freeze()))
        }
    }
}

/// A source fed by another task over a channel.
///
/// Sending `Err` reports a read failure; dropping every sender ends the data.
pub struct ChannelSource {
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self { rx }
    }

    /// Create a source together with the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl ByteSource for ChannelSource {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_source_chunks_until_eof() {
        let data: Vec<u8> = (0..10u8).collect();
        let mut src = ReaderSource::with_chunk_size(std::io::Cursor::new(data), 4);

        let mut collected = Vec::new();
        while let Some(chunk) = src.read_chunk().await.unwrap() {
            assert!(chunk.len() <= 4);
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, (0..10u8).collect::<Vec<_>>());
        assert!(src.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_source_error_and_end() {
        let (tx, mut src) = ChannelSource::channel(4);
        tx.send(Ok(Bytes::from_static(b"ftyp"))).await.unwrap();
        tx.send(Err(ClipError::Stream("socket reset".into())))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(src.read_chunk().await.unwrap().unwrap(), "ftyp");
        assert!(matches!(
            src.read_chunk().await,
            Err(ClipError::Stream(_))
        ));
        assert!(src.read_chunk().await.unwrap().is_none());
    }
}
