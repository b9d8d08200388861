use async_compression::tokio::bufread::DeflateDecoder;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, BufReader, ReadBuf};

use crate::vfs::VfsFile;

const INPUT_BUFFER_SIZE: usize = 32 * 1024;

/// Inflates the raw DEFLATE data of one entry.
///
/// Entry data is pulled from the underlying reader only as the caller
/// consumes output, so a client that stops reading stops the transfer.
/// The stream must inflate to exactly the entry's uncompressed size.
pub struct DeflateReader<R> {
    decoder: DeflateDecoder<BufReader<R>>,
    size: u64,
    total_out: u64,
}

impl<R: AsyncRead + Unpin> DeflateReader<R> {
    pub fn new(inner: R, size: u64) -> Self {
        Self {
            decoder: DeflateDecoder::new(BufReader::with_capacity(INPUT_BUFFER_SIZE, inner)),
            size,
            total_out: 0,
        }
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DeflateReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.decoder).poll_read(cx, buf))?;
        let produced = (buf.filled().len() - before) as u64;
        this.total_out += produced;

        if this.total_out > this.size {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "deflate stream longer than its entry",
            )));
        }
        if produced == 0 && this.total_out < this.size {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "deflate stream ended prematurely",
            )));
        }

        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncRead + Send + Unpin> VfsFile for DeflateReader<R> {}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;
    use tokio::io::AsyncReadExt;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_inflates_whole_stream() {
        let data: Vec<u8> = (0..200_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
        let compressed = deflate(&data);

        let mut reader = DeflateReader::new(compressed.as_slice(), data.len() as u64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, data);
        assert_eq!(reader.total_out(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_truncated_stream_fails() {
        let data = vec![7u8; 10_000];
        let compressed = deflate(&data);
        let truncated = &compressed[..compressed.len() / 2];

        let mut reader = DeflateReader::new(truncated, data.len() as u64);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_size_mismatch_fails() {
        let data = vec![7u8; 10_000];
        let compressed = deflate(&data);

        let mut reader = DeflateReader::new(compressed.as_slice(), 100);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut reader = DeflateReader::new(compressed.as_slice(), 20_000);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
