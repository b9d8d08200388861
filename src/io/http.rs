use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use super::{ReadAt, Resource};
use crate::error::{VfsError, VfsResult};
use crate::vfs::VfsFile;

type BodyStream = BoxStream<'static, reqwest::Result<Bytes>>;

enum State {
    /// No response open; the next read issues a request at `offset`.
    Idle,
    Connecting(BoxFuture<'static, VfsResult<BodyStream>>),
    Streaming { body: BodyStream, chunk: Bytes },
}

/// Seekable reader over a window `[start, start + size)` of a [`Resource`].
///
/// The ranged `GET` is only sent when data is first needed and its body is
/// reused by following reads until a seek moves the offset or the reader is
/// dropped, which releases the connection.
pub struct RangeReader {
    resource: Arc<Resource>,
    range_start: u64,
    range_size: u64,
    offset: u64,
    state: State,
}

impl RangeReader {
    pub fn new(resource: Arc<Resource>, offset: u64, size: u64) -> Self {
        Self {
            resource,
            range_start: offset,
            range_size: size,
            offset,
            state: State::Idle,
        }
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Current position relative to the start of the window.
    pub fn position(&self) -> u64 {
        self.offset - self.range_start
    }

    pub fn len(&self) -> u64 {
        self.range_size
    }

    pub fn is_empty(&self) -> bool {
        self.range_size == 0
    }

    fn range_end(&self) -> u64 {
        self.range_start + self.range_size
    }

    /// Whether a response body is currently held open.
    pub fn is_open(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    /// Moves the offset within the window. Returns the new position relative
    /// to the window start.
    pub fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let new_offset = match pos {
            SeekFrom::Start(n) => self.range_start as i128 + n as i128,
            SeekFrom::Current(n) => self.offset as i128 + n as i128,
            SeekFrom::End(n) => self.range_end() as i128 + n as i128,
        };

        if new_offset < self.range_start as i128 || new_offset > self.range_end() as i128 {
            return Err(VfsError::OutsideRange);
        }

        let new_offset = new_offset as u64;
        if new_offset != self.offset {
            // the open body no longer starts where we want to read
            self.close();
        }

        self.offset = new_offset;
        Ok(self.position())
    }

    /// Drops the in-flight response, if any.
    pub fn close(&mut self) {
        self.state = State::Idle;
    }

    /// Reads up to `buf.len()` bytes; `Ok(0)` at the end of the window.
    pub async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        AsyncReadExt::read(self, buf).await.map_err(VfsError::from_io)
    }

    fn validate(&self) -> VfsResult<()> {
        if self.range_end() > self.resource.size() {
            return Err(VfsError::InvalidRange);
        }

        if self.offset < self.range_start || self.offset >= self.range_end() {
            return Err(VfsError::InvalidRange);
        }

        Ok(())
    }

    fn connect(&self) -> BoxFuture<'static, VfsResult<BodyStream>> {
        let resource = self.resource.clone();
        let (offset, end) = (self.offset, self.range_end());

        Box::pin(async move {
            let res = resource.fetch_range(offset, end).await?;
            Ok(res.bytes_stream().boxed())
        })
    }
}

impl AsyncRead for RangeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let end = this.range_end();

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match &mut this.state {
                State::Idle => {
                    if this.offset >= end {
                        return Poll::Ready(Ok(()));
                    }
                    this.validate().map_err(VfsError::into_io)?;
                    this.state = State::Connecting(this.connect());
                }
                State::Connecting(fut) => match ready!(fut.as_mut().poll(cx)) {
                    Ok(body) => {
                        this.state = State::Streaming {
                            body,
                            chunk: Bytes::new(),
                        }
                    }
                    Err(e) => {
                        this.state = State::Idle;
                        return Poll::Ready(Err(e.into_io()));
                    }
                },
                State::Streaming { body, chunk } => {
                    if !chunk.is_empty() {
                        let wanted = (end - this.offset).min(buf.remaining() as u64) as usize;
                        let n = chunk.len().min(wanted);
                        buf.put_slice(&chunk[..n]);
                        chunk.advance(n);
                        this.offset += n as u64;

                        if this.offset >= end {
                            // a 200 response may carry more than the window
                            this.state = State::Idle;
                        }
                        return Poll::Ready(Ok(()));
                    }

                    match ready!(body.poll_next_unpin(cx)) {
                        Some(Ok(bytes)) => {
                            this.resource.add_transferred(bytes.len());
                            *chunk = bytes;
                        }
                        Some(Err(e)) => {
                            this.state = State::Idle;
                            return Poll::Ready(Err(VfsError::from_reqwest(e).into_io()));
                        }
                        None => {
                            this.state = State::Idle;
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "range response ended before the requested window",
                            )));
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl VfsFile for RangeReader {
    fn is_seekable(&self) -> bool {
        true
    }

    async fn seek_to(&mut self, offset: u64) -> VfsResult<u64> {
        self.seek(SeekFrom::Start(offset))
    }
}

/// [`ReadAt`] over a [`Resource`]: every call is its own ranged request.
#[derive(Debug, Clone)]
pub struct RangedReader {
    resource: Arc<Resource>,
}

impl RangedReader {
    pub fn new(resource: Arc<Resource>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Partitions the resource from `offset` with `size` bytes.
    pub fn section_reader(&self, offset: u64, size: u64) -> RangeReader {
        RangeReader::new(self.resource.clone(), offset, size)
    }

    /// A reader that keeps a single response open over the whole resource and
    /// only reopens when a call does not continue where the last one stopped.
    pub fn cached(&self) -> CachedRangedReader {
        CachedRangedReader {
            resource: self.resource.clone(),
            reader: tokio::sync::Mutex::new(RangeReader::new(
                self.resource.clone(),
                0,
                self.resource.size(),
            )),
        }
    }
}

fn check_bounds(size: u64, offset: u64, len: u64) -> VfsResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(VfsError::InvalidRange),
    }
}

#[async_trait]
impl ReadAt for RangedReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        check_bounds(self.size(), offset, buf.len() as u64)?;

        let mut reader = self.section_reader(offset, buf.len() as u64);
        reader.read_exact(buf).await.map_err(VfsError::from_io)?;

        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.resource.size()
    }

    fn section(&self, offset: u64, size: u64) -> VfsResult<Box<dyn VfsFile>> {
        check_bounds(self.size(), offset, size)?;
        Ok(Box::new(self.section_reader(offset, size)))
    }

    fn session(&self) -> Option<Box<dyn ReadAt>> {
        Some(Box::new(self.cached()))
    }

    fn check(&self) -> VfsResult<()> {
        self.resource.check()
    }
}

/// Cached-session [`ReadAt`], see [`RangedReader::cached`].
///
/// Dropping it releases the open response.
pub struct CachedRangedReader {
    resource: Arc<Resource>,
    reader: tokio::sync::Mutex<RangeReader>,
}

impl CachedRangedReader {
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }
}

#[async_trait]
impl ReadAt for CachedRangedReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        check_bounds(self.size(), offset, buf.len() as u64)?;

        let mut reader = self.reader.lock().await;
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(buf).await.map_err(VfsError::from_io)?;

        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.resource.size()
    }

    fn section(&self, offset: u64, size: u64) -> VfsResult<Box<dyn VfsFile>> {
        check_bounds(self.size(), offset, size)?;
        Ok(Box::new(RangeReader::new(self.resource.clone(), offset, size)))
    }

    fn check(&self) -> VfsResult<()> {
        self.resource.check()
    }
}
