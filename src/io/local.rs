use super::ReadAt;
use async_trait::async_trait;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf, Take};

use crate::error::{VfsError, VfsResult};
use crate::vfs::VfsFile;

/// Local file reader with random access support
pub struct LocalFileReader {
    path: PathBuf,
    file: std::fs::File,
    size: u64,
}

impl LocalFileReader {
    pub fn new(path: &Path) -> VfsResult<Self> {
        let file = std::fs::File::open(path).map_err(VfsError::from_io)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    /// Opens a `file://` URL, accepted only below one of `allowed_paths`.
    pub fn from_url(url: &str, allowed_paths: &[PathBuf]) -> VfsResult<Self> {
        let path = url
            .strip_prefix("file://")
            .ok_or_else(|| VfsError::invalid_path(url))?;

        let path = std::fs::canonicalize(path).map_err(VfsError::from_io)?;

        let allowed = allowed_paths.iter().any(|allowed| {
            std::fs::canonicalize(allowed)
                .map(|allowed| path.starts_with(allowed))
                .unwrap_or(false)
        });
        if !allowed {
            return Err(VfsError::path_escapes_root(path.display().to_string()));
        }

        Self::new(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_at(buf, offset)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            self.file.seek_read(buf, offset)
        }
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        match offset.checked_add(buf.len() as u64) {
            Some(end) if end <= self.size => {}
            _ => return Err(VfsError::InvalidRange),
        }

        let mut filled = 0;
        while filled < buf.len() {
            let n = self.pread(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(VfsError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }

        Ok(filled)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn section(&self, offset: u64, size: u64) -> VfsResult<Box<dyn VfsFile>> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => {}
            _ => return Err(VfsError::InvalidRange),
        }

        // a fresh handle so concurrent sections don't share a file position
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;

        Ok(Box::new(LocalSection {
            inner: tokio::fs::File::from_std(file).take(size),
            start: offset,
            size,
        }))
    }
}

/// A byte window of a local archive.
struct LocalSection {
    inner: Take<tokio::fs::File>,
    start: u64,
    size: u64,
}

impl AsyncRead for LocalSection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[async_trait]
impl VfsFile for LocalSection {
    fn is_seekable(&self) -> bool {
        true
    }

    async fn seek_to(&mut self, offset: u64) -> VfsResult<u64> {
        if offset > self.size {
            return Err(VfsError::OutsideRange);
        }

        self.inner
            .get_mut()
            .seek(SeekFrom::Start(self.start + offset))
            .await?;
        self.inner.set_limit(self.size - offset);
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[tokio::test]
    async fn test_read_at_and_section() {
        let file = fixture(b"0123456789");
        let reader = LocalFileReader::new(file.path()).unwrap();

        let mut buf = [0u8; 4];
        reader.read_at(3, &mut buf).await.unwrap();
        assert_eq!(&buf, b"3456");

        let mut section = reader.section(5, 3).unwrap();
        let mut out = Vec::new();
        section.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"567");

        let mut section = reader.section(2, 6).unwrap();
        assert!(section.is_seekable());
        section.seek_to(4).await.unwrap();
        let mut out = Vec::new();
        section.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"67");
        assert!(matches!(section.seek_to(7).await, Err(VfsError::OutsideRange)));
    }

    #[tokio::test]
    async fn test_read_past_end_is_invalid_range() {
        let file = fixture(b"short");
        let reader = LocalFileReader::new(file.path()).unwrap();

        let mut buf = [0u8; 4];
        let err = reader.read_at(3, &mut buf).await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidRange));
        assert!(reader.section(4, 2).is_err());
    }

    #[test]
    fn test_file_url_outside_allowed_paths() {
        let file = fixture(b"zip");
        let url = format!("file://{}", file.path().display());

        let elsewhere = tempfile::tempdir().unwrap();
        let err = LocalFileReader::from_url(&url, &[elsewhere.path().to_path_buf()])
            .err()
            .unwrap();
        assert!(matches!(err, VfsError::PathEscapesRoot(_)));

        let parent = file.path().parent().unwrap().to_path_buf();
        assert!(LocalFileReader::from_url(&url, &[parent]).is_ok());
    }
}
