use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncSeekExt};

use crate::error::{VfsError, VfsResult};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Kind of a VFS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileType {
    /// Decodes the `S_IFMT` bits of a Unix mode.
    pub fn from_unix_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileType::Regular,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            // archives written by tools that leave the type bits empty
            0 => FileType::Regular,
            _ => FileType::Other,
        }
    }

    fn unix_bits(self) -> u32 {
        match self {
            FileType::Regular => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
            FileType::Other => 0,
        }
    }
}

/// Attributes of a VFS entry, as returned by `Root::lstat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub file_type: FileType,
    /// Permission bits (`0o7777` mask).
    pub permissions: u32,
    pub modified: Option<DateTime<Utc>>,
    /// Strong entity tag, when the backend knows a content fingerprint.
    pub etag: Option<String>,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u64, file_type: FileType) -> Self {
        let permissions = match file_type {
            FileType::Directory => 0o755,
            FileType::Symlink => 0o777,
            _ => 0o644,
        };

        Self {
            name: name.into(),
            size,
            file_type,
            permissions,
            modified: None,
            etag: None,
        }
    }

    /// Builds attributes from a full Unix mode (type bits + permissions).
    pub fn from_unix_mode(name: impl Into<String>, size: u64, mode: u32) -> Self {
        Self {
            permissions: mode & 0o7777,
            ..Self::new(name, size, FileType::from_unix_mode(mode))
        }
    }

    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    pub fn is_regular(&self) -> bool {
        self.file_type == FileType::Regular
    }

    /// Full Unix mode.
    pub fn mode(&self) -> u32 {
        self.file_type.unix_bits() | self.permissions
    }
}

/// An open file, typically the body of a response.
///
/// Files are read through [`AsyncRead`]; the ones backed by random-access
/// storage can also be repositioned, which the serving layer uses for client
/// byte ranges.
#[async_trait]
pub trait VfsFile: AsyncRead + Send + Unpin {
    fn is_seekable(&self) -> bool {
        false
    }

    /// Moves to `offset` bytes from the start of the file.
    async fn seek_to(&mut self, offset: u64) -> VfsResult<u64> {
        let _ = offset;
        Err(VfsError::NotSeekable)
    }
}

#[async_trait]
impl VfsFile for tokio::fs::File {
    fn is_seekable(&self) -> bool {
        true
    }

    async fn seek_to(&mut self, offset: u64) -> VfsResult<u64> {
        Ok(self.seek(std::io::SeekFrom::Start(offset)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_mode_decoding() {
        let link = FileInfo::from_unix_mode("link", 9, 0o120777);
        assert!(link.is_symlink());
        assert_eq!(link.mode(), 0o120777);

        let dir = FileInfo::from_unix_mode("dir", 0, 0o040755);
        assert!(dir.is_dir());

        let file = FileInfo::from_unix_mode("file", 3, 0o100644);
        assert!(file.is_regular());
        assert_eq!(file.permissions, 0o644);
    }

    #[test]
    fn test_missing_type_bits_mean_regular_file() {
        assert_eq!(FileType::from_unix_mode(0o644), FileType::Regular);
        assert_eq!(FileType::from_unix_mode(0o010644), FileType::Other);
    }
}
