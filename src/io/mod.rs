//! Random-access byte sources for archives.
//!
//! [`ReadAt`] is what the ZIP parser reads through. It has two
//! implementations: [`RangedReader`] over a remote [`Resource`] fetched with
//! HTTP Range requests, and [`LocalFileReader`] over a file on disk.

mod http;
mod local;
mod resource;

pub use http::{CachedRangedReader, RangeReader, RangedReader};
pub use local::LocalFileReader;
pub use resource::Resource;

use async_trait::async_trait;

use crate::error::VfsResult;
use crate::vfs::VfsFile;

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Fill `buf` with the bytes starting at `offset`.
    ///
    /// Reading past the end of the source fails instead of returning a short
    /// count.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> VfsResult<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Streaming reader over `[offset, offset + size)`.
    fn section(&self, offset: u64, size: u64) -> VfsResult<Box<dyn VfsFile>>;

    /// A reader that keeps one upstream connection open across consecutive
    /// `read_at` calls, for scanning many small records. `None` when plain
    /// `read_at` is already cheap.
    fn session(&self) -> Option<Box<dyn ReadAt>> {
        None
    }

    /// Fails once the source is known to have changed underneath us.
    fn check(&self) -> VfsResult<()> {
        Ok(())
    }
}
