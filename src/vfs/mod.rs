//! Backend-neutral VFS contract.
//!
//! A [`Vfs`] hands out a [`Root`] for a backing location (a directory, an
//! archive URL, a bucket prefix). A `Root` answers `lstat`, `readlink` and
//! `open` for slash-separated names relative to itself and never lets a name
//! resolve outside its boundary. Symlinks are reported, not followed; callers
//! walk them with [`crate::symlink::eval_symlinks`].

pub mod blob;
mod file;
pub mod local;

pub use file::{FileInfo, FileType, VfsFile};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::VfsResult;

/// A directory-like view of some backing store.
#[async_trait]
pub trait Root: Send + Sync {
    /// File attributes without following a final symlink.
    async fn lstat(&self, name: &str) -> VfsResult<FileInfo>;

    /// Target text of the symlink at `name`.
    async fn readlink(&self, name: &str) -> VfsResult<String>;

    /// Opens a regular file for streaming. Refuses symlinks and directories.
    async fn open(&self, name: &str) -> VfsResult<Box<dyn VfsFile>>;
}

/// Factory of [`Root`]s for one kind of backing store.
#[async_trait]
pub trait Vfs: Send + Sync {
    /// Returns the root for `path`. `cache_key` identifies the content for
    /// caching backends (e.g. the SHA-256 of an archive) and may be ignored.
    async fn root(&self, path: &str, cache_key: &str) -> VfsResult<Arc<dyn Root>>;

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<V: Vfs + ?Sized> Vfs for Arc<V> {
    async fn root(&self, path: &str, cache_key: &str) -> VfsResult<Arc<dyn Root>> {
        (**self).root(path, cache_key).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Wraps a [`Vfs`] so every root operation emits a trace event.
pub struct InstrumentedVfs<V> {
    inner: V,
}

impl<V: Vfs> InstrumentedVfs<V> {
    pub fn new(inner: V) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &V {
        &self.inner
    }
}

#[async_trait]
impl<V: Vfs> Vfs for InstrumentedVfs<V> {
    async fn root(&self, path: &str, cache_key: &str) -> VfsResult<Arc<dyn Root>> {
        let result = self.inner.root(path, cache_key).await;

        if let Err(e) = &result {
            tracing::debug!(vfs = self.inner.name(), root_path = %path, error = %e, "root call failed");
        }

        let root = result?;
        Ok(Arc::new(InstrumentedRoot {
            root,
            name: self.inner.name(),
            root_path: path.to_string(),
        }))
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

struct InstrumentedRoot {
    root: Arc<dyn Root>,
    name: &'static str,
    root_path: String,
}

#[async_trait]
impl Root for InstrumentedRoot {
    async fn lstat(&self, name: &str) -> VfsResult<FileInfo> {
        let result = self.root.lstat(name).await;
        tracing::trace!(
            vfs = self.name,
            root_path = %self.root_path,
            path = name,
            error = result.as_ref().err().map(tracing::field::display),
            "lstat call"
        );
        result
    }

    async fn readlink(&self, name: &str) -> VfsResult<String> {
        let result = self.root.readlink(name).await;
        tracing::trace!(
            vfs = self.name,
            root_path = %self.root_path,
            path = name,
            target = result.as_deref().ok(),
            error = result.as_ref().err().map(tracing::field::display),
            "readlink call"
        );
        result
    }

    async fn open(&self, name: &str) -> VfsResult<Box<dyn VfsFile>> {
        let result = self.root.open(name).await;
        tracing::trace!(
            vfs = self.name,
            root_path = %self.root_path,
            path = name,
            error = result.as_ref().err().map(tracing::field::display),
            "open call"
        );
        result
    }
}
