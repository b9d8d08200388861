use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{FileInfo, FileType, Root, Vfs, VfsFile};
use crate::error::{VfsError, VfsResult};
use crate::symlink::clean_path;

/// [`Vfs`] over directories of the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalVfs;

impl LocalVfs {
    pub fn new() -> Self {
        Self
    }

    /// Resolves `path` to a canonical directory and returns its root.
    pub async fn local_root(&self, path: &str) -> VfsResult<LocalRoot> {
        let root_path = tokio::fs::canonicalize(path)
            .await
            .map_err(VfsError::from_io)?;

        let metadata = tokio::fs::symlink_metadata(&root_path)
            .await
            .map_err(VfsError::from_io)?;
        if !metadata.is_dir() {
            return Err(VfsError::not_a_directory(path));
        }

        Ok(LocalRoot { root_path })
    }
}

#[async_trait]
impl Vfs for LocalVfs {
    async fn root(&self, path: &str, _cache_key: &str) -> VfsResult<Arc<dyn Root>> {
        Ok(Arc::new(self.local_root(path).await?))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// A [`Root`] confined to one directory.
///
/// Names are cleaned lexically before touching the disk, and `open` refuses
/// to follow a final symlink, so nothing outside `root_path` is reachable
/// without going through [`crate::symlink::eval_symlinks`].
#[derive(Debug, Clone)]
pub struct LocalRoot {
    root_path: PathBuf,
}

impl LocalRoot {
    pub fn path(&self) -> &Path {
        &self.root_path
    }

    fn validate_path(&self, name: &str) -> VfsResult<PathBuf> {
        let cleaned = clean_path(name).ok_or_else(|| {
            VfsError::path_escapes_root(format!(
                "{name:?} should be in {:?}",
                self.root_path.display().to_string()
            ))
        })?;

        if cleaned.is_empty() {
            Ok(self.root_path.clone())
        } else {
            Ok(self.root_path.join(cleaned))
        }
    }
}

fn file_info(name: &str, metadata: &std::fs::Metadata) -> FileInfo {
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_file() {
        FileType::Regular
    } else {
        FileType::Other
    };

    let base = name.rsplit('/').find(|c| !c.is_empty()).unwrap_or("");
    let mut info = FileInfo::new(base, metadata.len(), kind)
        .with_modified(metadata.modified().ok().map(DateTime::<Utc>::from));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        info.permissions = metadata.permissions().mode() & 0o7777;
    }

    info
}

#[async_trait]
impl Root for LocalRoot {
    async fn lstat(&self, name: &str) -> VfsResult<FileInfo> {
        let full_path = self.validate_path(name)?;
        let metadata = tokio::fs::symlink_metadata(&full_path)
            .await
            .map_err(VfsError::from_io)?;

        Ok(file_info(name, &metadata))
    }

    async fn readlink(&self, name: &str) -> VfsResult<String> {
        let full_path = self.validate_path(name)?;
        let target = tokio::fs::read_link(&full_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidInput {
                VfsError::not_symlink(name)
            } else {
                VfsError::from_io(e)
            }
        })?;

        // absolute targets inside the root become root-absolute
        if let Ok(inside) = target.strip_prefix(&self.root_path) {
            return Ok(format!("/{}", inside.to_string_lossy()));
        }

        Ok(target.to_string_lossy().into_owned())
    }

    async fn open(&self, name: &str) -> VfsResult<Box<dyn VfsFile>> {
        let full_path = self.validate_path(name)?;

        let mut options = tokio::fs::OpenOptions::new();
        options.read(true);
        #[cfg(unix)]
        options.custom_flags(libc::O_NOFOLLOW);

        let file = options.open(&full_path).await.map_err(|e| {
            #[cfg(unix)]
            if e.raw_os_error() == Some(libc::ELOOP) {
                return VfsError::not_regular_file(name);
            }
            VfsError::from_io(e)
        })?;

        // stat the opened handle, the path may have been swapped meanwhile
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(VfsError::not_regular_file(name));
        }

        Ok(Box::new(file))
    }
}
