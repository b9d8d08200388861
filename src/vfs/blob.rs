//! Blob storage backend.
//!
//! Objects live in a flat key space; directories only exist as key prefixes
//! up to a `/`. File modes and symlink targets travel as object metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf};

use super::{FileInfo, FileType, Root, Vfs, VfsFile};
use crate::config::BlobConfig;
use crate::error::{VfsError, VfsResult};
use crate::symlink::clean_path;

/// Metadata key holding the Unix mode as a decimal number.
pub const FILE_MODE_KEY: &str = "pages-filemode";
/// Metadata key holding a symlink's target.
pub const SYMLINK_TARGET_KEY: &str = "pages-symlink";

const DELIMITER: &str = "/";

/// Attributes stored with an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// One result of a delimited listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObject {
    pub key: String,
    /// A common prefix ending with the delimiter rather than an object.
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// The object store operations the blob backend needs.
#[async_trait]
pub trait Bucket: Send + Sync {
    async fn attributes(&self, key: &str) -> VfsResult<ObjectAttributes>;

    /// Objects and common prefixes starting with `prefix`, sorted by key.
    /// Common prefixes end with `delimiter`.
    async fn list(&self, prefix: &str, delimiter: &str) -> VfsResult<Vec<ListObject>>;

    /// Reads `length` bytes from `offset`, or to the end when `None`.
    async fn range_reader(&self, key: &str, offset: u64, length: Option<u64>) -> VfsResult<ObjectReader>;

    async fn write(&self, key: &str, contents: &[u8], metadata: HashMap<String, String>) -> VfsResult<()>;
}

/// A [`Bucket`] kept in a local directory.
///
/// Objects are plain files; their attributes sit in JSON sidecars under
/// `.attrs/`, which listings skip.
#[derive(Debug, Clone)]
pub struct FileBucket {
    dir: PathBuf,
}

const SIDECAR_DIR: &str = ".attrs";

impl FileBucket {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn object_path(&self, key: &str) -> VfsResult<PathBuf> {
        match clean_path(key) {
            Some(key) if !key.is_empty() && key.split('/').next() != Some(SIDECAR_DIR) => {
                Ok(self.dir.join(key))
            }
            _ => Err(VfsError::invalid_path(key)),
        }
    }

    fn sidecar_path(&self, key: &str) -> VfsResult<PathBuf> {
        let key = clean_path(key).ok_or_else(|| VfsError::invalid_path(key))?;
        Ok(self.dir.join(SIDECAR_DIR).join(format!("{key}.json")))
    }
}

#[async_trait]
impl Bucket for FileBucket {
    async fn attributes(&self, key: &str) -> VfsResult<ObjectAttributes> {
        let path = self.object_path(key)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(VfsError::from_io)?;
        if !metadata.is_file() {
            return Err(VfsError::not_found(key));
        }

        let mut attrs = match tokio::fs::read(self.sidecar_path(key)?).await {
            Ok(json) => serde_json::from_slice::<ObjectAttributes>(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ObjectAttributes::default(),
            Err(e) => return Err(e.into()),
        };

        attrs.size = metadata.len();
        if attrs.modified.is_none() {
            attrs.modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        }

        Ok(attrs)
    }

    async fn list(&self, prefix: &str, delimiter: &str) -> VfsResult<Vec<ListObject>> {
        if delimiter != DELIMITER {
            return Err(VfsError::invalid_path(format!("unsupported delimiter {delimiter:?}")));
        }

        let (dir, name_prefix) = match prefix.rsplit_once('/') {
            Some((dir, name)) => (format!("{dir}/"), name),
            None => (String::new(), prefix),
        };

        let mut read_dir = match tokio::fs::read_dir(self.dir.join(&dir)).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VfsError::from_io(e)),
        };

        let mut objects = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(name_prefix) || (dir.is_empty() && name == SIDECAR_DIR) {
                continue;
            }

            let metadata = entry.metadata().await?;
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            if metadata.is_dir() {
                objects.push(ListObject {
                    key: format!("{dir}{name}{DELIMITER}"),
                    is_dir: true,
                    modified,
                });
            } else {
                objects.push(ListObject {
                    key: format!("{dir}{name}"),
                    is_dir: false,
                    modified,
                });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn range_reader(&self, key: &str, offset: u64, length: Option<u64>) -> VfsResult<ObjectReader> {
        let mut file = tokio::fs::File::open(self.object_path(key)?)
            .await
            .map_err(VfsError::from_io)?;
        file.seek(SeekFrom::Start(offset)).await?;

        match length {
            Some(length) => Ok(Box::new(file.take(length))),
            None => Ok(Box::new(file)),
        }
    }

    async fn write(&self, key: &str, contents: &[u8], metadata: HashMap<String, String>) -> VfsResult<()> {
        let path = self.object_path(key)?;
        let sidecar = self.sidecar_path(key)?;

        for parent in [path.parent(), sidecar.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&path, contents).await?;

        let attrs = ObjectAttributes {
            size: contents.len() as u64,
            modified: Some(Utc::now()),
            metadata,
        };
        tokio::fs::write(&sidecar, serde_json::to_vec(&attrs)?).await?;

        Ok(())
    }
}

/// Resolved attributes of one key.
#[derive(Debug, Clone)]
struct Attributes {
    key: String,
    info: FileInfo,
    symlink_target: String,
}

/// [`Vfs`] over a [`Bucket`]; `root(path)` scopes it to the `path/` prefix.
///
/// Attribute lookups cost a listing plus a metadata request, so results are
/// kept in a bounded cache shared by all roots.
#[derive(Clone)]
pub struct BlobVfs {
    bucket: Arc<dyn Bucket>,
    cache: Cache<String, Arc<Attributes>>,
}

impl BlobVfs {
    pub fn new(bucket: Arc<dyn Bucket>, config: BlobConfig) -> Self {
        Self {
            bucket,
            cache: Cache::new(config.attribute_cache_capacity),
        }
    }

    /// Root scoped to `prefix`.
    pub fn blob_root(&self, prefix: &str) -> VfsResult<BlobRoot> {
        let prefix = clean_path(prefix).ok_or_else(|| VfsError::path_escapes_root(prefix))?;
        Ok(BlobRoot {
            vfs: self.clone(),
            prefix,
        })
    }

    /// Stores a regular file with mode `0644`.
    pub async fn write_file(&self, name: &str, contents: &[u8]) -> VfsResult<()> {
        let key = object_key(name)?;
        let metadata = HashMap::from([(FILE_MODE_KEY.to_string(), 0o100644.to_string())]);

        self.bucket.write(&key, contents, metadata).await?;
        self.cache.invalidate(&key);
        Ok(())
    }

    /// Stores a symlink pointing at `target`.
    pub async fn write_symlink(&self, name: &str, target: &str) -> VfsResult<()> {
        let key = object_key(name)?;
        let metadata = HashMap::from([
            (FILE_MODE_KEY.to_string(), 0o120777.to_string()),
            (SYMLINK_TARGET_KEY.to_string(), target.to_string()),
        ]);

        self.bucket.write(&key, &[], metadata).await?;
        self.cache.invalidate(&key);
        Ok(())
    }

    async fn attributes(&self, key: &str) -> VfsResult<Arc<Attributes>> {
        if let Some(attrs) = self.cache.get(key) {
            return Ok(attrs);
        }

        let attrs = Arc::new(self.fetch_attributes(key).await?);
        self.cache.insert(key.to_string(), attrs.clone());
        Ok(attrs)
    }

    async fn fetch_attributes(&self, key: &str) -> VfsResult<Attributes> {
        let base = key.rsplit('/').next().unwrap_or(key);

        if key.is_empty() {
            return Ok(Attributes {
                key: String::new(),
                info: FileInfo::from_unix_mode(base, 0, 0o040755),
                symlink_target: String::new(),
            });
        }

        let object = self.find_object(key).await?;
        if object.is_dir {
            return Ok(Attributes {
                key: key.to_string(),
                info: FileInfo::from_unix_mode(base, 0, 0o040755).with_modified(object.modified),
                symlink_target: String::new(),
            });
        }

        let attrs = self.bucket.attributes(key).await?;
        let mode = match attrs.metadata.get(FILE_MODE_KEY) {
            Some(mode) => mode.parse::<u32>().map_err(|_| {
                VfsError::InvalidResponse(format!("invalid file mode {mode:?} on {key}"))
            })?,
            None => 0o100644,
        };

        Ok(Attributes {
            key: key.to_string(),
            info: FileInfo::from_unix_mode(base, attrs.size, mode).with_modified(attrs.modified),
            symlink_target: attrs.metadata.get(SYMLINK_TARGET_KEY).cloned().unwrap_or_default(),
        })
    }

    /// Finds `key` as an object or as a directory prefix.
    async fn find_object(&self, key: &str) -> VfsResult<ListObject> {
        let dir_key = format!("{key}{DELIMITER}");

        for object in self.bucket.list(key, DELIMITER).await? {
            if object.key == key || object.key == dir_key {
                return Ok(object);
            }
            if object.key > dir_key {
                break;
            }
        }

        Err(VfsError::not_found(key))
    }
}

fn object_key(name: &str) -> VfsResult<String> {
    clean_path(name).ok_or_else(|| VfsError::path_escapes_root(name))
}

#[async_trait]
impl Vfs for BlobVfs {
    async fn root(&self, path: &str, _cache_key: &str) -> VfsResult<Arc<dyn Root>> {
        Ok(Arc::new(self.blob_root(path)?))
    }

    fn name(&self) -> &'static str {
        "blob"
    }
}

/// A [`Root`] over the keys below one prefix of a bucket.
pub struct BlobRoot {
    vfs: BlobVfs,
    prefix: String,
}

impl BlobRoot {
    fn key(&self, name: &str) -> VfsResult<String> {
        let name = object_key(name)?;
        Ok(match (self.prefix.is_empty(), name.is_empty()) {
            (true, _) => name,
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, name),
        })
    }

    async fn attributes(&self, name: &str) -> VfsResult<Arc<Attributes>> {
        let key = self.key(name)?;
        self.vfs.attributes(&key).await
    }
}

#[async_trait]
impl Root for BlobRoot {
    async fn lstat(&self, name: &str) -> VfsResult<FileInfo> {
        Ok(self.attributes(name).await?.info.clone())
    }

    async fn readlink(&self, name: &str) -> VfsResult<String> {
        let attrs = self.attributes(name).await?;
        if !attrs.info.is_symlink() {
            return Err(VfsError::not_symlink(name));
        }
        Ok(attrs.symlink_target.clone())
    }

    async fn open(&self, name: &str) -> VfsResult<Box<dyn VfsFile>> {
        let attrs = self.attributes(name).await?;
        if attrs.info.file_type != FileType::Regular {
            return Err(VfsError::not_regular_file(name));
        }

        Ok(Box::new(BlobReader::new(
            self.vfs.bucket.clone(),
            attrs.key.clone(),
            attrs.info.size,
        )))
    }
}

enum ReaderState {
    Idle,
    Opening(BoxFuture<'static, VfsResult<ObjectReader>>),
    Reading(ObjectReader),
}

/// Seekable reader over one object; every seek reopens at the new position.
pub struct BlobReader {
    bucket: Arc<dyn Bucket>,
    key: String,
    size: u64,
    pos: u64,
    state: ReaderState,
}

impl BlobReader {
    fn new(bucket: Arc<dyn Bucket>, key: String, size: u64) -> Self {
        Self {
            bucket,
            key,
            size,
            pos: 0,
            state: ReaderState::Idle,
        }
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                ReaderState::Idle => {
                    if this.pos >= this.size {
                        return Poll::Ready(Ok(()));
                    }
                    let (bucket, key, pos) = (this.bucket.clone(), this.key.clone(), this.pos);
                    this.state = ReaderState::Opening(Box::pin(async move {
                        bucket.range_reader(&key, pos, None).await
                    }));
                }
                ReaderState::Opening(fut) => match ready!(fut.as_mut().poll(cx)) {
                    Ok(reader) => this.state = ReaderState::Reading(reader),
                    Err(e) => {
                        this.state = ReaderState::Idle;
                        return Poll::Ready(Err(e.into_io()));
                    }
                },
                ReaderState::Reading(reader) => {
                    let before = buf.filled().len();
                    ready!(Pin::new(reader).poll_read(cx, buf))?;
                    this.pos += (buf.filled().len() - before) as u64;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

#[async_trait]
impl VfsFile for BlobReader {
    fn is_seekable(&self) -> bool {
        true
    }

    async fn seek_to(&mut self, offset: u64) -> VfsResult<u64> {
        if offset > self.size {
            return Err(VfsError::OutsideRange);
        }
        if offset != self.pos {
            self.state = ReaderState::Idle;
            self.pos = offset;
        }
        Ok(self.pos)
    }
}
