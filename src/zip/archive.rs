use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;

use super::deflate::DeflateReader;
use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};
use crate::error::{VfsError, VfsResult};
use crate::io::{ReadAt, Resource};
use crate::symlink::clean_path;
use crate::vfs::{FileInfo, FileType, Root, VfsFile};

/// Only entries below this prefix are served.
pub const PUBLIC_DIR: &str = "public/";

/// One indexed archive member.
#[derive(Debug)]
struct Entry {
    header: ZipFileEntry,
    data_offset: OnceCell<u64>,
    symlink_target: OnceCell<String>,
}

/// A [`Root`] over the `public/` directory of one ZIP archive.
///
/// Only the central directory is read up front. Member data is streamed from
/// the source when a file is opened.
pub struct ZipArchive {
    reader: Arc<dyn ReadAt>,
    resource: Option<Arc<Resource>>,
    files: HashMap<String, Entry>,
    /// Real directory entries, or `None` for directories only implied by a
    /// member's path.
    directories: HashMap<String, Option<ZipFileEntry>>,
    max_symlink_size: usize,
}

impl ZipArchive {
    /// Reads the central directory from `reader` and indexes the `public/`
    /// entries.
    pub async fn open(
        reader: Arc<dyn ReadAt>,
        resource: Option<Arc<Resource>>,
        max_symlink_size: usize,
    ) -> VfsResult<Self> {
        // many small reads in a row, keep one response open while scanning
        let session = reader.session();
        let source: &dyn ReadAt = session.as_deref().unwrap_or(reader.as_ref());
        let entries = ZipParser::new(source).list_files().await?;
        drop(session);

        let mut files = HashMap::new();
        let mut directories = HashMap::new();

        for header in entries {
            let Some(name) = header
                .file_name
                .strip_prefix(PUBLIC_DIR)
                .and_then(clean_path)
            else {
                continue;
            };

            add_parent_directories(&mut directories, &name);

            if header.is_directory || FileType::from_unix_mode(header.mode()) == FileType::Directory {
                directories.insert(name, Some(header));
            } else if !name.is_empty() {
                files.insert(
                    name,
                    Entry {
                        header,
                        data_offset: OnceCell::new(),
                        symlink_target: OnceCell::new(),
                    },
                );
            }
        }

        tracing::debug!(
            files = files.len(),
            directories = directories.len(),
            "zip archive indexed"
        );

        Ok(Self {
            reader,
            resource,
            files,
            directories,
            max_symlink_size,
        })
    }

    /// Fails once the underlying source is known to have changed.
    pub fn check(&self) -> VfsResult<()> {
        self.reader.check()
    }

    pub fn resource(&self) -> Option<&Arc<Resource>> {
        self.resource.as_ref()
    }

    /// Points the remote resource at a new URL for the same object.
    pub fn refresh_url(&self, url: &str) {
        if let Some(resource) = &self.resource
            && resource.url() != url
        {
            resource.set_url(url);
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// All indexed members, sorted by name. Directories end with `/`.
    pub fn entries(&self) -> Vec<(String, FileInfo)> {
        let mut entries: Vec<_> = self
            .files
            .iter()
            .map(|(name, entry)| (name.clone(), file_info(name, &entry.header)))
            .chain(
                self.directories
                    .iter()
                    .filter(|(name, _)| !name.is_empty())
                    .map(|(name, dir)| (format!("{name}/"), directory_info(name, dir.as_ref()))),
            )
            .collect();

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn find(&self, name: &str) -> VfsResult<Found<'_>> {
        let name = clean_path(name).ok_or_else(|| VfsError::not_found(name))?;

        if let Some(entry) = self.files.get(&name) {
            return Ok(Found::File(name, entry));
        }

        match self.directories.get(&name) {
            Some(dir) => Ok(Found::Directory(name, dir.as_ref())),
            None => Err(VfsError::not_found(name)),
        }
    }

    async fn data_offset(&self, entry: &Entry) -> VfsResult<u64> {
        let offset = entry
            .data_offset
            .get_or_try_init(|| async {
                ZipParser::new(self.reader.as_ref())
                    .get_data_offset(&entry.header)
                    .await
            })
            .await?;
        Ok(*offset)
    }

    async fn open_entry(&self, entry: &Entry) -> VfsResult<Box<dyn VfsFile>> {
        let header = &entry.header;
        if let CompressionMethod::Unknown(method) = header.compression_method {
            return Err(VfsError::UnsupportedCompression(method));
        }

        let offset = self.data_offset(entry).await?;
        let section = self.reader.section(offset, header.compressed_size)?;

        match header.compression_method {
            CompressionMethod::Deflate => Ok(Box::new(DeflateReader::new(
                section,
                header.uncompressed_size,
            ))),
            _ => Ok(section),
        }
    }
}

enum Found<'a> {
    File(String, &'a Entry),
    Directory(String, Option<&'a ZipFileEntry>),
}

fn add_parent_directories(directories: &mut HashMap<String, Option<ZipFileEntry>>, name: &str) {
    let mut dir = name;
    while let Some((parent, _)) = dir.rsplit_once('/') {
        if directories.contains_key(parent) {
            return;
        }
        directories.insert(parent.to_string(), None);
        dir = parent;
    }
    directories.entry(String::new()).or_insert(None);
}

fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn file_info(name: &str, header: &ZipFileEntry) -> FileInfo {
    let info = FileInfo::from_unix_mode(base_name(name), header.uncompressed_size, header.mode())
        .with_modified(header.modified());

    if info.is_regular() {
        info.with_etag(Some(header.etag()))
    } else {
        info
    }
}

fn directory_info(name: &str, header: Option<&ZipFileEntry>) -> FileInfo {
    match header {
        Some(header) => {
            FileInfo::new(base_name(name), 0, FileType::Directory).with_modified(header.modified())
        }
        None => FileInfo::new(base_name(name), 0, FileType::Directory),
    }
}

#[async_trait]
impl Root for ZipArchive {
    async fn lstat(&self, name: &str) -> VfsResult<FileInfo> {
        match self.find(name)? {
            Found::File(name, entry) => Ok(file_info(&name, &entry.header)),
            Found::Directory(name, header) => Ok(directory_info(&name, header)),
        }
    }

    async fn readlink(&self, name: &str) -> VfsResult<String> {
        let entry = match self.find(name)? {
            Found::File(_, entry) if entry.header.is_symlink() => entry,
            Found::File(name, _) | Found::Directory(name, _) => {
                return Err(VfsError::not_symlink(name));
            }
        };

        let target = entry
            .symlink_target
            .get_or_try_init(|| async {
                let mut file = self.open_entry(entry).await?;
                let mut target = Vec::new();
                // one byte over the limit is enough to tell it is too large
                (&mut file)
                    .take(self.max_symlink_size as u64 + 1)
                    .read_to_end(&mut target)
                    .await
                    .map_err(VfsError::from_io)?;
                Ok::<_, VfsError>(String::from_utf8_lossy(&target).into_owned())
            })
            .await?;

        if target.len() > self.max_symlink_size {
            return Err(VfsError::SymlinkTooLarge(entry.header.file_name.clone()));
        }

        Ok(target.clone())
    }

    async fn open(&self, name: &str) -> VfsResult<Box<dyn VfsFile>> {
        match self.find(name)? {
            Found::File(name, entry) => {
                if FileType::from_unix_mode(entry.header.mode()) != FileType::Regular {
                    return Err(VfsError::not_regular_file(name));
                }
                self.open_entry(entry).await
            }
            Found::Directory(name, _) => Err(VfsError::not_regular_file(name)),
        }
    }
}

impl std::fmt::Debug for ZipArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipArchive")
            .field("resource", &self.resource)
            .field("files", &self.files.len())
            .field("directories", &self.directories.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalFileReader;
    use ::zip::write::SimpleFileOptions;
    use std::io::Write;

    fn build_archive() -> tempfile::NamedTempFile {
        let mut out = tempfile::NamedTempFile::new().unwrap();
        {
            let mut zip = ::zip::ZipWriter::new(out.as_file_mut());
            let stored = SimpleFileOptions::default()
                .compression_method(::zip::CompressionMethod::Stored);
            let deflated = SimpleFileOptions::default()
                .compression_method(::zip::CompressionMethod::Deflated);

            zip.start_file("public/index.html", stored).unwrap();
            zip.write_all(b"hello").unwrap();
            zip.start_file("public/docs/guide/deflated.txt", deflated).unwrap();
            zip.write_all(&b"compressible ".repeat(100)).unwrap();
            zip.add_directory("public/empty/", stored).unwrap();
            zip.add_symlink("public/link.html", "index.html", stored).unwrap();
            zip.add_symlink("public/long", "x".repeat(300), stored).unwrap();
            zip.start_file("private/secret.txt", stored).unwrap();
            zip.write_all(b"secret").unwrap();
            zip.finish().unwrap();
        }
        out
    }

    async fn open_archive(file: &tempfile::NamedTempFile) -> ZipArchive {
        let reader = Arc::new(LocalFileReader::new(file.path()).unwrap());
        ZipArchive::open(reader, None, 256).await.unwrap()
    }

    async fn read_all(mut file: Box<dyn VfsFile>) -> Vec<u8> {
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_only_public_entries_are_indexed() {
        let file = build_archive();
        let archive = open_archive(&file).await;

        assert!(archive.lstat("index.html").await.is_ok());
        assert!(archive.lstat("../private/secret.txt").await.unwrap_err().is_not_found());
        assert!(archive.lstat("private/secret.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_synthetic_directories() {
        let file = build_archive();
        let archive = open_archive(&file).await;

        for dir in ["", "docs", "docs/guide", "empty", "docs/guide/"] {
            assert!(archive.lstat(dir).await.unwrap().is_dir(), "{dir}");
        }

        let err = archive.open("docs").await.err().unwrap();
        assert!(matches!(err, VfsError::NotRegularFile(_)));
    }

    #[tokio::test]
    async fn test_open_stored_and_deflated() {
        let file = build_archive();
        let archive = open_archive(&file).await;

        assert_eq!(read_all(archive.open("index.html").await.unwrap()).await, b"hello");
        assert_eq!(
            read_all(archive.open("docs/guide/deflated.txt").await.unwrap()).await,
            b"compressible ".repeat(100)
        );

        let info = archive.lstat("index.html").await.unwrap();
        assert_eq!(info.size, 5);
        assert!(info.etag.is_some());
        assert!(info.modified.is_some());
    }

    #[tokio::test]
    async fn test_readlink() {
        let file = build_archive();
        let archive = open_archive(&file).await;

        assert!(archive.lstat("link.html").await.unwrap().is_symlink());
        assert_eq!(archive.readlink("link.html").await.unwrap(), "index.html");
        // memoized
        assert_eq!(archive.readlink("link.html").await.unwrap(), "index.html");

        assert!(matches!(
            archive.readlink("index.html").await,
            Err(VfsError::NotSymlink(_))
        ));
        assert!(matches!(
            archive.readlink("long").await,
            Err(VfsError::SymlinkTooLarge(_))
        ));
        assert!(matches!(
            archive.open("link.html").await.err().unwrap(),
            VfsError::NotRegularFile(_)
        ));
    }

    #[tokio::test]
    async fn test_entries_listing() {
        let file = build_archive();
        let archive = open_archive(&file).await;

        let names: Vec<String> = archive.entries().into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            [
                "docs/",
                "docs/guide/",
                "docs/guide/deflated.txt",
                "empty/",
                "index.html",
                "link.html",
                "long",
            ]
        );
        assert_eq!(archive.file_count(), 4);
    }
}
