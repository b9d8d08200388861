//! # pages-vfs
//!
//! A virtual file system for serving static sites out of local directories,
//! ZIP archives fetched lazily over HTTP Range requests, and blob storage
//! buckets, all behind one [`Root`] interface.
//!
//! Remote archives are never downloaded in full: opening one reads the End of
//! Central Directory record and the central directory, and every file is then
//! streamed from its own byte window of the archive.
//!
//! ## Features
//!
//! - Path confinement: no name, symlink target or open file resolves outside
//!   its root
//! - Symlink resolution through any backend with [`eval_symlinks`]
//! - ZIP64 archives, STORED and DEFLATE entries
//! - A shared archive cache that opens each archive once under concurrent load
//! - [`FileServer`]: `index.html` resolution, precompressed variants,
//!   conditional requests, byte ranges and custom 404 pages
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pages_vfs::{FileServer, LookupPath, ServeRequest, ZipConfig, ZipVfs};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let vfs = ZipVfs::new(ZipConfig::default())?;
//!     let server = FileServer::new(Arc::new(vfs));
//!
//!     let lookup = LookupPath {
//!         path: "https://example.com/artifacts/site.zip".to_string(),
//!         sha256: "d2a84f4b8b650937ec8f73cd8be2c74add5a911ba64df27458ed8229da804a26".to_string(),
//!         ..LookupPath::default()
//!     };
//!
//!     let response = server.serve(&lookup, &ServeRequest::get("/", "")).await;
//!     println!("{}", response.status);
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod serving;
pub mod symlink;
pub mod vfs;
pub mod zip;

pub use cli::Cli;
pub use config::{BlobConfig, ZipConfig};
pub use error::{VfsError, VfsResult};
pub use io::{CachedRangedReader, LocalFileReader, RangeReader, RangedReader, ReadAt, Resource};
pub use serving::{Body, FileServer, LookupPath, ServeRequest, ServeResponse};
pub use symlink::{MAX_SYMLINK_HOPS, clean_path, eval_symlinks};
pub use vfs::blob::{BlobRoot, BlobVfs, Bucket, FileBucket};
pub use vfs::local::{LocalRoot, LocalVfs};
pub use vfs::{FileInfo, FileType, InstrumentedVfs, Root, Vfs, VfsFile};
pub use zip::{ZipArchive, ZipFileEntry, ZipVfs};
