//! ZIP archives as VFS roots.
//!
//! Only the End of Central Directory record, the optional ZIP64 locator and
//! record, and the central directory are fetched when an archive is opened.
//! File data is read later from each entry's own byte window, so a large
//! remote archive costs a handful of range requests per served file.
//!
//! - [`structures`]: on-disk records and the per-entry metadata derived from
//!   them (mode, mtime, ETag)
//! - [`parser`]: locates and decodes those records through a [`ReadAt`]
//! - [`archive`]: [`ZipArchive`], a `Root` over the `public/` directory
//! - [`vfs`]: [`ZipVfs`], the shared cache of opened archives
//!
//! Entries are STORED or DEFLATE. Unix symlinks are entries with the
//! `S_IFLNK` mode whose content is the target text. Encrypted and multi-disk
//! archives are rejected.
//!
//! [`ReadAt`]: crate::io::ReadAt

pub mod archive;
mod deflate;
pub mod parser;
pub mod structures;
pub mod vfs;

pub use archive::ZipArchive;
pub use deflate::DeflateReader;
pub use parser::ZipParser;
pub use structures::*;
pub use vfs::ZipVfs;
