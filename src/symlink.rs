//! Symlink resolution through a [`Root`].
//!
//! The walk never touches the host filesystem: absolute link targets restart
//! at the root and `..` can never climb above it.

use std::collections::VecDeque;

use crate::error::{VfsError, VfsResult};
use crate::vfs::Root;

/// Maximum number of symlinks followed while resolving one path.
pub const MAX_SYMLINK_HOPS: usize = 255;

/// Lexically cleans a slash-separated path relative to a root.
///
/// Empty and `.` components are dropped and `..` removes the previous one.
/// Returns `None` when `..` would climb above the root. The root itself is
/// `""`.
pub fn clean_path(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            part => parts.push(part),
        }
    }

    Some(parts.join("/"))
}

/// Resolves every symlink in `path`, returning a cleaned path relative to
/// `root` that contains no symlinks.
///
/// # Errors
///
/// - [`VfsError::PathEscapesRoot`] if `..` climbs above the root
/// - [`VfsError::TooManyLinks`] after [`MAX_SYMLINK_HOPS`] links
/// - [`VfsError::NotADirectory`] if a non-directory has components after it
/// - whatever the root reports for a missing component
pub async fn eval_symlinks(root: &dyn Root, path: &str) -> VfsResult<String> {
    let mut pending: VecDeque<String> = path.split('/').map(str::to_string).collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut hops = 0;

    while let Some(component) = pending.pop_front() {
        match component.as_str() {
            "" | "." => continue,
            ".." => {
                if resolved.pop().is_none() {
                    return Err(VfsError::path_escapes_root(path));
                }
                continue;
            }
            _ => {}
        }

        resolved.push(component);
        let current = resolved.join("/");
        let info = root.lstat(&current).await?;

        if info.is_symlink() {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(VfsError::TooManyLinks);
            }

            let target = root.readlink(&current).await?;
            if target.is_empty() {
                return Err(VfsError::not_found(current));
            }

            resolved.pop();
            if target.starts_with('/') {
                resolved.clear();
            }

            for part in target.split('/').rev() {
                pending.push_front(part.to_string());
            }
            continue;
        }

        if !info.is_dir() && pending.iter().any(|c| !c.is_empty() && c != ".") {
            return Err(VfsError::not_a_directory(current));
        }
    }

    Ok(resolved.join("/"))
}
