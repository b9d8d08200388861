use crate::error::{VfsError, VfsResult};
use crate::symlink::eval_symlinks;
use crate::vfs::Root;

/// Outcome of mapping a request onto a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A regular file, as a symlink-free path relative to the root.
    File(String),
    /// The path names a directory but the URL lacks the trailing slash.
    RedirectToSlash,
}

enum Failure {
    Directory(String),
    NoExtension(VfsError),
    Other(VfsError),
}

impl Failure {
    fn into_error(self) -> VfsError {
        match self {
            Failure::Directory(path) => VfsError::not_regular_file(path),
            Failure::NoExtension(e) | Failure::Other(e) => e,
        }
    }
}

/// Resolves a request's sub-path to the file to serve.
///
/// A directory is served through its `index.html` when `url_path` ends in
/// `/` and redirected otherwise. A path that does not resolve and lacks the
/// `.html` extension is retried once with `.html` appended.
pub async fn resolve_file_path(root: &dyn Root, sub_path: &str, url_path: &str) -> VfsResult<Resolved> {
    let mut result = resolve_path(root, sub_path).await;

    if let Err(Failure::Directory(_)) = result {
        if !url_path.ends_with('/') {
            return Ok(Resolved::RedirectToSlash);
        }
        // joined, not cleaned: the walk must see the path as supplied
        result = resolve_path(root, &format!("{sub_path}/index.html")).await;
    }

    if let Err(Failure::NoExtension(_)) = result {
        let html = format!("{}.html", sub_path.trim_end_matches('/'));
        result = resolve_path(root, &html).await;
    }

    result.map(Resolved::File).map_err(Failure::into_error)
}

/// Resolves a custom error page such as `404.html`, with no directory or
/// extension fallbacks.
pub async fn resolve_page(root: &dyn Root, name: &str) -> VfsResult<String> {
    resolve_path(root, name).await.map_err(Failure::into_error)
}

async fn resolve_path(root: &dyn Root, test_path: &str) -> Result<String, Failure> {
    let full_path = match eval_symlinks(root, test_path).await {
        Ok(path) => path,
        Err(e) if !test_path.ends_with(".html") => return Err(Failure::NoExtension(e)),
        Err(e) => return Err(Failure::Other(e)),
    };

    let info = root.lstat(&full_path).await.map_err(Failure::Other)?;

    if info.is_dir() {
        return Err(Failure::Directory(full_path));
    }

    // devices and the like are never served
    if !info.is_regular() {
        return Err(Failure::Other(VfsError::not_regular_file(full_path)));
    }

    Ok(full_path)
}
