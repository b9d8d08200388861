//! Serving static-site files out of any [`Vfs`].
//!
//! [`FileServer::serve`] maps a request onto a file of the site's root and
//! builds the full response: `index.html` and `.html` fallbacks, trailing
//! slash redirects, precompressed `.br`/`.gz` siblings, content type,
//! caching headers, conditional requests, single byte ranges and the site's
//! own `404.html`.

mod conditional;
mod content_type;
mod encoding;
mod resolve;

pub use conditional::{ByteRange, Precondition, check_preconditions, http_date, parse_range};
pub use content_type::detect_content_type;
pub use encoding::{Variant, negotiate_variant};
pub use resolve::{Resolved, resolve_file_path, resolve_page};

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite};

use crate::error::{VfsError, VfsResult};
use crate::vfs::{FileInfo, Root, Vfs, VfsFile};

const NOT_FOUND_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>The page you're looking for could not be found (404)</title></head>\n<body>\n<h1>404</h1>\n<p>The page you're looking for could not be found.</p>\n</body>\n</html>\n";

const INTERNAL_ERROR_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>We're sorry, but something went wrong (500)</title></head>\n<body>\n<h1>500</h1>\n<p>Whoops, something went wrong on our end.</p>\n</body>\n</html>\n";

/// Where a site's content lives, as resolved by the domain lookup.
#[derive(Debug, Clone, Default)]
pub struct LookupPath {
    /// URL prefix the site is served under.
    pub prefix: String,
    /// Directory, archive URL or bucket prefix handed to the [`Vfs`].
    pub path: String,
    /// Content identity (archive SHA-256), the cache key of caching backends.
    pub sha256: String,
    pub has_access_control: bool,
    pub is_https_only: bool,
    pub project_id: u64,
    pub is_namespace_project: bool,
}

/// The parts of an HTTP request the file server looks at.
#[derive(Debug, Clone)]
pub struct ServeRequest {
    pub method: Method,
    /// Path of the request URL, used for directory redirects.
    pub url_path: String,
    /// Raw query string, without the `?`.
    pub query: Option<String>,
    /// Path relative to the site root.
    pub sub_path: String,
    pub headers: HeaderMap,
}

impl ServeRequest {
    pub fn new(method: Method, url_path: impl Into<String>, sub_path: impl Into<String>) -> Self {
        Self {
            method,
            url_path: url_path.into(),
            query: None,
            sub_path: sub_path.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn get(url_path: impl Into<String>, sub_path: impl Into<String>) -> Self {
        Self::new(Method::GET, url_path, sub_path)
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Adds a header; values that are not valid header text are dropped.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }
}

/// Response body.
pub enum Body {
    Empty,
    Bytes(Bytes),
    /// `len` bytes streamed from the current position of `file`.
    File { file: Box<dyn VfsFile>, len: u64 },
}

impl Body {
    /// Streams the body into `writer`, returning the bytes written.
    pub async fn copy_to<W: AsyncWrite + Unpin + ?Sized>(self, writer: &mut W) -> VfsResult<u64> {
        match self {
            Body::Empty => Ok(0),
            Body::Bytes(bytes) => {
                tokio::io::AsyncWriteExt::write_all(writer, &bytes).await?;
                Ok(bytes.len() as u64)
            }
            Body::File { file, len } => {
                let mut limited = file.take(len);
                let copied = tokio::io::copy(&mut limited, writer)
                    .await
                    .map_err(VfsError::from_io)?;
                if copied < len {
                    return Err(VfsError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("body ended after {copied} of {len} bytes"),
                    )));
                }
                Ok(copied)
            }
        }
    }

    /// Buffers the whole body.
    pub async fn into_bytes(self) -> VfsResult<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Bytes(bytes) => Ok(bytes),
            body => {
                let mut buf = Vec::new();
                body.copy_to(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Body::File { len, .. } => f.debug_struct("File").field("len", len).finish(),
        }
    }
}

#[derive(Debug)]
pub struct ServeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl ServeResponse {
    fn new(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    fn page(status: StatusCode, page: &'static str, method: &Method) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(page.len()));

        let body = if method == Method::HEAD {
            Body::Empty
        } else {
            Body::Bytes(Bytes::from_static(page.as_bytes()))
        };
        Self::new(status, headers, body)
    }

    fn not_found(method: &Method) -> Self {
        Self::page(StatusCode::NOT_FOUND, NOT_FOUND_PAGE, method)
    }

    fn internal_error(method: &Method) -> Self {
        Self::page(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_PAGE, method)
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: impl Into<String>) {
    if let Ok(value) = HeaderValue::try_from(value.into()) {
        headers.insert(name, value);
    }
}

/// Serves files of the sites found through one [`Vfs`].
pub struct FileServer {
    vfs: Arc<dyn Vfs>,
}

impl FileServer {
    pub fn new(vfs: Arc<dyn Vfs>) -> Self {
        Self { vfs }
    }

    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    /// Builds the response for `request` against the site at `lookup`.
    ///
    /// Never fails: missing content becomes a 404 (the site's `404.html`
    /// when it has one) and other failures a generic 500.
    pub async fn serve(&self, lookup: &LookupPath, request: &ServeRequest) -> ServeResponse {
        let root = match self.vfs.root(&lookup.path, &lookup.sha256).await {
            Ok(root) => root,
            Err(e) => return self.root_error(lookup, request, e),
        };

        match resolve_file_path(root.as_ref(), &request.sub_path, &request.url_path).await {
            Ok(Resolved::File(path)) => {
                match serve_file(root.as_ref(), request, &path, lookup.has_access_control).await {
                    Ok(response) => response,
                    Err(e) => self.serve_error(lookup, request, "serve file", e),
                }
            }
            Ok(Resolved::RedirectToSlash) => redirect_to_slash(request),
            Err(e) => {
                if !e.is_not_found() {
                    tracing::debug!(
                        vfs = self.vfs.name(),
                        path = %request.sub_path,
                        error = %e,
                        "resolve path failed"
                    );
                }
                self.serve_not_found(root.as_ref(), lookup, request).await
            }
        }
    }

    async fn serve_not_found(&self, root: &dyn Root, lookup: &LookupPath, request: &ServeRequest) -> ServeResponse {
        let Ok(page) = resolve_page(root, "404.html").await else {
            return ServeResponse::not_found(&request.method);
        };

        match serve_custom_file(root, request, StatusCode::NOT_FOUND, &page).await {
            Ok(response) => response,
            Err(e) if matches!(e.inner(), VfsError::Canceled) => {
                tracing::warn!(error = %e, "user cancelled request");
                ServeResponse::not_found(&request.method)
            }
            Err(e) => self.serve_error(lookup, request, "serve custom 404 page", e),
        }
    }

    fn root_error(&self, lookup: &LookupPath, request: &ServeRequest, error: VfsError) -> ServeResponse {
        if error.is_not_found() {
            return ServeResponse::not_found(&request.method);
        }

        if matches!(error.inner(), VfsError::Canceled) {
            tracing::debug!(vfs = self.vfs.name(), root_path = %lookup.path, "root request canceled");
            return ServeResponse::not_found(&request.method);
        }

        self.serve_error(lookup, request, "vfs root", error)
    }

    fn serve_error(&self, lookup: &LookupPath, request: &ServeRequest, during: &str, error: VfsError) -> ServeResponse {
        if error.is_canceled() {
            tracing::debug!(
                vfs = self.vfs.name(),
                project_id = lookup.project_id,
                path = %request.sub_path,
                error = %error,
                "{during} canceled"
            );
        } else {
            tracing::error!(
                vfs = self.vfs.name(),
                project_id = lookup.project_id,
                path = %request.sub_path,
                error = %error,
                "{during} failed"
            );
        }
        ServeResponse::internal_error(&request.method)
    }
}

fn redirect_to_slash(request: &ServeRequest) -> ServeResponse {
    let mut location = format!("/{}/", request.url_path.trim_matches('/'));
    if location == "//" {
        location = "/".to_string();
    }
    if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
        location.push('?');
        location.push_str(query);
    }

    let mut headers = HeaderMap::new();
    set_header(&mut headers, header::LOCATION, location);
    ServeResponse::new(StatusCode::FOUND, headers, Body::Empty)
}

/// Opens the variant of `path` to send, returning it with its size and
/// modification time.
async fn open_variant(
    root: &dyn Root,
    request: &ServeRequest,
    path: &str,
    headers: &mut HeaderMap,
) -> VfsResult<(Box<dyn VfsFile>, FileInfo, bool)> {
    let variant = negotiate_variant(root, &request.headers, path).await;
    let full_path = variant.as_ref().map_or(path, |v| v.path.as_str());

    let file = root.open(full_path).await?;
    let info = root.lstat(full_path).await?;

    if let Some(variant) = &variant {
        headers.insert(
            header::CONTENT_ENCODING,
            HeaderValue::from_static(variant.encoding),
        );
    }

    Ok((file, info, variant.is_some()))
}

async fn serve_file(
    root: &dyn Root,
    request: &ServeRequest,
    path: &str,
    has_access_control: bool,
) -> VfsResult<ServeResponse> {
    let mut headers = HeaderMap::new();
    let (mut file, info, compressed) = open_variant(root, request, path, &mut headers).await?;

    if !has_access_control {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=600"));
        let expires = Utc::now() + chrono::Duration::minutes(10);
        set_header(&mut headers, header::EXPIRES, http_date(expires));
    }

    // typed by the requested name, not the compressed sibling
    let content_type = detect_content_type(root, path).await?;
    set_header(&mut headers, header::CONTENT_TYPE, content_type);

    if let Some(modified) = info.modified {
        set_header(&mut headers, header::LAST_MODIFIED, http_date(modified));
    }
    if let Some(etag) = &info.etag {
        set_header(&mut headers, header::ETAG, etag.as_str());
    }

    let range = match check_preconditions(&request.method, &request.headers, info.etag.as_deref(), info.modified) {
        Precondition::Failed => {
            return Ok(ServeResponse::new(StatusCode::PRECONDITION_FAILED, headers, Body::Empty));
        }
        Precondition::NotModified => {
            headers.remove(header::CONTENT_TYPE);
            headers.remove(header::CONTENT_ENCODING);
            if headers.contains_key(header::ETAG) {
                headers.remove(header::LAST_MODIFIED);
            }
            return Ok(ServeResponse::new(StatusCode::NOT_MODIFIED, headers, Body::Empty));
        }
        Precondition::Proceed { range } => range,
    };

    let size = info.size;
    let mut status = StatusCode::OK;
    let (mut start, mut len) = (0, size);

    let ranged = file.is_seekable() && !compressed;
    if ranged {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        match range.as_deref().map(|r| parse_range(r, size)) {
            None | Some(ByteRange::Full) => {}
            Some(ByteRange::Partial { start: from, len: count }) => {
                status = StatusCode::PARTIAL_CONTENT;
                (start, len) = (from, count);
                set_header(
                    &mut headers,
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, start + len - 1, size),
                );
            }
            Some(ByteRange::Unsatisfiable) => {
                headers.remove(header::CONTENT_TYPE);
                set_header(&mut headers, header::CONTENT_RANGE, format!("bytes */{size}"));
                return Ok(ServeResponse::new(StatusCode::RANGE_NOT_SATISFIABLE, headers, Body::Empty));
            }
        }
    }

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

    if request.method == Method::HEAD {
        return Ok(ServeResponse::new(status, headers, Body::Empty));
    }

    if start > 0 {
        file.seek_to(start).await?;
    }

    Ok(ServeResponse::new(status, headers, Body::File { file, len }))
}

async fn serve_custom_file(
    root: &dyn Root,
    request: &ServeRequest,
    status: StatusCode,
    path: &str,
) -> VfsResult<ServeResponse> {
    let mut headers = HeaderMap::new();
    let (file, info, _) = open_variant(root, request, path, &mut headers).await?;

    let content_type = detect_content_type(root, path).await?;
    set_header(&mut headers, header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(info.size));

    let body = if request.method == Method::HEAD {
        Body::Empty
    } else {
        Body::File {
            file,
            len: info.size,
        }
    };

    Ok(ServeResponse::new(status, headers, body))
}
