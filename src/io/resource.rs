use parking_lot::{Mutex, RwLock};
use reqwest::header::{CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VfsError, VfsResult};

/// Why a resource stopped being trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poison {
    ContentChanged,
    RangeRequestsNotSupported,
}

impl Poison {
    fn error(self) -> VfsError {
        match self {
            Poison::ContentChanged => VfsError::ContentChanged,
            Poison::RangeRequestsNotSupported => VfsError::RangeRequestsNotSupported,
        }
    }
}

/// A remote object that can be read with HTTP Range requests.
///
/// Size, ETag and Last-Modified are captured once by a 1-byte probe. Every
/// later ranged response is checked against them; the first disagreement
/// poisons the resource for good and all further reads fail.
pub struct Resource {
    client: Client,
    url: RwLock<String>,
    size: u64,
    etag: Option<String>,
    last_modified: Option<String>,
    poison: Mutex<Option<Poison>>,
    requests: AtomicU64,
    transferred_bytes: AtomicU64,
}

impl Resource {
    /// Probe `url` with `Range: bytes=0-0` and record its metadata.
    pub async fn new(client: Client, url: impl Into<String>) -> VfsResult<Arc<Self>> {
        let url = url.into();

        let res = client
            .get(&url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(VfsError::from_reqwest)?;

        let etag = header_string(&res, ETAG);
        let last_modified = header_string(&res, LAST_MODIFIED);

        // the response is dropped unread, we only need its headers
        let size = match res.status() {
            StatusCode::OK => res.content_length().ok_or_else(|| {
                VfsError::InvalidResponse("missing `Content-Length`".to_string())
            })?,
            StatusCode::PARTIAL_CONTENT => {
                let content_range = header_string(&res, CONTENT_RANGE).unwrap_or_default();
                parse_content_range(&content_range)?.total
            }
            StatusCode::NOT_FOUND => return Err(VfsError::not_found(url)),
            StatusCode::RANGE_NOT_SATISFIABLE => return Err(VfsError::RangeRequestsNotSupported),
            status => return Err(VfsError::UnexpectedStatus(status.as_u16())),
        };

        tracing::debug!(url = %url, size, etag = ?etag, "resource probed");

        Ok(Arc::new(Self {
            client,
            url: RwLock::new(url),
            size,
            etag,
            last_modified,
            poison: Mutex::new(None),
            requests: AtomicU64::new(1),
            transferred_bytes: AtomicU64::new(0),
        }))
    }

    pub fn url(&self) -> String {
        self.url.read().clone()
    }

    /// Replaces the URL, e.g. with a freshly signed one for the same object.
    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.write() = url.into();
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    /// Fails with the recorded reason once the resource has been poisoned.
    pub fn check(&self) -> VfsResult<()> {
        match *self.poison.lock() {
            Some(poison) => Err(poison.error()),
            None => Ok(()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.poison.lock().is_none()
    }

    /// Number of HTTP requests issued against this resource, probe included.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_transferred(&self, n: usize) {
        self.transferred_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn poison(&self, poison: Poison) -> VfsError {
        let mut guard = self.poison.lock();
        if guard.is_none() {
            tracing::warn!(url = %self.url(), error = %poison.error(), "resource invalidated");
            *guard = Some(poison);
        }
        poison.error()
    }

    /// Issues `GET` for `[offset, end)` and validates the response against the
    /// recorded metadata.
    pub(crate) async fn fetch_range(&self, offset: u64, end: u64) -> VfsResult<Response> {
        self.check()?;

        if offset >= end || end > self.size {
            return Err(VfsError::InvalidRange);
        }

        let mut req = self
            .client
            .get(self.url())
            .header(RANGE, format!("bytes={}-{}", offset, end - 1));

        // Last-Modified is the fallback validator when there is no ETag
        if let Some(etag) = &self.etag {
            req = req.header(IF_RANGE, etag);
        } else if let Some(last_modified) = &self.last_modified {
            req = req.header(IF_RANGE, last_modified);
        }

        self.requests.fetch_add(1, Ordering::Relaxed);
        let res = req.send().await.map_err(VfsError::from_reqwest)?;

        match res.status() {
            StatusCode::PARTIAL_CONTENT => {
                if self.etag_changed(&res) {
                    return Err(self.poison(Poison::ContentChanged));
                }

                if let Some(content_range) = header_string(&res, CONTENT_RANGE) {
                    let range = parse_content_range(&content_range)?;
                    if range.start != offset || range.total != self.size {
                        return Err(self.poison(Poison::ContentChanged));
                    }
                }

                Ok(res)
            }
            // some servers answer `bytes=0-` with the whole object
            StatusCode::OK => {
                if offset > 0 {
                    return Err(self.poison(Poison::RangeRequestsNotSupported));
                }
                if self.etag_changed(&res) {
                    return Err(self.poison(Poison::ContentChanged));
                }
                Ok(res)
            }
            StatusCode::NOT_FOUND => Err(VfsError::not_found(self.url())),
            StatusCode::RANGE_NOT_SATISFIABLE => Err(VfsError::RangeRequestsNotSupported),
            status => Err(VfsError::UnexpectedStatus(status.as_u16())),
        }
    }

    fn etag_changed(&self, res: &Response) -> bool {
        match (&self.etag, header_string(res, ETAG)) {
            (Some(recorded), Some(current)) => *recorded != current,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("url", &self.url())
            .field("size", &self.size)
            .field("etag", &self.etag)
            .field("valid", &self.is_valid())
            .finish()
    }
}

fn header_string(res: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    total: u64,
}

/// Parses `bytes <start>-<end>/<total>`.
fn parse_content_range(value: &str) -> VfsResult<ContentRange> {
    let invalid = || VfsError::InvalidResponse(format!("invalid `Content-Range`: {value:?}"));

    let spec = value.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
    let (range, total) = spec.split_once('/').ok_or_else(invalid)?;
    let (start, _end) = range.split_once('-').ok_or_else(invalid)?;

    Ok(ContentRange {
        start: start.trim().parse().map_err(|_| invalid())?,
        total: total.trim().parse().map_err(|_| invalid())?,
    })
}
