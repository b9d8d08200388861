//! Shared fixtures: a range-aware HTTP server and a ZIP builder.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipWriter};

use pages_vfs::{ZipConfig, ZipVfs};

/// A request as seen by [`TestServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub range: Option<String>,
}

impl RecordedRequest {
    /// First byte of the requested range, if any.
    pub fn range_start(&self) -> Option<u64> {
        let spec = self.range.as_deref()?.strip_prefix("bytes=")?;
        spec.split_once('-')?.0.parse().ok()
    }

    pub fn is_probe(&self) -> bool {
        self.range.as_deref() == Some("bytes=0-0")
    }
}

struct Object {
    data: Vec<u8>,
    etag: String,
}

#[derive(Default)]
struct State {
    objects: Mutex<HashMap<String, Object>>,
    requests: Mutex<Vec<RecordedRequest>>,
    ignore_ranges: AtomicBool,
    versions: AtomicU64,
}

/// Minimal HTTP/1.1 object server honoring single `Range` and `If-Range`
/// headers. Every response closes its connection.
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let task = tokio::spawn({
            let state = state.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    tokio::spawn(handle(stream, state.clone()));
                }
            }
        });

        Self { addr, state, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Publishes (or replaces) an object. Each version gets a new ETag.
    pub fn put(&self, path: &str, data: Vec<u8>) {
        let version = self.state.versions.fetch_add(1, Ordering::SeqCst);
        let path = format!("/{}", path.trim_start_matches('/'));
        self.state.objects.lock().insert(
            path,
            Object {
                data,
                etag: format!("\"v{version}\""),
            },
        );
    }

    /// Answers every request with the whole object and `200 OK`.
    pub fn ignore_ranges(&self, ignore: bool) {
        self.state.ignore_ranges.store(ignore, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().len()
    }

    pub fn probe_count(&self) -> usize {
        self.state.requests.lock().iter().filter(|r| r.is_probe()).count()
    }

    /// Requests whose range starts at `offset`.
    pub fn requests_starting_at(&self, offset: u64) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.range_start() == Some(offset))
            .count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(stream: TcpStream, state: Arc<State>) {
    let mut stream = BufReader::new(stream);

    let mut request_line = String::new();
    if stream.read_line(&mut request_line).await.unwrap_or(0) == 0 {
        return;
    }
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let range = headers.get("range").cloned();
    state.requests.lock().push(RecordedRequest {
        path: path.clone(),
        range: range.clone(),
    });

    let response = {
        let objects = state.objects.lock();
        match objects.get(&path) {
            None => Response::status("404 Not Found", Vec::new()),
            Some(object) => {
                let if_range_ok = headers
                    .get("if-range")
                    .is_none_or(|value| *value == object.etag);

                match range {
                    Some(range) if if_range_ok && !state.ignore_ranges.load(Ordering::SeqCst) => {
                        partial(object, &range)
                    }
                    _ => Response::status("200 OK", object.data.clone()).etag(&object.etag),
                }
            }
        }
    };

    let mut stream = stream.into_inner();
    let _ = stream.write_all(&response.into_bytes()).await;
    let _ = stream.shutdown().await;
}

fn partial(object: &Object, range: &str) -> Response {
    let size = object.data.len() as u64;
    let parsed = range.strip_prefix("bytes=").and_then(|spec| {
        let (start, end) = spec.split_once('-')?;
        let start: u64 = start.parse().ok()?;
        let end: u64 = if end.is_empty() { size.saturating_sub(1) } else { end.parse().ok()? };
        Some((start, end.min(size.saturating_sub(1))))
    });

    match parsed {
        Some((start, end)) if start < size && start <= end => {
            let body = object.data[start as usize..=end as usize].to_vec();
            Response::status("206 Partial Content", body)
                .etag(&object.etag)
                .header("Content-Range", format!("bytes {start}-{end}/{size}"))
        }
        _ => Response::status("416 Range Not Satisfiable", Vec::new())
            .header("Content-Range", format!("bytes */{size}")),
    }
}

struct Response {
    status: &'static str,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn status(status: &'static str, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    fn etag(self, etag: &str) -> Self {
        self.header("ETag", etag)
    }

    fn into_bytes(self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {}\r\n", self.status).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(
            format!("Content-Length: {}\r\nConnection: close\r\n\r\n", self.body.len()).as_bytes(),
        );
        out.extend_from_slice(&self.body);
        out
    }
}

/// Builds an in-memory ZIP archive.
pub struct ZipBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
}

impl Default for ZipBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    pub fn stored(mut self, name: &str, content: impl AsRef<[u8]>) -> Self {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        self.writer.start_file(name, options).unwrap();
        self.writer.write_all(content.as_ref()).unwrap();
        self
    }

    pub fn deflated(mut self, name: &str, content: impl AsRef<[u8]>) -> Self {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        self.writer.start_file(name, options).unwrap();
        self.writer.write_all(content.as_ref()).unwrap();
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        self.writer.add_symlink(name, target, options).unwrap();
        self
    }

    pub fn directory(mut self, name: &str) -> Self {
        self.writer
            .add_directory(name, SimpleFileOptions::default())
            .unwrap();
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.writer.finish().unwrap().into_inner()
    }
}

/// Offset of the central directory, read from a comment-less EOCD record.
pub fn central_directory_offset(archive: &[u8]) -> u64 {
    let eocd = &archive[archive.len() - 22..];
    assert_eq!(&eocd[..4], b"PK\x05\x06");
    u32::from_le_bytes([eocd[16], eocd[17], eocd[18], eocd[19]]) as u64
}

/// A client that never goes through a proxy from the environment.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn zip_vfs(config: ZipConfig) -> ZipVfs {
    ZipVfs::with_client(config, client())
}
