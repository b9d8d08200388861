use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::Op;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::archive::ZipArchive;
use crate::config::ZipConfig;
use crate::error::{VfsError, VfsResult};
use crate::io::{LocalFileReader, RangedReader, ReadAt, Resource};
use crate::vfs::{Root, Vfs};

type OpenResult = Result<Arc<ZipArchive>, Arc<VfsError>>;
type PendingArchive = Shared<BoxFuture<'static, OpenResult>>;

/// State of a cached archive at lookup time.
enum Status {
    Opening,
    OpenError,
    Opened(Arc<ZipArchive>),
    Corrupted(VfsError),
}

fn status(pending: &PendingArchive) -> Status {
    match pending.peek() {
        None => Status::Opening,
        Some(Err(_)) => Status::OpenError,
        Some(Ok(archive)) => match archive.check() {
            Ok(()) => Status::Opened(archive.clone()),
            Err(e) => Status::Corrupted(e),
        },
    }
}

/// Entries live for the expiration interval. An opened archive read within
/// the refresh interval of its expiry gets a whole new interval; pending and
/// failed opens never do.
struct ArchiveExpiry {
    config: Arc<RwLock<ZipConfig>>,
}

impl Expiry<String, PendingArchive> for ArchiveExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        _value: &PendingArchive,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.config.read().expiration_interval)
    }

    fn expire_after_read(
        &self,
        key: &String,
        value: &PendingArchive,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        let config = self.config.read();
        match (value.peek(), duration_until_expiry) {
            (Some(Ok(_)), Some(remaining)) if remaining < config.refresh_interval => {
                tracing::trace!(archive_key = %key, "archive cache entry refreshed");
                Some(config.expiration_interval)
            }
            _ => duration_until_expiry,
        }
    }

    fn expire_after_update(
        &self,
        _key: &String,
        _value: &PendingArchive,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.config.read().expiration_interval)
    }
}

/// [`Vfs`] over ZIP archives addressed by URL.
///
/// Opened archives are cached by key (the archive's SHA-256 in practice).
/// Concurrent lookups of a key that is not cached yet share a single open,
/// which runs as its own task so a caller that gives up does not waste it.
/// Failed opens stay cached until they expire. An archive whose remote
/// content changed is dropped on the next lookup and opened again.
///
/// Must be created inside a Tokio runtime. Expired archives are swept every
/// cleanup interval until the `ZipVfs` is dropped.
pub struct ZipVfs {
    cache: Cache<String, PendingArchive>,
    config: Arc<RwLock<ZipConfig>>,
    client: RwLock<reqwest::Client>,
    _cleanup: DropGuard,
}

impl ZipVfs {
    pub fn new(config: ZipConfig) -> VfsResult<Self> {
        let client = build_client(&config)?;
        Ok(Self::with_client(config, client))
    }

    /// Uses `client` for every archive instead of building one from the
    /// configuration.
    pub fn with_client(config: ZipConfig, client: reqwest::Client) -> Self {
        let config = Arc::new(RwLock::new(config));
        let cache: Cache<String, PendingArchive> = Cache::builder()
            .expire_after(ArchiveExpiry {
                config: config.clone(),
            })
            .eviction_listener(|key, _, cause| {
                tracing::debug!(archive_key = %key, ?cause, "zip archive evicted");
            })
            .build();

        let token = CancellationToken::new();
        tokio::spawn(cleanup_loop(cache.clone(), config.clone(), token.clone()));

        Self {
            cache,
            config,
            client: RwLock::new(client),
            _cleanup: token.drop_guard(),
        }
    }

    pub fn config(&self) -> ZipConfig {
        self.config.read().clone()
    }

    /// Replaces the cache timings and transport settings and drops every
    /// cached archive.
    pub fn reconfigure(&self, config: ZipConfig) -> VfsResult<()> {
        let client = build_client(&config)?;

        *self.client.write() = client;
        *self.config.write() = config;
        self.cache.invalidate_all();

        tracing::info!("zip vfs reconfigured, archive cache reset");
        Ok(())
    }

    /// Number of archives currently held, including failed and pending opens.
    pub async fn cached_archives(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    /// Opens (or fetches from the cache) the archive at `url`.
    pub async fn archive(&self, url: &str, cache_key: &str) -> VfsResult<Arc<ZipArchive>> {
        if cache_key.is_empty() {
            return Err(VfsError::invalid_path("missing cache key"));
        }

        let pending = self.find_or_open(cache_key, url).await;
        let open_timeout = self.config.read().open_timeout;

        match tokio::time::timeout(open_timeout, pending).await {
            Ok(Ok(archive)) => Ok(archive),
            Ok(Err(e)) => match e.inner() {
                VfsError::NotFound(_) => Err(VfsError::not_found(url)),
                _ => Err(VfsError::Shared(e)),
            },
            Err(_) => {
                tracing::debug!(archive_key = cache_key, "open zip archive timed out");
                Err(VfsError::DeadlineExceeded)
            }
        }
    }

    async fn find_or_open(&self, key: &str, url: &str) -> PendingArchive {
        if let Some(pending) = self.cache.get(key).await {
            match status(&pending) {
                Status::Opening | Status::OpenError => return pending,
                Status::Opened(archive) => {
                    archive.refresh_url(url);
                    return pending;
                }
                Status::Corrupted(e) => {
                    tracing::error!(archive_key = key, error = %e, "archive corrupted");
                    self.cache.invalidate(key).await;
                }
            }
        }

        // Serialized per key, so racing callers agree on a single open.
        let computed = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|entry| {
                let op = match entry.map(|entry| entry.into_value()) {
                    Some(pending) if !matches!(status(&pending), Status::Corrupted(_)) => Op::Nop,
                    _ => Op::Put(self.open(url.to_string())),
                };
                std::future::ready(op)
            })
            .await;

        match computed.into_entry() {
            Some(entry) => entry.into_value(),
            None => self.open(url.to_string()),
        }
    }

    fn open(&self, url: String) -> PendingArchive {
        let client = self.client.read().clone();
        let config = self.config.read().clone();

        let task = tokio::spawn(async move {
            let opened =
                tokio::time::timeout(config.open_timeout, open_archive(client, &url, &config))
                    .await
                    .map_err(VfsError::from)
                    .and_then(|result| result);

            match opened {
                Ok(archive) => Ok(Arc::new(archive)),
                Err(e) => {
                    tracing::info!(archive_url = %url, error = %e, "read zip archive request failed");
                    Err(Arc::new(e))
                }
            }
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(Arc::new(VfsError::Canceled)),
                Err(e) => Err(Arc::new(VfsError::Io(std::io::Error::other(e.to_string())))),
            }
        }
        .boxed()
        .shared()
    }
}

async fn open_archive(client: reqwest::Client, url: &str, config: &ZipConfig) -> VfsResult<ZipArchive> {
    let (reader, resource) = if url.starts_with("file://") {
        let (url, allowed) = (url.to_string(), config.allowed_paths.clone());
        let reader = tokio::task::spawn_blocking(move || LocalFileReader::from_url(&url, &allowed))
            .await
            .map_err(|e| VfsError::Io(std::io::Error::other(e.to_string())))??;
        (Arc::new(reader) as Arc<dyn ReadAt>, None)
    } else {
        let resource = Resource::new(client, url).await?;
        (
            Arc::new(RangedReader::new(resource.clone())) as Arc<dyn ReadAt>,
            Some(resource),
        )
    };

    ZipArchive::open(reader, resource, config.max_symlink_size).await
}

fn build_client(config: &ZipConfig) -> VfsResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.http_client_timeout)
        .build()
        .map_err(VfsError::Http)
}

/// moka only evicts during cache activity; this drives its maintenance so an
/// idle cache still releases expired archives and their connections.
async fn cleanup_loop(
    cache: Cache<String, PendingArchive>,
    config: Arc<RwLock<ZipConfig>>,
    token: CancellationToken,
) {
    loop {
        let interval = config.read().cleanup_interval.max(Duration::from_millis(10));

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl Vfs for ZipVfs {
    async fn root(&self, path: &str, cache_key: &str) -> VfsResult<Arc<dyn Root>> {
        let archive: Arc<dyn Root> = self.archive(path, cache_key).await?;
        Ok(archive)
    }

    fn name(&self) -> &'static str {
        "zip"
    }
}
