//! Package transport and the concurrent download scheduler.
//!
//! [`HttpTransport`] fetches manifests and streams package payloads over
//! HTTP. [`DownloadScheduler`] runs a bounded pool of workers over the
//! selected packages, retrying each failed package on the worker that
//! claimed it and aborting the whole batch once any package exhausts its
//! retries.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, PRAGMA};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Credentials, DownloadConfig, NetworkConfig};
use crate::error::{PackageFailure, UpdateError};
use crate::events::{EventSink, UpdateEvent};
use crate::manifest::Package;
use crate::verifier::FileVerifier;

/// Receives `(bytes_received, total_bytes)` during a transfer.
pub type ProgressFn<'a> = dyn FnMut(u64, Option<u64>) + Send + 'a;

/// Fetches raw manifest payloads.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self, url: &str) -> Result<Bytes, UpdateError>;
}

/// Transfers package payloads to disk.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Stream `url` into `dest`, returning the number of bytes written.
    ///
    /// Must return [`UpdateError::Cancelled`] promptly once `cancel` fires.
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateError>;

    /// Best-effort notification sent before a batch starts.
    async fn ping(&self, url: &str) -> Result<(), UpdateError>;
}

/// HTTP transport built on a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    server_credentials: Option<Credentials>,
}

impl HttpTransport {
    /// Build a client from the network configuration.
    ///
    /// Credentials go to the proxy when one is configured, and to the
    /// update server otherwise. Responses are never served from caches.
    pub fn new(config: &NetworkConfig) -> Result<Self, UpdateError> {
        let mut headers = HeaderMap::new();
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_seconds))
            .read_timeout(Duration::from_secs(config.read_timeout_seconds))
            .user_agent(&config.user_agent)
            .default_headers(headers);

        let mut server_credentials = config.credentials.clone();
        if let Some(proxy_url) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            let mut proxy = reqwest::Proxy::all(proxy_url)?;
            if let Some(creds) = server_credentials.take() {
                proxy = proxy.basic_auth(&creds.username, &creds.password);
            }
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            client: builder.build()?,
            server_credentials,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.server_credentials {
            Some(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
            None => request,
        }
    }
}

#[async_trait]
impl ManifestSource for HttpTransport {
    async fn fetch_manifest(&self, url: &str) -> Result<Bytes, UpdateError> {
        debug!("Fetching manifest: {}", url);

        let response = self.get(url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed {
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        debug!("Fetched {} bytes", bytes.len());
        Ok(bytes)
    }
}

#[async_trait]
impl PackageFetcher for HttpTransport {
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateError> {
        info!("Starting download: {} -> {:?}", url, dest);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            response = self.get(url).send() => response?,
        };
        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed {
                status: response.status().as_u16(),
            });
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut received = 0u64;
        progress(received, total);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(dest).await;
                    return Err(UpdateError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| UpdateError::NetworkError(e.to_string()))?;

            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            progress(received, total);
        }

        file.flush().await?;
        file.sync_all().await?;
        info!("Download complete: {} bytes", received);
        Ok(received)
    }

    async fn ping(&self, url: &str) -> Result<(), UpdateError> {
        let response = self.client.post(url).body(Vec::new()).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes to download, when the server announced it.
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: Option<u64>) -> Self {
        Self { downloaded, total }
    }

    /// Get download progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => (self.downloaded as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if total > 0 && self.downloaded >= total)
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.total {
            Some(total) => write!(
                f,
                "{}/{} bytes ({:.1}%)",
                self.downloaded,
                total,
                self.percentage()
            ),
            None => write!(f, "{} bytes", self.downloaded),
        }
    }
}

/// Runtime state of one package in a batch.
///
/// `is_downloading` and `is_downloaded` are never both set, and
/// `retry_count` only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageState {
    pub is_downloading: bool,
    pub is_downloaded: bool,
    pub progress: Option<DownloadProgress>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

impl PackageState {
    fn is_claimable(&self) -> bool {
        !self.is_downloading && !self.is_downloaded
    }
}

/// A package, where to get it, and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub package: Package,
    pub url: String,
    pub dest: PathBuf,
}

impl DownloadJob {
    pub fn new(package: Package, url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            package,
            url: url.into(),
            dest: dest.into(),
        }
    }
}

struct Slot {
    job: DownloadJob,
    state: PackageState,
}

struct Board {
    slots: Vec<Slot>,
    batch_failed: bool,
    live_workers: usize,
}

impl Board {
    fn all_downloaded(&self) -> bool {
        self.slots.iter().all(|slot| slot.state.is_downloaded)
    }

    /// Mark the first idle package as downloading and hand it out.
    fn claim(&mut self) -> Option<(usize, DownloadJob)> {
        if self.batch_failed {
            return None;
        }
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.state.is_claimable())?;
        slot.state.is_downloading = true;
        Some((index, slot.job.clone()))
    }
}

struct Shared {
    board: Mutex<Board>,
    wake: Notify,
    cancel: CancellationToken,
    fetcher: Arc<dyn PackageFetcher>,
    events: EventSink,
    max_retry_count: u32,
}

impl Shared {
    fn board(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded pool of download workers with per-package retry.
pub struct DownloadScheduler {
    fetcher: Arc<dyn PackageFetcher>,
    worker_count: usize,
    max_retry_count: u32,
    ping_url: Option<String>,
    events: EventSink,
    cancel: CancellationToken,
}

impl DownloadScheduler {
    pub fn new(fetcher: Arc<dyn PackageFetcher>, config: &DownloadConfig) -> Self {
        Self {
            fetcher,
            worker_count: config.worker_count(),
            max_retry_count: config.max_retry_count,
            ping_url: None,
            events: EventSink::disconnected(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Notify this URL (empty POST) before the batch starts.
    pub fn with_ping_url(mut self, url: Option<String>) -> Self {
        self.ping_url = url.filter(|u| !u.is_empty());
        self
    }

    /// Cancelling `token` aborts the batch.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Download every job, returning the final state of each package.
    ///
    /// Fails with [`UpdateError::PackagesFailed`] listing every package with
    /// a recorded error once any package runs out of retries. An external
    /// cancellation with no recorded errors is [`UpdateError::Cancelled`].
    pub async fn run(&self, jobs: Vec<DownloadJob>) -> Result<Vec<PackageState>, UpdateError> {
        if let Some(url) = &self.ping_url {
            if let Err(e) = self.fetcher.ping(url).await {
                debug!(url = %url, error = %e, "Update ping failed");
            }
        }

        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.worker_count.min(jobs.len());
        info!(packages = jobs.len(), workers, "Starting package downloads");

        let shared = Arc::new(Shared {
            board: Mutex::new(Board {
                slots: jobs
                    .into_iter()
                    .map(|job| Slot {
                        job,
                        state: PackageState::default(),
                    })
                    .collect(),
                batch_failed: false,
                live_workers: workers,
            }),
            wake: Notify::new(),
            cancel: self.cancel.child_token(),
            fetcher: Arc::clone(&self.fetcher),
            events: self.events.clone(),
            max_retry_count: self.max_retry_count,
        });

        let handles: Vec<_> = (0..workers)
            .map(|id| tokio::spawn(worker(id, Arc::clone(&shared))))
            .collect();

        loop {
            {
                let board = shared.board();
                if board.batch_failed || board.all_downloaded() || board.live_workers == 0 {
                    break;
                }
            }
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = shared.cancel.cancelled() => {
                    shared.board().batch_failed = true;
                }
            }
        }

        shared.cancel.cancel();
        let mut join_error = None;
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Download worker did not finish cleanly");
                join_error.get_or_insert(e);
            }
        }
        if let Some(e) = join_error {
            return Err(e.into());
        }

        let board = shared.board();
        let states: Vec<PackageState> = board.slots.iter().map(|s| s.state.clone()).collect();
        if !board.batch_failed && board.all_downloaded() {
            info!("All packages downloaded");
            return Ok(states);
        }

        let failures: Vec<PackageFailure> = board
            .slots
            .iter()
            .filter_map(|slot| {
                slot.state.last_error.as_ref().map(|error| PackageFailure {
                    name: slot.job.package.name.clone(),
                    error: error.clone(),
                    retry_count: slot.state.retry_count,
                })
            })
            .collect();
        if failures.is_empty() {
            info!("Package downloads cancelled");
            return Err(UpdateError::Cancelled);
        }
        error!(failed = failures.len(), "Package download batch failed");
        Err(UpdateError::PackagesFailed(failures))
    }
}

/// What a worker does after an attempt.
enum Next {
    Claim,
    Retry { retry_count: u32, error: String },
    Stop { retry_count: u32, error: String },
}

async fn worker(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "Download worker started");

    while !shared.cancel.is_cancelled() {
        let claimed = shared.board().claim();
        let Some((index, job)) = claimed else { break };
        let name = job.package.name.clone();

        loop {
            let attempt = shared.board().slots[index].state.retry_count + 1;
            let result = download_package(&shared, index, &job, attempt).await;
            let next = settle(&shared, index, result);

            match next {
                Next::Claim => break,
                Next::Retry { retry_count, error } => {
                    warn!(
                        package = %name,
                        retry_count,
                        max_retries = shared.max_retry_count,
                        error = %error,
                        "Package download failed; retrying"
                    );
                    shared.events.emit(UpdateEvent::PackageRetried {
                        name: name.clone(),
                        retry_count,
                        error,
                    });
                }
                Next::Stop { retry_count, error } => {
                    error!(package = %name, retry_count, error = %error, "Package download failed");
                    shared.wake.notify_one();
                    break;
                }
            }
        }
    }

    shared.board().live_workers -= 1;
    shared.wake.notify_one();
    debug!(worker = id, "Download worker stopped");
}

/// Record the outcome of one attempt under the lock.
fn settle(shared: &Shared, index: usize, result: Result<(), UpdateError>) -> Next {
    let mut board = shared.board();
    let state = &mut board.slots[index].state;

    match result {
        Ok(()) => {
            state.is_downloading = false;
            state.is_downloaded = true;
            state.last_error = None;
            let name = board.slots[index].job.package.name.clone();
            drop(board);
            shared.events.emit(UpdateEvent::PackageDownloaded { name });
            shared.wake.notify_one();
            Next::Claim
        }
        Err(e) if e.is_cancelled() => {
            state.is_downloading = false;
            debug!(package = %board.slots[index].job.package.name, "Transfer cancelled");
            Next::Claim
        }
        Err(e) => {
            state.retry_count += 1;
            state.last_error = Some(e.to_string());
            let retry_count = state.retry_count;
            let error = e.to_string();

            if retry_count <= shared.max_retry_count && !shared.cancel.is_cancelled() {
                return Next::Retry { retry_count, error };
            }
            state.is_downloading = false;
            board.batch_failed = true;
            Next::Stop { retry_count, error }
        }
    }
}

async fn download_package(
    shared: &Arc<Shared>,
    index: usize,
    job: &DownloadJob,
    attempt: u32,
) -> Result<(), UpdateError> {
    let package = &job.package;
    let verifier = FileVerifier::new();

    if !package.hash.is_empty()
        && job.dest.exists()
        && verifier.hash_matches(&job.dest, &package.hash)?
    {
        info!(package = %package.name, "Payload already present; skipping transfer");
        return Ok(());
    }

    if let Some(parent) = job.dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    shared.events.emit(UpdateEvent::PackageDownloadStarted {
        name: package.name.clone(),
        attempt,
    });

    let progress_shared = Arc::clone(shared);
    let name = package.name.clone();
    let mut on_progress = move |received: u64, total: Option<u64>| {
        progress_shared.board().slots[index].state.progress =
            Some(DownloadProgress::new(received, total));
        progress_shared.events.emit(UpdateEvent::DownloadProgress {
            name: name.clone(),
            attempt,
            received,
            total,
        });
    };

    shared
        .fetcher
        .fetch_to_file(&job.url, &job.dest, &mut on_progress, &shared.cancel)
        .await?;

    let verified = verify_payload(&verifier, package, &job.dest);
    if verified.is_err() {
        let _ = std::fs::remove_file(&job.dest);
    }
    verified
}

fn verify_payload(
    verifier: &FileVerifier,
    package: &Package,
    path: &Path,
) -> Result<(), UpdateError> {
    if package.size > 0 {
        verifier.verify_size(path, package.size)?;
    }
    if !package.hash.is_empty() {
        verifier.verify_hash(path, &package.hash)?;
    }
    Ok(())
}
