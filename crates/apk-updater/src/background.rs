//! In-process background download service.
//!
//! Implements [`DownloadService`] on tokio tasks and `reqwest` streaming for
//! hosts without a system download manager (desktop builds, tests, the CLI).
//! Each transfer:
//! - waits while the network state violates the request's constraints
//! - resumes from the existing partial file via HTTP `Range`
//! - retries transient failures a bounded number of times
//! - follows a redirect only to an HTTPS URL on a trusted host
//! - reports status rows using the same codes as the platform service

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::download::{codes, lock, DownloadId, DownloadRequest, DownloadRow, DownloadService};
use crate::error::UpdateError;
use crate::origin::TrustedOrigins;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Default delay before retrying or re-checking the network.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Current network conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Unmetered,
    Metered,
    Roaming,
    Offline,
}

/// Source of network conditions.
pub trait Connectivity: Send + Sync {
    fn network_state(&self) -> NetworkState;
}

/// Assumes an unmetered connection is always available.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn network_state(&self) -> NetworkState {
        NetworkState::Unmetered
    }
}

type Rows = Arc<Mutex<HashMap<DownloadId, DownloadRow>>>;

/// Why a single transfer attempt stopped.
#[derive(Debug)]
enum TransferError {
    /// Worth another attempt (reason code)
    Retryable(i32),
    /// Give up (reason code)
    Fatal(i32),
}

/// Tokio-based [`DownloadService`].
pub struct BackgroundDownloadService {
    client: reqwest::Client,
    rows: Rows,
    next_id: AtomicU64,
    connectivity: Arc<dyn Connectivity>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl BackgroundDownloadService {
    /// Create a service using the given network settings and the default
    /// trusted hosts.
    pub fn new(config: &NetworkConfig, connectivity: Arc<dyn Connectivity>) -> Result<Self, UpdateError> {
        Self::with_trusted_origins(config, connectivity, TrustedOrigins::default())
    }

    /// Create a service whose transfers, including every redirect hop, stay
    /// on `origins`.
    pub fn with_trusted_origins(
        config: &NetworkConfig,
        connectivity: Arc<dyn Connectivity>,
        origins: TrustedOrigins,
    ) -> Result<Self, UpdateError> {
        Self::build(config, connectivity, origins, true)
    }

    fn build(
        config: &NetworkConfig,
        connectivity: Arc<dyn Connectivity>,
        origins: TrustedOrigins,
        https_only: bool,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .user_agent(&config.user_agent)
            .https_only(https_only)
            .redirect(redirect_policy(origins))
            .build()
            .map_err(|e| UpdateError::ConfigError(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            rows: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            connectivity,
            max_attempts: config.max_retries.max(1),
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Override the delay between retries and network re-checks.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl DownloadService for BackgroundDownloadService {
    async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, UpdateError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.rows).insert(
            id,
            DownloadRow {
                status: codes::STATUS_PENDING,
                reason: 0,
                bytes_downloaded: 0,
                total_bytes: None,
                local_path: None,
            },
        );

        info!(
            download_id = id,
            title = %request.title,
            notification = request.notification_visible,
            "Starting background download: {} -> {:?}",
            request.url,
            request.destination
        );

        let transfer = Transfer {
            id,
            client: self.client.clone(),
            rows: self.rows.clone(),
            connectivity: self.connectivity.clone(),
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
            request,
        };
        tokio::spawn(transfer.run());

        Ok(id)
    }

    async fn query(&self, id: DownloadId) -> Result<Option<DownloadRow>, UpdateError> {
        Ok(lock(&self.rows).get(&id).cloned())
    }

    fn forget(&self, id: DownloadId) {
        let mut rows = lock(&self.rows);
        let finished = rows.get(&id).is_some_and(|row| {
            row.status == codes::STATUS_SUCCESSFUL || row.status == codes::STATUS_FAILED
        });
        if finished {
            rows.remove(&id);
            debug!(download_id = id, "Dropped finished download row");
        }
    }
}

/// Follow a redirect only while each hop passes [`TrustedOrigins::validate`].
fn redirect_policy(origins: TrustedOrigins) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        match origins.validate(attempt.url().as_str()) {
            Ok(_) => attempt.follow(),
            Err(e) => {
                warn!(security = true, url = %attempt.url(), "Refusing download redirect");
                attempt.error(e)
            }
        }
    })
}

/// State owned by one spawned transfer task.
struct Transfer {
    id: DownloadId,
    client: reqwest::Client,
    rows: Rows,
    connectivity: Arc<dyn Connectivity>,
    max_attempts: u32,
    retry_delay: Duration,
    request: DownloadRequest,
}

impl Transfer {
    async fn run(self) {
        let mut attempts = 0;
        loop {
            self.wait_for_network().await;
            self.set_status(codes::STATUS_RUNNING, 0);

            match self.attempt().await {
                Ok(()) => {
                    let path = self.request.destination.clone();
                    self.update(|row| {
                        row.status = codes::STATUS_SUCCESSFUL;
                        row.reason = 0;
                        row.local_path = Some(path);
                    });
                    info!(download_id = self.id, "Background download complete");
                    return;
                }
                Err(TransferError::Fatal(reason)) => {
                    warn!(download_id = self.id, reason, "Background download failed");
                    let _ = tokio::fs::remove_file(&self.request.destination).await;
                    self.set_status(codes::STATUS_FAILED, reason);
                    return;
                }
                Err(TransferError::Retryable(reason)) => {
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        warn!(download_id = self.id, reason, attempts, "Giving up on download");
                        self.set_status(codes::STATUS_FAILED, reason);
                        return;
                    }
                    debug!(download_id = self.id, reason, attempts, "Retrying download");
                    self.set_status(codes::STATUS_PAUSED, codes::PAUSED_WAITING_TO_RETRY);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn wait_for_network(&self) {
        loop {
            let paused_reason = match self.connectivity.network_state() {
                NetworkState::Offline => Some(codes::PAUSED_WAITING_FOR_NETWORK),
                NetworkState::Roaming if !self.request.allow_roaming => {
                    Some(codes::PAUSED_WAITING_FOR_NETWORK)
                }
                NetworkState::Metered if !self.request.allow_metered => {
                    Some(codes::PAUSED_QUEUED_FOR_WIFI)
                }
                _ => None,
            };

            match paused_reason {
                None => return,
                Some(reason) => {
                    self.set_status(codes::STATUS_PAUSED, reason);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// One HTTP request, resuming from whatever is already on disk.
    async fn attempt(&self) -> Result<(), TransferError> {
        let dest = &self.request.destination;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|_| TransferError::Fatal(codes::ERROR_DEVICE_NOT_FOUND))?;
        }

        let start_byte = if self.request.resumable {
            existing_len(dest).await
        } else {
            0
        };

        let mut http = self.client.get(&self.request.url);
        if start_byte > 0 {
            debug!(download_id = self.id, start_byte, "Resuming download");
            http = http.header("Range", format!("bytes={}-", start_byte));
        }

        let response = http.send().await.map_err(|e| send_failure(&e))?;

        let status = response.status().as_u16();
        let resumed = match status {
            206 if start_byte > 0 => true,
            200..=299 => false,
            416 => {
                // Partial file is unusable; start over on the next attempt.
                let _ = tokio::fs::remove_file(dest).await;
                return Err(TransferError::Retryable(codes::ERROR_CANNOT_RESUME));
            }
            500..=599 => return Err(TransferError::Retryable(i32::from(status))),
            _ => return Err(TransferError::Fatal(i32::from(status))),
        };

        let mut downloaded = if resumed { start_byte } else { 0 };
        let total = response.content_length().map(|len| len + downloaded);
        self.update(|row| {
            row.bytes_downloaded = downloaded;
            row.total_bytes = total;
        });

        let opened = if resumed {
            tokio::fs::OpenOptions::new().append(true).open(dest).await
        } else {
            if start_byte > 0 {
                warn!(download_id = self.id, "Server does not support range requests, restarting download");
            }
            tokio::fs::File::create(dest).await
        };
        let mut file = opened.map_err(|e| TransferError::Fatal(io_reason(&e)))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|_| TransferError::Retryable(codes::ERROR_HTTP_DATA_ERROR))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::Fatal(io_reason(&e)))?;
            downloaded += chunk.len() as u64;
            self.update(|row| row.bytes_downloaded = downloaded);
        }

        file.flush().await.map_err(|e| TransferError::Fatal(io_reason(&e)))?;
        file.sync_all().await.map_err(|e| TransferError::Fatal(io_reason(&e)))?;

        if let Some(expected) = total {
            if downloaded != expected {
                warn!(
                    download_id = self.id,
                    expected, downloaded, "Download size mismatch"
                );
                return Err(TransferError::Retryable(codes::ERROR_HTTP_DATA_ERROR));
            }
        }

        Ok(())
    }

    fn set_status(&self, status: u32, reason: i32) {
        self.update(|row| {
            row.status = status;
            row.reason = reason;
        });
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut DownloadRow),
    {
        if let Some(row) = lock(&self.rows).get_mut(&self.id) {
            f(row);
        }
    }
}

fn send_failure(err: &reqwest::Error) -> TransferError {
    if err.is_builder() {
        // Refused before sending, e.g. a plain HTTP URL.
        return TransferError::Fatal(codes::ERROR_UNHANDLED_HTTP_CODE);
    }
    if err.is_redirect() {
        let untrusted = std::error::Error::source(err).is_some_and(|src| src.is::<UpdateError>());
        return TransferError::Fatal(if untrusted {
            codes::ERROR_UNHANDLED_HTTP_CODE
        } else {
            codes::ERROR_TOO_MANY_REDIRECTS
        });
    }
    TransferError::Retryable(codes::ERROR_HTTP_DATA_ERROR)
}

async fn existing_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

fn io_reason(err: &std::io::Error) -> i32 {
    match err.kind() {
        std::io::ErrorKind::StorageFull => codes::ERROR_INSUFFICIENT_SPACE,
        std::io::ErrorKind::NotFound => codes::ERROR_DEVICE_NOT_FOUND,
        _ => codes::ERROR_FILE_ERROR,
    }
}
