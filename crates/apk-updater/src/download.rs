//! Artifact download through the platform download service.
//!
//! The [`Downloader`] never moves bytes itself. It validates the request,
//! prepares the destination, hands the transfer to a [`DownloadService`] and
//! translates the service's status rows into [`DownloadStatus`]. The service
//! may be the host's background download facility or the tokio-based
//! [`BackgroundDownloadService`](crate::background::BackgroundDownloadService).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::UpdateError;
use crate::origin::TrustedOrigins;
use crate::release::UpdateAvailable;

/// Opaque handle issued by a [`DownloadService`].
pub type DownloadId = u64;

/// MIME type of the installable artifact.
pub const APK_MIME_TYPE: &str = "application/vnd.android.package-archive";

/// File name used when the asset name sanitizes to nothing usable.
const FALLBACK_FILE_NAME: &str = "update.apk";

/// Status and reason codes reported by a download service.
///
/// These mirror the platform download manager's vocabulary so that a host
/// binding can pass its rows through unchanged.
pub mod codes {
    pub const STATUS_PENDING: u32 = 1;
    pub const STATUS_RUNNING: u32 = 2;
    pub const STATUS_PAUSED: u32 = 4;
    pub const STATUS_SUCCESSFUL: u32 = 8;
    pub const STATUS_FAILED: u32 = 16;

    pub const PAUSED_WAITING_TO_RETRY: i32 = 1;
    pub const PAUSED_WAITING_FOR_NETWORK: i32 = 2;
    pub const PAUSED_QUEUED_FOR_WIFI: i32 = 3;
    pub const PAUSED_UNKNOWN: i32 = 4;

    pub const ERROR_UNKNOWN: i32 = 1000;
    pub const ERROR_FILE_ERROR: i32 = 1001;
    pub const ERROR_UNHANDLED_HTTP_CODE: i32 = 1002;
    pub const ERROR_HTTP_DATA_ERROR: i32 = 1004;
    pub const ERROR_TOO_MANY_REDIRECTS: i32 = 1005;
    pub const ERROR_INSUFFICIENT_SPACE: i32 = 1006;
    pub const ERROR_DEVICE_NOT_FOUND: i32 = 1007;
    pub const ERROR_CANNOT_RESUME: i32 = 1008;
    pub const ERROR_FILE_ALREADY_EXISTS: i32 = 1009;
}

/// A transfer request handed to the download service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    pub title: String,
    pub description: String,
    pub mime_type: String,
    /// Show progress in the system notification area
    pub notification_visible: bool,
    /// Continue from the last byte after an interruption
    pub resumable: bool,
    pub allow_metered: bool,
    pub allow_roaming: bool,
}

/// One status row as reported by the download service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRow {
    /// One of the `codes::STATUS_*` values
    pub status: u32,
    /// Pause or failure reason (`codes::PAUSED_*`, `codes::ERROR_*`, or an HTTP status)
    pub reason: i32,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub local_path: Option<PathBuf>,
}

/// Background transfer facility.
#[async_trait]
pub trait DownloadService: Send + Sync {
    /// Queue a transfer and return its handle.
    async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, UpdateError>;

    /// Current status row, or `None` if the service no longer knows the id.
    async fn query(&self, id: DownloadId) -> Result<Option<DownloadRow>, UpdateError>;

    /// Drop the row of a finished transfer. Rows still in progress are kept.
    fn forget(&self, _id: DownloadId) {}
}

/// Result of queueing a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEnqueueResult {
    Started { download_id: DownloadId, local_path: PathBuf },
    Failed { message: String },
}

/// Result of polling a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    InProgress {
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        /// Set while the transfer is paused, e.g. "waiting for network"
        paused_reason: Option<String>,
    },
    Succeeded { local_path: PathBuf },
    Failed { message: String },
}

impl DownloadStatus {
    /// Whether polling can stop.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress { .. })
    }
}

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes, if known.
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: Option<u64>) -> Self {
        Self { downloaded, total }
    }

    /// Progress as a percentage (0.0 to 100.0), if the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.downloaded as f64 / total as f64 * 100.0).min(100.0)),
        }
    }

    /// Remaining bytes, if the total is known.
    pub fn remaining(&self) -> Option<u64> {
        self.total.map(|t| t.saturating_sub(self.downloaded))
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.total, self.percentage()) {
            (Some(total), Some(pct)) => {
                write!(f, "{}/{} bytes ({:.1}%)", self.downloaded, total, pct)
            }
            _ => write!(f, "{} bytes", self.downloaded),
        }
    }
}

// ============================================================================
// Download-id to path store
// ============================================================================

/// Remembers where each download was asked to land.
///
/// Used when a status row does not carry a local path.
pub trait DownloadStore: Send + Sync {
    fn record(&self, id: DownloadId, path: &Path) -> Result<(), UpdateError>;
    fn lookup(&self, id: DownloadId) -> Option<PathBuf>;
    fn forget(&self, id: DownloadId) -> Result<(), UpdateError>;
}

/// In-memory store scoped to its owner's lifetime.
#[derive(Debug, Default)]
pub struct MemoryDownloadStore {
    paths: Mutex<HashMap<DownloadId, PathBuf>>,
}

impl MemoryDownloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DownloadStore for MemoryDownloadStore {
    fn record(&self, id: DownloadId, path: &Path) -> Result<(), UpdateError> {
        lock(&self.paths).insert(id, path.to_path_buf());
        Ok(())
    }

    fn lookup(&self, id: DownloadId) -> Option<PathBuf> {
        lock(&self.paths).get(&id).cloned()
    }

    fn forget(&self, id: DownloadId) -> Result<(), UpdateError> {
        lock(&self.paths).remove(&id);
        Ok(())
    }
}

/// Store persisted as JSON so paths survive a process restart.
#[derive(Debug)]
pub struct JsonDownloadStore {
    file: PathBuf,
    paths: Mutex<BTreeMap<DownloadId, PathBuf>>,
}

impl JsonDownloadStore {
    /// Open the store, loading existing entries if the file exists.
    pub fn open(file: PathBuf) -> Result<Self, UpdateError> {
        let paths = if file.exists() {
            let content = std::fs::read_to_string(&file)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };
        debug!(file = %file.display(), "Opened download store");
        Ok(Self {
            file,
            paths: Mutex::new(paths),
        })
    }

    fn persist(&self, paths: &BTreeMap<DownloadId, PathBuf>) -> Result<(), UpdateError> {
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.file, serde_json::to_string_pretty(paths)?)?;
        Ok(())
    }
}

impl DownloadStore for JsonDownloadStore {
    fn record(&self, id: DownloadId, path: &Path) -> Result<(), UpdateError> {
        let mut paths = lock(&self.paths);
        paths.insert(id, path.to_path_buf());
        self.persist(&paths)
    }

    fn lookup(&self, id: DownloadId) -> Option<PathBuf> {
        lock(&self.paths).get(&id).cloned()
    }

    fn forget(&self, id: DownloadId) -> Result<(), UpdateError> {
        let mut paths = lock(&self.paths);
        if paths.remove(&id).is_some() {
            self.persist(&paths)?;
        }
        Ok(())
    }
}

// A poisoned map is still a valid map.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Downloader
// ============================================================================

/// Queue-and-poll interface used by the install coordinator.
#[async_trait]
pub trait DownloadQueue: Send + Sync {
    async fn enqueue_download(&self, update: &UpdateAvailable) -> DownloadEnqueueResult;
    async fn download_status(&self, id: DownloadId) -> DownloadStatus;
    /// Drop bookkeeping for a finished download.
    fn release(&self, id: DownloadId);
}

/// Validates, stages and tracks artifact downloads.
pub struct Downloader {
    service: Arc<dyn DownloadService>,
    store: Arc<dyn DownloadStore>,
    origins: TrustedOrigins,
    download_dir: PathBuf,
    notification_title: String,
}

impl Downloader {
    /// Create a downloader writing into `download_dir`.
    pub fn new(
        service: Arc<dyn DownloadService>,
        store: Arc<dyn DownloadStore>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            service,
            store,
            origins: TrustedOrigins::default(),
            download_dir,
            notification_title: "Downloading update".to_string(),
        }
    }

    /// Replace the trusted host list.
    pub fn with_origins(mut self, origins: TrustedOrigins) -> Self {
        self.origins = origins;
        self
    }

    /// Set the notification title shown during the transfer.
    pub fn with_notification_title(mut self, title: impl Into<String>) -> Self {
        self.notification_title = title.into();
        self
    }

    /// Directory downloads are written to.
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Destination path for an update.
    pub fn destination_for(&self, update: &UpdateAvailable) -> PathBuf {
        self.download_dir.join(safe_file_name(&update.asset_name))
    }

    /// Validate the URL, clear the destination and queue the transfer.
    pub async fn try_enqueue(
        &self,
        update: &UpdateAvailable,
    ) -> Result<(DownloadId, PathBuf), UpdateError> {
        // Checked again here: the update may not have come from the checker.
        self.origins.validate(&update.download_url)?;

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let destination = self.destination_for(update);
        match tokio::fs::remove_file(&destination).await {
            Ok(()) => debug!(path = %destination.display(), "Removed stale download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let request = DownloadRequest {
            url: update.download_url.clone(),
            destination: destination.clone(),
            title: self.notification_title.clone(),
            description: format!("Version {}", update.latest_version),
            mime_type: APK_MIME_TYPE.to_string(),
            notification_visible: true,
            resumable: true,
            allow_metered: true,
            allow_roaming: false,
        };

        let id = self.service.enqueue(request).await?;
        // The transfer is already running.
        if let Err(e) = self.store.record(id, &destination) {
            warn!(download_id = id, error = %e, "Failed to record download path");
        }
        info!(
            download_id = id,
            version = %update.latest_version,
            path = %destination.display(),
            "Download enqueued"
        );
        Ok((id, destination))
    }

    /// Query the service and map the row. Every call is a fresh query.
    pub async fn status(&self, id: DownloadId) -> DownloadStatus {
        let row = match self.service.query(id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(download_id = id, "Download no longer known to the service");
                return DownloadStatus::Failed {
                    message: "download not found".to_string(),
                };
            }
            Err(e) => {
                warn!(download_id = id, error = %e, "Download status query failed");
                return DownloadStatus::Failed {
                    message: e.user_message(),
                };
            }
        };
        map_row(id, row, self.store.as_ref())
    }
}

#[async_trait]
impl DownloadQueue for Downloader {
    async fn enqueue_download(&self, update: &UpdateAvailable) -> DownloadEnqueueResult {
        match self.try_enqueue(update).await {
            Ok((download_id, local_path)) => DownloadEnqueueResult::Started {
                download_id,
                local_path,
            },
            Err(e) => {
                if e.is_security_relevant() {
                    error!(security = true, url = %update.download_url, error = %e, "Download refused");
                } else {
                    warn!(error = %e, "Failed to enqueue download");
                }
                DownloadEnqueueResult::Failed {
                    message: e.user_message(),
                }
            }
        }
    }

    async fn download_status(&self, id: DownloadId) -> DownloadStatus {
        self.status(id).await
    }

    fn release(&self, id: DownloadId) {
        self.service.forget(id);
        if let Err(e) = self.store.forget(id) {
            warn!(download_id = id, error = %e, "Failed to drop download record");
        }
    }
}

fn map_row(id: DownloadId, row: DownloadRow, store: &dyn DownloadStore) -> DownloadStatus {
    match row.status {
        codes::STATUS_PENDING | codes::STATUS_RUNNING => DownloadStatus::InProgress {
            bytes_downloaded: row.bytes_downloaded,
            total_bytes: row.total_bytes,
            paused_reason: None,
        },
        codes::STATUS_PAUSED => DownloadStatus::InProgress {
            bytes_downloaded: row.bytes_downloaded,
            total_bytes: row.total_bytes,
            paused_reason: Some(describe_pause_reason(row.reason).to_string()),
        },
        codes::STATUS_SUCCESSFUL => match row.local_path.or_else(|| store.lookup(id)) {
            Some(local_path) => {
                info!(download_id = id, path = %local_path.display(), "Download complete");
                DownloadStatus::Succeeded { local_path }
            }
            None => {
                error!(download_id = id, "Download finished but no local path is known");
                DownloadStatus::Failed {
                    message: "path unavailable".to_string(),
                }
            }
        },
        codes::STATUS_FAILED => {
            let message = describe_failure_reason(row.reason);
            warn!(download_id = id, reason = row.reason, %message, "Download failed");
            DownloadStatus::Failed { message }
        }
        other => DownloadStatus::Failed {
            message: format!("unknown download status {other}"),
        },
    }
}

/// Stable text for a failure reason code.
pub fn describe_failure_reason(reason: i32) -> String {
    let text = match reason {
        codes::ERROR_INSUFFICIENT_SPACE => "not enough storage space",
        codes::ERROR_DEVICE_NOT_FOUND => "storage not available",
        codes::ERROR_FILE_ERROR => "could not write file",
        codes::ERROR_HTTP_DATA_ERROR => "network error during download",
        codes::ERROR_TOO_MANY_REDIRECTS => "too many redirects",
        codes::ERROR_UNHANDLED_HTTP_CODE => "unexpected server response",
        codes::ERROR_CANNOT_RESUME => "download cannot be resumed",
        codes::ERROR_FILE_ALREADY_EXISTS => "file already exists",
        400..=599 => return format!("server returned HTTP {reason}"),
        _ => "download failed",
    };
    text.to_string()
}

/// Stable text for a pause reason code.
pub fn describe_pause_reason(reason: i32) -> &'static str {
    match reason {
        codes::PAUSED_WAITING_TO_RETRY => "waiting to retry",
        codes::PAUSED_WAITING_FOR_NETWORK => "waiting for network",
        codes::PAUSED_QUEUED_FOR_WIFI => "waiting for Wi-Fi",
        _ => "paused",
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn safe_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        sanitized
    }
}
