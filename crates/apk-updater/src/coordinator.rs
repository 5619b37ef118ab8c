//! Install coordinator - sequences check, download, verification and hand-off.
//!
//! The coordinator owns the [`UpdateState`] and advances it only through
//! [`transition`]. Every collaborator call is guarded: a failure or panic
//! inside a collaborator becomes [`UpdateState::Error`] instead of escaping to
//! the caller. `Err` is returned only when the caller asks for something the
//! current state does not allow.
//!
//! # Example
//!
//! ```ignore
//! let coordinator = InstallCoordinator::new(checker, downloader, verifier, host, version);
//!
//! if let UpdateState::Available { update } = coordinator.check().await? {
//!     println!("Update available: {}", update.latest_version);
//!     coordinator.start_download().await?;
//!     match coordinator.run_download(Duration::from_millis(500)).await? {
//!         UpdateState::ReadyToInstall { .. } => launch(coordinator.install().await?),
//!         UpdateState::PermissionRequired { .. } => open(coordinator.permission_request().await?),
//!         other => println!("{other:?}"),
//!     }
//! }
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::checker::UpdateCheck;
use crate::download::{DownloadId, DownloadQueue};
use crate::error::UpdateError;
use crate::install::{InstallHost, InstallRequest, PermissionRequest};
use crate::release::UpdateAvailable;
use crate::state::{transition, UpdateEvent, UpdateState};
use crate::verify::ArtifactVerify;

/// Supplies the installed application's version name.
pub trait VersionProvider: Send + Sync {
    fn current_version(&self) -> Option<String>;
}

/// Fixed version name.
#[derive(Debug, Clone)]
pub struct StaticVersion(pub String);

impl VersionProvider for StaticVersion {
    fn current_version(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Drives one update attempt at a time through the lifecycle.
pub struct InstallCoordinator {
    checker: Arc<dyn UpdateCheck>,
    downloads: Arc<dyn DownloadQueue>,
    verifier: Arc<dyn ArtifactVerify>,
    host: Arc<dyn InstallHost>,
    version: Arc<dyn VersionProvider>,
    state: Arc<RwLock<UpdateState>>,
}

impl InstallCoordinator {
    pub fn new(
        checker: Arc<dyn UpdateCheck>,
        downloads: Arc<dyn DownloadQueue>,
        verifier: Arc<dyn ArtifactVerify>,
        host: Arc<dyn InstallHost>,
        version: Arc<dyn VersionProvider>,
    ) -> Self {
        Self {
            checker,
            downloads,
            verifier,
            host,
            version,
            state: Arc::new(RwLock::new(UpdateState::Idle)),
        }
    }

    /// Get the current state.
    pub async fn state(&self) -> UpdateState {
        self.state.read().await.clone()
    }

    async fn apply(&self, event: UpdateEvent) -> Result<UpdateState, UpdateError> {
        let mut state = self.state.write().await;
        let next = transition(&state, event)?;
        debug!(from = state.name(), to = next.name(), "Update state changed");
        *state = next.clone();
        Ok(next)
    }

    async fn fail(&self, message: String) -> UpdateState {
        error!(from = self.state.read().await.name(), %message, "Update attempt failed");
        *self.state.write().await = UpdateState::Error {
            message: message.clone(),
        };
        UpdateState::Error { message }
    }

    /// Check the release source.
    ///
    /// Allowed from any state without an outstanding collaborator call; a new
    /// check supersedes the previous attempt.
    pub async fn check(&self) -> Result<UpdateState, UpdateError> {
        self.apply(UpdateEvent::CheckStarted).await?;
        let cancel = CancelGuard::arm(&self.state, "checking");
        info!("Checking for updates...");

        let current = match self.version.current_version() {
            Some(v) => v,
            None => {
                let failed = self.fail("current version unavailable".to_string()).await;
                cancel.disarm();
                return Ok(failed);
            }
        };

        let next = match guarded(self.checker.check_for_update(&current)).await {
            Ok(result) => self.apply(UpdateEvent::CheckFinished(result)).await,
            Err(message) => Ok(self.fail(message).await),
        };
        cancel.disarm();
        next
    }

    /// Queue the download of the available update.
    pub async fn start_download(&self) -> Result<UpdateState, UpdateError> {
        let update = match &*self.state.read().await {
            UpdateState::Available { update } => update.clone(),
            other => return Err(not_allowed("start_download", other)),
        };

        info!(version = %update.latest_version, "Starting update download");
        match guarded(self.downloads.enqueue_download(&update)).await {
            Ok(result) => self.apply(UpdateEvent::DownloadEnqueued(result)).await,
            Err(message) => Ok(self.fail(message).await),
        }
    }

    /// Poll the download once. A finished download is verified right away.
    pub async fn poll_download(&self) -> Result<UpdateState, UpdateError> {
        let id: DownloadId = match &*self.state.read().await {
            UpdateState::DownloadQueued { download_id, .. }
            | UpdateState::Downloading { download_id, .. } => *download_id,
            other => return Err(not_allowed("poll_download", other)),
        };

        let status = match guarded(self.downloads.download_status(id)).await {
            Ok(status) => status,
            Err(message) => return Ok(self.fail(message).await),
        };
        let terminal = status.is_terminal();

        let next = self.apply(UpdateEvent::DownloadPolled(status)).await?;
        if terminal {
            self.downloads.release(id);
        }

        if matches!(next, UpdateState::Verifying { .. }) {
            return self.verify_downloaded().await;
        }
        Ok(next)
    }

    /// Poll until the download leaves the downloading states.
    pub async fn run_download(&self, poll_interval: Duration) -> Result<UpdateState, UpdateError> {
        loop {
            let state = self.poll_download().await?;
            if !state.is_downloading() {
                return Ok(state);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn verify_downloaded(&self) -> Result<UpdateState, UpdateError> {
        let cancel = CancelGuard::arm(&self.state, "verifying");
        let next = self.verify_and_settle().await;
        cancel.disarm();
        next
    }

    async fn verify_and_settle(&self) -> Result<UpdateState, UpdateError> {
        let (update, path): (UpdateAvailable, PathBuf) = match &*self.state.read().await {
            UpdateState::Verifying { update, local_path } => (update.clone(), local_path.clone()),
            other => return Err(not_allowed("verify", other)),
        };

        let result = match guarded(self.verifier.verify(&path, &update)).await {
            Ok(result) => result,
            Err(message) => return Ok(self.fail(message).await),
        };

        let next = self.apply(UpdateEvent::Verified(result)).await?;
        if !matches!(next, UpdateState::ReadyToInstall { .. }) {
            return Ok(next);
        }
        match self.can_install().await {
            Ok(true) => Ok(next),
            Ok(false) => {
                info!("Install permission required before hand-off");
                self.apply(UpdateEvent::PermissionMissing).await
            }
            Err(message) => Ok(self.fail(message).await),
        }
    }

    async fn can_install(&self) -> Result<bool, String> {
        guarded(async { self.host.can_request_package_installs() }).await
    }

    /// Settings request the caller should launch while in `PermissionRequired`.
    pub async fn permission_request(&self) -> Result<PermissionRequest, UpdateError> {
        match &*self.state.read().await {
            UpdateState::PermissionRequired { .. } => {
                guarded(async { self.host.permission_request(self.host.package_name()) })
                    .await
                    .map_err(UpdateError::InstallationFailed)
            }
            other => Err(not_allowed("permission_request", other)),
        }
    }

    /// Called when the user returns from the permission settings.
    ///
    /// On grant the already downloaded artifact is verified again; nothing is
    /// downloaded a second time.
    pub async fn on_permission_result(&self, granted: bool) -> Result<UpdateState, UpdateError> {
        let allowed = match self.can_install().await {
            Ok(allowed) => allowed,
            Err(message) => return Ok(self.fail(message).await),
        };
        if !granted || !allowed {
            warn!(granted, "Install permission still missing");
            return self.apply(UpdateEvent::PermissionDenied).await;
        }

        self.apply(UpdateEvent::PermissionGranted).await?;
        self.verify_downloaded().await
    }

    /// Hand the verified artifact to the OS installer.
    ///
    /// After this the coordinator is `Installing` and no longer tracks the
    /// outcome.
    pub async fn install(&self) -> Result<InstallRequest, UpdateError> {
        let path = match &*self.state.read().await {
            UpdateState::ReadyToInstall { verified_path, .. } => verified_path.clone(),
            other => return Err(not_allowed("install", other)),
        };

        match self.can_install().await {
            Ok(true) => {}
            Ok(false) => {
                self.apply(UpdateEvent::PermissionMissing).await?;
                return Err(UpdateError::InstallationFailed(
                    "install permission required".to_string(),
                ));
            }
            Err(message) => {
                self.fail(message.clone()).await;
                return Err(UpdateError::InstallationFailed(message));
            }
        }

        match guarded(async { self.host.install_request(&path) }).await {
            Ok(Ok(request)) => {
                self.apply(UpdateEvent::InstallHandedOff).await?;
                info!(path = %path.display(), "Update handed to installer");
                Ok(request)
            }
            Ok(Err(e)) => {
                self.fail(e.user_message()).await;
                Err(e)
            }
            Err(message) => {
                self.fail(message.clone()).await;
                Err(UpdateError::InstallationFailed(message))
            }
        }
    }
}

/// Moves the state to `Error` if a call is dropped while the state is still
/// `during`.
struct CancelGuard {
    state: Arc<RwLock<UpdateState>>,
    during: &'static str,
    armed: bool,
}

impl CancelGuard {
    fn arm(state: &Arc<RwLock<UpdateState>>, during: &'static str) -> Self {
        Self {
            state: Arc::clone(state),
            during,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let during = self.during;
        match self.state.try_write() {
            Ok(mut state) => mark_cancelled(&mut state, during),
            Err(_) => {
                let state = Arc::clone(&self.state);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        mark_cancelled(&mut *state.write().await, during);
                    });
                }
            }
        }
    }
}

fn mark_cancelled(state: &mut UpdateState, during: &'static str) {
    if state.name() == during {
        warn!(state = during, "Update call cancelled");
        *state = UpdateState::Error {
            message: "cancelled".to_string(),
        };
    }
}

fn not_allowed(operation: &str, state: &UpdateState) -> UpdateError {
    UpdateError::InvalidState(format!("{operation} not allowed while {}", state.name()))
}

/// Run a collaborator call, turning a panic into an error message.
async fn guarded<T>(fut: impl Future<Output = T>) -> Result<T, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| format!("unexpected failure: {}", panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
