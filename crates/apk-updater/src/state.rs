//! Update lifecycle state machine.
//!
//! [`transition`] is a pure function: it never touches the network, disk or
//! clock. The coordinator feeds it the outcome of each collaborator call.

use std::path::PathBuf;

use serde::Serialize;

use crate::checker::CheckResult;
use crate::download::{DownloadEnqueueResult, DownloadId, DownloadProgress, DownloadStatus};
use crate::error::UpdateError;
use crate::release::UpdateAvailable;
use crate::verify::VerificationResult;

/// Consumer-facing lifecycle of one update attempt.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpdateState {
    /// Nothing happening
    #[default]
    Idle,
    /// Release check in flight
    Checking,
    /// Installed build is current
    UpToDate,
    /// Newer build found, waiting for the user to accept it
    Available { update: UpdateAvailable },
    /// Download handed to the download service
    DownloadQueued {
        update: UpdateAvailable,
        download_id: DownloadId,
        local_path: PathBuf,
    },
    /// Download running or paused
    Downloading {
        update: UpdateAvailable,
        download_id: DownloadId,
        progress: DownloadProgress,
        paused_reason: Option<String>,
    },
    /// Artifact on disk, checks running
    Verifying {
        update: UpdateAvailable,
        local_path: PathBuf,
    },
    /// Verified artifact ready for the installer
    ReadyToInstall {
        update: UpdateAvailable,
        verified_path: PathBuf,
    },
    /// Host must grant install permission first
    PermissionRequired {
        update: UpdateAvailable,
        verified_path: PathBuf,
    },
    /// Handed to the OS installer; not tracked further
    Installing { verified_path: PathBuf },
    /// Attempt failed; the caller must start a new check
    Error { message: String },
}

impl UpdateState {
    /// Short lowercase name, used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::UpToDate => "up_to_date",
            Self::Available { .. } => "available",
            Self::DownloadQueued { .. } => "download_queued",
            Self::Downloading { .. } => "downloading",
            Self::Verifying { .. } => "verifying",
            Self::ReadyToInstall { .. } => "ready_to_install",
            Self::PermissionRequired { .. } => "permission_required",
            Self::Installing { .. } => "installing",
            Self::Error { .. } => "error",
        }
    }

    /// Whether a collaborator call is outstanding for this state.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Checking | Self::DownloadQueued { .. } | Self::Downloading { .. } | Self::Verifying { .. }
        )
    }

    /// Whether the download is still being polled.
    pub fn is_downloading(&self) -> bool {
        matches!(self, Self::DownloadQueued { .. } | Self::Downloading { .. })
    }

    /// The update this state is about, if any.
    pub fn update(&self) -> Option<&UpdateAvailable> {
        match self {
            Self::Available { update }
            | Self::DownloadQueued { update, .. }
            | Self::Downloading { update, .. }
            | Self::Verifying { update, .. }
            | Self::ReadyToInstall { update, .. }
            | Self::PermissionRequired { update, .. } => Some(update),
            _ => None,
        }
    }
}

/// Something that happened to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    CheckStarted,
    CheckFinished(CheckResult),
    DownloadEnqueued(DownloadEnqueueResult),
    DownloadPolled(DownloadStatus),
    Verified(VerificationResult),
    /// Host reports it may not install packages from this source
    PermissionMissing,
    /// User came back from the permission settings with the grant
    PermissionGranted,
    /// User came back without granting
    PermissionDenied,
    InstallHandedOff,
    /// Unexpected failure anywhere
    Failed(String),
}

impl UpdateEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::CheckStarted => "check_started",
            Self::CheckFinished(_) => "check_finished",
            Self::DownloadEnqueued(_) => "download_enqueued",
            Self::DownloadPolled(_) => "download_polled",
            Self::Verified(_) => "verified",
            Self::PermissionMissing => "permission_missing",
            Self::PermissionGranted => "permission_granted",
            Self::PermissionDenied => "permission_denied",
            Self::InstallHandedOff => "install_handed_off",
            Self::Failed(_) => "failed",
        }
    }
}

/// Compute the state that follows `state` after `event`.
///
/// `Failed` is accepted in every state. Starting a check is refused while a
/// collaborator call is outstanding.
pub fn transition(state: &UpdateState, event: UpdateEvent) -> Result<UpdateState, UpdateError> {
    use UpdateEvent as E;
    use UpdateState as S;

    let next = match (state, event) {
        (_, E::Failed(message)) => S::Error { message },

        (s, E::CheckStarted) if !s.is_busy() => S::Checking,

        (S::Checking, E::CheckFinished(result)) => match result {
            CheckResult::UpToDate => S::UpToDate,
            CheckResult::UpdateAvailable(update) => S::Available { update },
            CheckResult::Error(message) => S::Error { message },
        },

        (S::Available { update }, E::DownloadEnqueued(result)) => match result {
            DownloadEnqueueResult::Started {
                download_id,
                local_path,
            } => S::DownloadQueued {
                update: update.clone(),
                download_id,
                local_path,
            },
            DownloadEnqueueResult::Failed { message } => S::Error { message },
        },

        (
            S::DownloadQueued {
                update, download_id, ..
            }
            | S::Downloading {
                update, download_id, ..
            },
            E::DownloadPolled(status),
        ) => match status {
            DownloadStatus::InProgress {
                bytes_downloaded,
                total_bytes,
                paused_reason,
            } => S::Downloading {
                update: update.clone(),
                download_id: *download_id,
                progress: DownloadProgress::new(bytes_downloaded, total_bytes),
                paused_reason,
            },
            DownloadStatus::Succeeded { local_path } => S::Verifying {
                update: update.clone(),
                local_path,
            },
            DownloadStatus::Failed { message } => S::Error { message },
        },

        (S::Verifying { update, .. }, E::Verified(result)) => match result {
            VerificationResult::Success { verified_path } => S::ReadyToInstall {
                update: update.clone(),
                verified_path,
            },
            VerificationResult::Failed { message } => S::Error { message },
        },

        (
            S::ReadyToInstall {
                update,
                verified_path,
            },
            E::PermissionMissing,
        ) => S::PermissionRequired {
            update: update.clone(),
            verified_path: verified_path.clone(),
        },

        (
            S::PermissionRequired {
                update,
                verified_path,
            },
            E::PermissionGranted,
        ) => S::Verifying {
            update: update.clone(),
            local_path: verified_path.clone(),
        },

        (s @ S::PermissionRequired { .. }, E::PermissionDenied) => s.clone(),

        (S::ReadyToInstall { verified_path, .. }, E::InstallHandedOff) => S::Installing {
            verified_path: verified_path.clone(),
        },

        (s, e) => {
            return Err(UpdateError::InvalidState(format!(
                "{} not allowed while {}",
                e.name(),
                s.name()
            )))
        }
    };

    Ok(next)
}
