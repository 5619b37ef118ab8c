//! # apk-updater
//!
//! Secure self-update pipeline for a sideloaded Android application.
//!
//! This crate handles:
//! - Release checks against a published-release endpoint
//! - SemVer 2.0 version precedence
//! - Artifact download through a platform download service, with resume
//! - SHA-256, package identity and signing certificate verification
//! - An update state machine that ends with an installer hand-off
//!
//! ## Security
//!
//! - Download URLs must be HTTPS on an allow-listed host, checked at release
//!   evaluation and again before download
//! - Artifacts are hash-verified in constant time before anything else reads them
//! - Artifacts must be signed by a certificate the installed app already
//!   trusts, directly or through its key rotation history
//! - Any artifact that fails verification is deleted

pub mod background;
pub mod checker;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod error;
pub mod install;
pub mod origin;
#[cfg(test)]
mod proptests;
pub mod release;
pub mod signing;
pub mod state;
pub mod verify;
pub mod version;

// Re-export main types for convenience
pub use background::{AlwaysOnline, BackgroundDownloadService, Connectivity, NetworkState};
pub use checker::{
    evaluate_release, CheckResult, HttpReleaseSource, HttpResponse, ReleaseSource, UpdateCheck,
    UpdateChecker,
};
pub use config::{DownloadConfig, NetworkConfig, UpdaterConfig};
pub use coordinator::{InstallCoordinator, StaticVersion, VersionProvider};
pub use download::{
    DownloadEnqueueResult, DownloadId, DownloadProgress, DownloadQueue, DownloadRequest,
    DownloadRow, DownloadService, DownloadStatus, DownloadStore, Downloader, JsonDownloadStore,
    MemoryDownloadStore,
};
pub use error::{ErrorKind, UpdateError};
pub use install::{InstallHost, InstallRequest, PermissionRequest};
pub use origin::{TrustedOrigins, RELEASE_ENDPOINT, TRUSTED_HOSTS};
pub use release::{Asset, ReleaseDescriptor, UpdateAvailable};
pub use signing::{Certificate, PackageInfo, PackageInspector, SigningInfo};
pub use state::{transition, UpdateEvent, UpdateState};
pub use verify::{ArtifactVerify, IntegrityVerifier, VerificationResult};
pub use version::{compare_versions, is_newer_version};
