//! Error types for the update pipeline.

use thiserror::Error;

/// Errors that can occur while checking, downloading or verifying an update.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Release endpoint answered with an unexpected HTTP status
    #[error("release check failed with HTTP {status}")]
    UnexpectedStatus { status: u16 },

    /// Network error (timeout, DNS failure, connection reset)
    #[error("network error: {0}")]
    NetworkError(String),

    /// Release metadata could not be parsed
    #[error("malformed release metadata: {0}")]
    MalformedRelease(String),

    /// No installable asset in the release
    #[error("no APK asset found")]
    NoInstallableAsset,

    /// Asset digest absent or not of the form `sha256:<64 hex>`
    #[error("update missing integrity digest")]
    MissingDigest,

    /// Download URL could not be parsed or is not HTTPS
    #[error("invalid release URL: {0}")]
    InvalidUrl(String),

    /// Download URL host is not allow-listed
    #[error("untrusted host: {0}")]
    UntrustedHost(String),

    /// Artifact hash does not match expected value
    #[error("integrity check failed: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Artifact could not be inspected for identity metadata
    #[error("could not inspect package: {0}")]
    InspectionFailed(String),

    /// Artifact declares a different application identity
    #[error("package does not match: expected {expected}, got {actual}")]
    PackageMismatch { expected: String, actual: String },

    /// Artifact signers are not covered by the installed signers
    #[error("signature verification failed")]
    SignatureMismatch,

    /// Downloaded artifact is missing on disk
    #[error("downloaded file not found: {0}")]
    FileMissing(String),

    /// Platform download service refused or lost the download
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// Install hand-off could not be produced
    #[error("installation hand-off failed: {0}")]
    InstallationFailed(String),

    /// Operation not allowed in the current pipeline state
    #[error("invalid state transition: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Version parsing error
    #[error("version parse error: {0}")]
    VersionParseError(String),
}

/// Failure taxonomy used to decide how a caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// DNS, timeout, connection reset. Caller may re-run the check.
    Transient,
    /// Publisher-side problem with the release metadata.
    MalformedData,
    /// Download URL not on the allow-list.
    UntrustedOrigin,
    /// Hash, identity or signature mismatch.
    Integrity,
    /// Storage, permission or platform service failure.
    Platform,
}

impl UpdateError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkError(_) | Self::UnexpectedStatus { .. } => ErrorKind::Transient,
            Self::MalformedRelease(_)
            | Self::NoInstallableAsset
            | Self::MissingDigest
            | Self::JsonError(_)
            | Self::VersionParseError(_) => ErrorKind::MalformedData,
            Self::InvalidUrl(_) | Self::UntrustedHost(_) => ErrorKind::UntrustedOrigin,
            Self::HashMismatch { .. }
            | Self::InspectionFailed(_)
            | Self::PackageMismatch { .. }
            | Self::SignatureMismatch => ErrorKind::Integrity,
            Self::FileMissing(_)
            | Self::DownloadFailed(_)
            | Self::InstallationFailed(_)
            | Self::InvalidState(_)
            | Self::ConfigError(_)
            | Self::IoError(_) => ErrorKind::Platform,
        }
    }

    /// Whether the failure should be logged as a security event.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl(_)
                | Self::UntrustedHost(_)
                | Self::HashMismatch { .. }
                | Self::PackageMismatch { .. }
                | Self::SignatureMismatch
        )
    }

    /// Short, stable message for display to the user.
    ///
    /// Unlike `Display`, this omits hashes and hosts.
    pub fn user_message(&self) -> String {
        match self {
            Self::HashMismatch { .. } => "integrity check failed".to_string(),
            Self::PackageMismatch { .. } => "package does not match".to_string(),
            Self::UntrustedHost(_) => "untrusted host".to_string(),
            Self::InvalidUrl(_) => "invalid release URL".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::NetworkError(err.to_string())
    }
}

impl From<semver::Error> for UpdateError {
    fn from(err: semver::Error) -> Self {
        UpdateError::VersionParseError(err.to_string())
    }
}
