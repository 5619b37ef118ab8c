//! Release metadata as published by the release endpoint.
//!
//! The endpoint returns a GitHub-style "latest release" document:
//!
//! ```json
//! {
//!   "tag_name": "v3.0.0",
//!   "html_url": "https://github.com/owner/repo/releases/tag/v3.0.0",
//!   "body": "Release notes",
//!   "assets": [
//!     {
//!       "name": "app-3.0.0.apk",
//!       "browser_download_url": "https://github.com/owner/repo/releases/download/v3.0.0/app-3.0.0.apk",
//!       "size": 12345678,
//!       "digest": "sha256:<64 hex chars>"
//!     }
//!   ]
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// File suffix of the installable artifact.
pub const INSTALLABLE_SUFFIX: &str = ".apk";

/// Prefix of the only accepted digest form.
const DIGEST_PREFIX: &str = "sha256:";

/// Length of a hex-encoded SHA-256 digest.
const SHA256_HEX_LEN: usize = 64;

/// A published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    /// Release tag, optionally "v"-prefixed
    pub tag_name: String,
    /// Human-facing release page
    pub html_url: String,
    /// Release notes (markdown)
    #[serde(rename = "body", default)]
    pub release_notes: Option<String>,
    /// Publication time, absent for drafts
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    /// Downloadable files attached to the release
    pub assets: Vec<Asset>,
}

/// A file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// File name
    pub name: String,
    /// Direct download URL
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    /// Size in bytes
    #[serde(rename = "size")]
    pub size_bytes: u64,
    /// Content digest, e.g. `sha256:<hex>`
    #[serde(default)]
    pub digest: Option<String>,
}

impl ReleaseDescriptor {
    /// Parse a release document from raw JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, UpdateError> {
        serde_json::from_slice(data).map_err(|e| UpdateError::MalformedRelease(e.to_string()))
    }

    /// First asset whose name ends with the installable suffix.
    pub fn installable_asset(&self) -> Option<&Asset> {
        self.assets.iter().find(|asset| {
            asset
                .name
                .to_ascii_lowercase()
                .ends_with(INSTALLABLE_SUFFIX)
        })
    }
}

impl Asset {
    /// Lowercase hex SHA-256 from the digest field.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::MissingDigest` if the digest is absent or is not
    /// `sha256:` followed by exactly 64 hex characters.
    pub fn sha256_hex(&self) -> Result<String, UpdateError> {
        let digest = self.digest.as_deref().ok_or(UpdateError::MissingDigest)?;
        parse_sha256_digest(digest).ok_or(UpdateError::MissingDigest)
    }
}

/// Parse `sha256:<64 hex>` into lowercase hex.
pub fn parse_sha256_digest(digest: &str) -> Option<String> {
    let hex_part = digest.trim().strip_prefix(DIGEST_PREFIX)?;
    if hex_part.len() != SHA256_HEX_LEN || !hex_part.bytes().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(hex_part.to_ascii_lowercase())
}

/// An update that passed every metadata check and is newer than the installed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAvailable {
    /// Version without a leading "v"
    pub latest_version: String,
    /// Asset file name
    pub asset_name: String,
    /// Asset size in bytes
    pub asset_size_bytes: u64,
    /// HTTPS URL on a trusted host
    pub download_url: String,
    /// Lowercase hex SHA-256 of the asset
    pub sha256_hex: String,
    /// Release notes (markdown), empty if none were published
    pub release_notes: String,
}

impl UpdateAvailable {
    /// Expected hash as raw bytes.
    pub fn sha256_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.sha256_hex).ok()?;
        bytes.try_into().ok()
    }
}
