//! Release check.
//!
//! Fetches the latest release document, validates it and decides whether the
//! installed build is out of date. Every failure ends up as
//! [`CheckResult::Error`]; nothing is propagated to the caller as a fault.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::error::UpdateError;
use crate::origin::{TrustedOrigins, RELEASE_ENDPOINT};
use crate::release::{ReleaseDescriptor, UpdateAvailable};
use crate::version::{is_newer_version, normalize_tag};

/// Outcome of a release check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    /// Installed build is current, or nothing has been published yet
    UpToDate,
    /// A newer, fully validated build is available
    UpdateAvailable(UpdateAvailable),
    /// The check failed; the message is safe to show to the user
    Error(String),
}

/// Raw HTTP response from a [`ReleaseSource`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Read-only transport for the release endpoint.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Issue a GET and return status and body.
    ///
    /// Transport failures (DNS, timeout, reset) are `Err`; any HTTP status,
    /// including errors, is `Ok`.
    async fn get(&self, url: &str) -> Result<HttpResponse, UpdateError>;
}

/// `reqwest`-backed release source with bounded timeouts.
pub struct HttpReleaseSource {
    client: reqwest::Client,
}

impl HttpReleaseSource {
    /// Create a source using the given network settings.
    pub fn new(config: &NetworkConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .user_agent(&config.user_agent)
            .https_only(true)
            .build()
            .map_err(|e| UpdateError::ConfigError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReleaseSource for HttpReleaseSource {
    async fn get(&self, url: &str) -> Result<HttpResponse, UpdateError> {
        debug!("Fetching release metadata: {}", url);

        let response = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(describe_transport_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(describe_transport_error)?;
        debug!(status, bytes = body.len(), "Release metadata fetched");
        Ok(HttpResponse { status, body })
    }
}

fn describe_transport_error(err: reqwest::Error) -> UpdateError {
    let reason = if err.is_timeout() {
        "request timed out"
    } else if err.is_connect() {
        "could not connect to update server"
    } else if err.is_body() || err.is_decode() {
        "connection interrupted"
    } else {
        "request failed"
    };
    UpdateError::NetworkError(format!("{reason}: {err}"))
}

/// Anything that can answer "is there a newer build?".
#[async_trait]
pub trait UpdateCheck: Send + Sync {
    async fn check_for_update(&self, current_version: &str) -> CheckResult;
}

/// Checks the release endpoint for a newer build.
pub struct UpdateChecker {
    source: Arc<dyn ReleaseSource>,
    endpoint: String,
    origins: TrustedOrigins,
}

impl UpdateChecker {
    /// Checker against the built-in release endpoint and trusted hosts.
    pub fn new(source: Arc<dyn ReleaseSource>) -> Self {
        Self {
            source,
            endpoint: RELEASE_ENDPOINT.to_string(),
            origins: TrustedOrigins::default(),
        }
    }

    /// Replace the trusted host list.
    pub fn with_origins(mut self, origins: TrustedOrigins) -> Self {
        self.origins = origins;
        self
    }

    /// Endpoint the checker queries.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch and evaluate the latest release.
    ///
    /// - `Ok(None)`: up to date (including HTTP 404, no releases yet)
    /// - `Ok(Some(_))`: validated newer build
    pub async fn try_check(&self, current_version: &str) -> Result<Option<UpdateAvailable>, UpdateError> {
        info!(current = %current_version, "Checking for updates");

        let response = self.source.get(&self.endpoint).await?;
        match response.status {
            200 => {}
            404 => {
                info!("No releases published yet");
                return Ok(None);
            }
            _ => {
                return Err(UpdateError::UnexpectedStatus {
                    status: response.status,
                })
            }
        }

        let release = ReleaseDescriptor::from_json(&response.body)?;
        self.evaluate(&release, current_version)
    }

    /// Validate a parsed release against this checker's trusted hosts.
    pub fn evaluate(
        &self,
        release: &ReleaseDescriptor,
        current_version: &str,
    ) -> Result<Option<UpdateAvailable>, UpdateError> {
        evaluate_release(release, current_version, &self.origins)
    }
}

/// Validate a parsed release and compare it with the installed version.
///
/// Checks run in order: installable asset, digest, origin, then version.
pub fn evaluate_release(
    release: &ReleaseDescriptor,
    current_version: &str,
    origins: &TrustedOrigins,
) -> Result<Option<UpdateAvailable>, UpdateError> {
    let asset = release
        .installable_asset()
        .ok_or(UpdateError::NoInstallableAsset)?;
    let sha256_hex = asset.sha256_hex()?;
    origins.validate(&asset.download_url)?;

    let latest_version = normalize_tag(&release.tag_name).to_string();
    if !is_newer_version(&latest_version, current_version) {
        info!(
            current = %current_version,
            latest = %latest_version,
            "No update available"
        );
        return Ok(None);
    }

    info!(
        current = %current_version,
        latest = %latest_version,
        asset = %asset.name,
        size = asset.size_bytes,
        published = ?release.published_at,
        "Update available"
    );

    Ok(Some(UpdateAvailable {
        latest_version,
        asset_name: asset.name.clone(),
        asset_size_bytes: asset.size_bytes,
        download_url: asset.download_url.clone(),
        sha256_hex,
        release_notes: release.release_notes.clone().unwrap_or_default(),
    }))
}

#[async_trait]
impl UpdateCheck for UpdateChecker {
    async fn check_for_update(&self, current_version: &str) -> CheckResult {
        match self.try_check(current_version).await {
            Ok(Some(update)) => CheckResult::UpdateAvailable(update),
            Ok(None) => CheckResult::UpToDate,
            Err(e) => {
                if e.is_security_relevant() {
                    error!(security = true, error = %e, "Release rejected");
                } else {
                    warn!(error = %e, kind = ?e.kind(), "Update check failed");
                }
                CheckResult::Error(e.user_message())
            }
        }
    }
}
