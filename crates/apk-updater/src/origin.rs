//! Trusted download origins.
//!
//! Artifacts are only ever fetched over HTTPS from a fixed set of hosts. The
//! check runs twice: once when release metadata is accepted and again right
//! before a download is enqueued.

use reqwest::Url;
use tracing::warn;

use crate::error::UpdateError;

/// Release metadata endpoint.
pub const RELEASE_ENDPOINT: &str =
    "https://api.github.com/repos/quickreply-app/quickreply-android/releases/latest";

/// Hosts allowed to serve release artifacts.
pub const TRUSTED_HOSTS: &[&str] = &[
    "github.com",
    "objects.githubusercontent.com",
    "release-assets.githubusercontent.com",
];

/// HTTPS host allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedOrigins {
    hosts: Vec<String>,
}

impl TrustedOrigins {
    /// Allow-list with the given hosts (compared case-insensitively, exact match).
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Allowed hosts.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Validate that `url` is HTTPS on an allowed host.
    ///
    /// # Errors
    ///
    /// - `UpdateError::InvalidUrl` if the URL does not parse, is not HTTPS,
    ///   carries credentials, or uses a non-default port
    /// - `UpdateError::UntrustedHost` if the host is not allow-listed
    pub fn validate(&self, url: &str) -> Result<Url, UpdateError> {
        let parsed = Url::parse(url).map_err(|e| {
            warn!(security = true, url = %url, error = %e, "Rejected unparseable release URL");
            UpdateError::InvalidUrl(format!("{url}: {e}"))
        })?;

        if parsed.scheme() != "https" {
            warn!(security = true, url = %url, scheme = parsed.scheme(), "Rejected non-HTTPS release URL");
            return Err(UpdateError::InvalidUrl(format!("{url}: HTTPS required")));
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            warn!(security = true, url = %url, "Rejected release URL carrying credentials");
            return Err(UpdateError::InvalidUrl(format!("{url}: credentials not allowed")));
        }

        if parsed.port().is_some() {
            warn!(security = true, url = %url, "Rejected release URL with explicit port");
            return Err(UpdateError::InvalidUrl(format!("{url}: non-default port")));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| UpdateError::InvalidUrl(format!("{url}: missing host")))?
            .to_ascii_lowercase();

        if !self.hosts.iter().any(|allowed| *allowed == host) {
            warn!(security = true, host = %host, url = %url, "Rejected release URL from untrusted host");
            return Err(UpdateError::UntrustedHost(host));
        }

        Ok(parsed)
    }

    /// Convenience wrapper around [`validate`](Self::validate).
    pub fn is_trusted(&self, url: &str) -> bool {
        self.validate(url).is_ok()
    }
}

impl Default for TrustedOrigins {
    fn default() -> Self {
        Self::new(TRUSTED_HOSTS)
    }
}
