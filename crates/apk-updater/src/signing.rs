//! Package identity and signing certificates.
//!
//! The host platform reads package metadata; this module only reasons about
//! what it returns. Certificates are reduced to SHA-256 fingerprints and
//! compared as sets.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::UpdateError;

/// DER-encoded signing certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        Self(der.into())
    }

    pub fn as_der(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.0))
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Certificate({})", self.fingerprint())
    }
}

/// Signing information for a package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningInfo {
    /// Certificates that signed the package contents. More than one means
    /// the package is multi-signer.
    pub content_signers: Vec<Certificate>,
    /// Key rotation lineage for a single-signer package, oldest first and
    /// the current certificate last. Empty when the platform reports none.
    pub certificate_history: Vec<Certificate>,
}

impl SigningInfo {
    pub fn has_multiple_signers(&self) -> bool {
        self.content_signers.len() > 1
    }

    /// Fingerprints considered to identify this signer.
    ///
    /// Single-signer packages with a rotation lineage use the full history so
    /// that old and new keys of the same signer are both recognised.
    /// Multi-signer packages use only the current content signers.
    pub fn fingerprints(&self) -> BTreeSet<String> {
        let certs = if !self.has_multiple_signers() && !self.certificate_history.is_empty() {
            &self.certificate_history
        } else {
            &self.content_signers
        };
        certs.iter().map(Certificate::fingerprint).collect()
    }
}

/// Identity metadata of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    /// Application identity, e.g. `app.quickreply.android`
    pub package_name: String,
    pub version_name: Option<String>,
    pub signing: SigningInfo,
}

/// Platform package inspection.
#[async_trait]
pub trait PackageInspector: Send + Sync {
    /// Read identity and signers from an archive on disk without installing it.
    async fn inspect_archive(&self, path: &Path) -> Result<PackageInfo, UpdateError>;

    /// Identity and signers of the running application.
    async fn installed_package(&self) -> Result<PackageInfo, UpdateError>;
}

/// True if every artifact signer is known to the installed application.
///
/// An artifact with no signers is never covered.
pub fn signers_covered(installed: &BTreeSet<String>, artifact: &BTreeSet<String>) -> bool {
    !artifact.is_empty() && artifact.is_subset(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(tag: &str) -> Certificate {
        Certificate::from_der(format!("cert-{tag}").into_bytes())
    }

    #[test]
    fn test_fingerprint_is_sha256_of_der() {
        let c = Certificate::from_der(b"test".to_vec());
        assert_eq!(
            c.fingerprint(),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
        assert!(format!("{c:?}").starts_with("Certificate(9f86d0"));
    }

    #[test]
    fn test_single_signer_uses_history() {
        let info = SigningInfo {
            content_signers: vec![cert("new")],
            certificate_history: vec![cert("old"), cert("new")],
        };
        let fps = info.fingerprints();
        assert_eq!(fps.len(), 2);
        assert!(fps.contains(&cert("old").fingerprint()));
    }

    #[test]
    fn test_multi_signer_uses_content_signers() {
        let info = SigningInfo {
            content_signers: vec![cert("a"), cert("b")],
            certificate_history: vec![cert("old")],
        };
        assert!(info.has_multiple_signers());
        let fps = info.fingerprints();
        assert_eq!(fps.len(), 2);
        assert!(!fps.contains(&cert("old").fingerprint()));
    }

    #[test]
    fn test_no_history_falls_back_to_content_signers() {
        let info = SigningInfo {
            content_signers: vec![cert("only")],
            certificate_history: vec![],
        };
        assert_eq!(
            info.fingerprints(),
            BTreeSet::from([cert("only").fingerprint()])
        );
    }

    #[test]
    fn test_signers_covered() {
        let installed = BTreeSet::from(["a".to_string(), "b".to_string()]);
        assert!(signers_covered(&installed, &BTreeSet::from(["a".to_string()])));
        assert!(signers_covered(&installed, &installed.clone()));
        assert!(!signers_covered(&installed, &BTreeSet::from(["c".to_string()])));
        assert!(!signers_covered(
            &installed,
            &BTreeSet::from(["a".to_string(), "c".to_string()])
        ));
        assert!(!signers_covered(&installed, &BTreeSet::new()));
    }
}
