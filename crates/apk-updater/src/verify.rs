//! Artifact verification.
//!
//! A downloaded artifact is trusted only after all of the following hold:
//! - its SHA-256 matches the digest published with the release
//! - it declares the same application identity as the installed app
//! - every certificate that signed it is known to the installed app,
//!   directly or through the installed app's key rotation history
//!
//! # Security
//!
//! - Hashes are compared in constant time
//! - The file is hashed in fixed-size chunks, never loaded whole
//! - Any failure deletes the artifact before returning, so nothing
//!   half-verified is left on disk

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::error::UpdateError;
use crate::release::UpdateAvailable;
use crate::signing::{signers_covered, PackageInspector};

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// Outcome of verifying an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    /// Artifact is safe to hand to the installer; the path is unchanged
    Success { verified_path: PathBuf },
    /// Artifact rejected and deleted
    Failed { message: String },
}

/// Verification interface used by the install coordinator.
#[async_trait]
pub trait ArtifactVerify: Send + Sync {
    async fn verify(&self, path: &Path, update: &UpdateAvailable) -> VerificationResult;
}

/// Verifies downloaded artifacts for integrity and authenticity.
pub struct IntegrityVerifier {
    inspector: Arc<dyn PackageInspector>,
}

impl IntegrityVerifier {
    pub fn new(inspector: Arc<dyn PackageInspector>) -> Self {
        Self { inspector }
    }

    /// Run hash, identity and signer checks. Does not delete anything.
    pub async fn try_verify(&self, path: &Path, update: &UpdateAvailable) -> Result<(), UpdateError> {
        verify_digest(path, &update.sha256_hex).await?;

        let artifact = self
            .inspector
            .inspect_archive(path)
            .await
            .map_err(|e| UpdateError::InspectionFailed(e.to_string()))?;
        let installed = self
            .inspector
            .installed_package()
            .await
            .map_err(|e| UpdateError::InspectionFailed(format!("installed app: {e}")))?;

        if artifact.package_name != installed.package_name {
            error!(
                security = true,
                expected = %installed.package_name,
                actual = %artifact.package_name,
                path = %path.display(),
                "Artifact package name mismatch"
            );
            return Err(UpdateError::PackageMismatch {
                expected: installed.package_name,
                actual: artifact.package_name,
            });
        }

        let installed_fps = installed.signing.fingerprints();
        let artifact_fps = artifact.signing.fingerprints();
        if !signers_covered(&installed_fps, &artifact_fps) {
            error!(
                security = true,
                installed = ?installed_fps,
                artifact = ?artifact_fps,
                installed_multi_signer = installed.signing.has_multiple_signers(),
                artifact_multi_signer = artifact.signing.has_multiple_signers(),
                path = %path.display(),
                "Artifact signing certificates not trusted"
            );
            return Err(UpdateError::SignatureMismatch);
        }

        debug!(
            package = %artifact.package_name,
            signers = artifact_fps.len(),
            "Artifact signers verified"
        );
        Ok(())
    }
}

#[async_trait]
impl ArtifactVerify for IntegrityVerifier {
    async fn verify(&self, path: &Path, update: &UpdateAvailable) -> VerificationResult {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            let err = UpdateError::FileMissing(path.display().to_string());
            warn!(path = %path.display(), "Artifact to verify does not exist");
            return VerificationResult::Failed {
                message: err.user_message(),
            };
        }

        match self.try_verify(path, update).await {
            Ok(()) => {
                info!(
                    path = %path.display(),
                    version = %update.latest_version,
                    "Artifact verification complete"
                );
                VerificationResult::Success {
                    verified_path: path.to_path_buf(),
                }
            }
            Err(e) => {
                if !e.is_security_relevant() {
                    warn!(error = %e, path = %path.display(), "Artifact verification failed");
                }
                discard(path).await;
                VerificationResult::Failed {
                    message: e.user_message(),
                }
            }
        }
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "Deleted rejected artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %path.display(), error = %e, "Failed to delete rejected artifact"),
    }
}

/// Compare the file's SHA-256 with `expected_hex` (case-insensitive).
///
/// Hashing runs on the blocking pool.
pub async fn verify_digest(path: &Path, expected_hex: &str) -> Result<(), UpdateError> {
    let owned = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || compute_hash(&owned))
        .await
        .map_err(|e| UpdateError::IoError(std::io::Error::other(e)))??;

    let expected = hex::decode(expected_hex.trim()).unwrap_or_default();
    let matches = expected.len() == actual.len()
        && actual.as_slice().ct_eq(expected.as_slice()).unwrap_u8() == 1;
    if !matches {
        error!(
            security = true,
            expected = %expected_hex.to_ascii_lowercase(),
            actual = %hex::encode(actual),
            path = %path.display(),
            "Artifact hash mismatch"
        );
        return Err(UpdateError::HashMismatch {
            expected: expected_hex.to_ascii_lowercase(),
            actual: hex::encode(actual),
        });
    }

    debug!(hash = %hex::encode(actual), path = %path.display(), "Artifact hash verified");
    Ok(())
}

/// Compute SHA-256 hash of a file, reading it in chunks.
pub fn compute_hash(path: &Path) -> Result<[u8; 32], UpdateError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}
