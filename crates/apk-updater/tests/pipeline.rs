//! End-to-end tests driving the install coordinator with in-memory platform fakes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use apk_updater::download::codes;
use apk_updater::{
    Certificate, CheckResult, DownloadId, DownloadRequest, DownloadRow, DownloadService,
    Downloader, HttpResponse, InstallCoordinator, InstallHost, IntegrityVerifier,
    MemoryDownloadStore, PackageInfo, PackageInspector, ReleaseSource, SigningInfo,
    StaticVersion, UpdateCheck, UpdateChecker, UpdateError, UpdateState,
};

const PACKAGE: &str = "app.quickreply.android";
const ASSET_URL: &str =
    "https://github.com/quickreply-app/quickreply-android/releases/download/v3.0.0/app-3.0.0.apk";
const ARTIFACT: &[u8] = b"PK\x03\x04 quickreply 3.0.0 release build";

// =============================================================================
// Fakes
// =============================================================================

struct StaticRelease {
    status: u16,
    body: String,
}

#[async_trait]
impl ReleaseSource for StaticRelease {
    async fn get(&self, _url: &str) -> Result<HttpResponse, UpdateError> {
        Ok(HttpResponse {
            status: self.status,
            body: Bytes::from(self.body.clone()),
        })
    }
}

/// Writes the artifact on enqueue and reports success on the second query.
struct InstantDownloads {
    content: Vec<u8>,
    next_id: AtomicU64,
    queries: AtomicU64,
    requests: Mutex<Vec<DownloadRequest>>,
}

impl InstantDownloads {
    fn new(content: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            content: content.to_vec(),
            next_id: AtomicU64::new(100),
            queries: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DownloadService for InstantDownloads {
    async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, UpdateError> {
        std::fs::write(&request.destination, &self.content)?;
        self.requests.lock().unwrap().push(request);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn query(&self, _id: DownloadId) -> Result<Option<DownloadRow>, UpdateError> {
        let total = self.content.len() as u64;
        let row = if self.queries.fetch_add(1, Ordering::SeqCst) == 0 {
            DownloadRow {
                status: codes::STATUS_RUNNING,
                reason: 0,
                bytes_downloaded: total / 2,
                total_bytes: Some(total),
                local_path: None,
            }
        } else {
            DownloadRow {
                status: codes::STATUS_SUCCESSFUL,
                reason: 0,
                bytes_downloaded: total,
                total_bytes: Some(total),
                // Platform omitted the path; the downloader's store supplies it.
                local_path: None,
            }
        };
        Ok(Some(row))
    }
}

struct Inspector {
    artifact_signer: &'static str,
}

fn cert(tag: &str) -> Certificate {
    Certificate::from_der(format!("x509:{tag}").into_bytes())
}

#[async_trait]
impl PackageInspector for Inspector {
    async fn inspect_archive(&self, path: &Path) -> Result<PackageInfo, UpdateError> {
        if !path.exists() {
            return Err(UpdateError::InspectionFailed("archive missing".into()));
        }
        Ok(PackageInfo {
            package_name: PACKAGE.into(),
            version_name: Some("3.0.0".into()),
            signing: SigningInfo {
                content_signers: vec![cert(self.artifact_signer)],
                certificate_history: vec![],
            },
        })
    }

    async fn installed_package(&self) -> Result<PackageInfo, UpdateError> {
        Ok(PackageInfo {
            package_name: PACKAGE.into(),
            version_name: Some("2.5.0".into()),
            signing: SigningInfo {
                content_signers: vec![cert("release-2024")],
                certificate_history: vec![cert("release-2021"), cert("release-2024")],
            },
        })
    }
}

struct Host {
    allowed: AtomicBool,
}

impl InstallHost for Host {
    fn package_name(&self) -> &str {
        PACKAGE
    }

    fn can_request_package_installs(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn release_body(tag: &str, digest_hex: &str) -> String {
    serde_json::json!({
        "tag_name": tag,
        "html_url": "https://github.com/quickreply-app/quickreply-android/releases/tag/v3.0.0",
        "body": "Templates sync across devices",
        "assets": [
            {
                "name": "checksums.txt",
                "browser_download_url": "https://github.com/quickreply-app/quickreply-android/releases/download/v3.0.0/checksums.txt",
                "size": 120
            },
            {
                "name": "app-3.0.0.apk",
                "browser_download_url": ASSET_URL,
                "size": ARTIFACT.len(),
                "digest": format!("sha256:{digest_hex}")
            }
        ]
    })
    .to_string()
}

fn artifact_hex() -> String {
    hex::encode(Sha256::digest(ARTIFACT))
}

fn checker(status: u16, body: String) -> UpdateChecker {
    UpdateChecker::new(Arc::new(StaticRelease { status, body }))
}

struct Pipeline {
    coordinator: InstallCoordinator,
    downloads: Arc<InstantDownloads>,
    host: Arc<Host>,
    dir: TempDir,
}

fn pipeline(digest_hex: &str, served: &[u8], signer: &'static str, allowed: bool) -> Pipeline {
    let dir = TempDir::new().unwrap();
    let downloads = InstantDownloads::new(served);
    let downloader = Downloader::new(
        downloads.clone(),
        Arc::new(MemoryDownloadStore::new()),
        dir.path().join("updates"),
    );
    let host = Arc::new(Host {
        allowed: AtomicBool::new(allowed),
    });
    let coordinator = InstallCoordinator::new(
        Arc::new(checker(200, release_body("v3.0.0", digest_hex))),
        Arc::new(downloader),
        Arc::new(IntegrityVerifier::new(Arc::new(Inspector {
            artifact_signer: signer,
        }))),
        host.clone(),
        Arc::new(StaticVersion("2.5.0".into())),
    );
    Pipeline {
        coordinator,
        downloads,
        host,
        dir,
    }
}

fn expected_path(dir: &TempDir) -> PathBuf {
    dir.path().join("updates").join("app-3.0.0.apk")
}

// =============================================================================
// Release check scenarios
// =============================================================================

#[tokio::test]
async fn test_newer_release_is_available() {
    let hex = "a1".repeat(32);
    let result = checker(200, release_body("v3.0.0", &hex))
        .check_for_update("2.5.0")
        .await;

    match result {
        CheckResult::UpdateAvailable(update) => {
            assert_eq!(update.latest_version, "3.0.0");
            assert_eq!(update.sha256_hex, hex);
            assert_eq!(update.asset_name, "app-3.0.0.apk");
            assert_eq!(update.download_url, ASSET_URL);
        }
        other => panic!("expected update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_same_version_is_up_to_date() {
    let result = checker(200, release_body("v3.0.0", &"a1".repeat(32)))
        .check_for_update("3.0.0")
        .await;
    assert_eq!(result, CheckResult::UpToDate);
}

#[tokio::test]
async fn test_missing_release_is_up_to_date() {
    let result = checker(404, "{\"message\":\"Not Found\"}".into())
        .check_for_update("2.5.0")
        .await;
    assert_eq!(result, CheckResult::UpToDate);
}

// =============================================================================
// Full pipeline
// =============================================================================

#[tokio::test]
async fn test_full_update_to_installer_hand_off() {
    let p = pipeline(&artifact_hex(), ARTIFACT, "release-2024", true);

    assert!(matches!(
        p.coordinator.check().await.unwrap(),
        UpdateState::Available { .. }
    ));
    assert!(matches!(
        p.coordinator.start_download().await.unwrap(),
        UpdateState::DownloadQueued { .. }
    ));

    let state = p.coordinator.run_download(Duration::ZERO).await.unwrap();
    assert_eq!(
        state,
        UpdateState::ReadyToInstall {
            update: state.update().unwrap().clone(),
            verified_path: expected_path(&p.dir),
        }
    );

    let request = p.coordinator.install().await.unwrap();
    assert_eq!(request.path, expected_path(&p.dir));
    assert!(request.path.exists());
    assert!(matches!(
        p.coordinator.state().await,
        UpdateState::Installing { .. }
    ));

    let requests = p.downloads.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, ASSET_URL);
    assert!(requests[0].resumable);
    assert!(!requests[0].allow_roaming);
}

#[tokio::test]
async fn test_artifact_signed_with_rotated_key_is_accepted() {
    let p = pipeline(&artifact_hex(), ARTIFACT, "release-2021", true);

    p.coordinator.check().await.unwrap();
    p.coordinator.start_download().await.unwrap();
    assert!(matches!(
        p.coordinator.run_download(Duration::ZERO).await.unwrap(),
        UpdateState::ReadyToInstall { .. }
    ));
}

#[tokio::test]
async fn test_tampered_artifact_is_deleted() {
    let p = pipeline(&artifact_hex(), b"PK\x03\x04 something else", "release-2024", true);

    p.coordinator.check().await.unwrap();
    p.coordinator.start_download().await.unwrap();
    assert_eq!(
        p.coordinator.run_download(Duration::ZERO).await.unwrap(),
        UpdateState::Error {
            message: "integrity check failed".into()
        }
    );
    assert!(!expected_path(&p.dir).exists());
}

#[tokio::test]
async fn test_foreign_signer_is_rejected() {
    let p = pipeline(&artifact_hex(), ARTIFACT, "someone-else", true);

    p.coordinator.check().await.unwrap();
    p.coordinator.start_download().await.unwrap();
    assert_eq!(
        p.coordinator.run_download(Duration::ZERO).await.unwrap(),
        UpdateState::Error {
            message: "signature verification failed".into()
        }
    );
    assert!(!expected_path(&p.dir).exists());
}

#[tokio::test]
async fn test_permission_grant_resumes_without_redownload() {
    let p = pipeline(&artifact_hex(), ARTIFACT, "release-2024", false);

    p.coordinator.check().await.unwrap();
    p.coordinator.start_download().await.unwrap();
    assert!(matches!(
        p.coordinator.run_download(Duration::ZERO).await.unwrap(),
        UpdateState::PermissionRequired { .. }
    ));
    assert!(p.coordinator.install().await.is_err());

    let settings = p.coordinator.permission_request().await.unwrap();
    assert_eq!(settings.data, format!("package:{PACKAGE}"));

    p.host.allowed.store(true, Ordering::SeqCst);
    assert!(matches!(
        p.coordinator.on_permission_result(true).await.unwrap(),
        UpdateState::ReadyToInstall { .. }
    ));
    assert!(p.coordinator.install().await.is_ok());
    assert_eq!(p.downloads.requests.lock().unwrap().len(), 1);
}
