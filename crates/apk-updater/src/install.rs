//! Install hand-off.
//!
//! The pipeline never installs anything itself. It produces requests the host
//! platform's installer UI consumes and stops tracking once one is handed off.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::download::APK_MIME_TYPE;
use crate::error::UpdateError;

/// Settings screen that grants "install unknown apps" to a package.
pub const MANAGE_UNKNOWN_SOURCES_ACTION: &str = "android.settings.MANAGE_UNKNOWN_APP_SOURCES";

/// Opaque request to open the system installer on a verified artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallRequest {
    pub path: PathBuf,
    pub mime_type: String,
    /// Installer must be granted read access to `path`
    pub grant_read: bool,
    pub new_task: bool,
}

impl InstallRequest {
    pub fn for_artifact(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            mime_type: APK_MIME_TYPE.to_string(),
            grant_read: true,
            new_task: true,
        }
    }
}

/// Opaque request to open the install-permission settings for a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRequest {
    pub action: String,
    /// `package:<application id>`
    pub data: String,
}

impl PermissionRequest {
    pub fn for_package(package_name: &str) -> Self {
        Self {
            action: MANAGE_UNKNOWN_SOURCES_ACTION.to_string(),
            data: format!("package:{package_name}"),
        }
    }
}

/// Host platform installer boundary.
pub trait InstallHost: Send + Sync {
    /// Application identity of the running app.
    fn package_name(&self) -> &str;

    /// Whether this app may currently ask the system to install packages.
    fn can_request_package_installs(&self) -> bool;

    /// Build the installer request for a verified artifact.
    fn install_request(&self, path: &Path) -> Result<InstallRequest, UpdateError> {
        if !path.is_file() {
            return Err(UpdateError::FileMissing(path.display().to_string()));
        }
        Ok(InstallRequest::for_artifact(path))
    }

    /// Build the settings request that lets the user grant install permission.
    fn permission_request(&self, package_name: &str) -> PermissionRequest {
        PermissionRequest::for_package(package_name)
    }
}
