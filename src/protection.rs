//! Self-protection: path classification and caller authorization.
//!
//! Paths belonging to this product (the installed bundle, the protected
//! configuration file, the shared data directory) are classified so the
//! file-event handlers can refuse tampering by anything that is not one of
//! our own components.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::monitor::{Pid, ProcessInfo};

/// Where a path sits relative to our own files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Inside the installed application bundle.
    OwnBundle,
    /// The protected configuration file itself.
    ConfigFile,
    /// Inside the protected data directory.
    ProtectedDir,
    /// Not ours.
    Unrelated,
}

impl PathClass {
    /// Whether the path is one we protect.
    pub fn is_protected(self) -> bool {
        !matches!(self, Self::Unrelated)
    }
}

/// Why a caller was trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustReason {
    /// The pid is the authenticated main application.
    AuthenticatedPid,
    /// Known component identity running from the installed bundle.
    ComponentIdentity,
    /// Update helper launched by the authenticated main application from an
    /// expected ephemeral directory.
    UpdaterLineage,
}

/// Self-protection settings (`[protection]`).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Installed application bundle.
    pub bundle_path: PathBuf,
    /// Protected policy configuration file.
    pub config_file: PathBuf,
    /// Shared data directory holding the configuration.
    pub protected_dir: PathBuf,
    /// Signing identifiers of our own components.
    pub component_ids: Vec<String>,
    /// Substring identifying the update-delivery helper.
    pub updater_marker: String,
    /// Directories the update helper may legitimately run from.
    pub updater_dirs: Vec<PathBuf>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            bundle_path: PathBuf::from("/Applications/ExecGuard.app"),
            config_file: PathBuf::from("/Users/Shared/ExecGuard/config.plist"),
            protected_dir: PathBuf::from("/Users/Shared/ExecGuard"),
            component_ids: vec![
                "io.execguard.app".to_owned(),
                "io.execguard.engine".to_owned(),
                "io.execguard.helper".to_owned(),
            ],
            updater_marker: "org.sparkle-project".to_owned(),
            updater_dirs: vec![
                PathBuf::from("/private/var/folders"),
                PathBuf::from("/private/tmp"),
                PathBuf::from("/tmp"),
            ],
        }
    }
}

/// Path classifier and caller authorizer.
#[derive(Debug, Clone)]
pub struct SelfProtection {
    config: ProtectionConfig,
}

impl SelfProtection {
    /// Build from settings.
    pub fn new(config: ProtectionConfig) -> Self {
        Self { config }
    }

    /// Settings in force.
    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    /// Classify `path`. The configuration file wins over the directory
    /// that contains it.
    pub fn classify(&self, path: &str) -> PathClass {
        let path = normalize(Path::new(path));
        if path == self.config.config_file {
            PathClass::ConfigFile
        } else if path.starts_with(&self.config.bundle_path) {
            PathClass::OwnBundle
        } else if path.starts_with(&self.config.protected_dir) {
            PathClass::ProtectedDir
        } else {
            PathClass::Unrelated
        }
    }

    /// Decide whether `caller` is one of our own components.
    ///
    /// Checks, in order: the authenticated main-application pid, a known
    /// component identity executing from inside the installed bundle, and
    /// the update helper proving lineage from the main application.
    pub fn authorize_caller(
        &self,
        caller: &ProcessInfo,
        main_app_pid: Option<Pid>,
    ) -> Option<TrustReason> {
        if main_app_pid == Some(caller.pid) {
            return Some(TrustReason::AuthenticatedPid);
        }

        let signing_id = caller.signing_id.as_deref()?;

        if self.config.component_ids.iter().any(|id| id == signing_id)
            && is_within(&caller.executable, &self.config.bundle_path)
        {
            return Some(TrustReason::ComponentIdentity);
        }

        if !self.config.updater_marker.is_empty()
            && signing_id.contains(&self.config.updater_marker)
            && main_app_pid == Some(caller.ppid)
            && self
                .config
                .updater_dirs
                .iter()
                .any(|dir| is_within(&caller.executable, dir))
        {
            return Some(TrustReason::UpdaterLineage);
        }

        None
    }
}

/// `path` is `root` or beneath it, with no `..` components that could walk
/// back out.
pub fn is_within(path: &Path, root: &Path) -> bool {
    path.is_absolute() && !has_parent_component(path) && path.starts_with(root)
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Resolve `.` and `..` lexically so `/a/b/../c` classifies as `/a/c`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
