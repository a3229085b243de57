//! Core data types shared across the crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Unique key of an app: a bundle identifier or a cask token.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppIdentity(String);

impl AppIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AppIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which catalog an entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Native,
    Cask,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Native => "native",
            SourceKind::Cask => "cask",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One offer of an installable app. Replaced wholesale on catalog refresh.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    pub identity: AppIdentity,
    pub source: SourceKind,
    pub name: String,
    pub version: String,
    pub subtitle: Option<String>,
    pub developer: Option<String>,
    pub homepage: Option<String>,
    pub download_url: String,
    /// Lowercase hex SHA-256 of the artifact, if the catalog records one.
    pub sha256: Option<String>,
    pub size: Option<u64>,
    pub download_count: Option<u64>,
    /// File name of the `.app` bundle the artifact installs, e.g. `Foo.app`.
    pub app_bundle: Option<String>,
    pub categories: Vec<String>,
}

impl CatalogEntry {
    /// Bundle file name, derived from the display name when the catalog has none.
    pub fn bundle_file_name(&self) -> String {
        match &self.app_bundle {
            Some(b) => b.clone(),
            None => {
                let safe: String = self
                    .name
                    .chars()
                    .filter(|c| !matches!(c, '/' | '\\' | ':' | '\0'))
                    .collect();
                let safe = safe.trim();
                let stem = if safe.is_empty() || safe.starts_with('.') {
                    self.identity.as_str()
                } else {
                    safe
                };
                format!("{}.app", stem)
            }
        }
    }
}

/// Derived, cached fact about an app's local installation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallState {
    NotInstalled,
    Installed(String),
    Outdated { installed: String, available: String },
}

impl InstallState {
    pub fn is_installed(&self) -> bool {
        !matches!(self, InstallState::NotInstalled)
    }

    pub fn installed_version(&self) -> Option<&str> {
        match self {
            InstallState::NotInstalled => None,
            InstallState::Installed(v) => Some(v),
            InstallState::Outdated { installed, .. } => Some(installed),
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallState::NotInstalled => write!(f, "not installed"),
            InstallState::Installed(v) => write!(f, "installed {}", v),
            InstallState::Outdated {
                installed,
                available,
            } => write!(f, "installed {} (update {} available)", installed, available),
        }
    }
}

/// Lifecycle activity the coordinator can run for an app.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Install,
    Update,
    Launch,
    Reveal,
    Trash,
}

impl ActivityKind {
    /// Whether finishing this activity may change the app's install state.
    pub fn changes_install_state(&self) -> bool {
        matches!(
            self,
            ActivityKind::Install | ActivityKind::Update | ActivityKind::Trash
        )
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityKind::Install => "install",
            ActivityKind::Update => "update",
            ActivityKind::Launch => "launch",
            ActivityKind::Reveal => "reveal",
            ActivityKind::Trash => "trash",
        };
        f.write_str(s)
    }
}

/// Where an identity currently sits in the operation state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationPhase {
    Idle,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationPhase::Completed | OperationPhase::Failed | OperationPhase::Cancelled
        )
    }
}

/// Change notification sent to coordinator subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum StateEvent {
    Operation {
        identity: AppIdentity,
        activity: ActivityKind,
        phase: OperationPhase,
    },
    InstallState {
        identity: AppIdentity,
        source: SourceKind,
        state: InstallState,
    },
}

/// Application bundle discovered on disk with its manifest metadata.
#[derive(Clone, Debug)]
pub struct InstalledApp {
    pub path: PathBuf,
    pub name: String,
    pub bundle_id: Option<String>,
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, bundle: Option<&str>) -> CatalogEntry {
        CatalogEntry {
            identity: AppIdentity::from("app.demo"),
            source: SourceKind::Native,
            name: name.to_string(),
            version: "1.0".into(),
            subtitle: None,
            developer: None,
            homepage: None,
            download_url: "file:///dev/null".into(),
            sha256: None,
            size: None,
            download_count: None,
            app_bundle: bundle.map(str::to_string),
            categories: Vec::new(),
        }
    }

    #[test]
    fn bundle_file_name_prefers_catalog_value() {
        assert_eq!(entry("Demo", Some("Other.app")).bundle_file_name(), "Other.app");
        assert_eq!(entry("Demo", None).bundle_file_name(), "Demo.app");
    }

    #[test]
    fn bundle_file_name_never_escapes_install_root() {
        assert_eq!(entry("../evil", None).bundle_file_name(), "app.demo.app");
        assert_eq!(entry("a/b", None).bundle_file_name(), "ab.app");
    }

    #[test]
    fn identities_compare_by_value() {
        let a = AppIdentity::from("app.demo");
        let b = AppIdentity::new(String::from("app.demo"));
        assert_eq!(a, b);
    }
}
