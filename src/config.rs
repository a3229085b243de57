//! Configuration loading.
//!
//! Stored as TOML. Every field has a default rooted in the user's home
//! directory, so a missing file simply means "use defaults":
//!
//! ```toml
//! [catalog]
//! native = "https://appfair.net/fairapps-macOS.json"
//! cask = "https://formulae.brew.sh/api/cask.json"
//!
//! [native]
//! install_root = "/Applications/App Fair"
//!
//! [homebrew]
//! enabled = true
//! integrated_download = true
//! ```

use home::home_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR_NAME: &str = "app-manager";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub native: NativeConfig,
    #[serde(default)]
    pub homebrew: HomebrewConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

/// Catalog locations: `http(s)://` or `file://` URLs, or plain paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_native_catalog")]
    pub native: String,
    #[serde(default = "default_cask_catalog")]
    pub cask: String,
}

fn default_native_catalog() -> String {
    "https://appfair.net/fairapps-macOS.json".to_string()
}

fn default_cask_catalog() -> String {
    "https://formulae.brew.sh/api/cask.json".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            native: default_native_catalog(),
            cask: default_cask_catalog(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeConfig {
    /// Directory native bundles are installed into.
    #[serde(default = "default_install_root")]
    pub install_root: PathBuf,
    /// Refuse artifacts whose catalog entry carries no checksum.
    #[serde(default = "default_true")]
    pub require_checksum: bool,
    /// Move deleted bundles to the Trash instead of removing them.
    #[serde(default = "default_true")]
    pub use_trash: bool,
    /// Refuse to trash an app that is currently running.
    #[serde(default = "default_true")]
    pub refuse_running: bool,
}

fn default_install_root() -> PathBuf {
    PathBuf::from("/Applications").join("App Fair")
}

fn default_true() -> bool {
    true
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            install_root: default_install_root(),
            require_checksum: true,
            use_trash: true,
            refuse_running: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomebrewConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Private Homebrew prefix owned by this application.
    #[serde(default = "default_brew_root")]
    pub root: PathBuf,
    /// Use the system-wide `brew` instead of the private one.
    #[serde(default)]
    pub use_system: bool,
    /// Explicit `brew` executable, overriding both of the above.
    #[serde(default)]
    pub brew_path: Option<PathBuf>,
    /// Where casks link their `.app` bundles.
    #[serde(default = "default_cask_app_dir")]
    pub app_dir: PathBuf,
    /// Download cask artifacts ourselves so byte progress can be reported.
    #[serde(default = "default_true")]
    pub integrated_download: bool,
    /// Archive the private toolchain is bootstrapped from.
    #[serde(default = "default_bootstrap_url")]
    pub bootstrap_url: String,
}

fn default_brew_root() -> PathBuf {
    app_support_dir().join("Homebrew")
}

fn default_cask_app_dir() -> PathBuf {
    PathBuf::from("/Applications")
}

fn default_bootstrap_url() -> String {
    "https://github.com/Homebrew/brew/archive/refs/heads/master.zip".to_string()
}

impl Default for HomebrewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_brew_root(),
            use_system: false,
            brew_path: None,
            app_dir: default_cask_app_dir(),
            integrated_download: true,
            bootstrap_url: default_bootstrap_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_user_agent() -> String {
    format!("{}/{}", APP_DIR_NAME, env!("CARGO_PKG_VERSION"))
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn app_support_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("/Users/unknown"))
        .join("Library")
        .join("Application Support")
        .join(APP_DIR_NAME)
}

impl Config {
    /// `~/.config/app-manager/config.toml`
    pub fn default_path() -> PathBuf {
        home_dir()
            .unwrap_or_else(|| PathBuf::from("/Users/unknown"))
            .join(".config")
            .join(APP_DIR_NAME)
            .join("config.toml")
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "download.timeout_secs must be greater than zero".into(),
            ));
        }
        if self.catalog.native.trim().is_empty() || self.catalog.cask.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "catalog locations must not be empty".into(),
            ));
        }
        if self.native.install_root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "native.install_root must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Caskroom consulted for installed cask versions.
    ///
    /// Follows the `brew` that actually runs: an explicit `brew_path` of
    /// `<prefix>/bin/brew` uses `<prefix>/Caskroom`.
    pub fn caskroom(&self) -> PathBuf {
        let explicit_prefix = self
            .homebrew
            .brew_path
            .as_deref()
            .and_then(Path::parent)
            .and_then(Path::parent);
        match explicit_prefix {
            Some(prefix) => prefix.join("Caskroom"),
            None if self.homebrew.use_system => system_brew_prefix().join("Caskroom"),
            None => self.homebrew.root.join("Caskroom"),
        }
    }
}

/// Prefix of the system-wide Homebrew installation.
pub fn system_brew_prefix() -> PathBuf {
    if cfg!(target_arch = "aarch64") {
        PathBuf::from("/opt/homebrew")
    } else {
        PathBuf::from("/usr/local")
    }
}
