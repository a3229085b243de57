//! Homebrew casks, installed through a `brew` toolchain this application owns.
//!
//! The private toolchain lives under `HomebrewConfig::root` and is
//! bootstrapped on first use. Every `brew` invocation is polled so that a
//! cancelled operation kills the subprocess instead of waiting it out.

use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Backend;
use crate::config::{HomebrewConfig, system_brew_prefix};
use crate::core::{caskroom_versions, unpack_zip};
use crate::error::AppError;
use crate::osx::{launch_app, reveal_in_finder};
use crate::progress::{Downloader, ProgressHandle, verify_checksum};
use crate::types::{AppIdentity, CatalogEntry, SourceKind};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct HomebrewBackend {
    config: HomebrewConfig,
    caskroom: PathBuf,
    downloader: Downloader,
    bootstrap_lock: Mutex<()>,
}

impl HomebrewBackend {
    pub fn new(config: &HomebrewConfig, caskroom: PathBuf, downloader: Downloader) -> Self {
        Self {
            config: config.clone(),
            caskroom,
            downloader,
            bootstrap_lock: Mutex::new(()),
        }
    }

    pub fn brew_path(&self) -> PathBuf {
        if let Some(path) = &self.config.brew_path {
            return path.clone();
        }
        let prefix = if self.config.use_system {
            system_brew_prefix()
        } else {
            self.config.root.clone()
        };
        prefix.join("bin").join("brew")
    }

    /// Whether the toolchain is the private one we may install and remove.
    fn owns_toolchain(&self) -> bool {
        !self.config.use_system && self.config.brew_path.is_none()
    }

    pub fn is_toolchain_installed(&self) -> bool {
        self.brew_path().is_file()
    }

    /// Return the `brew` executable, bootstrapping the private toolchain if needed.
    pub fn ensure_toolchain(&self, progress: &ProgressHandle) -> Result<PathBuf> {
        if !self.config.enabled {
            return Err(AppError::ToolchainMissing("Homebrew support is disabled".into()).into());
        }
        let _guard = self.bootstrap_lock.lock().unwrap_or_else(|e| e.into_inner());
        let brew = self.brew_path();
        if brew.is_file() {
            return Ok(brew);
        }
        if !self.owns_toolchain() {
            return Err(AppError::ToolchainMissing(format!("{} not found", brew.display())).into());
        }
        self.bootstrap(progress)?;
        if !brew.is_file() {
            return Err(AppError::ToolchainMissing(format!(
                "bootstrap archive did not provide {}",
                brew.display()
            ))
            .into());
        }
        Ok(brew)
    }

    fn bootstrap(&self, progress: &ProgressHandle) -> Result<()> {
        let root = &self.config.root;
        info!("Bootstrapping Homebrew into {:?}", root);
        let parent = root
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Homebrew root {:?} has no parent", root))?;
        fs::create_dir_all(parent).with_context(|| format!("Create {:?}", parent))?;
        let staging = tempfile::Builder::new()
            .prefix(".homebrew-")
            .tempdir_in(parent)
            .context("Create staging directory")?;

        let archive = staging.path().join("brew.zip");
        self.downloader
            .fetch(&self.config.bootstrap_url, &archive, progress)
            .with_context(|| format!("Download {}", self.config.bootstrap_url))?;
        progress.check_cancelled()?;

        let unpacked = staging.path().join("unpacked");
        unpack_zip(&archive, &unpacked)?;
        let top = toolchain_dir_in(&unpacked).ok_or_else(|| {
            AppError::ToolchainMissing("bootstrap archive contains no bin/brew".into())
        })?;

        if root.exists() {
            fs::remove_dir_all(root).with_context(|| format!("Remove stale {:?}", root))?;
        }
        fs::rename(&top, root).with_context(|| format!("Move toolchain to {:?}", root))?;
        make_executable(&root.join("bin").join("brew"))?;
        Ok(())
    }

    /// Remove the private toolchain and everything installed through it.
    pub fn uninstall_toolchain(&self) -> Result<()> {
        if !self.owns_toolchain() {
            anyhow::bail!(
                "refusing to remove a Homebrew installation this application does not own"
            );
        }
        let _guard = self.bootstrap_lock.lock().unwrap_or_else(|e| e.into_inner());
        let root = &self.config.root;
        if root.exists() {
            fs::remove_dir_all(root).with_context(|| format!("Remove {:?}", root))?;
            info!("Removed Homebrew toolchain at {:?}", root);
        }
        Ok(())
    }

    /// Apply the `enabled` setting: a disabled feature leaves no private toolchain behind.
    pub fn reconcile(&self) -> Result<()> {
        if !self.config.enabled && self.owns_toolchain() && self.config.root.exists() {
            info!("Homebrew support disabled; uninstalling private toolchain");
            self.uninstall_toolchain()?;
        }
        Ok(())
    }

    fn installed_versions(&self, identity: &AppIdentity) -> Vec<String> {
        caskroom_versions(&self.caskroom)
            .remove(identity)
            .map(|v| v.into_iter().collect())
            .unwrap_or_default()
    }

    /// Run `brew` with `args`, killing it if the operation is cancelled.
    fn run(&self, brew: &Path, args: &[&str], progress: &ProgressHandle) -> Result<String> {
        debug!("brew {}", args.join(" "));
        let mut child = Command::new(brew)
            .args(args)
            .env("HOMEBREW_NO_AUTO_UPDATE", "1")
            .env("HOMEBREW_NO_ANALYTICS", "1")
            .env("HOMEBREW_NO_INSTALL_CLEANUP", "1")
            .env("HOMEBREW_NO_ENV_HINTS", "1")
            .env(
                "HOMEBREW_CASK_OPTS",
                format!("--appdir={}", self.config.app_dir.display()),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::ToolchainMissing(format!("{}: {}", brew.display(), e)))?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = loop {
            if progress.is_cancelled() {
                warn!("Cancelling brew {}", args.join(" "));
                let _ = child.kill();
                let _ = child.wait();
                return Err(AppError::Cancelled.into());
            }
            match child.try_wait().context("Poll brew")? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let out = stdout.join().unwrap_or_default();
        let err = stderr.join().unwrap_or_default();
        if !status.success() {
            anyhow::bail!("brew {} failed ({}): {}", args.join(" "), status, err.trim());
        }
        Ok(out)
    }

    /// Download the cask artifact into Homebrew's cache ourselves so byte
    /// progress is visible; `brew install` then finds it already fetched.
    fn prefetch(&self, brew: &Path, entry: &CatalogEntry, progress: &ProgressHandle) -> Result<()> {
        let token = entry.identity.as_str();
        let out = self.run(brew, &["--cache", "--cask", token], progress)?;
        let cached = out
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("brew --cache printed nothing for {}", token))?;

        if let Some(parent) = cached.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Create {:?}", parent))?;
        }
        let partial = cached.with_extension("incomplete");
        let digest = self
            .downloader
            .fetch(&entry.download_url, &partial, progress)
            .with_context(|| format!("Download {}", entry.download_url))?;
        if let Some(expected) = &entry.sha256 {
            if let Err(e) = verify_checksum(expected, &digest) {
                let _ = fs::remove_file(&partial);
                return Err(e.into());
            }
        }
        fs::rename(&partial, &cached).with_context(|| format!("Move download to {:?}", cached))?;
        debug!("Prefetched {} into {:?}", token, cached);
        Ok(())
    }

    fn app_path(&self, entry: &CatalogEntry) -> Result<PathBuf> {
        let path = self.config.app_dir.join(entry.bundle_file_name());
        if self.installed_versions(&entry.identity).is_empty() || !path.exists() {
            return Err(AppError::NotInstalled(entry.identity.clone()).into());
        }
        Ok(path)
    }
}

impl Backend for HomebrewBackend {
    fn source(&self) -> SourceKind {
        SourceKind::Cask
    }

    fn install(
        &self,
        entry: &CatalogEntry,
        progress: &ProgressHandle,
        overwrite: bool,
    ) -> Result<()> {
        let brew = self.ensure_toolchain(progress)?;
        let installed = self.installed_versions(&entry.identity);
        if !installed.is_empty() && !overwrite {
            return Err(AppError::AlreadyInstalled {
                identity: entry.identity.clone(),
                version: installed.join(", "),
            }
            .into());
        }
        if self.config.integrated_download {
            self.prefetch(&brew, entry, progress)?;
        }
        progress.check_cancelled()?;

        let token = entry.identity.as_str();
        let verb = if installed.is_empty() { "install" } else { "upgrade" };
        info!("brew {} --cask {}", verb, token);
        self.run(&brew, &[verb, "--cask", token], progress)?;
        progress.finish();
        Ok(())
    }

    fn launch(&self, entry: &CatalogEntry) -> Result<()> {
        launch_app(&self.app_path(entry)?)
    }

    fn reveal(&self, entry: &CatalogEntry) -> Result<()> {
        reveal_in_finder(&self.app_path(entry)?)
    }

    fn delete(&self, entry: &CatalogEntry, progress: &ProgressHandle) -> Result<()> {
        if self.installed_versions(&entry.identity).is_empty() {
            return Err(AppError::NotInstalled(entry.identity.clone()).into());
        }
        let brew = self.ensure_toolchain(progress)?;
        info!("brew uninstall --cask {}", entry.identity);
        self.run(&brew, &["uninstall", "--cask", entry.identity.as_str()], progress)?;
        progress.finish();
        Ok(())
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut s = String::new();
        if let Some(mut r) = source {
            let _ = r.read_to_string(&mut s);
        }
        s
    })
}

/// Directory holding `bin/brew`: the archive root or its single top-level folder.
fn toolchain_dir_in(dir: &Path) -> Option<PathBuf> {
    if dir.join("bin").join("brew").is_file() {
        return Some(dir.to_path_buf());
    }
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .find(|p| p.join("bin").join("brew").is_file())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("Stat {:?}", path))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).with_context(|| format!("Chmod {:?}", path))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
