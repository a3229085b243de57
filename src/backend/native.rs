//! Fairground releases: zipped `.app` bundles installed into a private root.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::Backend;
use crate::config::NativeConfig;
use crate::core::{
    bundle_running_now, find_bundle_in, find_installed_app, refresh_manifest, remove_bundle,
    unpack_zip,
};
use crate::error::AppError;
use crate::osx::{launch_app, reveal_in_finder};
use crate::progress::{Downloader, ProgressHandle, verify_checksum};
use crate::types::{CatalogEntry, InstalledApp, SourceKind};

pub struct NativeBackend {
    install_root: PathBuf,
    downloader: Downloader,
    require_checksum: bool,
    use_trash: bool,
    refuse_running: bool,
}

impl NativeBackend {
    pub fn new(config: &NativeConfig, downloader: Downloader) -> Self {
        Self {
            install_root: config.install_root.clone(),
            downloader,
            require_checksum: config.require_checksum,
            use_trash: config.use_trash,
            refuse_running: config.refuse_running,
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Where `entry` lands when installed.
    pub fn install_path(&self, entry: &CatalogEntry) -> PathBuf {
        self.install_root.join(entry.bundle_file_name())
    }

    fn installed(&self, entry: &CatalogEntry) -> Result<InstalledApp> {
        find_installed_app(&self.install_root, &entry.identity)
            .ok_or_else(|| AppError::NotInstalled(entry.identity.clone()).into())
    }
}

/// Put the bundle moved aside by an update back where it was.
///
/// If that fails too, the staging directory is kept so the previous bundle
/// survives, and the returned error says where it is.
fn restore_previous(
    staging: TempDir,
    previous: Option<(PathBuf, PathBuf)>,
    cause: anyhow::Error,
) -> anyhow::Error {
    let Some((orig, backup)) = previous else {
        return cause;
    };
    match fs::rename(&backup, &orig) {
        Ok(()) => cause,
        Err(e) => {
            let kept = staging.keep();
            warn!("Could not restore {:?}; previous bundle kept in {:?}", orig, kept);
            cause.context(format!(
                "restoring {:?} failed ({}); previous bundle kept at {:?}",
                orig, e, backup
            ))
        }
    }
}

impl Backend for NativeBackend {
    fn source(&self) -> SourceKind {
        SourceKind::Native
    }

    /// Download, verify, unpack and move the bundle into place.
    ///
    /// Everything up to the final rename happens in a staging directory
    /// inside the install root, so a failed or cancelled install never
    /// leaves anything at the install path.
    fn install(
        &self,
        entry: &CatalogEntry,
        progress: &ProgressHandle,
        overwrite: bool,
    ) -> Result<()> {
        let existing = find_installed_app(&self.install_root, &entry.identity);
        if let (Some(app), false) = (&existing, overwrite) {
            return Err(AppError::AlreadyInstalled {
                identity: entry.identity.clone(),
                version: app.version.clone().unwrap_or_default(),
            }
            .into());
        }
        if self.require_checksum && entry.sha256.is_none() {
            return Err(AppError::ChecksumMismatch {
                expected: "a recorded checksum".into(),
                actual: "none".into(),
            }
            .into());
        }

        fs::create_dir_all(&self.install_root)
            .with_context(|| format!("Create {:?}", self.install_root))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.install_root)
            .context("Create staging directory")?;

        let archive = staging.path().join("artifact.zip");
        info!("Downloading {} {} from {}", entry.identity, entry.version, entry.download_url);
        let digest = self
            .downloader
            .fetch(&entry.download_url, &archive, progress)
            .with_context(|| format!("Download {}", entry.download_url))?;
        if let Some(expected) = &entry.sha256 {
            verify_checksum(expected, &digest)?;
        }
        progress.check_cancelled()?;

        let unpacked = staging.path().join("unpacked");
        unpack_zip(&archive, &unpacked)?;
        let bundle = find_bundle_in(&unpacked).ok_or_else(|| {
            anyhow::anyhow!("{} contains no application bundle", entry.download_url)
        })?;
        refresh_manifest(&bundle, &entry.identity, &entry.version)?;
        progress.check_cancelled()?;

        let dest = self.install_path(entry);
        let previous = match existing {
            Some(app) => {
                let backup = staging.path().join("previous.app");
                fs::rename(&app.path, &backup)
                    .with_context(|| format!("Move aside {:?}", app.path))?;
                Some((app.path, backup))
            }
            None => None,
        };
        if dest.exists() {
            let cause = anyhow::anyhow!("{:?} is occupied by another application", dest);
            return Err(restore_previous(staging, previous, cause));
        }
        if let Err(e) = fs::rename(&bundle, &dest) {
            let cause = anyhow::Error::new(e).context(format!("Move bundle to {:?}", dest));
            return Err(restore_previous(staging, previous, cause));
        }
        debug!("Installed {} at {:?}", entry.identity, dest);
        progress.finish();
        Ok(())
    }

    fn launch(&self, entry: &CatalogEntry) -> Result<()> {
        let app = self.installed(entry)?;
        launch_app(&app.path)
    }

    fn reveal(&self, entry: &CatalogEntry) -> Result<()> {
        let app = self.installed(entry)?;
        reveal_in_finder(&app.path)
    }

    fn delete(&self, entry: &CatalogEntry, progress: &ProgressHandle) -> Result<()> {
        let app = self.installed(entry)?;
        if self.refuse_running && bundle_running_now(&app.path) {
            return Err(AppError::Unknown(format!("{} is running", app.name)).into());
        }
        progress.set_total(1);
        progress.check_cancelled()?;
        remove_bundle(&app.path, self.use_trash)?;
        info!("Removed {} from {:?}", entry.identity, app.path);
        progress.finish();
        Ok(())
    }
}
