use anyhow::{Context, Result};
use plist::{Dictionary, Value};
use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
};
use sysinfo::System;
use walkdir::WalkDir;

use crate::types::{AppIdentity, InstalledApp};

// Filesystem-level helpers: reading and refreshing bundle manifests, scanning
// install roots and the Caskroom, checking running processes, unpacking
// artifacts and removing bundles.

const BUNDLE_ID_KEY: &str = "CFBundleIdentifier";
const SHORT_VERSION_KEY: &str = "CFBundleShortVersionString";
const BUNDLE_VERSION_KEY: &str = "CFBundleVersion";

fn manifest_path(app: &Path) -> PathBuf {
    app.join("Contents").join("Info.plist")
}

/// Read identifier, display name and version from Contents/Info.plist.
pub fn read_info_from_app(
    path: &Path,
) -> Result<(Option<String>, Option<String>, Option<String>)> {
    let info = manifest_path(path);
    if !info.exists() {
        return Ok((None, None, None));
    }
    let v = Value::from_file(&info).context("Read plist")?;
    let dict = v.as_dictionary();
    let string_key = |key: &str| {
        dict.and_then(|d| d.get(key))
            .and_then(|v| v.as_string())
            .map(|s| s.to_string())
    };
    let bundle_id = string_key(BUNDLE_ID_KEY);
    let bundle_name = string_key("CFBundleName").or_else(|| string_key("CFBundleDisplayName"));
    let version = string_key(SHORT_VERSION_KEY).or_else(|| string_key(BUNDLE_VERSION_KEY));
    Ok((bundle_id, bundle_name, version))
}

/// Make sure the bundle's manifest records `identity` and `version`.
///
/// Missing keys are filled in; an existing identifier that differs from
/// `identity` is an error, since the artifact is not the app we were asked for.
pub fn refresh_manifest(app: &Path, identity: &AppIdentity, version: &str) -> Result<()> {
    let info = manifest_path(app);
    let mut dict = if info.exists() {
        Value::from_file(&info)
            .with_context(|| format!("Read {:?}", info))?
            .into_dictionary()
            .ok_or_else(|| anyhow::anyhow!("{:?} is not a dictionary", info))?
    } else {
        Dictionary::new()
    };

    if let Some(existing) = dict.get(BUNDLE_ID_KEY).and_then(|v| v.as_string()) {
        if existing != identity.as_str() {
            anyhow::bail!(
                "bundle identifier mismatch: artifact is {}, expected {}",
                existing,
                identity
            );
        }
    }

    let mut changed = false;
    for (key, value) in [(BUNDLE_ID_KEY, identity.as_str()), (SHORT_VERSION_KEY, version)] {
        if dict.get(key).and_then(|v| v.as_string()).is_none() {
            dict.insert(key.to_string(), Value::String(value.to_string()));
            changed = true;
        }
    }
    if changed {
        if let Some(parent) = info.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Create {:?}", parent))?;
        }
        Value::Dictionary(dict)
            .to_file_xml(&info)
            .with_context(|| format!("Write {:?}", info))?;
    }
    Ok(())
}

/// Scan a directory for .app bundles. A missing directory yields nothing.
pub fn scan_apps_in_dir(dir: &Path) -> Vec<InstalledApp> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };
    let mut res = Vec::new();
    for entry in entries.flatten() {
        let p = entry.path();
        if p.extension().and_then(|s| s.to_str()) != Some("app") || !p.is_dir() {
            continue;
        }
        let (bid, name, version) = match read_info_from_app(&p) {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!("Skipping unreadable bundle {:?}: {:#}", p, e);
                (None, None, None)
            }
        };
        let fallback = p
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        res.push(InstalledApp {
            path: p,
            name: name.unwrap_or(fallback),
            bundle_id: bid,
            version,
        });
    }
    res.sort_by(|a, b| a.name.cmp(&b.name));
    res
}

/// Locate the installed bundle whose manifest records `identity`.
pub fn find_installed_app(dir: &Path, identity: &AppIdentity) -> Option<InstalledApp> {
    scan_apps_in_dir(dir)
        .into_iter()
        .find(|app| app.bundle_id.as_deref() == Some(identity.as_str()))
}

/// Installed cask versions from `<Caskroom>/<token>/<version>/`.
pub fn caskroom_versions(caskroom: &Path) -> HashMap<AppIdentity, BTreeSet<String>> {
    let mut res: HashMap<AppIdentity, BTreeSet<String>> = HashMap::new();
    if !caskroom.is_dir() {
        return res;
    }
    for entry in WalkDir::new(caskroom).min_depth(2).max_depth(2).into_iter().flatten() {
        if !entry.file_type().is_dir() {
            continue;
        }
        let version = entry.file_name().to_string_lossy().to_string();
        // .metadata holds Homebrew's own bookkeeping, not a version
        if version.starts_with('.') {
            continue;
        }
        let token = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().to_string());
        if let Some(token) = token {
            res.entry(AppIdentity::from(token)).or_default().insert(version);
        }
    }
    res
}

/// First .app bundle under `dir`, searched shallowly.
pub fn find_bundle_in(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .find(|e| {
            e.file_type().is_dir()
                && e.path().extension().and_then(|s| s.to_str()) == Some("app")
        })
        .map(|e| e.path().to_path_buf())
}

/// Extract a zip archive into `dest`.
pub fn unpack_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive).with_context(|| format!("Open archive {:?}", archive))?;
    let mut zip = zip::ZipArchive::new(file).with_context(|| format!("Read zip {:?}", archive))?;
    fs::create_dir_all(dest).with_context(|| format!("Create {:?}", dest))?;
    zip.extract(dest)
        .with_context(|| format!("Extract {:?}", archive))?;
    Ok(())
}

/// Whether any process in `sys` runs an executable from inside `bundle`.
pub fn is_bundle_running(sys: &System, bundle: &Path) -> bool {
    let bundle = bundle.canonicalize().unwrap_or_else(|_| bundle.to_path_buf());
    sys.processes()
        .values()
        .any(|p| p.exe().is_some_and(|exe| exe.starts_with(&bundle)))
}

/// [`is_bundle_running`] against a fresh process snapshot.
pub fn bundle_running_now(bundle: &Path) -> bool {
    let mut sys = System::new_all();
    sys.refresh_all();
    is_bundle_running(&sys, bundle)
}

/// Trash `path` when asked to and a trash is available, else delete it.
pub fn remove_bundle(path: &Path, use_trash: bool) -> Result<()> {
    if use_trash {
        match trash::delete(path) {
            Ok(()) => return Ok(()),
            Err(e) => tracing::debug!("Trash unavailable for {:?}: {}", path, e),
        }
    }
    let meta = fs::symlink_metadata(path).with_context(|| format!("Stat {:?}", path))?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("Remove {:?}", path))
}
