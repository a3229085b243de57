//! Install-state resolution against the native install root and the Caskroom.
//!
//! Resolution is pull-based: nothing here watches the filesystem. Results are
//! cached per (source, identity) so front ends can read a snapshot without
//! touching disk; the coordinator re-resolves after every operation.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::catalog::CatalogStore;
use crate::core::{caskroom_versions, find_installed_app};
use crate::types::{AppIdentity, InstallState, SourceKind};

pub struct Resolver {
    catalog: Arc<CatalogStore>,
    native_root: PathBuf,
    caskroom: PathBuf,
    cache: Mutex<HashMap<(SourceKind, AppIdentity), InstallState>>,
}

impl Resolver {
    pub fn new(catalog: Arc<CatalogStore>, native_root: PathBuf, caskroom: PathBuf) -> Self {
        Self {
            catalog,
            native_root,
            caskroom,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn native_root(&self) -> &Path {
        &self.native_root
    }

    pub fn caskroom(&self) -> &Path {
        &self.caskroom
    }

    /// Recompute the install state of `identity` in `source` and cache it.
    pub fn resolve(&self, identity: &AppIdentity, source: SourceKind) -> InstallState {
        let available = self
            .catalog
            .find_in(source, identity)
            .map(|entry| entry.version);
        let state = match source {
            SourceKind::Native => {
                let installed = find_installed_app(&self.native_root, identity)
                    .map(|app| app.version.unwrap_or_else(|| "0".into()));
                native_state(installed, available.as_deref())
            }
            SourceKind::Cask => {
                let versions = caskroom_versions(&self.caskroom)
                    .remove(identity)
                    .unwrap_or_default();
                cask_state(&versions, available.as_deref())
            }
        };
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((source, identity.clone()), state.clone());
        state
    }

    /// Last resolved state, or `None` while unknown.
    pub fn cached(&self, identity: &AppIdentity, source: SourceKind) -> Option<InstallState> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(source, identity.clone()))
            .cloned()
    }

    /// Forget the cached state so the next read re-resolves.
    pub fn invalidate(&self, identity: &AppIdentity, source: SourceKind) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(source, identity.clone()));
    }

    /// Path of the installed native bundle for `identity`, if any.
    pub fn installed_path(&self, identity: &AppIdentity) -> Option<PathBuf> {
        find_installed_app(&self.native_root, identity).map(|app| app.path)
    }

    /// Installed cask versions for `identity`.
    pub fn cask_versions(&self, identity: &AppIdentity) -> BTreeSet<String> {
        caskroom_versions(&self.caskroom)
            .remove(identity)
            .unwrap_or_default()
    }
}

fn native_state(installed: Option<String>, available: Option<&str>) -> InstallState {
    match (installed, available) {
        (None, _) => InstallState::NotInstalled,
        (Some(installed), Some(available))
            if compare_versions(&installed, available) == Ordering::Less =>
        {
            InstallState::Outdated {
                installed,
                available: available.to_string(),
            }
        }
        (Some(installed), _) => InstallState::Installed(installed),
    }
}

fn cask_state(versions: &BTreeSet<String>, available: Option<&str>) -> InstallState {
    let newest = match versions.iter().max_by(|a, b| compare_versions(a, b)) {
        Some(v) => v.clone(),
        None => return InstallState::NotInstalled,
    };
    match available {
        Some(available) if versions.contains(available) => {
            InstallState::Installed(available.to_string())
        }
        Some("latest") | None => InstallState::Installed(newest),
        Some(available) => InstallState::Outdated {
            installed: newest,
            available: available.to_string(),
        },
    }
}

/// Compare dotted version strings segment by segment.
///
/// Segments split on `.`, `,`, `-`, `_`; numeric segments compare
/// numerically, others lexically, and missing segments count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |s: &str| -> Vec<String> {
        s.trim()
            .trim_start_matches(['v', 'V'])
            .split(['.', ',', '-', '_'])
            .map(str::to_string)
            .collect()
    };
    let (a, b) = (split(a), split(b));
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).map(String::as_str).unwrap_or("0");
        let y = b.get(i).map(String::as_str).unwrap_or("0");
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::refresh_manifest;
    use crate::progress::Downloader;
    use crate::types::CatalogEntry;
    use std::fs;
    use std::time::Duration;

    fn entry(id: &str, source: SourceKind, version: &str) -> CatalogEntry {
        CatalogEntry {
            identity: id.into(),
            source,
            name: "Demo".into(),
            version: version.into(),
            subtitle: None,
            developer: None,
            homepage: None,
            download_url: "file:///dev/null".into(),
            sha256: None,
            size: None,
            download_count: None,
            app_bundle: None,
            categories: Vec::new(),
        }
    }

    fn setup(catalog: Vec<CatalogEntry>) -> (tempfile::TempDir, Resolver) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CatalogStore::new(
            Downloader::new(Duration::from_secs(1), "test"),
            "unused",
            "unused",
        ));
        let (native, cask): (Vec<_>, Vec<_>) =
            catalog.into_iter().partition(|e| e.source == SourceKind::Native);
        store.replace(SourceKind::Native, native);
        store.replace(SourceKind::Cask, cask);
        let resolver = Resolver::new(store, dir.path().join("Apps"), dir.path().join("Caskroom"));
        (dir, resolver)
    }

    fn install_native(resolver: &Resolver, id: &str, version: &str) {
        let app = resolver.native_root().join("Demo.app");
        fs::create_dir_all(&app).unwrap();
        refresh_manifest(&app, &id.into(), version).unwrap();
    }

    #[test]
    fn missing_manifest_is_not_installed() {
        let (_dir, resolver) = setup(vec![entry("app.demo", SourceKind::Native, "1.0")]);
        let id = AppIdentity::from("app.demo");
        assert_eq!(resolver.cached(&id, SourceKind::Native), None);
        assert_eq!(resolver.resolve(&id, SourceKind::Native), InstallState::NotInstalled);
        assert_eq!(
            resolver.cached(&id, SourceKind::Native),
            Some(InstallState::NotInstalled)
        );
    }

    #[test]
    fn matching_version_is_installed_and_older_is_outdated() {
        let (_dir, resolver) = setup(vec![entry("app.demo", SourceKind::Native, "2.0")]);
        let id = AppIdentity::from("app.demo");

        install_native(&resolver, "app.demo", "1.0");
        assert_eq!(
            resolver.resolve(&id, SourceKind::Native),
            InstallState::Outdated {
                installed: "1.0".into(),
                available: "2.0".into()
            }
        );

        fs::remove_dir_all(resolver.native_root().join("Demo.app")).unwrap();
        install_native(&resolver, "app.demo", "2.0");
        assert_eq!(
            resolver.resolve(&id, SourceKind::Native),
            InstallState::Installed("2.0".into())
        );
    }

    #[test]
    fn uncatalogued_install_reports_installed_version() {
        let (_dir, resolver) = setup(Vec::new());
        install_native(&resolver, "app.demo", "3.1");
        assert_eq!(
            resolver.resolve(&"app.demo".into(), SourceKind::Native),
            InstallState::Installed("3.1".into())
        );
    }

    #[test]
    fn cask_membership_decides_state() {
        let (_dir, resolver) = setup(vec![entry("firefox", SourceKind::Cask, "121.0")]);
        let id = AppIdentity::from("firefox");
        assert_eq!(resolver.resolve(&id, SourceKind::Cask), InstallState::NotInstalled);

        fs::create_dir_all(resolver.caskroom().join("firefox/120.0")).unwrap();
        assert_eq!(
            resolver.resolve(&id, SourceKind::Cask),
            InstallState::Outdated {
                installed: "120.0".into(),
                available: "121.0".into()
            }
        );

        fs::create_dir_all(resolver.caskroom().join("firefox/121.0")).unwrap();
        assert_eq!(
            resolver.resolve(&id, SourceKind::Cask),
            InstallState::Installed("121.0".into())
        );
    }

    #[test]
    fn latest_cask_counts_any_installed_version() {
        let (_dir, resolver) = setup(vec![entry("foo", SourceKind::Cask, "latest")]);
        fs::create_dir_all(resolver.caskroom().join("foo/1.2")).unwrap();
        assert_eq!(
            resolver.resolve(&"foo".into(), SourceKind::Cask),
            InstallState::Installed("1.2".into())
        );
    }

    #[test]
    fn uncatalogued_cask_reports_newest_installed_version() {
        let (_dir, resolver) = setup(Vec::new());
        fs::create_dir_all(resolver.caskroom().join("foo/1.9")).unwrap();
        fs::create_dir_all(resolver.caskroom().join("foo/1.10")).unwrap();
        assert_eq!(
            resolver.resolve(&"foo".into(), SourceKind::Cask),
            InstallState::Installed("1.10".into())
        );
    }

    #[test]
    fn invalidate_returns_state_to_unknown() {
        let (_dir, resolver) = setup(Vec::new());
        let id = AppIdentity::from("app.demo");
        resolver.resolve(&id, SourceKind::Native);
        resolver.invalidate(&id, SourceKind::Native);
        assert_eq!(resolver.cached(&id, SourceKind::Native), None);
    }

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "2"), Ordering::Equal);
        assert_eq!(compare_versions("v1.2.3", "1.2.4"), Ordering::Less);
        assert_eq!(compare_versions("4.1,1234", "4.1,1300"), Ordering::Less);
        assert_eq!(compare_versions("1.0-beta", "1.0-rc"), Ordering::Less);
    }
}
