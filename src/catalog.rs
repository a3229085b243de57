//! Catalog loading and the per-source snapshot store.
//!
//! Two formats are understood: the Fairground app source (a JSON object with
//! an `apps` array) and the Homebrew cask API (a JSON array of casks). Each
//! successful load replaces the previous snapshot for that source.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::progress::Downloader;
use crate::types::{AppIdentity, CatalogEntry, SourceKind};

#[derive(Debug, Deserialize)]
struct FairgroundCatalog {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    apps: Vec<FairgroundApp>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FairgroundApp {
    name: String,
    bundle_identifier: String,
    #[serde(default)]
    version: Option<String>,
    subtitle: Option<String>,
    developer_name: Option<String>,
    #[serde(rename = "downloadURL")]
    download_url: Option<String>,
    sha256: Option<String>,
    size: Option<u64>,
    download_count: Option<u64>,
    homepage: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CaskInfo {
    token: String,
    #[serde(default)]
    name: Vec<String>,
    desc: Option<String>,
    homepage: Option<String>,
    url: Option<String>,
    version: Option<String>,
    sha256: Option<String>,
    #[serde(default)]
    artifacts: Vec<serde_json::Value>,
}

/// Parse a catalog document for `source`, dropping unusable entries.
pub fn parse_catalog(source: SourceKind, bytes: &[u8]) -> Result<Vec<CatalogEntry>> {
    let entries = match source {
        SourceKind::Native => {
            let catalog: FairgroundCatalog =
                serde_json::from_slice(bytes).context("Parse Fairground catalog")?;
            if let Some(name) = &catalog.name {
                tracing::debug!("Fairground catalog {:?}: {} apps", name, catalog.apps.len());
            }
            catalog.apps.into_iter().filter_map(native_entry).collect()
        }
        SourceKind::Cask => {
            let casks: Vec<CaskInfo> =
                serde_json::from_slice(bytes).context("Parse cask catalog")?;
            casks.into_iter().filter_map(cask_entry).collect()
        }
    };
    Ok(entries)
}

fn native_entry(app: FairgroundApp) -> Option<CatalogEntry> {
    let download_url = match app.download_url {
        Some(u) if !u.trim().is_empty() => u,
        _ => {
            warn!("Skipping {:?}: no download URL", app.bundle_identifier);
            return None;
        }
    };
    if app.bundle_identifier.trim().is_empty() {
        warn!("Skipping {:?}: no bundle identifier", app.name);
        return None;
    }
    Some(CatalogEntry {
        identity: AppIdentity::from(app.bundle_identifier),
        source: SourceKind::Native,
        name: app.name,
        version: app.version.unwrap_or_else(|| "0".into()),
        subtitle: app.subtitle,
        developer: app.developer_name,
        homepage: app.homepage,
        download_url,
        sha256: app.sha256.filter(|s| !s.trim().is_empty()),
        size: app.size,
        download_count: app.download_count,
        app_bundle: None,
        categories: app.categories,
    })
}

fn cask_entry(cask: CaskInfo) -> Option<CatalogEntry> {
    let download_url = match cask.url {
        Some(u) if !u.trim().is_empty() => u,
        _ => {
            warn!("Skipping cask {:?}: no url", cask.token);
            return None;
        }
    };
    if cask.token.trim().is_empty() {
        return None;
    }
    let app_bundle = cask.artifacts.iter().find_map(|a| {
        a.get("app")
            .and_then(|v| v.as_array())
            .and_then(|list| list.iter().find_map(|v| v.as_str()))
            .map(|s| s.to_string())
    });
    let name = cask.name.into_iter().next().unwrap_or_else(|| cask.token.clone());
    Some(CatalogEntry {
        identity: AppIdentity::from(cask.token),
        source: SourceKind::Cask,
        name,
        version: cask.version.unwrap_or_else(|| "latest".into()),
        subtitle: cask.desc,
        developer: None,
        homepage: cask.homepage,
        download_url,
        sha256: cask.sha256.filter(|s| s != "no_check" && !s.trim().is_empty()),
        size: None,
        download_count: None,
        app_bundle,
        categories: Vec::new(),
    })
}

/// Keep the first entry for each identity, preserving order.
fn dedup_by_identity(entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| {
            let fresh = seen.insert(e.identity.clone());
            if !fresh {
                tracing::debug!("Dropping duplicate catalog entry {}", e.identity);
            }
            fresh
        })
        .collect()
}

/// Immutable per-source catalog snapshots.
pub struct CatalogStore {
    downloader: Downloader,
    locations: HashMap<SourceKind, String>,
    snapshots: RwLock<HashMap<SourceKind, Arc<Vec<CatalogEntry>>>>,
}

impl CatalogStore {
    pub fn new(downloader: Downloader, native: impl Into<String>, cask: impl Into<String>) -> Self {
        let mut locations = HashMap::new();
        locations.insert(SourceKind::Native, native.into());
        locations.insert(SourceKind::Cask, cask.into());
        Self {
            downloader,
            locations,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Catalog locations from `config`, fetched through `downloader`.
    pub fn from_config(config: &Config, downloader: Downloader) -> Self {
        Self::new(downloader, &config.catalog.native, &config.catalog.cask)
    }

    /// Fetch and parse `source`, replacing its snapshot on success.
    pub fn load_catalog(&self, source: SourceKind) -> Result<Arc<Vec<CatalogEntry>>, AppError> {
        let location = self
            .locations
            .get(&source)
            .ok_or_else(|| AppError::CatalogFetch(format!("no location for {}", source)))?;
        let entries = self
            .downloader
            .fetch_bytes(location)
            .and_then(|bytes| parse_catalog(source, &bytes))
            .map_err(|e| AppError::CatalogFetch(format!("{}: {:#}", location, e)))?;
        let snapshot = self.replace(source, entries);
        info!("Loaded {} {} catalog entries", snapshot.len(), source);
        Ok(snapshot)
    }

    /// Install `entries` as the snapshot for `source`.
    pub fn replace(
        &self,
        source: SourceKind,
        entries: Vec<CatalogEntry>,
    ) -> Arc<Vec<CatalogEntry>> {
        let snapshot = Arc::new(dedup_by_identity(entries));
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source, snapshot.clone());
        snapshot
    }

    /// Current snapshot; empty until the first successful load.
    pub fn entries(&self, source: SourceKind) -> Arc<Vec<CatalogEntry>> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&source)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_loaded(&self, source: SourceKind) -> bool {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&source)
    }

    pub fn find_in(&self, source: SourceKind, identity: &AppIdentity) -> Option<CatalogEntry> {
        self.entries(source)
            .iter()
            .find(|e| &e.identity == identity)
            .cloned()
    }

    /// Look `identity` up in the native catalog, then the cask catalog.
    pub fn find(&self, identity: &AppIdentity) -> Option<CatalogEntry> {
        self.find_in(SourceKind::Native, identity)
            .or_else(|| self.find_in(SourceKind::Cask, identity))
    }
}
