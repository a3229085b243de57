//! macOS-specific utilities.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Command;

/// Launch an application bundle.
pub fn launch_app(path: &Path) -> Result<()> {
    open_with("-a", path, "Launching apps")
}

/// Select `path` in a Finder window.
pub fn reveal_in_finder(path: &Path) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Resolve {:?}", path))?;
    open_with("-R", &path, "Reveal in Finder")
}

fn open_with(flag: &str, path: &Path, what: &str) -> Result<()> {
    if !cfg!(target_os = "macos") {
        bail!("{} is supported only on macOS", what);
    }
    let status = Command::new("open")
        .arg(flag)
        .arg(path)
        .status()
        .with_context(|| format!("Failed to run open {}", flag))?;
    if !status.success() {
        bail!("open {} {:?} exited with {}", flag, path, status);
    }
    Ok(())
}
