//! Shared progress handles and the streaming downloader that feeds them.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::AppError;

const CHUNK_SIZE: usize = 64 * 1024;
/// Upper bound for documents read into memory.
const MAX_DOCUMENT_BYTES: u64 = 256 * 1024 * 1024;
/// Largest up-front allocation a declared length may ask for.
const MAX_PREALLOC: u64 = 1024 * 1024;

#[derive(Debug, Default)]
struct ProgressInner {
    completed: AtomicU64,
    total: AtomicU64,
    cancelled: AtomicBool,
    finished: AtomicBool,
}

/// Completed/total units of one operation plus its cancellation flag.
///
/// Cloning shares the same counters; the operation, its backend and any
/// observer all hold clones.
#[derive(Clone, Debug, Default)]
pub struct ProgressHandle {
    inner: Arc<ProgressInner>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Acquire)
    }

    /// 0.0 ..= 1.0, or 0.0 while the total is unknown.
    pub fn fraction(&self) -> f32 {
        let total = self.total();
        if total == 0 {
            return if self.is_finished() { 1.0 } else { 0.0 };
        }
        (self.completed().min(total) as f64 / total as f64) as f32
    }

    /// Raise the total; never lowers it.
    pub fn set_total(&self, total: u64) {
        self.inner.total.fetch_max(total, Ordering::AcqRel);
    }

    /// Add `units` to the completed count, keeping it within the total.
    pub fn advance(&self, units: u64) {
        if self.is_finished() {
            return;
        }
        let completed = self.inner.completed.fetch_add(units, Ordering::AcqRel) + units;
        // streams without a Content-Length grow their total as they go
        self.inner.total.fetch_max(completed, Ordering::AcqRel);
    }

    /// Set completed = total. Only the first call has an effect.
    pub fn finish(&self) {
        if self
            .inner
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let completed = self.completed();
        self.inner.total.fetch_max(completed, Ordering::AcqRel);
        let total = self.total();
        self.inner.completed.fetch_max(total, Ordering::AcqRel);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Checkpoint for I/O loops: `Err(Cancelled)` once the flag is set.
    pub fn check_cancelled(&self) -> Result<(), AppError> {
        if self.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Where a catalog or artifact lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    Remote(String),
    Local(PathBuf),
}

impl Location {
    pub fn parse(s: &str) -> Location {
        let s = s.trim();
        if s.starts_with("http://") || s.starts_with("https://") {
            Location::Remote(s.to_string())
        } else if let Some(path) = s.strip_prefix("file://") {
            Location::Local(PathBuf::from(path))
        } else {
            Location::Local(PathBuf::from(s))
        }
    }
}

/// Blocking HTTP/file fetcher reporting byte progress.
#[derive(Clone)]
pub struct Downloader {
    agent: ureq::Agent,
}

impl Downloader {
    pub fn new(timeout: Duration, user_agent: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(user_agent)
            .build();
        Self { agent }
    }

    /// Open `location` for reading, returning the reader and its size if known.
    pub fn open(&self, location: &str) -> Result<(Box<dyn Read + Send>, Option<u64>)> {
        match Location::parse(location) {
            Location::Remote(url) => {
                let response = match self.agent.get(&url).call() {
                    Ok(r) => r,
                    Err(ureq::Error::Status(code, _)) => {
                        return Err(AppError::Network(format!("HTTP {} for {}", code, url)).into());
                    }
                    Err(e) => {
                        return Err(AppError::Network(format!("{} ({})", e, url)).into());
                    }
                };
                let len = response
                    .header("Content-Length")
                    .and_then(|v| v.trim().parse::<u64>().ok());
                Ok((Box::new(response.into_reader()), len))
            }
            Location::Local(path) => {
                let file = fs::File::open(&path)
                    .with_context(|| format!("Open {}", path.display()))?;
                let len = file.metadata().ok().map(|m| m.len());
                Ok((Box::new(file), len))
            }
        }
    }

    /// Read `location` fully into memory (catalog documents).
    pub fn fetch_bytes(&self, location: &str) -> Result<Vec<u8>> {
        let (reader, len) = self.open(location)?;
        read_bounded(reader, len, MAX_DOCUMENT_BYTES)
            .with_context(|| format!("Read {}", location))
    }

    /// Stream `location` into `dest`, returning the lowercase hex SHA-256.
    ///
    /// Cancellation is checked between chunks; a cancelled or failed fetch
    /// removes the partial file.
    pub fn fetch(&self, location: &str, dest: &Path, progress: &ProgressHandle) -> Result<String> {
        let result = self.fetch_inner(location, dest, progress);
        if result.is_err() && dest.exists() {
            let _ = fs::remove_file(dest);
        }
        result
    }

    fn fetch_inner(
        &self,
        location: &str,
        dest: &Path,
        progress: &ProgressHandle,
    ) -> Result<String> {
        progress.check_cancelled()?;
        let (mut reader, len) = self.open(location)?;
        if let Some(len) = len {
            progress.set_total(len);
        }
        debug!("Downloading {} -> {}", location, dest.display());

        let mut file =
            fs::File::create(dest).with_context(|| format!("Create {}", dest.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            progress.check_cancelled()?;
            let n = reader
                .read(&mut buf)
                .with_context(|| format!("Read {}", location))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .with_context(|| format!("Write {}", dest.display()))?;
            progress.advance(n as u64);
        }
        file.flush()?;
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Read at most `limit` bytes; a longer body is an error, not a truncation.
/// The declared length only sizes the first allocation.
fn read_bounded(reader: impl Read, declared: Option<u64>, limit: u64) -> Result<Vec<u8>> {
    let initial = declared.unwrap_or(0).min(MAX_PREALLOC).min(limit);
    let mut buf = Vec::with_capacity(initial as usize);
    reader.take(limit + 1).read_to_end(&mut buf)?;
    if buf.len() as u64 > limit {
        anyhow::bail!("document exceeds {} bytes", limit);
    }
    Ok(buf)
}

/// Compare a computed digest with the catalog's, case-insensitively.
pub fn verify_checksum(expected: &str, actual: &str) -> Result<(), AppError> {
    if expected.trim().eq_ignore_ascii_case(actual.trim()) {
        Ok(())
    } else {
        Err(AppError::ChecksumMismatch {
            expected: expected.trim().to_lowercase(),
            actual: actual.to_lowercase(),
        })
    }
}
