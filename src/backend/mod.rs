//! Source backends: the package-manager specific half of every operation.

use anyhow::Result;

use crate::progress::ProgressHandle;
use crate::types::{CatalogEntry, SourceKind};

pub mod homebrew;
pub mod native;

pub use homebrew::HomebrewBackend;
pub use native::NativeBackend;

/// Capability set every source implements.
///
/// Methods block the calling worker thread. Long-running steps must check
/// `progress.check_cancelled()` at their I/O boundaries and fail with
/// [`AppError::Cancelled`](crate::error::AppError::Cancelled) once the flag
/// is set. Errors are `anyhow` chains; the coordinator narrows them.
pub trait Backend: Send + Sync {
    fn source(&self) -> SourceKind;

    fn install(&self, entry: &CatalogEntry, progress: &ProgressHandle, overwrite: bool)
    -> Result<()>;

    fn update(&self, entry: &CatalogEntry, progress: &ProgressHandle) -> Result<()> {
        self.install(entry, progress, true)
    }

    fn launch(&self, entry: &CatalogEntry) -> Result<()>;

    fn reveal(&self, entry: &CatalogEntry) -> Result<()>;

    fn delete(&self, entry: &CatalogEntry, progress: &ProgressHandle) -> Result<()>;
}
