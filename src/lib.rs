//! Lifecycle coordination for apps from the Fairground catalog and Homebrew casks.

pub mod backend;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod osx;
pub mod progress;
pub mod resolver;
pub mod types;

#[cfg(test)]
mod testing;

pub use catalog::CatalogStore;
pub use config::Config;
pub use coordinator::{
    Coordinator, ErrorReporter, LogReporter, Operation, OperationFailure, RequestOutcome,
};
pub use error::AppError;
pub use progress::{Downloader, ProgressHandle};
pub use resolver::Resolver;
pub use types::{
    ActivityKind, AppIdentity, CatalogEntry, InstallState, OperationPhase, SourceKind, StateEvent,
};
