use std::io;

use thiserror::Error;

use crate::types::{ActivityKind, AppIdentity};

/// Errors surfaced by the catalog store and the operation coordinator.
///
/// Backends return `anyhow::Error` chains whose root may be one of these;
/// [`AppError::narrow`] collapses any chain into this taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("failed to load catalog: {0}")]
    CatalogFetch(String),

    #[error("{identity} is busy with {running} (requested {requested})")]
    Conflict {
        identity: AppIdentity,
        running: ActivityKind,
        requested: ActivityKind,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("{0} is not installed")]
    NotInstalled(AppIdentity),

    #[error("{identity} {version} is already installed")]
    AlreadyInstalled {
        identity: AppIdentity,
        version: String,
    },

    #[error("package manager toolchain unavailable: {0}")]
    ToolchainMissing(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),
}

impl AppError {
    /// Narrow an arbitrary error chain to the public taxonomy.
    pub fn narrow(err: anyhow::Error) -> AppError {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<AppError>() {
                return e.clone();
            }
            if let Some(e) = cause.downcast_ref::<ureq::Error>() {
                return AppError::Network(e.to_string());
            }
            if let Some(e) = cause.downcast_ref::<io::Error>() {
                if is_network_io(e.kind()) {
                    return AppError::Network(format!("{:#}", err));
                }
            }
        }
        AppError::Unknown(format!("{:#}", err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

fn is_network_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn narrow_keeps_taxonomy_root_under_context() {
        let err = Err::<(), _>(AppError::NotInstalled("app.demo".into()))
            .context("trash app.demo")
            .unwrap_err();
        assert_eq!(
            AppError::narrow(err),
            AppError::NotInstalled("app.demo".into())
        );
    }

    #[test]
    fn narrow_maps_timeouts_to_network() {
        let io = io::Error::new(io::ErrorKind::TimedOut, "read timed out");
        let err = anyhow::Error::new(io).context("download artifact");
        assert!(matches!(AppError::narrow(err), AppError::Network(_)));
    }

    #[test]
    fn narrow_falls_back_to_unknown_with_detail() {
        let err = anyhow::anyhow!("zip archive is corrupt").context("unpack");
        match AppError::narrow(err) {
            AppError::Unknown(detail) => assert!(detail.contains("corrupt")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
