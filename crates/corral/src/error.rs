//
// error.rs
//
// Error taxonomy for the project service
//

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Raised by any polled long-running operation whose token was cancelled.
///
/// Cancellation is not a user-visible failure: the scheduler swallows it and
/// retries once the service is stable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Failures surfaced to callers of the service's produced interface.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("file is not open: {}", .0.display())]
    NotOpen(PathBuf),

    #[error("stale edit for {}: version {received} is not newer than {current}", path.display())]
    StaleVersion {
        path: PathBuf,
        current: i32,
        received: i32,
    },

    #[error("edit range is outside the document: {}", .0.display())]
    InvalidRange(PathBuf),

    #[error("no project contains {}", .0.display())]
    NoProject(PathBuf),

    #[error("unknown external project: {0}")]
    UnknownExternalProject(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ServiceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ServiceError::Cancelled(_))
    }
}

/// A configuration file could not be turned into a project description.
///
/// Always converted into project-scoped diagnostics by the project that
/// requested the load; never propagated out of the service.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration extends itself: {}", .0.display())]
    ExtendsCycle(PathBuf),
}

impl ConfigError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            ConfigError::Read { path, .. } => path,
            ConfigError::Parse { path, .. } => path,
            ConfigError::ExtendsCycle(path) => path,
        }
    }
}

/// The dependents/dependencies relation stopped being a transpose.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency graph is asymmetric at {} -> {}", from.display(), to.display())]
pub struct GraphInvariantError {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_converts_into_service_error() {
        let err: ServiceError = Cancelled.into();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "operation cancelled");
    }

    #[test]
    fn test_stale_version_message() {
        let err = ServiceError::StaleVersion {
            path: PathBuf::from("/w/a.lm"),
            current: 4,
            received: 3,
        };
        assert_eq!(
            err.to_string(),
            "stale edit for /w/a.lm: version 3 is not newer than 4"
        );
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_config_error_path() {
        let err = ConfigError::ExtendsCycle(PathBuf::from("/w/corral.json"));
        assert_eq!(err.path(), std::path::Path::new("/w/corral.json"));
    }
}
