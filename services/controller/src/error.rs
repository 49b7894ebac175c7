//! Error types for the rollout controller.

use std::io;

use thiserror::Error;

/// Controller errors.
///
/// Only `Source` and `Io` are hard failures for a catalog refresh; everything
/// else is logged by the caller and heals on the next reconciliation pass.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The version source could not be reached. The catalog keeps its cache.
    #[error("version source unavailable: {0}")]
    SourceUnavailable(String),

    /// Clone/pull failed with no usable local copy.
    #[error("failed to materialize version {tag}: {reason}")]
    MaterializationFailed { tag: String, reason: String },

    /// A run command exited unsuccessfully.
    #[error("command `{command}` failed: {status}")]
    CommandFailed { command: String, status: String },

    /// No free local port could be obtained.
    #[error("no free port available: {0}")]
    PortExhausted(#[source] io::Error),

    /// The routing layer has no running instance to forward to.
    #[error("no backend available")]
    NoBackendAvailable,

    /// Tag not known to the catalog.
    #[error("version not found: {0}")]
    VersionNotFound(String),

    /// Version source failure that is not a connectivity problem.
    #[error("version source error: {0}")]
    Source(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ControllerError {
    /// Short machine-readable code, used as a structured log field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::MaterializationFailed { .. } => "materialization_failed",
            Self::CommandFailed { .. } => "command_failed",
            Self::PortExhausted(_) => "port_exhausted",
            Self::NoBackendAvailable => "no_backend_available",
            Self::VersionNotFound(_) => "version_not_found",
            Self::Source(_) => "source_error",
            Self::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
