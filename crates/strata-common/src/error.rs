//! Common error types for Strata.

use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StrataError`].
pub type StrataResult<T> = Result<T, StrataError>;

/// Errors raised while composing mounts or driving a container.
#[derive(Error, Diagnostic, Debug)]
pub enum StrataError {
    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(strata::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// A container with this ID is already known to the runtime.
    #[error("Container already exists: {id}")]
    #[diagnostic(
        code(strata::container::exists),
        help("Destroy the existing container or pick another ID")
    )]
    ContainerExists {
        /// The conflicting container ID.
        id: String,
    },

    /// The container process is no longer running.
    #[error("Container not running: {id}")]
    #[diagnostic(code(strata::container::not_running))]
    ContainerNotRunning {
        /// The container ID.
        id: String,
    },

    /// A mount destination that cannot be placed in the mount tree.
    #[error("Invalid mount destination: {}", path.display())]
    #[diagnostic(
        code(strata::mount::invalid_path),
        help("Mount destinations must be absolute and must not contain '..'")
    )]
    InvalidMountPath {
        /// The offending destination.
        path: PathBuf,
    },

    /// A raw mount and a layer mount were requested at the same destination.
    #[error("Conflicting mounts at {}: raw mounts cannot be merged", destination.display())]
    #[diagnostic(
        code(strata::mount::conflict),
        help("Only layer mounts can share a destination; bind, tmpfs and proc mounts must be alone")
    )]
    MountConflict {
        /// The destination holding both kinds of mount.
        destination: PathBuf,
    },

    /// The overlay option string does not fit into a single page.
    #[error(
        "Overlay options for {} are {len} bytes, exceeding the {limit} byte limit",
        destination.display()
    )]
    #[diagnostic(code(strata::mount::options_too_long))]
    MountOptionsTooLong {
        /// The overlay destination.
        destination: PathBuf,
        /// Length of the generated option string.
        len: usize,
        /// Maximum accepted length.
        limit: usize,
    },

    /// The FUSE overlay helper failed.
    #[error("Overlay helper failed: {message}")]
    #[diagnostic(
        code(strata::backend::helper),
        help("Check that fuse-overlayfs is installed and /dev/fuse is accessible")
    )]
    Helper {
        /// The error message.
        message: String,
    },

    /// An operation did not complete in time.
    #[error("Timed out after {timeout:?} waiting for {operation}")]
    #[diagnostic(code(strata::timeout))]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// The elapsed deadline.
        timeout: Duration,
    },

    /// The OCI runtime reported a failure.
    #[error("Runtime error: {message}")]
    #[diagnostic(code(strata::runtime))]
    Runtime {
        /// The error message.
        message: String,
    },

    /// The container process exited unsuccessfully.
    #[error("Process {pid} exited with code {code}")]
    #[diagnostic(code(strata::process::exit))]
    NonZeroExit {
        /// Process ID of the container init.
        pid: u32,
        /// Exit code reported by the kernel.
        code: i32,
        /// Terminating signal, if any.
        signal: Option<i32>,
    },

    /// The caller cancelled the operation.
    #[error("Cancelled while waiting for {operation}")]
    #[diagnostic(code(strata::cancelled))]
    Cancelled {
        /// The cancelled operation.
        operation: String,
    },

    /// New containers are refused while the engine drains.
    #[error("Engine is shutting down")]
    #[diagnostic(
        code(strata::engine::shutting_down),
        help("Wait for shutdown to finish and start a new engine")
    )]
    ShuttingDown,

    /// Several failures collected during one operation.
    #[error("{} errors occurred: {}", .errors.len(), join_errors(.errors))]
    #[diagnostic(code(strata::multiple))]
    Multiple {
        /// Every collected failure, in the order they happened.
        #[related]
        errors: Vec<StrataError>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(strata::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(strata::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(strata::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(strata::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/strata/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl StrataError {
    /// Fold a list of collected failures into a single result.
    ///
    /// No failures is `Ok`, one failure is returned as-is, more become
    /// [`StrataError::Multiple`].
    ///
    /// # Errors
    ///
    /// Returns an error if `errors` is not empty.
    pub fn collect(mut errors: Vec<Self>) -> StrataResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple { errors }),
        }
    }

    /// Returns true if this error (or any error it aggregates) is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Multiple { errors } => errors.iter().any(Self::is_cancelled),
            _ => false,
        }
    }

    /// Number of underlying failures this error stands for.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple { errors } => errors.iter().map(Self::count).sum(),
            _ => 1,
        }
    }
}

fn join_errors(errors: &[StrataError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
