//! The OCI runtime seam.
//!
//! The runtime primitive creates the namespaces, performs the mounts and
//! execs the process. The core only talks to it through [`OciRuntime`].

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use strata_common::{ContainerId, StrataError, StrataResult};

use super::definition::ContainerProc;
use crate::backend::ResolvedMount;
use crate::exec::StopSignal;

/// Everything the runtime needs to create and start a container.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Container ID.
    pub id: ContainerId,
    /// OCI bundle directory.
    pub bundle: PathBuf,
    /// Root filesystem mountpoint.
    pub rootfs: PathBuf,
    /// Mounts in application order.
    pub mounts: Vec<ResolvedMount>,
    /// Process to run.
    pub process: ContainerProc,
    /// Hostname inside the container.
    pub hostname: Option<String>,
    /// Socket to send the pty master to.
    pub console_socket: PathBuf,
    /// Where the runtime records the init pid.
    pub pid_file: PathBuf,
}

/// How the container init process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Process ID.
    pub pid: u32,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Exit code 0, or no exit code at all (killed by a signal).
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, None | Some(0))
    }

    /// Turn an unsuccessful exit into [`StrataError::NonZeroExit`].
    ///
    /// # Errors
    ///
    /// Returns an error for any exit code other than 0.
    pub fn into_result(self) -> StrataResult<Self> {
        match self.code {
            Some(code) if code != 0 => Err(StrataError::NonZeroExit {
                pid: self.pid,
                code,
                signal: self.signal,
            }),
            _ => Ok(self),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "pid {} exited with code {code}", self.pid),
            (None, Some(signal)) => write!(f, "pid {} killed by signal {signal}", self.pid),
            (None, None) => write!(f, "pid {} exited", self.pid),
        }
    }
}

/// An OCI runtime primitive.
#[async_trait]
pub trait OciRuntime: Send + Sync + fmt::Debug {
    /// Returns true if the runtime knows a container with this ID.
    async fn exists(&self, id: &ContainerId) -> StrataResult<bool>;

    /// Create and start the container, returning the init pid.
    async fn create(&self, request: CreateRequest) -> StrataResult<u32>;

    /// Deliver a signal to the container init.
    ///
    /// Returns [`StrataError::ContainerNotRunning`] when the process is gone.
    async fn signal(&self, id: &ContainerId, signal: StopSignal) -> StrataResult<()>;

    /// Wait for the container init to exit.
    async fn wait(&self, id: &ContainerId, pid: u32) -> StrataResult<ProcessExit>;

    /// Remove every trace of the container from the runtime.
    async fn destroy(&self, id: &ContainerId) -> StrataResult<()>;
}
