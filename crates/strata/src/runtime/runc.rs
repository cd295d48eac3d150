//! [`OciRuntime`] backed by a runc-compatible binary.
//!
//! The bundle's `config.json` is generated from the [`CreateRequest`]; every
//! other operation is one invocation of the binary. The container init is
//! reparented to this process (child subreaper) so it can be reaped with
//! `waitpid`.

#![allow(unsafe_code)]

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use strata_common::{ContainerId, StrataError, StrataResult};
use strata_oci::runtime::{
    Capabilities, IdMapping, Linux, Namespace, NamespaceType, Process, Root, User,
};
use strata_oci::{RuntimeState, Spec};
use tokio::process::Command;

use super::config::RuntimeConfig;
use super::oci::{CreateRequest, OciRuntime, ProcessExit};
use crate::exec::StopSignal;

/// Error output fragments meaning the runtime knows the container but its
/// process is already gone.
const NOT_RUNNING: &[&str] = &["not running", "process already finished", "no such process"];

/// Error output fragment meaning the runtime has no record of the container.
///
/// `exists` and `destroy` treat it as absence; for every other operation a
/// forgotten container is also a container that is not running.
const NOT_FOUND: &str = "does not exist";

/// Paths hidden from the container.
const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/sched_debug",
    "/sys/firmware",
];

/// Paths the container may only read.
const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Drives a runc-compatible binary.
#[derive(Debug, Clone)]
pub struct RuncRuntime {
    binary: PathBuf,
    state_root: PathBuf,
    rootless: bool,
}

impl RuncRuntime {
    /// Use `binary`, keeping runtime state under `state_root`.
    pub fn new(binary: impl Into<PathBuf>, state_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            state_root: state_root.into(),
            rootless: false,
        }
    }

    /// Runtime described by `config`.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(&config.runtime_binary, config.paths().runtime_state())
            .with_rootless(config.rootless)
    }

    /// Run containers in a user namespace owned by the caller.
    #[must_use]
    pub const fn with_rootless(mut self, rootless: bool) -> Self {
        self.rootless = rootless;
        self
    }

    /// The binary being driven.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Mark this process as child subreaper so orphaned container inits are
    /// reparented to it.
    ///
    /// # Errors
    ///
    /// Returns the `prctl` failure.
    pub fn become_subreaper() -> StrataResult<()> {
        // SAFETY: PR_SET_CHILD_SUBREAPER only reads its integer argument.
        let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// The OCI spec written into the bundle for `request`.
    #[must_use]
    pub fn spec(&self, request: &CreateRequest) -> Spec {
        let def = &request.process;

        let mut capabilities: Vec<String> =
            def.capabilities.iter().map(ToString::to_string).collect();
        capabilities.sort();

        let mut linux = Linux {
            namespaces: [
                NamespaceType::Mount,
                NamespaceType::Pid,
                NamespaceType::Ipc,
                NamespaceType::Uts,
            ]
            .into_iter()
            .map(Namespace::new)
            .collect(),
            masked_paths: MASKED_PATHS.iter().map(ToString::to_string).collect(),
            readonly_paths: READONLY_PATHS.iter().map(ToString::to_string).collect(),
            ..Linux::default()
        };

        if self.rootless {
            linux.namespaces.push(Namespace::new(NamespaceType::User));
            linux.uid_mappings = vec![IdMapping {
                container_id: 0,
                host_id: rustix::process::getuid().as_raw(),
                size: 1,
            }];
            linux.gid_mappings = vec![IdMapping {
                container_id: 0,
                host_id: rustix::process::getgid().as_raw(),
                size: 1,
            }];
        }

        Spec {
            root: Some(Root {
                path: request.rootfs.clone(),
                readonly: false,
            }),
            process: Some(Process {
                terminal: true,
                console_size: Some(def.console_size),
                user: User {
                    uid: def.uid,
                    gid: def.gid,
                    additional_gids: Vec::new(),
                },
                args: def.args.clone(),
                env: def.env.clone(),
                cwd: def.cwd.clone(),
                capabilities: Some(Capabilities::uniform(capabilities)),
                no_new_privileges: true,
            }),
            hostname: request.hostname.clone(),
            mounts: request.mounts.iter().map(|m| m.mount.clone()).collect(),
            linux: Some(linux),
            ..Spec::default()
        }
    }

    fn args<I, S>(&self, args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut all = vec![OsString::from("--root"), self.state_root.clone().into()];
        all.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        all
    }

    async fn run<I, S>(&self, args: I) -> StrataResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args = self.args(args);
        tracing::trace!(binary = %self.binary.display(), ?args, "Running OCI runtime");

        Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StrataError::Runtime {
                message: format!("Failed to run {}: {e}", self.binary.display()),
            })
    }

    /// Run one operation, turning a failed exit into an error.
    async fn checked<I, S>(&self, id: &ContainerId, operation: &str, args: I) -> StrataResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(classify(id, operation, &String::from_utf8_lossy(&output.stderr)))
        }
    }
}

/// Map runtime error output to an error.
fn classify(id: &ContainerId, operation: &str, stderr: &str) -> StrataError {
    let lower = stderr.to_lowercase();
    if is_unknown(&lower) || NOT_RUNNING.iter().any(|m| lower.contains(m)) {
        StrataError::ContainerNotRunning { id: id.to_string() }
    } else {
        StrataError::Runtime {
            message: format!("{operation} {id} failed: {}", stderr.trim()),
        }
    }
}

fn is_unknown(stderr: &str) -> bool {
    stderr.to_lowercase().contains(NOT_FOUND)
}

fn read_pid_file(path: &Path) -> StrataResult<u32> {
    let content = std::fs::read_to_string(path)?;
    content.trim().parse().map_err(|e| StrataError::Runtime {
        message: format!("Invalid pid file {}: {e}", path.display()),
    })
}

/// Block until `pid` exits.
fn wait_pid(pid: u32) -> StrataResult<ProcessExit> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| StrataError::Internal {
        message: format!("pid {pid} out of range"),
    })?;

    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status is a valid, writable c_int.
        let rc = unsafe { libc::waitpid(raw, &mut status, 0) };
        if rc != -1 {
            break;
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => {}
            // Reaped elsewhere; no exit code available.
            Some(libc::ECHILD) => {
                return Ok(ProcessExit {
                    pid,
                    code: None,
                    signal: None,
                });
            }
            _ => {
                return Err(StrataError::Runtime {
                    message: format!("waitpid {pid} failed: {err}"),
                });
            }
        }
    }

    Ok(if libc::WIFEXITED(status) {
        ProcessExit {
            pid,
            code: Some(libc::WEXITSTATUS(status)),
            signal: None,
        }
    } else if libc::WIFSIGNALED(status) {
        ProcessExit {
            pid,
            code: None,
            signal: Some(libc::WTERMSIG(status)),
        }
    } else {
        ProcessExit {
            pid,
            code: None,
            signal: None,
        }
    })
}

#[async_trait]
impl OciRuntime for RuncRuntime {
    async fn exists(&self, id: &ContainerId) -> StrataResult<bool> {
        let output = self.run([OsStr::new("state"), OsStr::new(id.as_str())]).await?;
        if output.status.success() {
            let state: RuntimeState = serde_json::from_slice(&output.stdout)?;
            tracing::trace!(container_id = %id, status = %state.status, "Runtime knows container");
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_unknown(&stderr) {
            Ok(false)
        } else {
            Err(classify(id, "state", &stderr))
        }
    }

    async fn create(&self, request: CreateRequest) -> StrataResult<u32> {
        Self::become_subreaper()?;

        let config = self.spec(&request).save(&request.bundle)?;
        tracing::debug!(container_id = %request.id, config = %config.display(), "Wrote bundle config");

        let id = &request.id;
        self.checked(
            id,
            "create",
            [
                OsStr::new("create"),
                OsStr::new("--bundle"),
                request.bundle.as_os_str(),
                OsStr::new("--console-socket"),
                request.console_socket.as_os_str(),
                OsStr::new("--pid-file"),
                request.pid_file.as_os_str(),
                OsStr::new(id.as_str()),
            ],
        )
        .await?;

        let pid = read_pid_file(&request.pid_file)?;
        self.checked(id, "start", [OsStr::new("start"), OsStr::new(id.as_str())])
            .await?;

        tracing::debug!(container_id = %id, pid, "Runtime started container");
        Ok(pid)
    }

    async fn signal(&self, id: &ContainerId, signal: StopSignal) -> StrataResult<()> {
        self.checked(
            id,
            "kill",
            [OsStr::new("kill"), OsStr::new(id.as_str()), OsStr::new(signal.name())],
        )
        .await?;
        Ok(())
    }

    async fn wait(&self, _id: &ContainerId, pid: u32) -> StrataResult<ProcessExit> {
        tokio::task::spawn_blocking(move || wait_pid(pid))
            .await
            .map_err(|e| StrataError::Internal {
                message: format!("Wait task failed: {e}"),
            })?
    }

    async fn destroy(&self, id: &ContainerId) -> StrataResult<()> {
        let output = self
            .run([OsStr::new("delete"), OsStr::new("--force"), OsStr::new(id.as_str())])
            .await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_unknown(&stderr) {
            tracing::debug!(container_id = %id, "Runtime already forgot container");
            Ok(())
        } else {
            Err(StrataError::Runtime {
                message: format!("delete {id} failed: {}", stderr.trim()),
            })
        }
    }
}
