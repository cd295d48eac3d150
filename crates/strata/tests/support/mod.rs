//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use strata::backend::OverlayBackend;
use strata::exec::{StopSignal, send_pty_master};
use strata::mount::MountSpec;
use strata::runtime::{
    ContainerDef, ContainerProc, ContainerState, CreateRequest, OciRuntime, ProcessExit,
    StartContext,
};
use strata_common::{ContainerId, StrataError, StrataResult};
use strata_oci::Mount;
use tempfile::TempDir;
use tokio::sync::watch;

/// Pid every fake container gets.
pub const PID: u32 = 4242;

/// In-memory OCI runtime.
///
/// The "process" exits when it receives one of the `exit_on` signals or when
/// a test calls [`FakeRuntime::exit_with`].
#[derive(Debug)]
pub struct FakeRuntime {
    exit_on: Vec<StopSignal>,
    fail_create: bool,
    fail_destroy: bool,
    send_pty: bool,
    known: Mutex<HashSet<String>>,
    signals: Mutex<Vec<StopSignal>>,
    terminal: Mutex<Option<UnixStream>>,
    requests: Mutex<Vec<CreateRequest>>,
    exit: watch::Sender<Option<ProcessExit>>,
    waits: AtomicUsize,
    destroys: AtomicUsize,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    /// A process that exits on SIGTERM.
    pub fn new() -> Self {
        Self {
            exit_on: vec![StopSignal::Terminate],
            fail_create: false,
            fail_destroy: false,
            send_pty: false,
            known: Mutex::new(HashSet::new()),
            signals: Mutex::new(Vec::new()),
            terminal: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            exit: watch::Sender::new(None),
            waits: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        }
    }

    pub fn exits_on(mut self, signals: &[StopSignal]) -> Self {
        self.exit_on = signals.to_vec();
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    /// Hand a socketpair end to the console socket on create.
    pub fn with_pty(mut self) -> Self {
        self.send_pty = true;
        self
    }

    pub fn with_existing(self, id: &str) -> Self {
        self.known.lock().insert(id.to_string());
        self
    }

    /// Signals delivered so far.
    pub fn signals(&self) -> Vec<StopSignal> {
        self.signals.lock().clone()
    }

    /// Number of runtime waits started.
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CreateRequest> {
        self.requests.lock().last().cloned()
    }

    /// The terminal side of the fake pty.
    pub fn take_terminal(&self) -> Option<UnixStream> {
        self.terminal.lock().take()
    }

    /// Make the process exit with `code`.
    pub fn exit_with(&self, code: i32) {
        self.exit.send_replace(Some(ProcessExit {
            pid: PID,
            code: Some(code),
            signal: None,
        }));
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[async_trait]
impl OciRuntime for FakeRuntime {
    async fn exists(&self, id: &ContainerId) -> StrataResult<bool> {
        Ok(self.known.lock().contains(id.as_str()))
    }

    async fn create(&self, request: CreateRequest) -> StrataResult<u32> {
        if self.fail_create {
            return Err(StrataError::Runtime {
                message: "exec format error".to_string(),
            });
        }

        if self.send_pty {
            let (terminal, master) = UnixStream::pair()?;
            let conn = UnixStream::connect(&request.console_socket)?;
            send_pty_master(&conn, master.as_fd())?;
            *self.terminal.lock() = Some(terminal);
        }

        self.known.lock().insert(request.id.to_string());
        self.requests.lock().push(request);
        Ok(PID)
    }

    async fn signal(&self, id: &ContainerId, signal: StopSignal) -> StrataResult<()> {
        if self.has_exited() {
            return Err(StrataError::ContainerNotRunning { id: id.to_string() });
        }

        self.signals.lock().push(signal);
        if self.exit_on.contains(&signal) {
            self.exit.send_replace(Some(ProcessExit {
                pid: PID,
                code: None,
                signal: Some(signal.as_raw()),
            }));
        }
        Ok(())
    }

    async fn wait(&self, _id: &ContainerId, _pid: u32) -> StrataResult<ProcessExit> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.exit.subscribe();
        let exit = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| StrataError::Runtime {
                message: "fake runtime dropped".to_string(),
            })?;
        exit.ok_or_else(|| StrataError::Internal {
            message: "exit status vanished".to_string(),
        })
    }

    async fn destroy(&self, id: &ContainerId) -> StrataResult<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.known.lock().remove(id.as_str());
        if self.fail_destroy {
            return Err(StrataError::Runtime {
                message: "delete failed: device or resource busy".to_string(),
            });
        }
        Ok(())
    }
}

/// A scratch root with two layers and a fake runtime.
pub struct Fixture {
    pub tmp: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub ctx: StartContext,
    pub state: ContainerState,
}

impl Fixture {
    pub fn new(runtime: FakeRuntime) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(runtime);
        let ctx = StartContext::new(runtime.clone(), Arc::new(OverlayBackend::new()));
        let state = ContainerState::new(
            tmp.path().join("containers"),
            ContainerId::new("c1").unwrap(),
        );
        Self {
            tmp,
            runtime,
            ctx,
            state,
        }
    }

    pub fn layer(&self, name: &str) -> PathBuf {
        let path = self.tmp.path().join("layers").join(name);
        std::fs::create_dir_all(path.join("etc")).unwrap();
        path
    }

    /// `base` and `tools` merged at `/`, a tmpfs at `/tmp`.
    pub fn definition(&self) -> ContainerDef {
        ContainerDef::new(ContainerProc::new(["sh"])).with_mounts([
            MountSpec::layer(0, self.layer("base"), "/"),
            MountSpec::layer(1, self.layer("tools"), "/"),
            MountSpec::Raw(Mount::tmpfs("/tmp")),
        ])
    }
}
