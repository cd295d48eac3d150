//! A live container: start, attach, wait and destroy.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use strata_common::{ContainerId, StrataError, StrataResult};
use strata_oci::runtime::ConsoleSize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::definition::ContainerDef;
use super::engine::ExecPermit;
use super::events::{EventBus, RuntimeEvent};
use super::oci::{CreateRequest, OciRuntime, ProcessExit};
use super::state::ContainerState;
use crate::backend::{MountBackend, RealizedMounts, ResolvedMount};
use crate::cleanup::{self, CleanupStack};
use crate::exec::{ConsolePump, ConsoleSocket, StopSignal, fifo};
use crate::mount::MountTree;

/// Signals sent by [`Container::destroy`], one tier per deadline.
const ESCALATION: [&[StopSignal]; 2] = [
    &[StopSignal::Terminate, StopSignal::Hangup],
    &[StopSignal::Kill],
];

/// How long destroy waits for the console pump to wind down.
const PUMP_GRACE: Duration = Duration::from_secs(1);

/// Collaborators needed to start a container.
#[derive(Debug, Clone)]
pub struct StartContext {
    /// OCI runtime primitive.
    pub runtime: Arc<dyn OciRuntime>,
    /// Backend realizing layered mounts.
    pub backend: Arc<dyn MountBackend>,
    /// Where lifecycle events go.
    pub events: EventBus,
}

impl StartContext {
    /// Context with a fresh event bus.
    #[must_use]
    pub fn new(runtime: Arc<dyn OciRuntime>, backend: Arc<dyn MountBackend>) -> Self {
        Self {
            runtime,
            backend,
            events: EventBus::new(),
        }
    }

    /// Publish events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }
}

/// Lifecycle phase of a [`Container`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPhase {
    /// Created and started by the runtime.
    Running,
    /// Destroy began delivering stop signals.
    Signaled,
    /// Torn down; every cleanup action has run.
    Destroyed,
}

#[derive(Debug, Clone)]
enum WaitOutcome {
    Exited(ProcessExit),
    Failed(String),
}

impl WaitOutcome {
    fn into_result(self) -> StrataResult<ProcessExit> {
        match self {
            Self::Exited(exit) => exit.into_result(),
            Self::Failed(message) => Err(StrataError::Runtime { message }),
        }
    }
}

type ExitFuture = Shared<BoxFuture<'static, WaitOutcome>>;

impl ContainerState {
    /// Set up the container's directories, mounts and console, then have the
    /// runtime create and start its process.
    ///
    /// Every resource acquired here registers its release on the returned
    /// container's cleanup stacks. On failure, whatever was set up is undone
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::ContainerExists`] if the runtime already knows
    /// the ID, or any setup or runtime failure.
    pub async fn start(&self, def: ContainerDef, ctx: &StartContext) -> StrataResult<Container> {
        let id = self.id().clone();
        if ctx.runtime.exists(&id).await? {
            return Err(StrataError::ContainerExists { id: id.to_string() });
        }

        tracing::info!(
            container_id = %id,
            backend = ctx.backend.name(),
            dir = %self.dir().display(),
            "Starting container"
        );

        // Declared first so that on an early return it drops last.
        let mut post_kill = CleanupStack::new();
        let mut pre_kill = CleanupStack::new();

        std::fs::create_dir_all(self.dir())?;
        if !def.persist {
            push_remove_dir(&mut post_kill, self.dir());
            push_remove_dir(&mut post_kill, self.overlay_root());
        }
        for dir in [self.io_dir(), self.inner(), self.rootfs()] {
            std::fs::create_dir_all(&dir)?;
            if !def.persist {
                push_remove_dir(&mut post_kill, dir);
            }
        }

        let tree = MountTree::build(def.mounts)?;
        let RealizedMounts {
            mounts,
            upper_dirs,
            cleanup: mount_cleanup,
        } = {
            let backend = Arc::clone(&ctx.backend);
            let state = self.clone();
            tokio::task::spawn_blocking(move || backend.realize(&tree, &state))
                .await
                .map_err(|e| StrataError::Internal {
                    message: format!("Mount task failed: {e}"),
                })??
        };
        post_kill.append(mount_cleanup);
        tracing::debug!(container_id = %id, mounts = mounts.len(), "Mounts realized");

        let stdin = self.stdin_fifo();
        let stdout = self.stdout_fifo();
        for path in [&stdin, &stdout] {
            cleanup::remove_file(path)?;
            fifo::create(path)?;
            let path = path.clone();
            post_kill.push(format!("remove {}", path.display()), move || {
                cleanup::remove_file(&path)
            });
        }

        let socket = ConsoleSocket::bind(&self.console_socket())?;
        let socket_path = socket.path().to_path_buf();
        post_kill.push("remove console socket", move || {
            cleanup::remove_file(&socket_path)
        });

        let (resize, resize_rx) = mpsc::channel(8);
        let console = CancellationToken::new();
        let pump = ConsolePump::new(socket, &stdin, &stdout, resize_rx, console.clone())?.spawn();
        {
            let console = console.clone();
            pre_kill.push("stop console pump", move || {
                console.cancel();
                Ok(())
            });
        }

        let request = CreateRequest {
            id: id.clone(),
            bundle: self.bundle(),
            rootfs: self.rootfs(),
            mounts: mounts.clone(),
            process: def.process,
            hostname: def.hostname,
            console_socket: self.console_socket(),
            pid_file: self.pid_file(),
        };

        let pid = match ctx.runtime.create(request).await {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "Runtime failed to create container");
                if let Err(cleanup_err) = ctx.runtime.destroy(&id).await {
                    tracing::debug!(
                        container_id = %id,
                        error = %cleanup_err,
                        "Runtime cleanup after failed create failed"
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(container_id = %id, pid, "Container started");
        ctx.events.publish(RuntimeEvent::Started {
            id: id.to_string(),
            pid,
            timestamp: Utc::now(),
        });

        Ok(Container {
            state: self.clone(),
            pid,
            mounts,
            upper_dirs,
            runtime: Arc::clone(&ctx.runtime),
            events: ctx.events.clone(),
            phase: RwLock::new(ContainerPhase::Running),
            pre_kill: Mutex::new(pre_kill.take()),
            post_kill: Mutex::new(post_kill.take()),
            resize,
            pump: Mutex::new(Some(pump)),
            exit: Mutex::new(None),
            destroy_lock: tokio::sync::Mutex::new(()),
            permit: Mutex::new(None),
        })
    }
}

fn push_remove_dir(stack: &mut CleanupStack, dir: PathBuf) {
    stack.push(format!("remove {}", dir.display()), move || {
        cleanup::remove_dir_all(&dir)
    });
}

/// A started container.
///
/// Teardown is two-phase: the pre-kill stack runs before the first stop
/// signal, the post-kill stack after the process is gone and the runtime
/// forgot it.
pub struct Container {
    state: ContainerState,
    pid: u32,
    mounts: Vec<ResolvedMount>,
    upper_dirs: BTreeMap<PathBuf, PathBuf>,
    runtime: Arc<dyn OciRuntime>,
    events: EventBus,
    phase: RwLock<ContainerPhase>,
    pre_kill: Mutex<CleanupStack>,
    post_kill: Mutex<CleanupStack>,
    resize: mpsc::Sender<ConsoleSize>,
    pump: Mutex<Option<JoinHandle<StrataResult<()>>>>,
    exit: Mutex<Option<ExitFuture>>,
    destroy_lock: tokio::sync::Mutex<()>,
    permit: Mutex<Option<ExecPermit>>,
}

impl Container {
    /// Container ID.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        self.state.id()
    }

    /// On-disk layout.
    #[must_use]
    pub const fn state(&self) -> &ContainerState {
        &self.state
    }

    /// Host pid of the container init.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Mounts handed to the runtime, parents first.
    #[must_use]
    pub fn mounts(&self) -> &[ResolvedMount] {
        &self.mounts
    }

    /// Writable layer of each layered destination.
    #[must_use]
    pub const fn upper_dirs(&self) -> &BTreeMap<PathBuf, PathBuf> {
        &self.upper_dirs
    }

    /// Writable layer backing `destination`, if it is layered.
    #[must_use]
    pub fn upper_dir(&self, destination: impl AsRef<Path>) -> Option<&Path> {
        self.upper_dirs
            .get(destination.as_ref())
            .map(PathBuf::as_path)
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> ContainerPhase {
        *self.phase.read()
    }

    pub(crate) fn hold(&self, permit: ExecPermit) {
        *self.permit.lock() = Some(permit);
    }

    /// Wait for the container process to exit.
    ///
    /// The runtime is asked only once; every caller, including later ones,
    /// sees the same outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Cancelled`] if `cancel` fires first,
    /// [`StrataError::NonZeroExit`] for a failed process, or the runtime's
    /// wait failure.
    pub async fn wait(&self, cancel: &CancellationToken) -> StrataResult<ProcessExit> {
        let exit = self.exit_future();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StrataError::Cancelled {
                operation: "wait".to_string(),
            }),
            outcome = exit => outcome.into_result(),
        }
    }

    fn exit_future(&self) -> ExitFuture {
        let mut slot = self.exit.lock();
        if let Some(exit) = slot.as_ref() {
            return exit.clone();
        }

        let runtime = Arc::clone(&self.runtime);
        let events = self.events.clone();
        let id = self.id().clone();
        let pid = self.pid;

        let task = tokio::spawn(async move {
            match runtime.wait(&id, pid).await {
                Ok(exit) => {
                    tracing::info!(container_id = %id, %exit, "Container process exited");
                    events.publish(RuntimeEvent::Exited {
                        id: id.to_string(),
                        code: exit.code,
                        signal: exit.signal,
                        timestamp: Utc::now(),
                    });
                    WaitOutcome::Exited(exit)
                }
                Err(e) => {
                    tracing::warn!(container_id = %id, error = %e, "Waiting for container failed");
                    WaitOutcome::Failed(e.to_string())
                }
            }
        });

        let exit = async move {
            task.await
                .unwrap_or_else(|e| WaitOutcome::Failed(format!("Wait task failed: {e}")))
        }
        .boxed()
        .shared();

        *slot = Some(exit.clone());
        exit
    }

    /// Stop the container and release everything it holds.
    ///
    /// Sends SIGTERM and SIGHUP, then SIGKILL, waiting up to `timeout` for
    /// the process after each tier. Runtime removal and the post-kill
    /// cleanup run whatever happened before. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns every teardown failure, combined into one error.
    pub async fn destroy(&self, timeout: Duration) -> StrataResult<()> {
        let _guard = self.destroy_lock.lock().await;
        if self.phase() == ContainerPhase::Destroyed {
            return Ok(());
        }
        *self.phase.write() = ContainerPhase::Signaled;

        let id = self.id().clone();
        tracing::info!(container_id = %id, ?timeout, "Destroying container");

        let mut errors = Vec::new();

        let mut pre_kill = self.pre_kill.lock().take();
        if let Err(e) = pre_kill.run() {
            errors.push(e);
        }
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            match tokio::time::timeout(PUMP_GRACE, pump).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    tracing::debug!(container_id = %id, error = %e, "Console pump failed");
                }
                Ok(Err(e)) => {
                    tracing::debug!(container_id = %id, error = %e, "Console pump panicked");
                }
                Err(_) => tracing::debug!(container_id = %id, "Console pump did not stop in time"),
            }
        }

        self.escalate(timeout, &mut errors).await;

        if let Err(e) = self.runtime.destroy(&id).await {
            errors.push(e);
        }

        let mut post_kill = self.post_kill.lock().take();
        match tokio::task::spawn_blocking(move || post_kill.run()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(StrataError::Internal {
                message: format!("Cleanup task failed: {e}"),
            }),
        }

        *self.phase.write() = ContainerPhase::Destroyed;
        self.events.publish(RuntimeEvent::Destroyed {
            id: id.to_string(),
            timestamp: Utc::now(),
        });
        drop(self.permit.lock().take());

        if errors.is_empty() {
            tracing::info!(container_id = %id, "Container destroyed");
        } else {
            tracing::warn!(container_id = %id, failures = errors.len(), "Container destroyed with errors");
        }
        StrataError::collect(errors)
    }

    async fn escalate(&self, timeout: Duration, errors: &mut Vec<StrataError>) {
        let id = self.id();

        for (tier, signals) in ESCALATION.iter().enumerate() {
            for &signal in *signals {
                match self.runtime.signal(id, signal).await {
                    Ok(()) => {
                        tracing::debug!(container_id = %id, %signal, "Sent stop signal");
                        self.events.publish(RuntimeEvent::Signaled {
                            id: id.to_string(),
                            signal: signal.name().to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                    Err(StrataError::ContainerNotRunning { .. }) => {
                        tracing::debug!(container_id = %id, %signal, "Container already stopped");
                        return;
                    }
                    Err(e) => errors.push(e),
                }
            }

            if tokio::time::timeout(timeout, self.exit_future()).await.is_ok() {
                return;
            }

            if tier + 1 < ESCALATION.len() {
                tracing::warn!(container_id = %id, ?timeout, "Container ignored stop signals, escalating");
            } else {
                tracing::warn!(container_id = %id, ?timeout, "Container still running after SIGKILL");
            }
        }
    }

    /// Stream `input` to the console and the console to `output`.
    ///
    /// Returns when the console output closes. Input reaching EOF does not
    /// end the session.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Cancelled`] if `cancel` fires,
    /// [`StrataError::ContainerNotRunning`] after destroy, or an I/O failure.
    pub async fn attach<I, O>(
        &self,
        cancel: &CancellationToken,
        input: I,
        output: O,
    ) -> StrataResult<()>
    where
        I: AsyncRead + Unpin + Send,
        O: AsyncWrite + Unpin + Send,
    {
        if self.phase() != ContainerPhase::Running {
            return Err(self.not_running());
        }
        tracing::debug!(container_id = %self.id(), "Attaching to console");
        fifo::attach(
            &self.state.stdin_fifo(),
            &self.state.stdout_fifo(),
            cancel,
            input,
            output,
        )
        .await
    }

    /// Change the console size.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::ContainerNotRunning`] once the console is gone.
    pub async fn resize(&self, size: ConsoleSize) -> StrataResult<()> {
        self.resize
            .send(size)
            .await
            .map_err(|_| self.not_running())
    }

    fn not_running(&self) -> StrataError {
        StrataError::ContainerNotRunning {
            id: self.id().to_string(),
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", self.id())
            .field("pid", &self.pid)
            .field("phase", &self.phase())
            .field("mounts", &self.mounts.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if *self.phase.get_mut() != ContainerPhase::Destroyed {
            tracing::warn!(container_id = %self.state.id(), "Container dropped without destroy");
        }
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}
