//! Container engine: shared collaborators plus shutdown draining.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use strata_common::{ContainerId, StrataError, StrataPaths, StrataResult};
use tokio::sync::Notify;

use super::config::RuntimeConfig;
use super::container::{Container, StartContext};
use super::definition::ContainerDef;
use super::events::{EventBus, RuntimeEvent};
use super::oci::OciRuntime;
use super::runc::RuncRuntime;
use super::state::ContainerState;
use crate::backend::{MountBackend, backend_for};

/// In-flight container accounting for one engine.
#[derive(Debug, Default)]
struct Drain {
    in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    idle: Notify,
}

impl Drain {
    fn begin(self: &Arc<Self>) -> StrataResult<ExecPermit> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let permit = ExecPermit {
            drain: Arc::clone(self),
        };
        if self.shutting_down.load(Ordering::SeqCst) {
            // Dropping the permit undoes the increment.
            drop(permit);
            return Err(StrataError::ShuttingDown);
        }
        Ok(permit)
    }

    async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Keeps a container counted as in flight until dropped.
#[derive(Debug)]
pub struct ExecPermit {
    drain: Arc<Drain>,
}

impl Drop for ExecPermit {
    fn drop(&mut self) {
        self.drain.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.drain.idle.notify_waiters();
    }
}

/// Starts and destroys containers with one runtime, backend and event bus.
///
/// Cloning is cheap; clones share the event bus and drain state.
#[derive(Debug, Clone)]
pub struct Engine {
    config: RuntimeConfig,
    runtime: Arc<dyn OciRuntime>,
    backend: Arc<dyn MountBackend>,
    events: EventBus,
    drain: Arc<Drain>,
}

impl Engine {
    /// Engine driving the configured runc-compatible binary.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directories cannot be created.
    pub fn new(config: RuntimeConfig) -> StrataResult<Self> {
        let runtime = Arc::new(RuncRuntime::from_config(&config));
        Self::with_runtime(config, runtime)
    }

    /// Engine using `runtime` and the configured mount backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directories cannot be created.
    pub fn with_runtime(config: RuntimeConfig, runtime: Arc<dyn OciRuntime>) -> StrataResult<Self> {
        let backend = backend_for(config.backend, &config);
        Self::with_parts(config, runtime, backend)
    }

    /// Engine from explicit parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directories cannot be created.
    pub fn with_parts(
        config: RuntimeConfig,
        runtime: Arc<dyn OciRuntime>,
        backend: Arc<dyn MountBackend>,
    ) -> StrataResult<Self> {
        config.paths().create_dirs()?;
        tracing::debug!(
            root = %config.root.display(),
            backend = backend.name(),
            rootless = config.rootless,
            "Engine ready"
        );
        Ok(Self {
            config,
            runtime,
            backend,
            events: EventBus::new(),
            drain: Arc::new(Drain::default()),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Data directory layout.
    #[must_use]
    pub fn paths(&self) -> StrataPaths {
        self.config.paths()
    }

    /// Lifecycle events of every container started here.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Number of containers started and not yet destroyed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.drain.in_flight.load(Ordering::SeqCst)
    }

    /// On-disk layout of container `id`.
    #[must_use]
    pub fn state(&self, id: ContainerId) -> ContainerState {
        ContainerState::from_paths(&self.paths(), id)
    }

    /// Start container `id`.
    ///
    /// The container counts as in flight until it is destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::ShuttingDown`] once [`Engine::shutdown`] was
    /// called, or any start failure.
    pub async fn start(&self, id: ContainerId, def: ContainerDef) -> StrataResult<Container> {
        let permit = self.drain.begin()?;

        let ctx = StartContext {
            runtime: Arc::clone(&self.runtime),
            backend: Arc::clone(&self.backend),
            events: self.events.clone(),
        };
        let container = self.state(id).start(def, &ctx).await?;
        container.hold(permit);
        Ok(container)
    }

    /// Destroy `container` with the configured stop timeout.
    ///
    /// # Errors
    ///
    /// Returns every teardown failure, combined into one error.
    pub async fn destroy(&self, container: &Container) -> StrataResult<()> {
        container.destroy(self.config.stop_timeout).await
    }

    /// Refuse new containers and wait until every started one is destroyed.
    pub async fn shutdown(&self) {
        tracing::info!(in_flight = self.in_flight(), "Engine shutting down");
        self.drain.shutdown().await;
        tracing::info!("Engine drained");
    }

    /// Returns true once shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.drain.shutting_down.load(Ordering::SeqCst)
    }

    /// Subscribe to events about container `id` only.
    #[must_use]
    pub fn watch(&self, id: &ContainerId) -> ContainerEvents {
        ContainerEvents {
            id: id.to_string(),
            rx: self.events.subscribe(),
        }
    }
}

/// Event stream filtered to one container.
#[derive(Debug)]
pub struct ContainerEvents {
    id: String,
    rx: tokio::sync::broadcast::Receiver<RuntimeEvent>,
}

impl ContainerEvents {
    /// Next event about the watched container, or `None` once the bus closed.
    ///
    /// Events lost to a lagging receiver are skipped.
    pub async fn next(&mut self) -> Option<RuntimeEvent> {
        use tokio::sync::broadcast::error::RecvError;

        loop {
            match self.rx.recv().await {
                Ok(event) if event.container_id() == self.id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(container_id = %self.id, skipped, "Event receiver lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn shutdown_without_containers_returns_immediately() {
        let drain = Arc::new(Drain::default());
        tokio::time::timeout(Duration::from_secs(1), drain.shutdown())
            .await
            .unwrap();
        assert!(matches!(drain.begin(), Err(StrataError::ShuttingDown)));
        assert_eq!(drain.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_every_permit() {
        let drain = Arc::new(Drain::default());
        let first = drain.begin().unwrap();
        let second = drain.begin().unwrap();

        let waiter = {
            let drain = Arc::clone(&drain);
            tokio::spawn(async move { drain.shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
