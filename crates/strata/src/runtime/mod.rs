//! Container lifecycle.
//!
//! [`ContainerState`] lays out a container on disk and starts it into a
//! [`Container`]; the [`Engine`] bundles the runtime, backend and event bus
//! and drains in-flight containers on shutdown.

mod config;
mod container;
mod definition;
mod engine;
pub mod events;
mod oci;
mod runc;
mod state;

pub use config::RuntimeConfig;
pub use container::{Container, ContainerPhase, StartContext};
pub use definition::{ContainerDef, ContainerProc};
pub use engine::{ContainerEvents, Engine, ExecPermit};
pub use events::{EventBus, RuntimeEvent};
pub use oci::{CreateRequest, OciRuntime, ProcessExit};
pub use runc::RuncRuntime;
pub use state::ContainerState;
