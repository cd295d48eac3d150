//! # Strata
//!
//! Layered root filesystems and container lifecycle on top of an OCI runtime.
//!
//! - [`mount`]: ordered layer and raw mounts folded into a [`mount::MountTree`]
//! - [`backend`]: the tree realized as kernel overlay mounts or
//!   `fuse-overlayfs` helpers
//! - [`exec`]: console socket, fifo attach and the console pump
//! - [`runtime`]: container layout, start, wait, attach and escalating destroy
//!
//! ## Usage
//!
//! ```no_run
//! use strata::mount::MountSpec;
//! use strata::runtime::{ContainerDef, ContainerProc, Engine, RuntimeConfig};
//! use strata_common::ContainerId;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> strata_common::StrataResult<()> {
//! let engine = Engine::new(RuntimeConfig::rootless())?;
//!
//! let def = ContainerDef::new(ContainerProc::new(["make", "all"])).with_mounts([
//!     MountSpec::layer(0, "/var/lib/layers/base", "/"),
//!     MountSpec::layer(1, "/var/lib/layers/toolchain", "/"),
//! ]);
//! let container = engine.start(ContainerId::new("build-1")?, def).await?;
//!
//! let exit = container.wait(&CancellationToken::new()).await;
//! engine.destroy(&container).await?;
//! exit?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cleanup;
pub mod exec;
pub mod mount;
pub mod runtime;

pub use cleanup::CleanupStack;
pub use runtime::{Container, ContainerState, Engine};
