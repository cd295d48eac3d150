//! Mount tree realization.
//!
//! A [`MountBackend`] turns a [`MountTree`] into concrete mount descriptors
//! for the OCI runtime, together with the cleanup that undoes whatever it
//! created on the host:
//! - [`OverlayBackend`] emits kernel `overlay` mounts
//! - [`FuseBackend`] mounts each layered node with `fuse-overlayfs` and emits
//!   bind mounts

mod fuse;
mod overlay;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_common::{StrataError, StrataResult};
use strata_oci::Mount;

use crate::cleanup::{self, CleanupStack};
use crate::mount::{MountNode, MountTree};
use crate::runtime::ContainerState;

pub use fuse::FuseBackend;
pub use overlay::OverlayBackend;

/// Which backend realizes layered mounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Kernel overlayfs.
    #[default]
    Overlay,
    /// `fuse-overlayfs` helper processes.
    Fuse,
}

/// Strategy that realizes a mount tree on the host.
///
/// Realization blocks on filesystem work and helper processes; run it on a
/// blocking thread.
pub trait MountBackend: Send + Sync + std::fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Realize every node of `tree` for the container laid out by `state`.
    ///
    /// On error, anything created so far has already been cleaned up.
    ///
    /// # Errors
    ///
    /// Returns setup failures (I/O, option length, helper failures).
    fn realize(&self, tree: &MountTree, state: &ContainerState) -> StrataResult<RealizedMounts>;
}

/// Layers backing an overlay destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayers {
    /// Read-only layers, bottom-most first. The masking layer is first.
    pub lower: Vec<PathBuf>,
    /// Writable layer.
    pub upper: PathBuf,
    /// Overlay work directory.
    pub work: PathBuf,
}

/// One mount handed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    /// The OCI mount descriptor.
    pub mount: Mount,
    /// Layer details for overlay destinations.
    pub layers: Option<OverlayLayers>,
}

impl ResolvedMount {
    /// A mount passed through untouched.
    #[must_use]
    pub const fn raw(mount: Mount) -> Self {
        Self {
            mount,
            layers: None,
        }
    }

    /// Destination inside the container.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.mount.destination
    }

    /// Returns true if this mount covers the container root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.mount.destination == Path::new("/")
    }
}

/// Output of [`MountBackend::realize`].
#[derive(Debug, Default)]
pub struct RealizedMounts {
    /// Mounts in application order: parents before children.
    pub mounts: Vec<ResolvedMount>,
    /// Writable layer of every layered destination.
    pub upper_dirs: BTreeMap<PathBuf, PathBuf>,
    /// Undoes everything realization created, upper directories excepted.
    pub cleanup: CleanupStack,
}

/// Build a backend from its kind.
#[must_use]
pub fn backend_for(
    kind: BackendKind,
    config: &crate::runtime::RuntimeConfig,
) -> std::sync::Arc<dyn MountBackend> {
    match kind {
        BackendKind::Overlay => std::sync::Arc::new(OverlayBackend::new()),
        BackendKind::Fuse => std::sync::Arc::new(
            FuseBackend::new(&config.fuse_overlayfs)
                .with_mount_timeout(config.mount_timeout)
                .with_stop_timeout(config.helper_stop_timeout),
        ),
    }
}

/// Per-destination scratch directories shared by both backends.
#[derive(Debug)]
struct LayerDirs {
    upper: PathBuf,
    work: PathBuf,
    private: PathBuf,
}

impl LayerDirs {
    /// Create `upper`, `work` and a populated `private` for `node`.
    ///
    /// Removal of `work` and `private` is registered on `cleanup`.
    fn create(
        state: &ContainerState,
        node: &MountNode,
        cleanup: &mut CleanupStack,
    ) -> StrataResult<Self> {
        let destination = node.destination();
        let dirs = Self {
            upper: state.upper_dir(destination),
            work: state.work_dir(destination),
            private: state.private_dir(destination),
        };

        std::fs::create_dir_all(&dirs.upper)?;

        std::fs::create_dir_all(&dirs.work)?;
        let work = dirs.work.clone();
        cleanup.push(format!("remove {}", work.display()), move || {
            cleanup::remove_dir_all(&work)
        });

        std::fs::create_dir_all(&dirs.private)?;
        let private = dirs.private.clone();
        cleanup.push(format!("remove {}", private.display()), move || {
            cleanup::remove_dir_all(&private)
        });
        populate_private(node, &dirs.private)?;

        Ok(dirs)
    }

    /// Lower layers of `node`, bottom-most first, masking layer included.
    fn lower(&self, node: &MountNode) -> Vec<PathBuf> {
        std::iter::once(self.private.clone())
            .chain(node.sources().iter().map(|source| source.path.clone()))
            .collect()
    }
}

/// Create a placeholder for every direct child mountpoint of `node`.
///
/// Children get an empty directory, except bind mounts of non-directories
/// which need an empty file to land on.
fn populate_private(node: &MountNode, private: &Path) -> StrataResult<()> {
    for child in node.children() {
        let relative = child
            .destination()
            .strip_prefix(node.destination())
            .map_err(|_| StrataError::Internal {
                message: format!(
                    "{} is not below {}",
                    child.destination().display(),
                    node.destination().display()
                ),
            })?;
        let placeholder = private.join(relative);

        let wants_file = child.raw().is_some_and(|mount| {
            mount.is_bind() && !mount.source.as_deref().is_some_and(Path::is_dir)
        });

        if wants_file {
            if let Some(parent) = placeholder.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&placeholder)?;
        } else {
            std::fs::create_dir_all(&placeholder)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use strata_common::ContainerId;

    use super::*;
    use crate::mount::MountSpec;

    #[test]
    fn private_layer_masks_children() {
        let tmp = tempfile::tempdir().unwrap();
        let host_file = tmp.path().join("resolv.conf");
        std::fs::write(&host_file, "nameserver 1.1.1.1\n").unwrap();

        let tree = MountTree::build([
            MountSpec::Raw(Mount::bind(&host_file, "/etc/resolv.conf")),
            MountSpec::Raw(Mount::bind(tmp.path(), "/mnt/host")),
            MountSpec::Raw(Mount::tmpfs("/tmp")),
        ])
        .unwrap();

        let state = ContainerState::new(tmp.path().join("containers"), ContainerId::new("c").unwrap());
        let mut cleanup = CleanupStack::new();
        let dirs = LayerDirs::create(&state, tree.root(), &mut cleanup).unwrap();

        assert!(dirs.upper.is_dir());
        assert!(dirs.work.is_dir());
        assert!(dirs.private.join("etc/resolv.conf").is_file());
        assert!(dirs.private.join("mnt/host").is_dir());
        assert!(dirs.private.join("tmp").is_dir());
        assert_eq!(dirs.lower(tree.root()), vec![dirs.private.clone()]);

        cleanup.run().unwrap();
        assert!(dirs.upper.is_dir());
        assert!(!dirs.work.exists());
        assert!(!dirs.private.exists());
    }

    #[test]
    fn backend_kind_serde() {
        let kind: BackendKind = serde_json::from_str("\"fuse\"").unwrap();
        assert_eq!(kind, BackendKind::Fuse);
        assert_eq!(BackendKind::default(), BackendKind::Overlay);
    }
}
