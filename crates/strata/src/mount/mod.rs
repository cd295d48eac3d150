//! Mount specifications and their composition into a mount tree.
//!
//! This module handles:
//! - The [`MountSpec`] input handed over by the layer resolver
//! - Destination path normalization
//! - The [`MountTree`] that merges overlapping layer mounts
//! - Host mount table queries and unmounting

pub mod mountinfo;
mod tree;
mod unmount;

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_common::{StrataError, StrataResult};
use strata_oci::Mount;

pub use tree::{LayerSource, MountNode, MountTree, NodeContent};
pub use unmount::{UnmountFlags, is_not_mounted, unmount};

/// One mount requested for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MountSpec {
    /// A directory merged with every other layer at the same destination.
    Layer(LayerMount),
    /// A mount that owns its destination exclusively (bind, tmpfs, proc...).
    Raw(Mount),
}

impl MountSpec {
    /// Shorthand for a layer mount without a selector.
    #[must_use]
    pub fn layer(
        index: usize,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self::Layer(LayerMount {
            index,
            source: source.into(),
            destination: destination.into(),
            selector: None,
        })
    }

    /// Where the mount lands inside the container.
    #[must_use]
    pub fn destination(&self) -> &Path {
        match self {
            Self::Layer(layer) => &layer.destination,
            Self::Raw(mount) => &mount.destination,
        }
    }
}

/// A layer directory to merge at a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMount {
    /// Position in the resolver's ordering; higher indexes sit on top.
    pub index: usize,
    /// Layer directory on the host.
    pub source: PathBuf,
    /// Mountpoint inside the container.
    pub destination: PathBuf,
    /// Subdirectory of `source` to expose instead of its root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<PathBuf>,
}

impl LayerMount {
    /// The host directory this layer actually contributes.
    #[must_use]
    pub fn effective_source(&self) -> PathBuf {
        match &self.selector {
            Some(selector) => {
                let relative = selector.strip_prefix("/").unwrap_or(selector);
                self.source.join(relative)
            }
            None => self.source.clone(),
        }
    }
}

/// Normalize a container mount destination.
///
/// The path must be absolute; `.` components and trailing separators are
/// dropped and `..` is refused.
///
/// # Errors
///
/// Returns [`StrataError::InvalidMountPath`] for relative paths or paths
/// containing `..`.
pub fn normalize_destination(path: &Path) -> StrataResult<PathBuf> {
    let invalid = || StrataError::InvalidMountPath {
        path: path.to_path_buf(),
    };

    if !path.is_absolute() {
        return Err(invalid());
    }

    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir | Component::Prefix(_) => return Err(invalid()),
        }
    }
    Ok(normalized)
}
