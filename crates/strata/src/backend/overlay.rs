//! Kernel overlayfs realization.

use std::path::Path;

use strata_common::{StrataError, StrataResult};
use strata_oci::Mount;

use super::{LayerDirs, MountBackend, OverlayLayers, RealizedMounts, ResolvedMount};
use crate::cleanup;
use crate::mount::{MountTree, NodeContent};
use crate::runtime::ContainerState;

/// Emits one `overlay` mount per layered destination.
///
/// Lower directories are referenced through short numbered symlinks in the
/// container's `rootfs/`, which the runtime resolves relative to the rootfs,
/// so deep layer stores do not blow the one-page option limit.
#[derive(Debug, Clone)]
pub struct OverlayBackend {
    option_limit: usize,
}

impl Default for OverlayBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayBackend {
    /// Create a backend limited to one page of mount options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            option_limit: rustix::param::page_size(),
        }
    }

    /// Override the option length limit, terminator included.
    #[must_use]
    pub const fn with_option_limit(mut self, limit: usize) -> Self {
        self.option_limit = limit;
        self
    }
}

/// `lowerdir` (top-most first), `upperdir` and `workdir` options.
fn overlay_options<'a>(
    lower_top_first: impl Iterator<Item = &'a str>,
    upper: &Path,
    work: &Path,
) -> Vec<String> {
    vec![
        format!("lowerdir={}", lower_top_first.collect::<Vec<_>>().join(":")),
        format!("upperdir={}", upper.display()),
        format!("workdir={}", work.display()),
    ]
}

impl MountBackend for OverlayBackend {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn realize(&self, tree: &MountTree, state: &ContainerState) -> StrataResult<RealizedMounts> {
        let mut realized = RealizedMounts::default();
        let mut next_link = 0usize;

        for node in tree.iter() {
            let destination = node.destination();
            if let NodeContent::Raw(mount) = node.content() {
                realized.mounts.push(ResolvedMount::raw(mount.clone()));
                continue;
            }

            let dirs = LayerDirs::create(state, node, &mut realized.cleanup)?;
            let lower = dirs.lower(node);

            let mut names = Vec::with_capacity(lower.len());
            for dir in &lower {
                let link = state.lower_link(next_link);
                std::os::unix::fs::symlink(dir, &link)?;
                realized
                    .cleanup
                    .push(format!("remove {}", link.display()), move || {
                        cleanup::remove_file(&link)
                    });
                names.push(next_link.to_string());
                next_link += 1;
            }

            let options = overlay_options(
                names.iter().rev().map(String::as_str),
                &dirs.upper,
                &dirs.work,
            );
            let len = options.join(",").len();
            if len >= self.option_limit {
                return Err(StrataError::MountOptionsTooLong {
                    destination: destination.to_path_buf(),
                    len,
                    limit: self.option_limit,
                });
            }

            tracing::debug!(
                destination = %destination.display(),
                layers = lower.len(),
                "Resolved overlay mount"
            );

            realized
                .upper_dirs
                .insert(destination.to_path_buf(), dirs.upper.clone());
            realized.mounts.push(ResolvedMount {
                mount: Mount {
                    destination: destination.to_path_buf(),
                    mount_type: Some("overlay".to_string()),
                    source: Some("overlay".into()),
                    options,
                },
                layers: Some(OverlayLayers {
                    lower,
                    upper: dirs.upper,
                    work: dirs.work,
                }),
            });
        }

        Ok(realized)
    }
}
