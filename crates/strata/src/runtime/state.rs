//! On-disk layout of a container.
//!
//! ```text
//! <root>/<id>/
//! ├── config.json          OCI bundle config
//! ├── init.pid
//! ├── rootfs/              numeric lowerdir symlinks
//! ├── io/{in,out,console.sock}
//! ├── inner/
//! └── overlay/<hex(mountpoint)>/{upper,work,private,mount}
//! ```

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use strata_common::{ContainerId, StrataPaths};

/// Path calculator for one container.
///
/// Pure: computing a path never touches the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    root: PathBuf,
    id: ContainerId,
}

impl ContainerState {
    /// Layout for `id` under `root`.
    pub fn new(root: impl Into<PathBuf>, id: ContainerId) -> Self {
        Self {
            root: root.into(),
            id,
        }
    }

    /// Layout for `id` under the containers directory of `paths`.
    #[must_use]
    pub fn from_paths(paths: &StrataPaths, id: ContainerId) -> Self {
        Self::new(paths.containers(), id)
    }

    /// Container ID.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Directory holding every container.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// This container's directory, also used as the OCI bundle.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.root.join(self.id.as_str())
    }

    /// OCI bundle directory.
    #[must_use]
    pub fn bundle(&self) -> PathBuf {
        self.dir()
    }

    /// File the runtime writes the init pid to.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.dir().join("init.pid")
    }

    /// Root filesystem mountpoint; also holds the lowerdir symlinks.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.dir().join("rootfs")
    }

    /// Numbered lowerdir symlink.
    #[must_use]
    pub fn lower_link(&self, n: usize) -> PathBuf {
        self.rootfs().join(n.to_string())
    }

    /// Directory for fifos and the console socket.
    #[must_use]
    pub fn io_dir(&self) -> PathBuf {
        self.dir().join("io")
    }

    /// Fifo feeding the console input.
    #[must_use]
    pub fn stdin_fifo(&self) -> PathBuf {
        self.io_dir().join("in")
    }

    /// Fifo carrying the console output.
    #[must_use]
    pub fn stdout_fifo(&self) -> PathBuf {
        self.io_dir().join("out")
    }

    /// Socket the runtime sends the pty master over.
    #[must_use]
    pub fn console_socket(&self) -> PathBuf {
        self.io_dir().join("console.sock")
    }

    /// Scratch directory shared with the container.
    #[must_use]
    pub fn inner(&self) -> PathBuf {
        self.dir().join("inner")
    }

    /// Parent of every per-mountpoint overlay directory.
    #[must_use]
    pub fn overlay_root(&self) -> PathBuf {
        self.dir().join("overlay")
    }

    /// Overlay directory for one mountpoint, keyed by its hex encoding.
    #[must_use]
    pub fn overlay_dir(&self, mountpoint: &Path) -> PathBuf {
        self.overlay_root()
            .join(hex::encode(mountpoint.as_os_str().as_bytes()))
    }

    /// Writable layer of a mountpoint.
    #[must_use]
    pub fn upper_dir(&self, mountpoint: &Path) -> PathBuf {
        self.overlay_dir(mountpoint).join("upper")
    }

    /// Overlay work directory of a mountpoint.
    #[must_use]
    pub fn work_dir(&self, mountpoint: &Path) -> PathBuf {
        self.overlay_dir(mountpoint).join("work")
    }

    /// Masking layer of a mountpoint.
    #[must_use]
    pub fn private_dir(&self, mountpoint: &Path) -> PathBuf {
        self.overlay_dir(mountpoint).join("private")
    }

    /// Where the FUSE helper mounts a mountpoint.
    #[must_use]
    pub fn mount_dir(&self, mountpoint: &Path) -> PathBuf {
        self.overlay_dir(mountpoint).join("mount")
    }
}
