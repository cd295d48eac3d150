//! `fuse-overlayfs` realization for hosts without unprivileged overlayfs.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use strata_common::{StrataError, StrataResult};
use strata_oci::Mount;

use super::{LayerDirs, MountBackend, OverlayLayers, RealizedMounts, ResolvedMount};
use crate::exec::signal::{self, StopSignal};
use crate::mount::{self, MountTree, NodeContent, UnmountFlags, mountinfo};
use crate::runtime::ContainerState;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Unprivileged unmount helpers, fuse3 first.
const FUSERMOUNT_COMMANDS: &[&str] = &["fusermount3", "fusermount"];

/// Mounts every layered destination with a `fuse-overlayfs` helper and
/// bind-mounts the result into the container.
#[derive(Debug, Clone)]
pub struct FuseBackend {
    binary: PathBuf,
    mount_timeout: Duration,
    stop_timeout: Duration,
}

impl FuseBackend {
    /// Create a backend driving the helper at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            mount_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
        }
    }

    /// How long a helper may take to mount.
    #[must_use]
    pub const fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    /// How long a helper may take to exit after SIGTERM.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Foreground helper invocation for one destination.
    fn command(&self, layers: &OverlayLayers, mountpoint: &Path) -> Command {
        let lower = layers
            .lower
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        let mut command = Command::new(&self.binary);
        command
            .arg("-f")
            .arg("-o")
            .arg(format!(
                "lowerdir={lower},upperdir={},workdir={}",
                layers.upper.display(),
                layers.work.display()
            ))
            .arg(mountpoint)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        command
    }
}

impl MountBackend for FuseBackend {
    fn name(&self) -> &'static str {
        "fuse"
    }

    fn realize(&self, tree: &MountTree, state: &ContainerState) -> StrataResult<RealizedMounts> {
        let mut realized = RealizedMounts::default();

        for node in tree.iter() {
            let destination = node.destination();
            if let NodeContent::Raw(mount) = node.content() {
                realized.mounts.push(ResolvedMount::raw(mount.clone()));
                continue;
            }

            let dirs = LayerDirs::create(state, node, &mut realized.cleanup)?;
            let mount_dir = state.mount_dir(destination);
            std::fs::create_dir_all(&mount_dir)?;
            let mount_dir = std::fs::canonicalize(&mount_dir)?;

            let layers = OverlayLayers {
                lower: dirs.lower(node),
                upper: dirs.upper,
                work: dirs.work,
            };

            let before = mountinfo::mount_id_at(&mount_dir)?;
            let mut child = self
                .command(&layers, &mount_dir)
                .spawn()
                .map_err(|e| StrataError::Helper {
                    message: format!("failed to spawn {}: {e}", self.binary.display()),
                })?;

            tracing::debug!(
                destination = %destination.display(),
                pid = child.id(),
                "Started fuse-overlayfs"
            );

            if let Err(e) = wait_for_mount(&mut child, &mount_dir, before, self.mount_timeout) {
                if let Err(stop) = stop_helper(child, &mount_dir, self.stop_timeout) {
                    tracing::warn!(error = %stop, "Failed to stop fuse-overlayfs");
                }
                return Err(e);
            }

            let stop_timeout = self.stop_timeout;
            let helper_dir = mount_dir.clone();
            realized.cleanup.push(
                format!("stop fuse-overlayfs at {}", mount_dir.display()),
                move || stop_helper(child, &helper_dir, stop_timeout),
            );

            realized
                .upper_dirs
                .insert(destination.to_path_buf(), layers.upper.clone());
            realized.mounts.push(ResolvedMount {
                mount: Mount::bind(&mount_dir, destination),
                layers: Some(layers),
            });
        }

        Ok(realized)
    }
}

/// Poll mountinfo until the mount at `mount_dir` changes from `before`.
fn wait_for_mount(
    child: &mut Child,
    mount_dir: &Path,
    before: Option<u64>,
    timeout: Duration,
) -> StrataResult<()> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(StrataError::Helper {
                message: format!(
                    "fuse-overlayfs exited before mounting {}: {status}",
                    mount_dir.display()
                ),
            });
        }

        let current = mountinfo::mount_id_at(mount_dir)?;
        if current.is_some() && current != before {
            tracing::trace!(mount_dir = %mount_dir.display(), "fuse-overlayfs mounted");
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(StrataError::Timeout {
                operation: format!("fuse-overlayfs to mount {}", mount_dir.display()),
                timeout,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM the helper and give it `timeout` to exit; if it does not, detach
/// its mount and SIGKILL it.
fn stop_helper(mut child: Child, mount_dir: &Path, timeout: Duration) -> StrataResult<()> {
    let mut errors: Vec<StrataError> = Vec::new();

    match signal::send(child.id(), StopSignal::Terminate) {
        Err(e) if !signal::is_gone(&e) => errors.push(e.into()),
        _ => {}
    }

    let deadline = Instant::now() + timeout;
    let exited = loop {
        match child.try_wait() {
            Ok(Some(_)) => break true,
            Ok(None) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
            Ok(None) => break false,
            Err(e) => {
                errors.push(e.into());
                break false;
            }
        }
    };

    if !exited {
        tracing::debug!(pid = child.id(), "fuse-overlayfs ignored SIGTERM, killing");
        if let Err(e) = detach(mount_dir) {
            errors.push(e);
        }
        if let Err(e) = child.kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                errors.push(e.into());
            }
        }
        if let Err(e) = child.wait() {
            errors.push(e.into());
        }
    }

    StrataError::collect(errors)
}

/// Lazily unmount `mount_dir`, falling back to the setuid FUSE helpers when
/// we lack the privilege to unmount ourselves.
fn detach(mount_dir: &Path) -> StrataResult<()> {
    let err = match mount::unmount(mount_dir, UnmountFlags::lazy()) {
        Ok(()) => return Ok(()),
        Err(StrataError::Io(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            StrataError::Io(e)
        }
        Err(e) => return Err(e),
    };

    for command in FUSERMOUNT_COMMANDS {
        let status = Command::new(command)
            .args(["-u", "-z"])
            .arg(mount_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if status.is_ok_and(|s| s.success()) {
            return Ok(());
        }
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use strata_common::ContainerId;

    use super::*;
    use crate::mount::MountSpec;

    fn layers() -> OverlayLayers {
        OverlayLayers {
            lower: vec![
                PathBuf::from("/c/overlay/2f/private"),
                PathBuf::from("/store/a"),
                PathBuf::from("/store/b"),
            ],
            upper: PathBuf::from("/c/overlay/2f/upper"),
            work: PathBuf::from("/c/overlay/2f/work"),
        }
    }

    #[test]
    fn helper_arguments() {
        let backend = FuseBackend::new("/usr/bin/fuse-overlayfs");
        let command = backend.command(&layers(), Path::new("/c/overlay/2f/mount"));

        assert_eq!(command.get_program(), OsStr::new("/usr/bin/fuse-overlayfs"));
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(
            args,
            vec![
                OsStr::new("-f"),
                OsStr::new("-o"),
                OsStr::new(
                    "lowerdir=/store/b:/store/a:/c/overlay/2f/private,\
                     upperdir=/c/overlay/2f/upper,workdir=/c/overlay/2f/work"
                ),
                OsStr::new("/c/overlay/2f/mount"),
            ]
        );
    }

    #[test]
    fn mount_wait_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();

        let start = Instant::now();
        let err = wait_for_mount(&mut child, tmp.path(), None, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, StrataError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));

        stop_helper(child, tmp.path(), Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn early_helper_exit_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut child = Command::new("false").spawn().unwrap();

        let err = wait_for_mount(&mut child, tmp.path(), None, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, StrataError::Helper { .. }));
    }

    #[test]
    fn stubborn_helper_is_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        let result = stop_helper(child, tmp.path(), Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(4));
        // Detaching a path that was never mounted may be refused without
        // CAP_SYS_ADMIN; the helper is killed either way.
        if let Err(e) = result {
            assert!(matches!(e, StrataError::Io(_)), "unexpected error: {e}");
        }
    }

    #[test]
    fn missing_binary_fails_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let state = ContainerState::new(tmp.path().join("containers"), ContainerId::new("f").unwrap());
        let tree = MountTree::build([MountSpec::layer(0, tmp.path(), "/")]).unwrap();

        let err = FuseBackend::new(tmp.path().join("no-such-helper"))
            .realize(&tree, &state)
            .unwrap_err();
        assert!(matches!(err, StrataError::Helper { .. }));
        assert!(!state.work_dir(Path::new("/")).exists());
        assert!(state.upper_dir(Path::new("/")).is_dir());
    }

    #[test]
    fn helper_that_never_mounts_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = tmp.path().join("fake-fuse-overlayfs");
        fs::write(&helper, "#!/bin/sh\nexec sleep 5\n").unwrap();
        fs::set_permissions(&helper, fs::Permissions::from_mode(0o755)).unwrap();

        let state = ContainerState::new(tmp.path().join("containers"), ContainerId::new("f").unwrap());
        let tree = MountTree::new();

        let err = FuseBackend::new(&helper)
            .with_mount_timeout(Duration::from_millis(50))
            .with_stop_timeout(Duration::from_millis(500))
            .realize(&tree, &state)
            .unwrap_err();
        assert!(matches!(err, StrataError::Timeout { .. }));
    }
}
