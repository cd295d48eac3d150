//! Unmount operations.

use std::path::Path;

use rustix::io::Errno;
use strata_common::StrataResult;

/// Unmount flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnmountFlags {
    /// Force unmount.
    pub force: bool,
    /// Lazy unmount (detach).
    pub detach: bool,
}

impl UnmountFlags {
    /// Detach now, clean up once the mount is no longer busy.
    #[must_use]
    pub const fn lazy() -> Self {
        Self {
            force: false,
            detach: true,
        }
    }
}

/// Returns true if `errno` means "nothing is mounted there".
///
/// Linux reports an unmounted target with `EINVAL`.
#[must_use]
pub fn is_not_mounted(errno: Errno) -> bool {
    errno == Errno::INVAL
}

/// Unmount a filesystem.
///
/// Succeeds if `target` is not a mountpoint.
///
/// # Errors
///
/// Returns any other unmount failure.
pub fn unmount(target: &Path, flags: UnmountFlags) -> StrataResult<()> {
    use rustix::mount::{UnmountFlags as RustixUnmountFlags, unmount};

    tracing::debug!(target = %target.display(), ?flags, "Unmounting filesystem");

    let mut rflags = RustixUnmountFlags::empty();
    if flags.force {
        rflags |= RustixUnmountFlags::FORCE;
    }
    if flags.detach {
        rflags |= RustixUnmountFlags::DETACH;
    }

    match unmount(target, rflags) {
        Ok(()) => Ok(()),
        Err(errno) if is_not_mounted(errno) => {
            tracing::trace!(target = %target.display(), "Nothing mounted, skipping unmount");
            Ok(())
        }
        Err(errno) => Err(std::io::Error::from(errno).into()),
    }
}
