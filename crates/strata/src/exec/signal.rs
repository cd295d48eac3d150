//! Signals used to stop processes.

#![allow(unsafe_code)]

use std::fmt;

/// A signal in the stop escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopSignal {
    /// SIGTERM.
    Terminate,
    /// SIGHUP.
    Hangup,
    /// SIGKILL.
    Kill,
}

impl StopSignal {
    /// Raw signal number.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Hangup => libc::SIGHUP,
            Self::Kill => libc::SIGKILL,
        }
    }

    /// Conventional name, as accepted by `kill(1)`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
            Self::Kill => "SIGKILL",
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Send `signal` to `pid`.
///
/// # Errors
///
/// Returns the OS error; `ESRCH` means the process is gone.
pub fn send(pid: u32, signal: StopSignal) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    tracing::trace!(pid, %signal, "Sending signal");

    if unsafe { libc::kill(pid, signal.as_raw()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Returns true if `err` means the target process no longer exists.
#[must_use]
pub fn is_gone(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}
