//! Console socket.
//!
//! The OCI runtime connects to this socket and hands over the master end of
//! the container's pty as an `SCM_RIGHTS` message.

#![allow(unsafe_code)]

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};
use tokio::io::Interest;
use tokio::net::UnixListener;

/// Listening console socket.
#[derive(Debug)]
pub struct ConsoleSocket {
    path: PathBuf,
    listener: UnixListener,
}

impl ConsoleSocket {
    /// Bind a console socket at `path`, replacing a stale one.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn bind(path: &Path) -> StrataResult<Self> {
        crate::cleanup::remove_file(path)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path).map_err(|e| StrataError::Internal {
            message: format!("Failed to bind console socket {}: {e}", path.display()),
        })?;

        tracing::debug!(path = %path.display(), "Console socket created");

        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    /// Get the socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one connection and receive the pty master from it.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails or the peer sends no descriptor.
    pub async fn recv_pty(&self) -> StrataResult<OwnedFd> {
        let (stream, _) = self.listener.accept().await?;
        tracing::debug!(path = %self.path.display(), "Console client connected");

        loop {
            stream.readable().await?;
            match stream.try_io(Interest::READABLE, || recv_fd(stream.as_raw_fd())) {
                Ok(fd) => {
                    tracing::debug!(fd = fd.as_raw_fd(), "Received PTY master FD");
                    return Ok(fd);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Send a pty master over a connected console socket.
///
/// # Errors
///
/// Returns an error if `sendmsg` fails.
pub fn send_pty_master(stream: &StdUnixStream, fd: BorrowedFd<'_>) -> StrataResult<()> {
    send_fd(stream.as_fd().as_raw_fd(), &[0u8], fd.as_raw_fd())?;
    tracing::debug!(fd = fd.as_raw_fd(), "Sent PTY master FD");
    Ok(())
}

/// Space for one control message carrying a single descriptor.
const CMSG_BUF_WORDS: usize = 8;

/// Receive one file descriptor over a Unix socket.
fn recv_fd(sock_fd: RawFd) -> std::io::Result<OwnedFd> {
    use std::mem;
    use std::ptr;

    let mut buf = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u64; CMSG_BUF_WORDS];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = mem::size_of_val(&cmsg_buf);

    let n = unsafe { libc::recvmsg(sock_fd, &raw mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&raw const msg) };
    if !cmsg.is_null() {
        let cmsg_ref = unsafe { &*cmsg };
        if cmsg_ref.cmsg_level == libc::SOL_SOCKET && cmsg_ref.cmsg_type == libc::SCM_RIGHTS {
            let fd = unsafe { ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>()) };
            if fd >= 0 {
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    Err(if n == 0 {
        std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "console socket closed without sending a PTY",
        )
    } else {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "no PTY master received")
    })
}

/// Send one file descriptor over a Unix socket.
fn send_fd(sock_fd: RawFd, buf: &[u8], fd: RawFd) -> std::io::Result<()> {
    use std::mem;
    use std::ptr;

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr().cast_mut().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u64; CMSG_BUF_WORDS];
    let fd_len = u32::try_from(mem::size_of::<RawFd>()).unwrap_or(4);

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(fd_len) } as usize;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&raw const msg) };
    if cmsg.is_null() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "control buffer too small",
        ));
    }
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len) as usize;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
    }

    let n = unsafe { libc::sendmsg(sock_fd, &raw const msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
