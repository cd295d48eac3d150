//! Console pump.
//!
//! Moves bytes between the container's pty and the `io/in` / `io/out` fifos
//! so any number of attach sessions can come and go while the process keeps
//! its terminal.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use strata_common::StrataResult;
use strata_oci::runtime::ConsoleSize;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::console::ConsoleSocket;
use super::fifo;

const BUF_SIZE: usize = 8192;

/// Non-blocking pty master registered with the tokio reactor.
struct Pty {
    fd: AsyncFd<OwnedFd>,
}

impl Pty {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        rustix::io::ioctl_fionbio(&fd, true)?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| Ok(rustix::io::read(inner.get_ref(), &mut *buf)?)) {
                Ok(result) => return result,
                Err(_would_block) => {}
            }
        }
    }

    async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| Ok(rustix::io::write(inner.get_ref(), buf)?)) {
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }

    fn resize(&self, size: ConsoleSize) {
        let winsize = rustix::termios::Winsize {
            ws_row: u16::try_from(size.height).unwrap_or(u16::MAX),
            ws_col: u16::try_from(size.width).unwrap_or(u16::MAX),
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        match rustix::termios::tcsetwinsize(self.fd.get_ref().as_fd(), winsize) {
            Ok(()) => tracing::trace!(?size, "Resized console"),
            Err(e) => tracing::warn!(?size, error = %e, "Failed to resize console"),
        }
    }
}

/// Returns true if a pty read error means the slave side is gone.
fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

enum PumpState {
    AwaitingPty,
    Pumping(Pty),
    Closed,
}

/// The console multiplexer task of one container.
pub struct ConsolePump {
    socket: ConsoleSocket,
    stdin: pipe::Receiver,
    stdout: pipe::Sender,
    resize: mpsc::Receiver<ConsoleSize>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConsolePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolePump")
            .field("socket", &self.socket.path())
            .finish_non_exhaustive()
    }
}

impl ConsolePump {
    /// Set up a pump over an already bound console socket and existing fifos.
    ///
    /// # Errors
    ///
    /// Returns an error if a fifo cannot be opened.
    pub fn new(
        socket: ConsoleSocket,
        stdin: &Path,
        stdout: &Path,
        resize: mpsc::Receiver<ConsoleSize>,
        cancel: CancellationToken,
    ) -> StrataResult<Self> {
        Ok(Self {
            socket,
            stdin: fifo::open_reader(stdin)?,
            stdout: fifo::open_writer(stdout)?,
            resize,
            cancel,
        })
    }

    /// Run the pump on the current runtime.
    pub fn spawn(self) -> JoinHandle<StrataResult<()>> {
        tokio::spawn(self.run())
    }

    /// Drive the pump until the pty closes or it is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the pty cannot be received or fifo I/O fails.
    pub async fn run(mut self) -> StrataResult<()> {
        let mut state = PumpState::AwaitingPty;

        loop {
            state = match state {
                PumpState::AwaitingPty => {
                    tokio::select! {
                        () = self.cancel.cancelled() => PumpState::Closed,
                        fd = self.socket.recv_pty() => PumpState::Pumping(Pty::new(fd?)?),
                    }
                }
                PumpState::Pumping(pty) => {
                    self.pump(&pty).await?;
                    PumpState::Closed
                }
                PumpState::Closed => {
                    tracing::debug!(socket = %self.socket.path().display(), "Console pump closed");
                    return Ok(());
                }
            };
        }
    }

    async fn pump(&mut self, pty: &Pty) -> StrataResult<()> {
        let Self {
            stdin,
            stdout,
            resize,
            cancel,
            ..
        } = self;
        let closed = cancel.child_token();

        tokio::try_join!(
            forward_input(stdin, pty, &closed),
            forward_output(pty, stdout, &closed),
            apply_resizes(resize, pty, &closed),
        )?;
        Ok(())
    }
}

/// Copy `io/in` into the pty until `closed` fires.
async fn forward_input(
    stdin: &mut pipe::Receiver,
    pty: &Pty,
    closed: &CancellationToken,
) -> StrataResult<()> {
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = tokio::select! {
            () = closed.cancelled() => return Ok(()),
            read = stdin.read(&mut buf) => read?,
        };
        if n == 0 {
            // A read-write fifo never reports EOF; stay idle until closed.
            closed.cancelled().await;
            return Ok(());
        }
        tokio::select! {
            () = closed.cancelled() => return Ok(()),
            written = pty.write_all(&buf[..n]) => match written {
                Ok(()) => {}
                Err(e) if is_hangup(&e) || e.kind() == io::ErrorKind::BrokenPipe => {
                    closed.cancel();
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            },
        }
    }
}

/// Copy the pty into `io/out`; the pty closing ends the whole pump.
async fn forward_output(
    pty: &Pty,
    stdout: &mut pipe::Sender,
    closed: &CancellationToken,
) -> StrataResult<()> {
    let _closing = closed.clone().drop_guard();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let read = tokio::select! {
            () = closed.cancelled() => return Ok(()),
            read = pty.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if is_hangup(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        // Nobody may be draining the output fifo.
        tokio::select! {
            () = closed.cancelled() => return Ok(()),
            written = stdout.write_all(&buf[..n]) => written?,
        }
    }
}

async fn apply_resizes(
    resize: &mut mpsc::Receiver<ConsoleSize>,
    pty: &Pty,
    closed: &CancellationToken,
) -> StrataResult<()> {
    loop {
        tokio::select! {
            () = closed.cancelled() => return Ok(()),
            size = resize.recv() => match size {
                Some(size) => pty.resize(size),
                None => {
                    closed.cancelled().await;
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::exec::console::send_pty_master;

    struct Fixture {
        _tmp: tempfile::TempDir,
        socket_path: std::path::PathBuf,
        stdin: std::path::PathBuf,
        stdout: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let stdin = tmp.path().join("in");
        let stdout = tmp.path().join("out");
        fifo::create(&stdin).unwrap();
        fifo::create(&stdout).unwrap();
        Fixture {
            socket_path: tmp.path().join("console.sock"),
            stdin,
            stdout,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn cancelled_while_awaiting_pty() {
        let fx = fixture();
        let socket = ConsoleSocket::bind(&fx.socket_path).unwrap();
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let pump = ConsolePump::new(socket, &fx.stdin, &fx.stdout, rx, cancel.clone()).unwrap();
        let handle = pump.spawn();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn pumps_both_directions_until_hangup() {
        let fx = fixture();
        let socket = ConsoleSocket::bind(&fx.socket_path).unwrap();
        let (resize_tx, rx) = mpsc::channel(1);
        let pump = ConsolePump::new(
            socket,
            &fx.stdin,
            &fx.stdout,
            rx,
            CancellationToken::new(),
        )
        .unwrap();
        let handle = pump.spawn();

        let mut out = pipe::OpenOptions::new().open_receiver(&fx.stdout).unwrap();
        let mut input = fifo::open_writer(&fx.stdin).unwrap();

        let (mut terminal, master) = StdUnixStream::pair().unwrap();
        let conn = StdUnixStream::connect(&fx.socket_path).unwrap();
        send_pty_master(&conn, master.as_fd()).unwrap();
        drop(master);

        // A socket is not a tty; resizing is logged and ignored.
        resize_tx.send(ConsoleSize { height: 40, width: 120 }).await.unwrap();

        input.write_all(b"echo hi\n").await.unwrap();
        let echoed = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8];
            terminal.read_exact(&mut buf).unwrap();
            terminal.write_all(b"hi\r\n").unwrap();
            (buf, terminal)
        })
        .await
        .unwrap();
        assert_eq!(&echoed.0, b"echo hi\n");

        let mut buf = [0u8; 4];
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi\r\n");

        drop(echoed.1);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // The pump released its end of the output fifo.
        let mut rest = Vec::new();
        out.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn output_keeps_flowing_while_input_is_backed_up() {
        const OUTPUT: usize = 4 << 20;
        const INPUT: usize = 1 << 20;

        let fx = fixture();
        let socket = ConsoleSocket::bind(&fx.socket_path).unwrap();
        let (resize_tx, rx) = mpsc::channel(1);
        let pump = ConsolePump::new(
            socket,
            &fx.stdin,
            &fx.stdout,
            rx,
            CancellationToken::new(),
        )
        .unwrap();
        let handle = pump.spawn();

        let (mut terminal, master) = StdUnixStream::pair().unwrap();
        let conn = StdUnixStream::connect(&fx.socket_path).unwrap();
        send_pty_master(&conn, master.as_fd()).unwrap();
        drop(master);

        // The program floods its terminal before reading any type-ahead.
        let program = tokio::task::spawn_blocking(move || {
            let output: Vec<u8> = (0..OUTPUT).map(|i| (i % 251) as u8).collect();
            terminal.write_all(&output).unwrap();
            let mut typed = vec![0u8; INPUT];
            terminal.read_exact(&mut typed).unwrap();
            typed
        });

        let mut input = fifo::open_writer(&fx.stdin).unwrap();
        let typist = tokio::spawn(async move {
            let typed: Vec<u8> = (0..INPUT).map(|i| (i % 13) as u8).collect();
            input.write_all(&typed).await.unwrap();
            input
        });

        // Nothing drains the output yet; resizes must still go through.
        tokio::time::timeout(Duration::from_secs(10), async {
            for row in 0..16 {
                resize_tx
                    .send(ConsoleSize { height: 24 + row, width: 80 })
                    .await
                    .unwrap();
            }
        })
        .await
        .unwrap();

        let mut out = pipe::OpenOptions::new().open_receiver(&fx.stdout).unwrap();
        let drained = tokio::time::timeout(Duration::from_secs(30), async {
            let mut buf = vec![0u8; OUTPUT];
            out.read_exact(&mut buf).await.unwrap();
            buf
        })
        .await
        .unwrap();
        assert!(drained.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));

        let typed = tokio::time::timeout(Duration::from_secs(30), program)
            .await
            .unwrap()
            .unwrap();
        assert!(typed.iter().enumerate().all(|(i, b)| *b == (i % 13) as u8));
        drop(typist.await.unwrap());

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
