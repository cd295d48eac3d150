//! Named pipes carrying console input and output.

use std::path::Path;

use rustix::fs::{CWD, FileType, Mode, mknodat};
use strata_common::{StrataError, StrataResult};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

/// Create a fifo readable and writable by the owner only.
///
/// # Errors
///
/// Returns an error if the node cannot be created.
pub fn create(path: &Path) -> StrataResult<()> {
    mknodat(CWD, path, FileType::Fifo, Mode::RUSR | Mode::WUSR, 0)
        .map_err(std::io::Error::from)?;
    tracing::trace!(path = %path.display(), "Created fifo");
    Ok(())
}

/// Open a fifo for reading without waiting for a writer.
///
/// The returned end also counts as a writer, so reads never see EOF.
///
/// # Errors
///
/// Returns an error if the fifo cannot be opened.
pub fn open_reader(path: &Path) -> StrataResult<pipe::Receiver> {
    Ok(pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)?)
}

/// Open a fifo for writing without waiting for a reader.
///
/// # Errors
///
/// Returns an error if the fifo cannot be opened.
pub fn open_writer(path: &Path) -> StrataResult<pipe::Sender> {
    Ok(pipe::OpenOptions::new()
        .read_write(true)
        .open_sender(path)?)
}

/// Copy `input` into the `stdin` fifo and the `stdout` fifo into `output`.
///
/// Returns once `stdout` reaches EOF. Input reaching EOF only stops the
/// input direction.
///
/// # Errors
///
/// Returns [`StrataError::Cancelled`] if `cancel` fires first, or the output
/// copy failure.
pub async fn attach<I, O>(
    stdin: &Path,
    stdout: &Path,
    cancel: &CancellationToken,
    mut input: I,
    mut output: O,
) -> StrataResult<()>
where
    I: AsyncRead + Unpin + Send,
    O: AsyncWrite + Unpin + Send,
{
    let mut sender = open_writer(stdin)?;
    let mut receiver = pipe::OpenOptions::new().open_receiver(stdout)?;

    let input_copy = async {
        match tokio::io::copy(&mut input, &mut sender).await {
            Ok(n) => tracing::trace!(bytes = n, "Attach input closed"),
            Err(e) => tracing::debug!(error = %e, "Attach input failed"),
        }
        std::future::pending::<()>().await;
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StrataError::Cancelled {
            operation: "attach".to_string(),
        }),
        copied = tokio::io::copy(&mut receiver, &mut output) => {
            let bytes = copied?;
            output.flush().await?;
            tracing::trace!(bytes, "Attach output reached EOF");
            Ok(())
        }
        () = input_copy => Ok(()),
    }
}
