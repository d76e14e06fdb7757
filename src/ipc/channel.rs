//! Newline-delimited JSON transport over an inherited Unix socket pair.
//!
//! The parent creates the pair, clears `FD_CLOEXEC` on the child's end and
//! passes its number through an environment variable. The child adopts the fd
//! and immediately marks it close-on-exec again so its own children never
//! inherit it.

use anyhow::{Context, Result};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use serde::Serialize;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::protocol::{Decoded, decode};

/// Host → executor control channel fd.
pub const IPC_FD_ENV: &str = "KLY_IPC_FD";

/// Executor → script resource bridge fd.
pub const RESOURCE_FD_ENV: &str = "KLY_RESOURCE_FD";

/// Reads frames, one JSON object per line.
pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next raw non-empty line, `None` at end of stream.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        while let Some(line) = self.lines.next_line().await? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Next usable frame. Frames that fail validation are dropped here.
    pub async fn next_message(&mut self) -> io::Result<Option<Decoded>> {
        while let Some(line) = self.next_line().await? {
            match decode(&line) {
                Decoded::Invalid(reason) => {
                    debug!("Ignoring invalid IPC frame: {}", reason);
                }
                decoded => return Ok(Some(decoded)),
            }
        }
        Ok(None)
    }
}

/// Writes frames, flushing after each one.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await
    }
}

/// Serialize concurrent senders onto one writer.
///
/// The task ends once every sender is dropped, or at the first write error.
pub fn spawn_writer<W, T>(writer: W) -> (mpsc::UnboundedSender<T>, JoinHandle<io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();
    let handle = tokio::spawn(async move {
        let mut writer = MessageWriter::new(writer);
        while let Some(message) = rx.recv().await {
            writer.send(&message).await?;
        }
        Ok(())
    });
    (tx, handle)
}

/// Create a connected pair whose second end survives `exec`.
///
/// Returns the parent's async end and the child's raw end. Drop the child end
/// in the parent once the child has been spawned.
pub fn inheritable_pair() -> Result<(UnixStream, OwnedFd)> {
    let (parent, child) =
        std::os::unix::net::UnixStream::pair().context("Failed to create socket pair")?;

    let child: OwnedFd = child.into();
    fcntl(&child, FcntlArg::F_SETFD(FdFlag::empty()))
        .context("Failed to clear FD_CLOEXEC on child socket")?;

    parent.set_nonblocking(true)?;
    let parent = UnixStream::from_std(parent)?;
    Ok((parent, child))
}

/// Adopt a socket fd handed down by the parent process.
pub fn adopt_inherited_fd(fd: RawFd) -> Result<UnixStream> {
    if fd < 3 {
        anyhow::bail!("Refusing to adopt standard stream fd {} as IPC channel", fd);
    }

    // SAFETY: the parent passed this descriptor to us for exclusive use; nothing
    // else in this process refers to it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    fcntl(&owned, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .with_context(|| format!("fd {} is not an open descriptor", fd))?;

    let std_stream = std::os::unix::net::UnixStream::from(owned);
    std_stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(std_stream)?)
}

/// Read an fd number from the environment.
pub fn fd_from_env(var: &str) -> Result<RawFd> {
    let raw = std::env::var(var).with_context(|| format!("{} is not set", var))?;
    raw.trim()
        .parse::<RawFd>()
        .with_context(|| format!("{} is not a file descriptor: {:?}", var, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{CompleteMessage, IpcMessage, Request, ResourceCall};

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe_and_garbage_is_skipped() {
        let (mut a, b) = tokio::io::duplex(4096);
        a.write_all(b"\n{broken\nnot json at all\n").await.unwrap();

        let mut writer = MessageWriter::new(a);
        writer
            .send(&IpcMessage::Request(Request::new("1", ResourceCall::ListModels {})))
            .await
            .unwrap();
        drop(writer);

        let mut reader = MessageReader::new(b);
        let first = reader.next_message().await.unwrap().unwrap();
        assert!(matches!(first, Decoded::Message(IpcMessage::Request(ref r)) if r.id == "1"));
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writer_task_drains_then_stops_when_senders_drop() {
        let (a, b) = tokio::io::duplex(4096);
        let (tx, handle) = spawn_writer::<_, IpcMessage>(a);
        for _ in 0..3 {
            tx.send(IpcMessage::Complete(CompleteMessage {
                success: true,
                result: None,
                error: None,
            }))
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap().unwrap();

        let mut reader = MessageReader::new(b);
        let mut count = 0;
        while let Some(Decoded::Message(IpcMessage::Complete(_))) =
            reader.next_message().await.unwrap()
        {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn inheritable_pair_round_trip() {
        let (mut parent, child_fd) = inheritable_pair().unwrap();

        // The child end must survive exec.
        let flags = fcntl(&child_fd, FcntlArg::F_GETFD).unwrap();
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        let std_child = std::os::unix::net::UnixStream::from(child_fd);
        std_child.set_nonblocking(true).unwrap();
        let child = UnixStream::from_std(std_child).unwrap();

        parent.write_all(b"{\"kind\":\"complete\",\"success\":true}\n").await.unwrap();
        let mut reader = MessageReader::new(child);
        let got = reader.next_message().await.unwrap().unwrap();
        assert!(matches!(got, Decoded::Message(IpcMessage::Complete(c)) if c.success));
    }

    #[test]
    fn adopt_refuses_standard_streams() {
        assert!(adopt_inherited_fd(1).is_err());
    }
}
