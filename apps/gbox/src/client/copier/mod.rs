//! Byte pumps between the local terminal and a hijacked exec connection.
//!
//! TTY sessions use [`raw::run_raw`]: one unframed stream in each
//! direction. Everything else uses [`multiplexed::MultiplexedCopier`], which
//! splits stdout and stderr out of length-prefixed frames.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::FramingError;
use crate::protocol::frame::FrameSection;
use crate::telemetry::{self, Flow};
use crate::transport::is_closed_connection;

pub mod multiplexed;
pub mod raw;

pub use multiplexed::MultiplexedCopier;
pub use raw::run_raw;

const COPY_CHUNK: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("failed to read from remote: {0}")]
    RemoteRead(#[source] io::Error),
    #[error("failed to write to remote: {0}")]
    RemoteWrite(#[source] io::Error),
    #[error("failed to read local input: {0}")]
    LocalRead(#[source] io::Error),
    #[error("failed to write {stream}: {source}")]
    LocalWrite {
        stream: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("copy task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CopyError {
    /// True when the error only says the remote end has already gone.
    pub fn is_benign(&self) -> bool {
        match self {
            CopyError::RemoteRead(err) | CopyError::RemoteWrite(err) => is_closed_connection(err),
            CopyError::Framing(FramingError::Io {
                section: FrameSection::Header,
                got: 0,
                source,
            }) => is_closed_connection(source),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    RemoteToStdout,
    StdinToRemote,
}

impl Direction {
    fn flow(self) -> Flow {
        match self {
            Direction::RemoteToStdout => Flow::RemoteToStdout,
            Direction::StdinToRemote => Flow::StdinToRemote,
        }
    }

    fn read_error(self, err: io::Error) -> CopyError {
        match self {
            Direction::RemoteToStdout => CopyError::RemoteRead(err),
            Direction::StdinToRemote => CopyError::LocalRead(err),
        }
    }

    fn write_error(self, err: io::Error) -> CopyError {
        match self {
            Direction::RemoteToStdout => CopyError::LocalWrite {
                stream: "stdout",
                source: err,
            },
            Direction::StdinToRemote => CopyError::RemoteWrite(err),
        }
    }
}

/// Copies until `reader` reports EOF, flushing after every chunk so
/// interactive output shows up immediately.
pub(crate) async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|err| direction.read_error(err))?;
        if n == 0 {
            return Ok(total);
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|err| direction.write_error(err))?;
        writer
            .flush()
            .await
            .map_err(|err| direction.write_error(err))?;
        telemetry::record(direction.flow(), n);
        total += n as u64;
    }
}

pub(crate) async fn write_local<W>(
    writer: &mut W,
    bytes: &[u8],
    stream: &'static str,
) -> Result<(), CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer
        .write_all(bytes)
        .await
        .map_err(|source| CopyError::LocalWrite { stream, source })?;
    writer
        .flush()
        .await
        .map_err(|source| CopyError::LocalWrite { stream, source })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// In-memory sink that can be inspected after the session consumed it.
    #[derive(Clone, Default)]
    pub struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        pub fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl AsyncWrite for Capture {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Reader that fails every read with the given error kind.
    pub struct FailingReader(pub io::ErrorKind);

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(self.0)))
        }
    }

    /// Connection that hands out `data` once, then fails every read with
    /// `kind`. Writes vanish.
    pub struct ResetAfter {
        data: Option<Vec<u8>>,
        kind: io::ErrorKind,
    }

    impl ResetAfter {
        pub fn new(data: &[u8], kind: io::ErrorKind) -> Self {
            Self {
                data: Some(data.to_vec()),
                kind,
            }
        }
    }

    impl AsyncRead for ResetAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(mut data) => {
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    let rest = data.split_off(n);
                    if !rest.is_empty() {
                        self.data = Some(rest);
                    }
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::from(self.kind))),
            }
        }
    }

    impl AsyncWrite for ResetAfter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Connection whose reads fail and whose writes vanish.
    pub struct BrokenConnection(pub io::ErrorKind);

    impl AsyncRead for BrokenConnection {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(self.0)))
        }
    }

    impl AsyncWrite for BrokenConnection {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Capture, FailingReader};
    use super::*;

    #[tokio::test]
    async fn pump_copies_until_eof() {
        let mut out = Capture::default();
        let mut input: &[u8] = b"abc def";
        let copied = pump(&mut input, &mut out, Direction::RemoteToStdout)
            .await
            .unwrap();
        assert_eq!(copied, 7);
        assert_eq!(out.contents(), b"abc def");
    }

    #[tokio::test]
    async fn pump_attributes_read_errors_to_their_side() {
        let mut out = Capture::default();
        let mut remote = FailingReader(io::ErrorKind::ConnectionReset);
        let err = pump(&mut remote, &mut out, Direction::RemoteToStdout)
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::RemoteRead(_)));
        assert!(err.is_benign());

        let mut local = FailingReader(io::ErrorKind::InvalidData);
        let err = pump(&mut local, &mut out, Direction::StdinToRemote)
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::LocalRead(_)));
        assert!(!err.is_benign());
    }
}
