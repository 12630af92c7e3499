use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{CopyError, write_local};
use crate::client::{LocalIo, LocalReader};
use crate::protocol::frame::{FrameSection, MAX_FRAME_LEN};
use crate::protocol::{FrameReader, FramingError, StreamType};
use crate::telemetry::{self, Flow, logging};
use crate::transport::{Connection, is_closed_connection};

const STDIN_CHUNK: usize = 4096;

/// Demultiplexes stdout/stderr frames from a non-TTY exec and, when local
/// input is enabled, forwards stdin alongside.
#[derive(Debug)]
pub struct MultiplexedCopier {
    max_frame_len: u32,
    live_forwarders: Arc<AtomicUsize>,
}

impl Default for MultiplexedCopier {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiplexedCopier {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: u32) -> Self {
        Self {
            max_frame_len,
            live_forwarders: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of stdin forwarding tasks that have not finished yet.
    pub fn live_forwarders(&self) -> usize {
        self.live_forwarders.load(Ordering::SeqCst)
    }

    pub async fn run<C: Connection>(
        &self,
        conn: C,
        io: LocalIo,
        forward_stdin: bool,
    ) -> Result<(), CopyError> {
        let LocalIo {
            stdin,
            mut stdout,
            mut stderr,
            ..
        } = io;
        let (remote_rx, remote_tx) = tokio::io::split(conn);

        let forwarder = if forward_stdin {
            Some(StdinForwarder::spawn(
                stdin,
                remote_tx,
                Arc::clone(&self.live_forwarders),
            ))
        } else {
            None
        };

        let mut frames = FrameReader::with_limit(remote_rx, self.max_frame_len);
        let outcome = demux(&mut frames, &mut stdout, &mut stderr).await;

        // Cancel strictly before joining so the forwarder can never outlive us.
        let stopped = match forwarder {
            Some(forwarder) => forwarder.stop().await,
            None => Ok(()),
        };

        outcome?;
        match stopped {
            Err(err) if !err.is_benign() => Err(err),
            _ => Ok(()),
        }
    }
}

async fn demux<R, O, E>(
    frames: &mut FrameReader<R>,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<(), CopyError>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    loop {
        let frame = match frames.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("multiplexed stream closed by remote");
                return Ok(());
            }
            Err(FramingError::Io {
                section: FrameSection::Header,
                got: 0,
                source,
            }) if is_closed_connection(&source) => {
                debug!(error = %source, "multiplexed stream connection closed");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match frame.stream {
            StreamType::Stdout => {
                write_local(stdout, &frame.payload, "stdout").await?;
                telemetry::record(Flow::RemoteToStdout, frame.payload.len());
            }
            StreamType::Stderr => {
                write_local(stderr, &frame.payload, "stderr").await?;
                telemetry::record(Flow::RemoteToStderr, frame.payload.len());
            }
            StreamType::Other(kind) => {
                warn!(
                    stream_type = kind,
                    len = frame.payload.len(),
                    "unknown stream type in multiplexed frame; discarding"
                );
                trace!(payload = %logging::escape_preview(&frame.payload, 64), "discarded frame");
            }
        }
    }
}

struct LiveTask(Arc<AtomicUsize>);

impl Drop for LiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct StdinForwarder {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), CopyError>>,
}

impl StdinForwarder {
    fn spawn<W>(stdin: LocalReader, remote_tx: W, live: Arc<AtomicUsize>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (cancel, cancelled) = oneshot::channel();
        live.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let _live = LiveTask(live);
            forward_stdin(stdin, remote_tx, cancelled).await
        });
        Self { cancel, handle }
    }

    async fn stop(self) -> Result<(), CopyError> {
        let _ = self.cancel.send(());
        self.handle.await?
    }
}

async fn forward_stdin<W>(
    mut stdin: LocalReader,
    mut remote_tx: W,
    mut cancelled: oneshot::Receiver<()>,
) -> Result<(), CopyError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        let n = tokio::select! {
            biased;
            _ = &mut cancelled => {
                debug!("stdin forwarding cancelled");
                return Ok(());
            }
            read = stdin.read(&mut buf) => read.map_err(CopyError::LocalRead)?,
        };

        if n == 0 {
            debug!("local stdin reached EOF; half-closing remote");
            return match remote_tx.shutdown().await {
                Ok(()) => Ok(()),
                Err(err) if is_closed_connection(&err) => Ok(()),
                Err(err) => Err(CopyError::RemoteWrite(err)),
            };
        }

        let written = tokio::select! {
            biased;
            _ = &mut cancelled => {
                debug!("stdin forwarding cancelled mid-write");
                return Ok(());
            }
            written = remote_tx.write_all(&buf[..n]) => written,
        };
        match written {
            Ok(()) => telemetry::record(Flow::StdinToRemote, n),
            Err(err) if is_closed_connection(&err) => {
                debug!(error = %err, "remote closed while forwarding stdin");
                return Ok(());
            }
            Err(err) => return Err(CopyError::RemoteWrite(err)),
        }
    }
}
