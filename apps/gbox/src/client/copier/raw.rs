use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{CopyError, Direction, pump};
use crate::client::LocalIo;
use crate::transport::{Connection, is_closed_connection};

#[derive(Debug, Clone, Copy)]
enum Side {
    RemoteOutput,
    LocalInput,
}

/// Runs a TTY session over an unframed stream. Whichever direction finishes
/// first ends the session; the other task is aborted and joined.
pub async fn run_raw<C: Connection>(conn: C, io: LocalIo) -> Result<(), CopyError> {
    let LocalIo {
        mut stdin,
        mut stdout,
        ..
    } = io;
    let (mut remote_rx, mut remote_tx) = tokio::io::split(conn);

    let mut output = tokio::spawn(async move {
        pump(&mut remote_rx, &mut stdout, Direction::RemoteToStdout).await
    });
    let mut input = tokio::spawn(async move {
        let copied = pump(&mut stdin, &mut remote_tx, Direction::StdinToRemote).await?;
        match remote_tx.shutdown().await {
            Ok(()) => Ok(copied),
            Err(err) if is_closed_connection(&err) => Ok(copied),
            Err(err) => Err(CopyError::RemoteWrite(err)),
        }
    });

    let (side, result) = tokio::select! {
        result = &mut output => (Side::RemoteOutput, result),
        result = &mut input => (Side::LocalInput, result),
    };
    let loser = match side {
        Side::RemoteOutput => input,
        Side::LocalInput => output,
    };
    loser.abort();
    let _ = loser.await;

    match result? {
        Ok(bytes) => {
            debug!(?side, bytes, "raw stream finished");
            Ok(())
        }
        Err(err) if err.is_benign() => {
            debug!(?side, error = %err, "raw stream closed by remote");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
