use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod upgrade;

pub use upgrade::{API_KEY_HEADER, UpgradeError, open_exec_stream, remote_error_message};

/// Full-duplex byte stream to a remote exec, however it was obtained.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedConnection = Box<dyn Connection>;

/// Errors that only mean the other side already went away. These end a
/// session quietly instead of failing it.
pub fn is_closed_connection(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => true,
        _ => err
            .to_string()
            .contains("use of closed network connection"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_closed_connection_kinds() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected,
        ] {
            assert!(is_closed_connection(&io::Error::from(kind)), "{kind:?}");
        }
        assert!(is_closed_connection(&io::Error::other(
            "read tcp: use of closed network connection"
        )));
    }

    #[test]
    fn other_errors_are_not_benign() {
        assert!(!is_closed_connection(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_closed_connection(&io::Error::other("disk on fire")));
    }
}
