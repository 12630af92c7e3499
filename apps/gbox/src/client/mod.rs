use std::io::IsTerminal;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod copier;
pub mod websocket;

pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The local end of an exec session.
pub struct LocalIo {
    pub stdin: LocalReader,
    pub stdout: LocalWriter,
    pub stderr: LocalWriter,
    /// Whether stdin is an interactive terminal rather than a pipe or file.
    pub stdin_is_terminal: bool,
}

impl LocalIo {
    /// Wires the session to this process's standard streams.
    pub fn process() -> Self {
        Self {
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            stdin_is_terminal: std::io::stdin().is_terminal(),
        }
    }

    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
        stdin_is_terminal: bool,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            stdin_is_terminal,
        }
    }
}
