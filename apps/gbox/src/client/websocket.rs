use std::io;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, trace};
use url::Url;

use super::{LocalIo, LocalReader, LocalWriter};
use crate::protocol::{ControlEvent, InitFrame};
use crate::session::terminal::{TerminalController, TerminalError};
use crate::telemetry::{self, Flow};
use crate::transport::{API_KEY_HEADER, is_closed_connection, remote_error_message};

const STDIN_CHUNK: usize = 4096;

pub type ExecSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Initialized,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect websocket: {0}")]
    Connect(#[source] WsError),
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
    #[error("api key is not a valid header value")]
    InvalidApiKey,
    #[error("failed to encode init frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    Protocol(#[source] WsError),
    #[error("{0}")]
    Remote(String),
    #[error("websocket closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },
    #[error("failed to write {stream}: {source}")]
    LocalWrite {
        stream: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to read local input: {0}")]
    LocalRead(#[source] io::Error),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("websocket task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What the channel announces in its init frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub command: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    pub working_dir: Option<String>,
}

impl ChannelOptions {
    fn forwards_input(&self) -> bool {
        self.interactive || self.tty
    }
}

/// Opens the exec socket, attaching the API key when there is one.
pub async fn dial(url: &Url, api_key: Option<&str>) -> Result<ExecSocket, ChannelError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(ChannelError::Connect)?;
    if let Some(key) = api_key {
        let value = HeaderValue::from_str(key).map_err(|_| ChannelError::InvalidApiKey)?;
        request.headers_mut().insert(API_KEY_HEADER, value);
    }
    debug!(%url, authenticated = api_key.is_some(), "dialing exec websocket");
    let (socket, response) = connect_async(request).await.map_err(handshake_error)?;
    debug!(status = response.status().as_u16(), "exec websocket connected");
    Ok(socket)
}

/// A handshake answered with a plain HTTP status carries the API's error
/// body, same as the upgrade path.
fn handshake_error(err: WsError) -> ChannelError {
    match err {
        WsError::Http(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            debug!(status = status.as_u16(), body = %body, "exec websocket rejected");
            ChannelError::Rejected {
                status,
                message: remote_error_message(status, &body),
            }
        }
        other => ChannelError::Connect(other),
    }
}

/// Close codes that mean the session simply ended.
pub fn is_benign_close(code: CloseCode) -> bool {
    matches!(
        code,
        CloseCode::Normal | CloseCode::Away | CloseCode::Status | CloseCode::Abnormal
    )
}

#[derive(Debug, Clone, Copy)]
enum Loop {
    Inbound,
    Outbound,
}

/// Drives one exec over an established WebSocket.
pub struct ControlChannel<S> {
    socket: Option<S>,
    options: ChannelOptions,
    terminal: Option<TerminalController>,
    state: ChannelState,
}

impl<S> ControlChannel<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin + 'static,
{
    pub fn new(socket: S, options: ChannelOptions) -> Self {
        Self {
            socket: Some(socket),
            options,
            terminal: None,
            state: ChannelState::Connecting,
        }
    }

    /// Terminal to switch into raw mode while streaming a TTY session.
    pub fn with_terminal(mut self, terminal: TerminalController) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn transition(&mut self, next: ChannelState) {
        trace!(from = ?self.state, to = ?next, "exec channel state");
        self.state = next;
    }

    /// Streams the session to completion. The channel ends in `Closed`
    /// whatever the outcome; a second call fails.
    pub async fn run(&mut self, io: LocalIo) -> Result<(), ChannelError> {
        let Some(socket) = self.socket.take() else {
            return Err(ChannelError::Protocol(WsError::AlreadyClosed));
        };
        let result = self.drive(socket, io).await;
        self.transition(ChannelState::Closed);
        result
    }

    async fn drive(&mut self, mut socket: S, io: LocalIo) -> Result<(), ChannelError> {
        let init = InitFrame::new(
            self.options.command.clone(),
            self.options.interactive,
            self.options.working_dir.as_deref(),
        );
        let payload = serde_json::to_string(&init)?;
        socket
            .send(Message::Text(payload))
            .await
            .map_err(ChannelError::Protocol)?;
        self.transition(ChannelState::Initialized);

        let raw_guard = match (&self.terminal, self.options.tty && io.stdin_is_terminal) {
            (Some(terminal), true) => Some(terminal.enter_raw()?),
            _ => None,
        };
        self.transition(ChannelState::Streaming);

        let forwards_input = self.options.forwards_input();
        let LocalIo {
            stdin,
            stdout,
            stderr,
            ..
        } = io;
        let (sink, stream) = socket.split();

        let mut inbound = tokio::spawn(pump_inbound(stream, stdout, stderr));
        let mut outbound = forwards_input.then(|| tokio::spawn(pump_outbound(stdin, sink)));

        let (finished, result) = match outbound.as_mut() {
            Some(out) => tokio::select! {
                result = &mut inbound => (Loop::Inbound, result),
                result = out => (Loop::Outbound, result),
            },
            None => (Loop::Inbound, (&mut inbound).await),
        };

        // A clean local EOF only half-closes; the remote still decides how
        // the session ends.
        let local_eof = matches!((finished, &result), (Loop::Outbound, Ok(Ok(()))));
        let (finished, result) = if local_eof {
            outbound = None;
            debug!("local input finished; waiting for remote to close");
            (Loop::Inbound, (&mut inbound).await)
        } else {
            (finished, result)
        };
        self.transition(ChannelState::Closing);

        // First result wins; the other loop is cancelled and joined.
        match finished {
            Loop::Inbound => {
                if let Some(out) = outbound.take() {
                    out.abort();
                    let _ = out.await;
                }
            }
            Loop::Outbound => {
                inbound.abort();
                let _ = inbound.await;
            }
        }

        drop(raw_guard);
        info!(?finished, ok = matches!(result, Ok(Ok(()))), "exec channel closed");
        result?
    }
}

async fn pump_inbound<St>(
    mut stream: St,
    mut stdout: LocalWriter,
    mut stderr: LocalWriter,
) -> Result<(), ChannelError>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => return classify_ws_error(err),
        };
        match message {
            Message::Text(text) => match ControlEvent::parse(&text) {
                Some(ControlEvent::Stdout { data }) => {
                    write_local(&mut stdout, data.as_bytes(), Flow::RemoteToStdout).await?
                }
                Some(ControlEvent::Stderr { data }) => {
                    write_local(&mut stderr, data.as_bytes(), Flow::RemoteToStderr).await?
                }
                Some(ControlEvent::End) => {
                    debug!("remote signalled end of exec");
                    return Ok(());
                }
                Some(ControlEvent::Error { message }) => {
                    return Err(ChannelError::Remote(message));
                }
                None => write_local(&mut stdout, text.as_bytes(), Flow::RemoteToStdout).await?,
            },
            Message::Binary(data) => write_local(&mut stdout, &data, Flow::RemoteToStdout).await?,
            Message::Close(frame) => return close_outcome(frame),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    debug!("exec websocket stream ended");
    Ok(())
}

async fn pump_outbound<Si>(mut stdin: LocalReader, mut sink: Si) -> Result<(), ChannelError>
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        let n = stdin.read(&mut buf).await.map_err(ChannelError::LocalRead)?;
        if n == 0 {
            debug!("local stdin reached EOF; closing exec websocket");
            let close = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            return match sink.send(Message::Close(Some(close))).await {
                Ok(()) => Ok(()),
                Err(err) => classify_ws_error(err),
            };
        }
        if let Err(err) = sink.send(Message::Binary(buf[..n].to_vec())).await {
            return classify_ws_error(err);
        }
        telemetry::record(Flow::StdinToRemote, n);
    }
}

async fn write_local(writer: &mut LocalWriter, bytes: &[u8], flow: Flow) -> Result<(), ChannelError> {
    let stream = match flow {
        Flow::RemoteToStderr => "stderr",
        _ => "stdout",
    };
    writer
        .write_all(bytes)
        .await
        .map_err(|source| ChannelError::LocalWrite { stream, source })?;
    writer
        .flush()
        .await
        .map_err(|source| ChannelError::LocalWrite { stream, source })?;
    telemetry::record(flow, bytes.len());
    Ok(())
}

fn close_outcome(frame: Option<CloseFrame<'_>>) -> Result<(), ChannelError> {
    let Some(frame) = frame else {
        debug!("exec websocket closed without status");
        return Ok(());
    };
    if is_benign_close(frame.code) {
        debug!(code = u16::from(frame.code), "exec websocket closed");
        return Ok(());
    }
    Err(ChannelError::Closed {
        code: u16::from(frame.code),
        reason: frame.reason.into_owned(),
    })
}

/// Errors that amount to the socket going away are treated as a clean end.
fn classify_ws_error(err: WsError) -> Result<(), ChannelError> {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Ok(()),
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => Ok(()),
        WsError::Io(ref io_err) if is_closed_connection(io_err) => Ok(()),
        other => Err(ChannelError::Protocol(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::copier::testing::Capture;
    use crate::session::terminal::tty::testing::CountingBackend;
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn socket_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (client, server) = duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (client, server)
    }

    fn options(interactive: bool, tty: bool) -> ChannelOptions {
        ChannelOptions {
            command: vec!["sh".into()],
            interactive,
            tty,
            working_dir: None,
        }
    }

    #[test]
    fn benign_close_codes() {
        for code in [1000u16, 1001, 1005, 1006] {
            assert!(is_benign_close(CloseCode::from(code)), "{code}");
        }
        for code in [1002u16, 1008, 1011, 4000] {
            assert!(!is_benign_close(CloseCode::from(code)), "{code}");
        }
    }

    #[test]
    fn closed_socket_errors_are_clean() {
        assert!(classify_ws_error(WsError::ConnectionClosed).is_ok());
        assert!(classify_ws_error(WsError::AlreadyClosed).is_ok());
        assert!(
            classify_ws_error(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake))
                .is_ok()
        );
        assert!(classify_ws_error(WsError::Io(io::ErrorKind::BrokenPipe.into())).is_ok());
        assert!(
            classify_ws_error(WsError::Protocol(ProtocolError::HandshakeIncomplete)).is_err()
        );
    }

    #[test]
    fn http_rejection_keeps_status_and_body_message() {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(409)
            .body(Some(br#"{"message":"box abc is stopped"}"#.to_vec()))
            .unwrap();
        match handshake_error(WsError::Http(response)) {
            ChannelError::Rejected { status, message } => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert_eq!(message, "box abc is stopped");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let bare = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(503)
            .body(None)
            .unwrap();
        let err = handshake_error(WsError::Http(bare));
        assert_eq!(err.to_string(), "Server returned status code 503");
    }

    #[tokio::test]
    async fn sends_init_then_routes_events_until_end() {
        let (client, mut server) = socket_pair().await;
        let stdout = Capture::default();
        let stderr = Capture::default();
        let io = LocalIo::new(tokio::io::empty(), stdout.clone(), stderr.clone(), false);

        let remote = tokio::spawn(async move {
            let init = server.next().await.unwrap().unwrap();
            let init: serde_json::Value = serde_json::from_str(init.to_text().unwrap()).unwrap();
            assert_eq!(init["command"]["commands"][0], "sh");
            assert_eq!(init["command"]["interactive"], false);

            for text in [
                r#"{"event":"stdout","data":"one\n"}"#,
                r#"{"event":"stderr","data":"oops\n"}"#,
                "not json at all",
                r#"{"event":"end"}"#,
            ] {
                server.send(Message::Text(text.into())).await.unwrap();
            }
            server.send(Message::Binary(b"late".to_vec())).await.ok();
        });

        ControlChannel::new(client, options(false, false))
            .run(io)
            .await
            .unwrap();
        remote.await.unwrap();
        assert_eq!(stdout.contents(), b"one\nnot json at all");
        assert_eq!(stderr.contents(), b"oops\n");
    }

    #[tokio::test]
    async fn error_event_fails_with_remote_message() {
        let (client, mut server) = socket_pair().await;
        let io = LocalIo::new(tokio::io::empty(), Capture::default(), Capture::default(), false);

        tokio::spawn(async move {
            let _init = server.next().await;
            server
                .send(Message::Text(r#"{"event":"error","message":"boom"}"#.into()))
                .await
                .unwrap();
        });

        let err = ControlChannel::new(client, options(false, false))
            .run(io)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Remote(ref message) if message == "boom"));
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn unexpected_close_code_is_an_error() {
        let (client, mut server) = socket_pair().await;
        let io = LocalIo::new(tokio::io::empty(), Capture::default(), Capture::default(), false);

        tokio::spawn(async move {
            let _init = server.next().await;
            let _ = server
                .close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "exec crashed".into(),
                }))
                .await;
        });

        let err = ControlChannel::new(client, options(false, false))
            .run(io)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed { code: 1011, .. }));
    }

    #[tokio::test]
    async fn binary_frames_and_normal_close_succeed() {
        let (client, mut server) = socket_pair().await;
        let stdout = Capture::default();
        let io = LocalIo::new(tokio::io::empty(), stdout.clone(), Capture::default(), false);

        tokio::spawn(async move {
            let _init = server.next().await;
            server.send(Message::Binary(vec![0x1b, b'[', b'H'])).await.unwrap();
            let _ = server
                .close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "".into(),
                }))
                .await;
        });

        ControlChannel::new(client, options(false, false))
            .run(io)
            .await
            .unwrap();
        assert_eq!(stdout.contents(), b"\x1b[H");
    }

    #[tokio::test]
    async fn interactive_input_is_forwarded_then_closed() {
        let (client, mut server) = socket_pair().await;
        let io = LocalIo::new(&b"echo hi\n"[..], Capture::default(), Capture::default(), false);

        let remote = tokio::spawn(async move {
            let _init = server.next().await;
            let mut received = Vec::new();
            let mut close_code = None;
            while let Some(Ok(message)) = server.next().await {
                match message {
                    Message::Binary(data) => received.extend(data),
                    Message::Close(frame) => {
                        close_code = frame.map(|frame| u16::from(frame.code));
                        break;
                    }
                    _ => {}
                }
            }
            (received, close_code)
        });

        ControlChannel::new(client, options(true, false))
            .run(io)
            .await
            .unwrap();
        let (received, close_code) = remote.await.unwrap();
        assert_eq!(received, b"echo hi\n");
        assert_eq!(close_code, Some(1000));
    }

    #[tokio::test]
    async fn tty_session_restores_terminal_after_failure() {
        let (client, mut server) = socket_pair().await;
        let backend = CountingBackend::tty();
        let terminal = TerminalController::with_backend(backend.clone());
        let (_stdin_tx, stdin_rx) = duplex(64);
        let io = LocalIo::new(stdin_rx, Capture::default(), Capture::default(), true);

        tokio::spawn(async move {
            let _init = server.next().await;
            server
                .send(Message::Text(r#"{"event":"error","message":"no such box"}"#.into()))
                .await
                .unwrap();
        });

        let mut channel = ControlChannel::new(client, options(true, true)).with_terminal(terminal);
        assert_eq!(channel.state(), ChannelState::Connecting);
        let err = channel.run(io).await.unwrap_err();
        assert!(matches!(err, ChannelError::Remote(_)));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(backend.counts(), (1, 1));

        let again = LocalIo::new(tokio::io::empty(), Capture::default(), Capture::default(), false);
        assert!(matches!(
            channel.run(again).await,
            Err(ChannelError::Protocol(WsError::AlreadyClosed))
        ));
    }

    #[tokio::test]
    async fn tty_without_terminal_stdin_skips_raw_mode() {
        let (client, mut server) = socket_pair().await;
        let backend = Arc::new(CountingBackend::default());
        let terminal = TerminalController::with_backend(backend.clone());
        let (_stdin_tx, stdin_rx) = duplex(64);
        let io = LocalIo::new(stdin_rx, Capture::default(), Capture::default(), false);

        tokio::spawn(async move {
            let _init = server.next().await;
            server
                .send(Message::Text(r#"{"event":"end"}"#.into()))
                .await
                .unwrap();
        });

        ControlChannel::new(client, options(false, true))
            .with_terminal(terminal)
            .run(io)
            .await
            .unwrap();
        assert_eq!(backend.counts(), (0, 0));
    }
}
