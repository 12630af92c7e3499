use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::LocalIo;
use crate::client::copier::{CopyError, MultiplexedCopier, run_raw};
use crate::client::websocket::{self, ChannelError, ChannelOptions, ControlChannel};
use crate::config::{ConfigError, ExecConfig};
use crate::protocol::{ExecOptions, ExecRequest, TermSize};
use crate::session::terminal::{TerminalController, TerminalError};
use crate::telemetry::SessionReport;
use crate::transport::{BoxedConnection, UpgradeError, open_exec_stream};

/// Which transport carries a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPlan {
    WebSocket,
    RawStream,
    Multiplexed { forward_stdin: bool },
}

impl TransportPlan {
    pub fn select(
        interactive: bool,
        tty: bool,
        stdin_is_terminal: bool,
        websocket_enabled: bool,
    ) -> Self {
        if (interactive || tty) && websocket_enabled {
            TransportPlan::WebSocket
        } else if tty {
            TransportPlan::RawStream
        } else {
            TransportPlan::Multiplexed {
                forward_stdin: stdin_enabled(interactive, tty, stdin_is_terminal),
            }
        }
    }
}

/// Piped or redirected stdin is forwarded even without `-i`.
pub fn stdin_enabled(interactive: bool, tty: bool, stdin_is_terminal: bool) -> bool {
    interactive || tty || !stdin_is_terminal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure(i32),
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure(code) => code,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no command given; pass one after `--`")]
    MissingCommand,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to send exec request: {0}")]
    Send(#[source] reqwest::Error),
    #[error("{message} (HTTP {status})")]
    Remote {
        status: StatusCode,
        message: String,
        hint: Option<String>,
    },
    #[error("response does not support hijacking: {0}")]
    Hijack(#[source] reqwest::Error),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

impl ExecError {
    fn from_upgrade(err: UpgradeError, box_id: &str) -> Self {
        match err {
            UpgradeError::Send(err) => ExecError::Send(err),
            UpgradeError::Hijack(err) => ExecError::Hijack(err),
            UpgradeError::Rejected { status, message } => Self::rejected(status, message, box_id),
        }
    }

    fn from_channel(err: ChannelError, box_id: &str) -> Self {
        match err {
            ChannelError::Rejected { status, message } => Self::rejected(status, message, box_id),
            other => ExecError::Channel(other),
        }
    }

    fn rejected(status: StatusCode, message: String, box_id: &str) -> Self {
        ExecError::Remote {
            status,
            message,
            hint: (status == StatusCode::CONFLICT).then(|| not_running_hint(box_id)),
        }
    }

    /// Suggested follow-up command, when there is one.
    pub fn hint(&self) -> Option<&str> {
        match self {
            ExecError::Remote { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        ExitStatus::Failure(1)
    }
}

fn not_running_hint(box_id: &str) -> String {
    format!("the box is not running; start it with `gbox box start {box_id}`")
}

/// Runs exec sessions against one API configuration.
pub struct ExecSession {
    config: ExecConfig,
    http: reqwest::Client,
    terminal: TerminalController,
    copier: MultiplexedCopier,
}

impl ExecSession {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            terminal: TerminalController::process(),
            copier: MultiplexedCopier::new(),
        }
    }

    pub fn with_terminal(mut self, terminal: TerminalController) -> Self {
        self.terminal = terminal;
        self
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn copier(&self) -> &MultiplexedCopier {
        &self.copier
    }

    pub async fn run(&self, options: ExecOptions, io: LocalIo) -> Result<ExitStatus, ExecError> {
        if options.command.is_empty() {
            return Err(ExecError::MissingCommand);
        }
        let _report = SessionReport::start(&options.box_id);
        let plan = TransportPlan::select(
            options.interactive,
            options.tty,
            io.stdin_is_terminal,
            self.config.websocket,
        );
        info!(
            box_id = %options.box_id,
            ?plan,
            target = ?self.config.target,
            "starting exec session"
        );

        let _resize = (options.tty && io.stdin_is_terminal)
            .then(|| ResizeMonitor::spawn(&self.terminal));

        match plan {
            TransportPlan::WebSocket => self.run_websocket(&options, io).await?,
            TransportPlan::RawStream => self.run_raw_stream(&options, io).await?,
            TransportPlan::Multiplexed { forward_stdin } => {
                self.run_multiplexed(&options, io, forward_stdin).await?
            }
        }

        debug!(box_id = %options.box_id, "exec session finished");
        Ok(ExitStatus::Success)
    }

    async fn run_websocket(&self, options: &ExecOptions, io: LocalIo) -> Result<(), ExecError> {
        let url = self.config.ws_exec_url(&options.box_id)?;
        let socket = websocket::dial(&url, self.config.api_key.as_deref())
            .await
            .map_err(|err| ExecError::from_channel(err, &options.box_id))?;
        let channel_options = ChannelOptions {
            command: options.command.clone(),
            interactive: options.interactive,
            tty: options.tty,
            working_dir: options.workdir.clone(),
        };
        let mut channel =
            ControlChannel::new(socket, channel_options).with_terminal(self.terminal.clone());
        let result = channel.run(io).await;
        debug!(state = ?channel.state(), ok = result.is_ok(), "exec websocket finished");
        Ok(result?)
    }

    async fn run_raw_stream(&self, options: &ExecOptions, io: LocalIo) -> Result<(), ExecError> {
        let term_size = if io.stdin_is_terminal {
            match self.terminal.query_size() {
                Ok(size) => Some(size),
                Err(err) => {
                    debug!(error = %err, "sending exec without a terminal size");
                    None
                }
            }
        } else {
            None
        };
        let request = self.build_request(options, &io, term_size)?;
        let conn = self.open(options, &request).await?;

        let _raw = if io.stdin_is_terminal {
            Some(self.terminal.enter_raw()?)
        } else {
            None
        };
        run_raw(conn, io).await?;
        Ok(())
    }

    async fn run_multiplexed(
        &self,
        options: &ExecOptions,
        io: LocalIo,
        forward_stdin: bool,
    ) -> Result<(), ExecError> {
        let request = self.build_request(options, &io, None)?;
        let conn = self.open(options, &request).await?;
        self.copier.run(conn, io, forward_stdin).await?;
        Ok(())
    }

    fn build_request(
        &self,
        options: &ExecOptions,
        io: &LocalIo,
        term_size: Option<TermSize>,
    ) -> Result<ExecRequest, ExecError> {
        let stdin = stdin_enabled(options.interactive, options.tty, io.stdin_is_terminal);
        ExecRequest::from_options(options, stdin, term_size).ok_or(ExecError::MissingCommand)
    }

    async fn open(
        &self,
        options: &ExecOptions,
        request: &ExecRequest,
    ) -> Result<BoxedConnection, ExecError> {
        let url = self.config.exec_url(&options.box_id)?;
        open_exec_stream(&self.http, url, self.config.api_key.as_deref(), request)
            .await
            .map_err(|err| ExecError::from_upgrade(err, &options.box_id))
    }
}

/// Logs terminal resizes for the lifetime of a session. The new size is not
/// sent to the remote; the exec API has no resize message.
struct ResizeMonitor(JoinHandle<()>);

impl ResizeMonitor {
    fn spawn(terminal: &TerminalController) -> Self {
        let mut watcher = terminal.watch_resize();
        ResizeMonitor(tokio::spawn(async move {
            while let Some(size) = watcher.changed().await {
                debug!(
                    height = size.height,
                    width = size.width,
                    "terminal resized; not forwarded to remote"
                );
            }
        }))
    }
}

impl Drop for ResizeMonitor {
    fn drop(&mut self) {
        self.0.abort();
    }
}
