use crate::client::LocalIo;
use crate::session::{ExecSession, ExitStatus};
use crate::terminal::cli::{self, BoxCommand, Command, ExecArgs};
use crate::terminal::error::CliError;
use tracing::debug;

pub async fn run(cli: cli::Cli) -> Result<ExitStatus, CliError> {
    match &cli.command {
        Command::Box(BoxCommand::Exec(args)) => exec(&cli, args).await,
    }
}

async fn exec(cli: &cli::Cli, args: &ExecArgs) -> Result<ExitStatus, CliError> {
    let config = cli.config_loader(!args.no_websocket).load()?;
    debug!(box_id = %args.box_id, api_base = %config.api_base, "running box exec");
    let session = ExecSession::new(config);
    let status = session.run(args.to_options(), LocalIo::process()).await?;
    Ok(status)
}
