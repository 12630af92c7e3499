use gbox_exec_core::telemetry::logging;
use gbox_exec_core::terminal::{app, cli, error::CliError};
use tracing::debug;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    match run().await {
        Ok(status) => std::process::exit(status.code()),
        Err(err) => {
            eprintln!("❌ {err}");
            if let Some(hint) = err.hint() {
                eprintln!("   hint: {hint}");
            }
            std::process::exit(err.exit_status().code());
        }
    }
}

async fn run() -> Result<gbox_exec_core::session::ExitStatus, CliError> {
    let cli = cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    app::run(cli).await
}
