use crate::config::ConfigError;
use crate::session::{ExecError, ExitStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Exec(#[from] ExecError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

impl CliError {
    pub fn hint(&self) -> Option<&str> {
        match self {
            CliError::Exec(err) => err.hint(),
            _ => None,
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        match self {
            CliError::Exec(err) => err.exit_status(),
            _ => ExitStatus::Failure(1),
        }
    }
}
