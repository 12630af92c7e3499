use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::PathBuf;

use crate::config::{ConfigLoader, DEFAULT_API_URL, DEFAULT_CLOUD_URL};
use crate::protocol::ExecOptions;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "gbox",
    about = "Run commands inside gbox boxes",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long = "api-url",
        global = true,
        env = "API_ENDPOINT",
        value_name = "URL",
        help = "API endpoint to use directly, bypassing profiles"
    )]
    pub api_url: Option<String>,

    #[arg(
        long = "local-url",
        global = true,
        env = "GBOX_LOCAL_URL",
        default_value = DEFAULT_API_URL,
        value_name = "URL",
        help = "API endpoint for profiles in the local organization"
    )]
    pub local_url: String,

    #[arg(
        long = "cloud-url",
        global = true,
        env = "GBOX_CLOUD_URL",
        default_value = DEFAULT_CLOUD_URL,
        value_name = "URL",
        help = "API endpoint for cloud profiles"
    )]
    pub cloud_url: String,

    #[arg(
        long = "profile",
        global = true,
        env = "GBOX_PROFILE",
        value_name = "PROFILE",
        help = "Select a profile by name instead of the current one"
    )]
    pub profile: Option<String>,

    #[arg(
        long = "profile-file",
        global = true,
        env = "GBOX_PROFILE_FILE",
        value_name = "PATH",
        help = "Profile file to read (defaults to ~/.gbox/profiles.toml)"
    )]
    pub profile_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn config_loader(&self, websocket: bool) -> ConfigLoader {
        ConfigLoader {
            api_url: self.api_url.clone(),
            local_url: Some(self.local_url.clone()),
            cloud_url: Some(self.cloud_url.clone()),
            profile: self.profile.clone(),
            profile_file: self.profile_file.clone(),
            websocket,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "GBOX_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "GBOX_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,

    #[arg(
        long = "debug",
        global = true,
        env = "DEBUG",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = parse_debug_flag,
        value_name = "BOOL",
        help = "Shorthand for --log-level debug"
    )]
    pub debug: Option<bool>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        let level = if self.debug == Some(true) {
            self.level.max(LogLevel::Debug)
        } else {
            self.level
        };
        LogConfig {
            level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Work with boxes
    #[command(subcommand)]
    Box(BoxCommand),
}

#[derive(Subcommand, Debug)]
pub enum BoxCommand {
    /// Execute a command inside a running box
    Exec(ExecArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    #[arg(value_name = "BOX_ID", help = "ID of the box to run the command in")]
    pub box_id: String,

    #[arg(
        long,
        short = 'i',
        action = clap::ArgAction::SetTrue,
        help = "Keep stdin open and forward it to the command"
    )]
    pub interactive: bool,

    #[arg(
        long,
        short = 't',
        action = clap::ArgAction::SetTrue,
        help = "Allocate a TTY for the command"
    )]
    pub tty: bool,

    #[arg(
        long,
        short = 'w',
        value_name = "DIR",
        help = "Working directory inside the box"
    )]
    pub workdir: Option<String>,

    #[arg(
        long = "env",
        short = 'e',
        value_name = "KEY=VALUE",
        value_parser = parse_env_pair,
        help = "Set an environment variable for the command (repeatable)"
    )]
    pub env: Vec<(String, String)>,

    #[arg(
        long = "no-websocket",
        action = clap::ArgAction::SetTrue,
        env = "GBOX_NO_WEBSOCKET",
        help = "Use the HTTP upgrade stream even for interactive sessions"
    )]
    pub no_websocket: bool,

    #[arg(
        last = true,
        required = true,
        num_args = 1..,
        value_name = "COMMAND",
        help = "Command and arguments to run, after `--`"
    )]
    pub command: Vec<String>,
}

impl ExecArgs {
    pub fn to_options(&self) -> ExecOptions {
        ExecOptions {
            box_id: self.box_id.clone(),
            command: self.command.clone(),
            interactive: self.interactive,
            tty: self.tty,
            workdir: self.workdir.clone(),
            env: self.env.iter().cloned().collect::<BTreeMap<_, _>>(),
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// `DEBUG` is shared with other tools (`DEBUG=*` and friends), so anything
/// that is not a recognised truthy value just means "off".
fn parse_debug_flag(raw: &str) -> Result<bool, Infallible> {
    Ok(matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "on"
    ))
}

pub fn parse() -> Cli {
    Cli::parse()
}
