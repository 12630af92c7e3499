use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_RAW_STREAM: &str = "application/vnd.gbox.raw-stream";
pub const MEDIA_TYPE_MULTIPLEXED_STREAM: &str = "application/vnd.gbox.multiplexed-stream";

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub height: u16,
    pub width: u16,
}

/// What the user asked for on the command line, before any transport has
/// been chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub box_id: String,
    pub command: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// Body of `POST /boxes/{id}/exec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_size: Option<TermSize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

impl ExecRequest {
    /// Splits the argv into `cmd` (first token) and `args` (the rest).
    /// Returns `None` for an empty command.
    pub fn from_options(
        options: &ExecOptions,
        stdin: bool,
        term_size: Option<TermSize>,
    ) -> Option<Self> {
        let (program, args) = options.command.split_first()?;
        Some(Self {
            cmd: vec![program.clone()],
            args: args.to_vec(),
            stdin,
            stdout: true,
            stderr: true,
            tty: options.tty,
            term_size: if options.tty { term_size } else { None },
            env: options.env.clone(),
            workdir: options.workdir.clone(),
        })
    }

    pub fn argv(&self) -> Vec<String> {
        self.cmd.iter().chain(self.args.iter()).cloned().collect()
    }

    /// `Accept` value selecting the stream representation for this request.
    pub fn media_type(&self) -> &'static str {
        if self.tty {
            MEDIA_TYPE_RAW_STREAM
        } else {
            MEDIA_TYPE_MULTIPLEXED_STREAM
        }
    }
}
