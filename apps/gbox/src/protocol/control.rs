use serde::{Deserialize, Serialize};

/// Out-of-band events the server sends as WebSocket text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ControlEvent {
    Stdout {
        #[serde(default)]
        data: String,
    },
    Stderr {
        #[serde(default)]
        data: String,
    },
    End,
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ControlEvent {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// First message a client sends after the WebSocket handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitFrame {
    pub command: InitCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitCommand {
    pub commands: Vec<String>,
    pub interactive: bool,
    pub working_dir: String,
}

impl InitFrame {
    pub fn new(commands: Vec<String>, interactive: bool, working_dir: Option<&str>) -> Self {
        Self {
            command: InitCommand {
                commands,
                interactive,
                working_dir: working_dir.unwrap_or_default().to_string(),
            },
        }
    }
}
