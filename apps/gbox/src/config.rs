use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:28080";
pub const DEFAULT_CLOUD_URL: &str = "https://gbox.ai";
const API_PREFIX: &str = "api/v1";
const LOCAL_ORGANIZATION: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiTarget {
    Local,
    Cloud,
}

/// Everything the exec core needs to reach the API. Built once by
/// [`ConfigLoader`] and handed to the session explicitly.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub api_base: Url,
    pub ws_base: Url,
    pub api_key: Option<String>,
    pub target: ApiTarget,
    /// Interactive and TTY sessions go over the WebSocket channel when set.
    pub websocket: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid API url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("API url '{0}' cannot carry a path")]
    CannotBeABase(String),
    #[error("failed to read profile file ({path}): {source}")]
    ReadProfiles {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse profile file ({path}): {source}")]
    ParseProfiles {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no profile named '{name}' in {path}")]
    UnknownProfile { name: String, path: PathBuf },
    #[error("profile '{0}' does not hold an api_key")]
    MissingApiKey(String),
}

impl ExecConfig {
    pub fn new(root: &str, api_key: Option<String>, target: ApiTarget) -> Result<Self, ConfigError> {
        let api_base = api_base(root)?;
        let ws_base = websocket_base(&api_base)?;
        Ok(Self {
            api_base,
            ws_base,
            api_key,
            target,
            websocket: true,
        })
    }

    pub fn local(root: &str) -> Result<Self, ConfigError> {
        Self::new(root, None, ApiTarget::Local)
    }

    /// `{api_base}/boxes/{id}/exec`
    pub fn exec_url(&self, box_id: &str) -> Result<Url, ConfigError> {
        exec_endpoint(&self.api_base, box_id)
    }

    /// Same path as [`exec_url`](Self::exec_url) on the ws/wss scheme.
    pub fn ws_exec_url(&self, box_id: &str) -> Result<Url, ConfigError> {
        exec_endpoint(&self.ws_base, box_id)
    }
}

fn api_base(root: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(root).map_err(|source| ConfigError::InvalidUrl {
        url: root.to_string(),
        source,
    })?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| ConfigError::CannotBeABase(root.to_string()))?;
        segments.pop_if_empty();
        segments.extend(API_PREFIX.split('/'));
    }
    Ok(url)
}

fn websocket_base(api_base: &Url) -> Result<Url, ConfigError> {
    let scheme = match api_base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    let rewritten = format!("{scheme}{}", &api_base[url::Position::AfterScheme..]);
    Url::parse(&rewritten).map_err(|source| ConfigError::InvalidUrl {
        url: rewritten,
        source,
    })
}

fn exec_endpoint(base: &Url, box_id: &str) -> Result<Url, ConfigError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ConfigError::CannotBeABase(base.to_string()))?
        .pop_if_empty()
        .extend(["boxes", box_id, "exec"]);
    Ok(url)
}

/// One entry of the profile file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Profile {
    #[serde(default)]
    pub api_key: String,
    pub name: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub current: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileFile {
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

impl ProfileFile {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::ReadProfiles {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::ParseProfiles {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn current(&self) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.current)
    }

    pub fn named(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }
}

pub fn default_profile_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".gbox").join("profiles.toml"))
}

/// Inputs gathered by the CLI (flags with their env fallbacks).
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// An explicit endpoint wins over any profile and talks to it without a key.
    pub api_url: Option<String>,
    pub local_url: Option<String>,
    pub cloud_url: Option<String>,
    pub profile: Option<String>,
    pub profile_file: Option<PathBuf>,
    pub websocket: bool,
}

impl ConfigLoader {
    pub fn load(&self) -> Result<ExecConfig, ConfigError> {
        let mut config = self.resolve()?;
        config.websocket = self.websocket;
        debug!(
            api_base = %config.api_base,
            target = ?config.target,
            websocket = config.websocket,
            "resolved exec configuration"
        );
        Ok(config)
    }

    fn resolve(&self) -> Result<ExecConfig, ConfigError> {
        let local_url = self.local_url.as_deref().unwrap_or(DEFAULT_API_URL);
        if let Some(endpoint) = self.api_url.as_deref().filter(|url| !url.trim().is_empty()) {
            return ExecConfig::local(endpoint.trim());
        }

        let path = match self.profile_file.clone().or_else(default_profile_path) {
            Some(path) => path,
            None => return ExecConfig::local(local_url),
        };
        if !path.exists() {
            if let Some(name) = &self.profile {
                return Err(ConfigError::UnknownProfile {
                    name: name.clone(),
                    path,
                });
            }
            debug!(path = %path.display(), "no profile file; using local API");
            return ExecConfig::local(local_url);
        }

        let profiles = ProfileFile::read(&path)?;
        let profile = match &self.profile {
            Some(name) => profiles.named(name).ok_or_else(|| ConfigError::UnknownProfile {
                name: name.clone(),
                path: path.clone(),
            })?,
            None => match profiles.current() {
                Some(profile) => profile,
                None => return ExecConfig::local(local_url),
            },
        };

        if profile.organization_name == LOCAL_ORGANIZATION {
            return ExecConfig::local(local_url);
        }
        if profile.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey(profile.name.clone()));
        }
        let cloud_url = self.cloud_url.as_deref().unwrap_or(DEFAULT_CLOUD_URL);
        ExecConfig::new(cloud_url, Some(profile.api_key.clone()), ApiTarget::Cloud)
    }
}
