use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONNECTION, UPGRADE};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::BoxedConnection;
use crate::protocol::ExecRequest;

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("failed to send request: {0}")]
    Send(#[source] reqwest::Error),
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
    #[error("response does not support hijacking: {0}")]
    Hijack(#[source] reqwest::Error),
}

/// Issues the exec request with `Upgrade: tcp` and hands back the hijacked
/// connection once the server answers `101` (or `200`).
pub async fn open_exec_stream(
    client: &reqwest::Client,
    url: Url,
    api_key: Option<&str>,
    request: &ExecRequest,
) -> Result<BoxedConnection, UpgradeError> {
    let accept = request.media_type();
    let mut builder = client
        .post(url.clone())
        .header(UPGRADE, "tcp")
        .header(CONNECTION, "Upgrade")
        .header(ACCEPT, accept)
        .json(request);
    if let Some(key) = api_key {
        builder = builder.header(API_KEY_HEADER, key);
    }

    debug!(%url, accept, tty = request.tty, stdin = request.stdin, "sending exec upgrade request");
    let response = builder.send().await.map_err(UpgradeError::Send)?;
    let status = response.status();
    debug!(status = status.as_u16(), headers = ?response.headers(), "exec upgrade response");

    if status != StatusCode::OK && status != StatusCode::SWITCHING_PROTOCOLS {
        let body = response.text().await.unwrap_or_default();
        debug!(body = %body, "exec upgrade rejected");
        return Err(UpgradeError::Rejected {
            status,
            message: remote_error_message(status, &body),
        });
    }

    let upgraded = response.upgrade().await.map_err(UpgradeError::Hijack)?;
    Ok(Box::new(upgraded))
}

/// Pulls `message` out of a JSON error body, falling back to the status code
/// (and the raw body when it is not JSON).
pub fn remote_error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value
            .get("message")
            .and_then(|message| message.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("Server returned status code {}", status.as_u16())),
        Err(_) if body.trim().is_empty() => {
            format!("Server returned status code {}", status.as_u16())
        }
        Err(_) => format!(
            "Server returned status code {}: {}",
            status.as_u16(),
            body.trim()
        ),
    }
}
