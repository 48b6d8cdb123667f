//! Installing an APK through a running `atx-agent`, over the network.
//!
//! The agent downloads the APK itself: we only hand it the URL, then poll the
//! job it created until it reports success or an error.

use crate::AGENT_PORT;
use crate::config::RemoteSettings;
use log::{debug, info};
use retry::{OperationResult, delay::Fixed, retry};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RemoteInstallError {
    #[error("agent request failed: {0}")]
    Network(String),
    #[error("agent answered HTTP {0}")]
    Status(u16),
    #[error("unexpected agent response: {0}")]
    Decode(String),
    #[error("install failed: {0}")]
    Failed(String),
    #[error("install still running after {attempts} poll(s)")]
    Timeout { attempts: usize },
}

impl From<ureq::Error> for RemoteInstallError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(code, _) => Self::Status(code),
            ureq::Error::Transport(t) => Self::Network(t.to_string()),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub copied_size: u64,
}

/// Body of `GET /install/<id>`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallStatus {
    pub message: String,
    pub error: Option<String>,
    pub progress: Option<Progress>,
    pub package_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded(String),
    Failed(String),
}

impl InstallStatus {
    #[must_use]
    pub fn state(&self) -> JobState {
        if let Some(err) = self.error.as_deref().filter(|e| !e.is_empty()) {
            return JobState::Failed(err.to_string());
        }
        if self.message.starts_with("success") {
            return JobState::Succeeded(self.package_name.clone().unwrap_or_default());
        }
        JobState::Running
    }
}

/// `http://<host>:<port>` for an address given as `host`, `host:port` or a URL.
/// The agent only speaks plain HTTP, so any scheme given is replaced.
#[must_use]
pub fn agent_base_url(addr: &str) -> String {
    let host = addr
        .split_once("://")
        .map_or(addr, |(_, rest)| rest)
        .trim_end_matches('/');
    let has_port = host
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if has_port {
        format!("http://{host}")
    } else {
        format!("http://{host}:{AGENT_PORT}")
    }
}

/// Have the agent at `addr` download and install `apk_url`.
/// Returns the installed package name.
pub fn install_via_agent(
    addr: &str,
    apk_url: &str,
    settings: RemoteSettings,
) -> Result<String, RemoteInstallError> {
    let base = agent_base_url(addr);
    let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();

    info!("{base}: install {apk_url}");
    let id = agent
        .post(&format!("{base}/install"))
        .send_form(&[("url", apk_url)])?
        .into_string()
        .map_err(|e| RemoteInstallError::Decode(e.to_string()))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(RemoteInstallError::Decode("empty job id".into()));
    }
    debug!("install job id: {id}");

    let attempts = settings.poll_attempts.max(1);
    let mut polls = 0;
    let result = retry(
        Fixed::from_millis(settings.poll_interval_ms).take(attempts - 1),
        || {
            polls += 1;
            let status = match agent.get(&format!("{base}/install/{id}")).call() {
                Ok(response) => match response.into_json::<InstallStatus>() {
                    Ok(status) => status,
                    Err(e) => return OperationResult::Err(RemoteInstallError::Decode(e.to_string())),
                },
                Err(e) => return OperationResult::Err(e.into()),
            };
            if let Some(p) = &status.progress {
                debug!("{}: {}/{} bytes", status.message, p.copied_size, p.total_size);
            }
            match status.state() {
                JobState::Succeeded(package) => OperationResult::Ok(package),
                JobState::Failed(err) => OperationResult::Err(RemoteInstallError::Failed(err)),
                JobState::Running => OperationResult::Retry(RemoteInstallError::Timeout { attempts: polls }),
            }
        },
    );

    match result {
        Ok(package) => {
            info!("installed {package}");
            Ok(package)
        }
        Err(e) => Err(e.error),
    }
}
