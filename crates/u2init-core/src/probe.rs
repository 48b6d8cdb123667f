use crate::AGENT_PORT;
use crate::adb::{AdbError, DeviceClient};
use crate::cancel::CancelToken;
use crate::config::ProbeSettings;
use log::{debug, error, info, warn};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Adb(#[from] AdbError),
    #[error("cannot allocate a local port: {0}")]
    Port(#[from] std::io::Error),
    #[error("agent unreachable: {0}")]
    Unreachable(String),
    #[error("agent did not answer after {attempts} attempt(s)")]
    Timeout { attempts: usize },
    #[error("probe cancelled")]
    Cancelled,
}

/// Answers whether something is serving `/version` on a local port.
pub trait HealthCheck: Send + Sync {
    /// Body of a successful response.
    fn check(&self, port: u16, timeout: Duration) -> Result<String, ProbeError>;
}

/// `GET http://127.0.0.1:<port>/version` through `ureq`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UreqHealthCheck;

impl HealthCheck for UreqHealthCheck {
    fn check(&self, port: u16, timeout: Duration) -> Result<String, ProbeError> {
        let response = ureq::AgentBuilder::new()
            .timeout(timeout)
            .build()
            .get(&format!("http://127.0.0.1:{port}/version"))
            .call()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        if !(200..300).contains(&response.status()) {
            return Err(ProbeError::Unreachable(format!("HTTP {}", response.status())));
        }
        response
            .into_string()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))
    }
}

/// Ask the OS for a port nobody listens on right now.
pub fn find_free_port() -> std::io::Result<u16> {
    Ok(TcpListener::bind(("127.0.0.1", 0))?.local_addr()?.port())
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub enum ProbeState {
    #[default]
    Launching,
    ForwardEstablished {
        local_port: u16,
    },
    Polling {
        attempt: usize,
    },
    Ready {
        version: String,
    },
    Failed {
        attempts: usize,
    },
}

impl std::fmt::Display for ProbeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launching => write!(f, "launching"),
            Self::ForwardEstablished { local_port } => write!(f, "forwarded tcp:{local_port}"),
            Self::Polling { attempt } => write!(f, "polling (attempt {attempt})"),
            Self::Ready { version } => write!(f, "ready ({version})"),
            Self::Failed { attempts } => write!(f, "failed after {attempts} attempt(s)"),
        }
    }
}

/// Starts `atx-agent` on the device and waits until it answers through a
/// port-forward.
pub struct ReadinessProbe<'a> {
    health: &'a dyn HealthCheck,
    settings: ProbeSettings,
    state: ProbeState,
    history: Vec<ProbeState>,
}

impl<'a> ReadinessProbe<'a> {
    #[must_use]
    pub fn new(health: &'a dyn HealthCheck, settings: ProbeSettings) -> Self {
        Self {
            health,
            settings,
            state: ProbeState::default(),
            history: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> &ProbeState {
        &self.state
    }

    /// Every state entered so far, oldest first.
    #[must_use]
    pub fn history(&self) -> &[ProbeState] {
        &self.history
    }

    fn enter(&mut self, state: ProbeState) {
        debug!("probe: {} -> {state}", self.state);
        self.history.push(state.clone());
        self.state = state;
    }

    /// Launch the daemon, forward a free local port to it, then poll.
    /// Returns the version reported by the agent.
    pub fn run(
        &mut self,
        client: &DeviceClient,
        agent_path: &str,
        server_addr: Option<&str>,
    ) -> Result<String, ProbeError> {
        self.enter(ProbeState::Launching);
        debug!("launch atx-agent daemon");
        let mut args = vec![agent_path, "-d"];
        if let Some(addr) = server_addr {
            args.extend(["-t", addr]);
        }
        let output = client.shell(&args)?;

        let local_port = find_free_port()?;
        debug!("obtain freeport: {local_port}");
        client.forward(local_port, AGENT_PORT)?;
        self.enter(ProbeState::ForwardEstablished { local_port });

        thread::sleep(self.settings.settle_delay());
        let outcome = self.poll(local_port, client.cancel_token());

        if let Err(e) = client.remove_forward(local_port) {
            warn!("could not remove forward tcp:{local_port}: {e}");
        }

        match outcome {
            Ok(version) => {
                debug!("atx-agent version: {version}");
                info!("atx-agent output: {}", output.trim());
                info!("success");
                Ok(version)
            }
            Err(e) => {
                error!("failure: {e}");
                Err(e)
            }
        }
    }

    /// Poll `/version` on `port` at most `attempts` times.
    pub fn poll(&mut self, port: u16, cancel: &CancelToken) -> Result<String, ProbeError> {
        let attempts = self.settings.attempts.max(1);
        let timeout = self.settings.attempt_timeout();

        for attempt in 1..=attempts {
            if attempt > 1 {
                thread::sleep(self.settings.retry_interval());
            }
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            self.enter(ProbeState::Polling { attempt });
            match self.health.check(port, timeout) {
                Ok(version) => {
                    self.enter(ProbeState::Ready {
                        version: version.clone(),
                    });
                    return Ok(version);
                }
                Err(e) => debug!("attempt {attempt}/{attempts}: {e}"),
            }
        }

        self.enter(ProbeState::Failed { attempts });
        Err(ProbeError::Timeout { attempts })
    }
}
