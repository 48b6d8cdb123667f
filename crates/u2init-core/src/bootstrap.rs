use crate::adb::{AdbError, DeviceClient, DeviceEntry, DeviceStatus, Transport, list_devices};
use crate::arch::UnsupportedArchitecture;
use crate::cache::{ContentCache, DownloadError};
use crate::cancel::{CancelToken, Cancelled};
use crate::config::Config;
use crate::device::{Device, SnapshotError};
use crate::install::{AGENT_BINARY, Installer, StageOutcome, device_path};
use crate::probe::{HealthCheck, ProbeError, ReadinessProbe};
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Why one device's session stopped.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("ADB: {0}")]
    Transport(AdbError),
    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),
    #[error(transparent)]
    UnsupportedArchitecture(#[from] UnsupportedArchitecture),
    #[error("atx-agent not reachable after {attempts} attempt(s)")]
    ReadinessTimeout { attempts: usize },
    #[error("Cannot extract atx-agent: {0}")]
    Archive(std::io::Error),
    #[error("I/O error: {0}")]
    Io(std::io::Error),
    #[error("property {name} has unexpected value {value:?}")]
    InvalidProperty { name: &'static str, value: String },
    #[error("cancelled")]
    Cancelled,
}

impl From<AdbError> for BootstrapError {
    fn from(e: AdbError) -> Self {
        match e {
            AdbError::Cancelled => Self::Cancelled,
            e => Self::Transport(e),
        }
    }
}

impl From<Cancelled> for BootstrapError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<SnapshotError> for BootstrapError {
    fn from(e: SnapshotError) -> Self {
        match e {
            SnapshotError::Adb(e) => e.into(),
            SnapshotError::InvalidProperty { name, value } => Self::InvalidProperty { name, value },
        }
    }
}

impl From<ProbeError> for BootstrapError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Adb(e) => e.into(),
            ProbeError::Port(e) => Self::Io(e),
            ProbeError::Timeout { attempts } => Self::ReadinessTimeout { attempts },
            ProbeError::Unreachable(_) => Self::ReadinessTimeout { attempts: 0 },
            ProbeError::Cancelled => Self::Cancelled,
        }
    }
}

/// The collaborators every session shares.
pub struct Environment<'a> {
    pub transport: Arc<dyn Transport>,
    pub cache: &'a ContentCache,
    pub health: &'a dyn HealthCheck,
    pub config: &'a Config,
    pub cancel: CancelToken,
}

/// Knobs of the `init` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    /// Address `atx-agent` should report to
    pub server: Option<String>,
    pub apk_version: String,
    pub agent_version: String,
    /// Only these serials, all devices when empty
    pub serials: Vec<String>,
}

impl InitOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            server: None,
            apk_version: config.apk_version.clone(),
            agent_version: config.agent_version.clone(),
            serials: vec![],
        }
    }
}

/// What a successful session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub device: Device,
    pub minicap: StageOutcome,
    pub apk: StageOutcome,
    pub agent: StageOutcome,
    /// As answered by `/version`
    pub agent_version: String,
}

#[derive(Debug)]
pub struct DeviceReport {
    pub serial: String,
    pub description: String,
    pub result: Result<SessionReport, BootstrapError>,
}

/// One full session: snapshot, the three install stages, then the readiness probe.
pub fn bootstrap_device(
    env: &Environment<'_>,
    client: &DeviceClient,
    options: &InitOptions,
) -> Result<SessionReport, BootstrapError> {
    let device = Device::query(client)?;
    debug!("device: {device}");
    let installer = Installer::new(client, &device, env.cache, &env.config.urls);

    env.cancel.check()?;
    let minicap = installer.install_minicap()?;
    env.cancel.check()?;
    let apk = installer.install_uiautomator_apk(&options.apk_version)?;
    env.cancel.check()?;
    let agent = installer.install_atx_agent(&options.agent_version)?;
    env.cancel.check()?;

    let agent_version = ReadinessProbe::new(env.health, env.config.probe).run(
        client,
        &device_path(AGENT_BINARY),
        options.server.as_deref(),
    )?;

    Ok(SessionReport {
        device,
        minicap,
        apk,
        agent,
        agent_version,
    })
}

fn wanted(entry: &DeviceEntry, options: &InitOptions) -> bool {
    match entry.status {
        DeviceStatus::Device => {}
        DeviceStatus::Offline => {
            warn!("device({}) is offline, skip", entry.serial);
            return false;
        }
        DeviceStatus::Unauthorized => {
            warn!("device({}) is unauthorized, accept the RSA prompt on it, skip", entry.serial);
            return false;
        }
        DeviceStatus::Other(ref s) => {
            warn!("device({}) is {s}, skip", entry.serial);
            return false;
        }
    }
    if !options.serials.is_empty() && !options.serials.contains(&entry.serial) {
        debug!("device({}) not selected, skip", entry.serial);
        return false;
    }
    true
}

/// Bootstrap every attached, online device in turn.
///
/// A failing device never stops the others: each outcome lands in its own
/// [`DeviceReport`]. Only failing to list devices is an error.
pub fn init_devices(
    env: &Environment<'_>,
    options: &InitOptions,
) -> Result<Vec<DeviceReport>, BootstrapError> {
    let devices = list_devices(env.transport.as_ref(), &env.cancel)?;
    if devices.is_empty() {
        warn!("no devices/emulators found");
    }

    let mut reports = Vec::with_capacity(devices.len());
    for entry in devices.into_iter().filter(|d| wanted(d, options)) {
        if env.cancel.is_cancelled() {
            warn!("cancelled, device({}) not initialized", entry.serial);
            reports.push(DeviceReport {
                serial: entry.serial,
                description: entry.description,
                result: Err(BootstrapError::Cancelled),
            });
            continue;
        }

        info!("Device({}) {} initialing ...", entry.serial, entry.description);
        let client = DeviceClient::new(
            env.transport.clone(),
            Some(entry.serial.clone()),
            env.cancel.clone(),
        );
        let result = bootstrap_device(env, &client, options);
        if let Err(e) = &result {
            error!("Device({}) failed: {e}", entry.serial);
        }
        reports.push(DeviceReport {
            serial: entry.serial,
            description: entry.description,
            result,
        });
    }
    Ok(reports)
}
