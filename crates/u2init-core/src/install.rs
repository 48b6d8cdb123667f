//! The three install stages of a bootstrap session.
//!
//! Each one checks what is on the device, skips when it already matches,
//! and otherwise fetches through the cache and applies with ADB.

use crate::DEVICE_TMP_DIR;
use crate::adb::{AdbError, DEFAULT_PUSH_MODE, DeviceClient};
use crate::arch::{resolve_agent_artifact_name, resolve_minicap_identity};
use crate::archive::extract_entry;
use crate::bootstrap::BootstrapError;
use crate::cache::ContentCache;
use crate::config::UrlSettings;
use crate::device::Device;
use log::{debug, info, warn};
use std::path::Path;

pub const UIAUTOMATOR_PACKAGE: &str = "com.github.uiautomator";
pub const UIAUTOMATOR_TEST_PACKAGE: &str = "com.github.uiautomator.test";
pub const AGENT_BINARY: &str = "atx-agent";
/// What a locally built `atx-agent` reports from `-v`.
pub const AGENT_DEV_VERSION: &str = "dev";

const EXEC_MODE: u32 = 0o755;

#[must_use]
pub fn device_path(name: &str) -> String {
    format!("{DEVICE_TMP_DIR}/{name}")
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// What a stage decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Already at the desired version
    Skip,
    /// A developer build is deployed, never overwrite it
    KeepDeveloperBuild,
    /// Nothing deployed yet
    Install,
    /// Another version deployed, remove it first
    Replace,
}

/// A component as seen on the device, against the version we want there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledComponent<'a> {
    pub name: &'a str,
    pub installed: Option<String>,
    pub desired: &'a str,
    /// Installed version that pins the component whatever `desired` is
    pub sentinel: Option<&'a str>,
}

impl InstalledComponent<'_> {
    #[must_use]
    pub fn plan(&self) -> Plan {
        match self.installed.as_deref() {
            Some(v) if v == self.desired => Plan::Skip,
            Some(v) if Some(v) == self.sentinel => Plan::KeepDeveloperBuild,
            Some(_) => Plan::Replace,
            None => Plan::Install,
        }
    }
}

/// Result of one stage, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Applied,
    UpToDate,
    DeveloperBuild,
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Applied => "installed",
            Self::UpToDate => "up to date",
            Self::DeveloperBuild => "developer build kept",
        };
        write!(f, "{s}")
    }
}

pub struct Installer<'a> {
    client: &'a DeviceClient,
    device: &'a Device,
    cache: &'a ContentCache,
    urls: &'a UrlSettings,
}

impl<'a> Installer<'a> {
    #[must_use]
    pub fn new(
        client: &'a DeviceClient,
        device: &'a Device,
        cache: &'a ContentCache,
        urls: &'a UrlSettings,
    ) -> Self {
        Self {
            client,
            device,
            cache,
            urls,
        }
    }

    /// Push `minicap.so` and `minicap` for the device's ABI and SDK.
    ///
    /// There is no version to compare against, so both files are pushed on
    /// every run.
    pub fn install_minicap(&self) -> Result<StageOutcome, BootstrapError> {
        let id = resolve_minicap_identity(self.device);

        debug!("install minicap.so");
        let url = join_url(
            &self.urls.minicap_base,
            &format!("{}/lib/android-{}/minicap.so", id.abi, id.effective_sdk),
        );
        let path = self.cache.fetch(&url, None)?;
        self.client
            .push(&path, &device_path("minicap.so"), DEFAULT_PUSH_MODE)?;

        debug!("install minicap");
        let url = join_url(&self.urls.minicap_base, &format!("{}/bin/minicap", id.abi));
        let path = self.cache.fetch(&url, None)?;
        self.client.push(&path, &device_path("minicap"), EXEC_MODE)?;

        info!(
            "Device({}) minicap pushed ({}, android-{})",
            self.client.serial(),
            id.abi,
            id.effective_sdk
        );
        Ok(StageOutcome::Applied)
    }

    /// Install `app-uiautomator.apk` and its test APK, unless the main
    /// package is already at `version`. Any other installed version is
    /// uninstalled (both packages) before installing.
    pub fn install_uiautomator_apk(&self, version: &str) -> Result<StageOutcome, BootstrapError> {
        let component = InstalledComponent {
            name: UIAUTOMATOR_PACKAGE,
            installed: self.client.package_version(UIAUTOMATOR_PACKAGE)?,
            desired: version,
            sentinel: None,
        };

        match component.plan() {
            Plan::Skip | Plan::KeepDeveloperBuild => {
                info!("apk already installed, skip");
                return Ok(StageOutcome::UpToDate);
            }
            Plan::Replace => {
                debug!(
                    "uninstall old apks ({} -> {version})",
                    component.installed.as_deref().unwrap_or_default()
                );
                self.client.uninstall_package(UIAUTOMATOR_PACKAGE)?;
                self.client.uninstall_package(UIAUTOMATOR_TEST_PACKAGE)?;
            }
            Plan::Install => {}
        }

        info!("app-uiautomator.apk installing ...");
        let url = join_url(&self.urls.apk_release_base, &format!("{version}/app-uiautomator.apk"));
        let path = self.cache.fetch(&url, None)?;
        self.client.install_package(&path, self.device.sdk)?;
        debug!("app-uiautomator.apk installed");

        debug!("app-uiautomator-test.apk installing ...");
        let url = join_url(
            &self.urls.apk_release_base,
            &format!("{version}/app-uiautomator-test.apk"),
        );
        let path = self.cache.fetch(&url, None)?;
        self.client.install_package(&path, self.device.sdk)?;
        debug!("app-uiautomator-test.apk installed");

        Ok(StageOutcome::Applied)
    }

    /// Version `atx-agent -v` reports on the device, `None` when it isn't there.
    pub fn agent_version(&self) -> Result<Option<String>, BootstrapError> {
        let agent = device_path(AGENT_BINARY);
        match self.client.shell(&[agent.as_str(), "-v"]) {
            Ok(out) => Ok(Some(out.trim().to_string()).filter(|v| !v.is_empty())),
            // Newer platforms propagate the shell's exit code: "not found" is 127.
            Err(AdbError::NonZero { code, output }) => {
                debug!("atx-agent not runnable ({code}): {output}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deploy the `atx-agent` build for the device's ABI list.
    pub fn install_atx_agent(&self, version: &str) -> Result<StageOutcome, BootstrapError> {
        debug!("install atx-agent");
        let component = InstalledComponent {
            name: AGENT_BINARY,
            installed: self.agent_version()?,
            desired: version,
            sentinel: Some(AGENT_DEV_VERSION),
        };

        match component.plan() {
            Plan::Skip => {
                info!("already installed, skip");
                return Ok(StageOutcome::UpToDate);
            }
            Plan::KeepDeveloperBuild => {
                warn!("atx-agent develop version, skip");
                return Ok(StageOutcome::DeveloperBuild);
            }
            Plan::Install | Plan::Replace => {}
        }

        let name = resolve_agent_artifact_name(&self.device.abi_list, version)?;
        let url = join_url(&self.urls.agent_release_base, &format!("{version}/{name}"));
        debug!("download atx-agent({version}) from github releases");
        let archive = self.cache.fetch(&url, None)?;

        let bin_path = archive
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(AGENT_BINARY);
        extract_entry(&archive, AGENT_BINARY, &bin_path).map_err(BootstrapError::Archive)?;
        self.client
            .push(&bin_path, &device_path(AGENT_BINARY), EXEC_MODE)?;
        info!("Device({}) atx-agent {version} installed", self.client.serial());

        Ok(StageOutcome::Applied)
    }
}
