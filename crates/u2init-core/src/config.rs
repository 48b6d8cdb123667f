use crate::NAME;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Versions the bootstrap installs unless told otherwise.
pub const DEFAULT_APK_VERSION: &str = "1.0.5";
pub const DEFAULT_AGENT_VERSION: &str = "0.0.5";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Everything a bootstrap run needs to know, passed explicitly to each part.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// ADB binary, looked up in `PATH` when not absolute
    pub adb_path: PathBuf,
    /// Root of the download cache
    pub cache_dir: PathBuf,
    pub apk_version: String,
    pub agent_version: String,
    pub adb_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub download_retries: usize,
    pub urls: UrlSettings,
    pub probe: ProbeSettings,
    pub remote: RemoteSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct UrlSettings {
    /// Prebuilt tree laid out as `<abi>/lib/android-<sdk>/minicap.so` and `<abi>/bin/minicap`
    pub minicap_base: String,
    /// Release tree laid out as `<version>/app-uiautomator.apk`
    pub apk_release_base: String,
    /// Release tree laid out as `<version>/atx-agent_<version>_linux_<arch>.tar.gz`
    pub agent_release_base: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ProbeSettings {
    pub attempts: usize,
    pub attempt_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub settle_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteSettings {
    pub poll_attempts: usize,
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            cache_dir: default_cache_dir(),
            apk_version: DEFAULT_APK_VERSION.to_string(),
            agent_version: DEFAULT_AGENT_VERSION.to_string(),
            adb_timeout_secs: 60,
            download_timeout_secs: 120,
            download_retries: 5,
            urls: UrlSettings::default(),
            probe: ProbeSettings::default(),
            remote: RemoteSettings::default(),
        }
    }
}

impl Default for UrlSettings {
    fn default() -> Self {
        Self {
            minicap_base: "https://github.com/codeskyblue/stf-binaries/raw/master/node_modules/minicap-prebuilt/prebuilt/".to_string(),
            apk_release_base: "https://github.com/openatx/android-uiautomator-server/releases/download/".to_string(),
            agent_release_base: "https://github.com/openatx/atx-agent/releases/download/".to_string(),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout_ms: 3000,
            retry_interval_ms: 1000,
            settle_delay_ms: 500,
        }
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            poll_attempts: 120,
            poll_interval_ms: 1000,
        }
    }
}

impl ProbeSettings {
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Config {
    #[must_use]
    pub const fn adb_timeout(&self) -> Duration {
        Duration::from_secs(self.adb_timeout_secs)
    }

    #[must_use]
    pub const fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Read `path`; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(s) => Ok(toml::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("config: {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }
}

/// `~/.uiautomator2`, shared with the Python tooling.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".uiautomator2")
}

/// `<config dir>/u2init/config.toml`
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(NAME)
        .join(CONFIG_FILE_NAME)
}
