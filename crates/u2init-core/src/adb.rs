//! Everything that talks to a device goes through this module.
//!
//! [`Transport`] is the seam: a transport runs one `adb` invocation and hands
//! back its output. [`AdbCli`] is the real one, wrapping the ADB binary.
//! [`DeviceClient`] sits on top and is scoped to a single device serial; it
//! keeps a 1-to-1 mapping between its methods and ADB commands:
//! - no "magic"
//! - no chaining ("piping") of existing commands
//! - the only extra it takes is a `chmod` after a `push` with a non-default mode
//!
//! ADB output is not a structured interface, so every format we read
//! (`devices -l`, `dumpsys package`) gets its own parsing function
//! with tests against literal samples.
//!
//! For comprehensive info about ADB,
//! [see this](https://android.googlesource.com/platform/packages/modules/adb/+/refs/heads/master/docs/)

use crate::cancel::CancelToken;
use log::{debug, error};
use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Mode `adb push` leaves files with; anything else needs a `chmod`.
pub const DEFAULT_PUSH_MODE: u32 = 0o644;

/// Convert ADB output bytes to a trimmed UTF-8 string.
/// Lossy, some OEM builds print garbage.
#[must_use]
pub fn to_trimmed_utf8(v: &[u8]) -> String {
    String::from_utf8_lossy(v).trim_end().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("ADB failed to start: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("ADB returned non-success status ({code}): {output}")]
    NonZero { code: i32, output: String },
    #[error("ADB command timed out after {0:?}")]
    Timeout(Duration),
    #[error("ADB command cancelled")]
    Cancelled,
}

/// Something able to run a single `adb` invocation.
///
/// `serial` of `None` lets ADB choose the default device.
pub trait Transport: Send + Sync {
    fn run(
        &self,
        serial: Option<&str>,
        args: &[&str],
        cancel: &CancelToken,
    ) -> Result<String, AdbError>;
}

/// The system `adb` binary.
#[derive(Debug, Clone)]
pub struct AdbCli {
    program: PathBuf,
    timeout: Duration,
}

impl AdbCli {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(program: P, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl Transport for AdbCli {
    fn run(
        &self,
        serial: Option<&str>,
        args: &[&str],
        cancel: &CancelToken,
    ) -> Result<String, AdbError> {
        if cancel.is_cancelled() {
            return Err(AdbError::Cancelled);
        }

        let mut cmd = Command::new(&self.program);
        if let Some(serial) = serial {
            cmd.args(["-s", serial]);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(target_os = "windows")]
        cmd.creation_flags(0x0800_0000); // do not open a cmd window

        debug!(
            "Ran command: adb {}",
            cmd.get_args()
                .filter_map(|s| s.to_str())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!("ADB: {e}");
            AdbError::Spawn(e)
        })?;

        // Drain both pipes while waiting, a chatty child blocks on a full pipe buffer.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let collect = |h: Option<thread::JoinHandle<Vec<u8>>>| {
            h.and_then(|h| h.join().ok()).unwrap_or_default()
        };

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            let abort = if cancel.is_cancelled() {
                Some(AdbError::Cancelled)
            } else if start.elapsed() > self.timeout {
                Some(AdbError::Timeout(self.timeout))
            } else {
                None
            };
            if let Some(err) = abort {
                let _ = child.kill();
                let _ = child.wait();
                collect(stdout);
                collect(stderr);
                return Err(err);
            }
            thread::sleep(Duration::from_millis(20));
        };

        let out = to_trimmed_utf8(&collect(stdout));
        if status.success() {
            Ok(out)
        } else {
            // ADB does really weird things:
            // Some errors are not redirected to `stderr`
            let output = if out.is_empty() {
                to_trimmed_utf8(&collect(stderr))
            } else {
                out
            };
            Err(AdbError::NonZero {
                code: status.code().unwrap_or(-1),
                output,
            })
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// Connection state as printed by `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Device,
    Offline,
    Unauthorized,
    Other(String),
}

impl DeviceStatus {
    fn parse(s: &str) -> Self {
        match s {
            "device" => Self::Device,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device => f.write_str("device"),
            Self::Offline => f.write_str("offline"),
            Self::Unauthorized => f.write_str("unauthorized"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// One line of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub serial: String,
    pub status: DeviceStatus,
    /// `product:… model:… device:… transport_id:…`, possibly empty
    pub description: String,
}

/// Parse `adb devices -l` output.
///
/// ```txt
/// List of devices attached
/// 0123456789ABCDEF       device usb:1-1 product:sailfish model:Pixel device:sailfish transport_id:1
/// emulator-5554          offline transport_id:2
/// ```
#[must_use]
pub fn parse_devices(output: &str) -> Vec<DeviceEntry> {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(?P<serial>[\w.:\-]+)\s+(?P<status>[a-z]+(?: [a-z]+)?)(?:\s+(?P<info>.*))?$")
            .unwrap_or_else(|_| unreachable!())
    });

    output
        .lines()
        .map(str::trim)
        .filter(|ln| !ln.is_empty() && !ln.starts_with("List of devices") && !ln.starts_with('*'))
        .filter_map(|ln| RE.captures(ln))
        .map(|caps| DeviceEntry {
            serial: caps["serial"].to_string(),
            status: DeviceStatus::parse(&caps["status"]),
            description: caps
                .name("info")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        })
        .collect()
}

/// Pull `versionName=<value>` out of `dumpsys package <name>`.
/// `None` means the package is not installed.
#[must_use]
pub fn parse_version_name(dumpsys: &str) -> Option<String> {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"versionName=(?P<name>\S+)").unwrap_or_else(|_| unreachable!())
    });

    RE.captures(dumpsys).map(|caps| caps["name"].to_string())
}

/// `adb install` flags for a platform level.
///
/// Marshmallow (23) introduced runtime permissions, so anything newer has to
/// pre-grant them or the instrumentation can't attach without a prompt.
#[must_use]
pub const fn install_flags(sdk: u16) -> &'static [&'static str] {
    if sdk <= 23 { &["-d", "-r"] } else { &["-d", "-r", "-g"] }
}

/// List every attached device, whatever its state.
pub fn list_devices(transport: &dyn Transport, cancel: &CancelToken) -> Result<Vec<DeviceEntry>, AdbError> {
    transport
        .run(None, &["devices", "-l"], cancel)
        .map(|out| parse_devices(&out))
}

/// ADB scoped to one device.
#[derive(Clone)]
pub struct DeviceClient {
    transport: Arc<dyn Transport>,
    serial: Option<String>,
    cancel: CancelToken,
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

impl DeviceClient {
    /// If `serial` is `None`, it lets ADB choose the sole attached device.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, serial: Option<String>, cancel: CancelToken) -> Self {
        Self {
            transport,
            serial,
            cancel,
        }
    }

    /// Serial for display purposes.
    #[must_use]
    pub fn serial(&self) -> &str {
        self.serial.as_deref().unwrap_or("default")
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn execute(&self, args: &[&str]) -> Result<String, AdbError> {
        self.transport
            .run(self.serial.as_deref(), args, &self.cancel)
    }

    /// `shell` sub-command.
    pub fn shell(&self, args: &[&str]) -> Result<String, AdbError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell");
        full.extend_from_slice(args);
        self.execute(&full)
    }

    /// Query a device property value, by its key.
    /// Unset properties come back as an empty string.
    pub fn getprop(&self, name: &str) -> Result<String, AdbError> {
        self.shell(&["getprop", name]).map(|s| s.trim().to_string())
    }

    /// Copy a file to the device, then `chmod` it unless `mode` is the default.
    pub fn push(&self, local: &Path, remote: &str, mode: u32) -> Result<(), AdbError> {
        self.execute(&["push", &local.to_string_lossy(), remote])?;
        if mode != DEFAULT_PUSH_MODE {
            self.shell(&["chmod", &format!("{:03o}", mode & 0o777), remote])?;
        }
        Ok(())
    }

    pub fn install_package(&self, apk: &Path, sdk: u16) -> Result<(), AdbError> {
        let apk = apk.to_string_lossy();
        let mut args = vec!["install"];
        args.extend_from_slice(install_flags(sdk));
        args.push(&apk);
        self.execute(&args).map(|_| ())
    }

    pub fn uninstall_package(&self, name: &str) -> Result<(), AdbError> {
        self.execute(&["uninstall", name]).map(|_| ())
    }

    /// `versionName` of an installed package, `None` if it isn't installed.
    pub fn package_version(&self, name: &str) -> Result<Option<String>, AdbError> {
        self.shell(&["dumpsys", "package", name])
            .map(|out| parse_version_name(&out))
    }

    pub fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), AdbError> {
        self.execute(&[
            "forward",
            &format!("tcp:{local_port}"),
            &format!("tcp:{remote_port}"),
        ])
        .map(|_| ())
    }

    pub fn remove_forward(&self, local_port: u16) -> Result<(), AdbError> {
        self.execute(&["forward", "--remove", &format!("tcp:{local_port}")])
            .map(|_| ())
    }
}
