#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::uninlined_format_args,
    reason = "Doc+style pedantic lints are out-of-scope for this pass"
)]

pub mod adb;
pub mod arch;
pub mod archive;
pub mod bootstrap;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod device;
pub mod install;
pub mod probe;
pub mod remote;

#[cfg(test)]
pub(crate) mod testing;

/// Canonical shortened name of the application
pub const NAME: &str = "u2init";

/// Where every pushed binary lives on the device.
pub const DEVICE_TMP_DIR: &str = "/data/local/tmp";

/// Port `atx-agent` listens on, on the device side.
pub const AGENT_PORT: u16 = 7912;
