use crate::adb::{AdbError, DeviceClient};

/// Properties of one device, read once at the start of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Unique serial identifier, `"default"` when ADB picks the only device
    pub serial: String,
    /// Android API level version
    pub sdk: u16,
    /// `ro.build.version.preview_sdk`, unset on older platforms
    pub preview_sdk: Option<String>,
    /// Primary ABI
    pub abi: String,
    /// Comma-separated, most preferred first
    pub abi_list: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Adb(#[from] AdbError),
    #[error("property {name} has unexpected value {value:?}")]
    InvalidProperty { name: &'static str, value: String },
}

impl Device {
    pub fn query(client: &DeviceClient) -> Result<Self, SnapshotError> {
        let raw_sdk = client.getprop("ro.build.version.sdk")?;
        let sdk = raw_sdk
            .parse()
            .map_err(|_| SnapshotError::InvalidProperty {
                name: "ro.build.version.sdk",
                value: raw_sdk.clone(),
            })?;
        let preview_sdk = Some(client.getprop("ro.build.version.preview_sdk")?)
            .filter(|p| !p.is_empty());

        Ok(Self {
            serial: client.serial().to_string(),
            sdk,
            preview_sdk,
            abi: client.getprop("ro.product.cpu.abi")?,
            abi_list: client.getprop("ro.product.cpu.abilist")?,
        })
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (sdk {}, {})", self.serial, self.sdk, self.abi)
    }
}
