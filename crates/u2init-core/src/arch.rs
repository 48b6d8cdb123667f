use crate::device::Device;

/// Which `atx-agent` build runs on which ABI.
/// `arm64-v8a` devices run the 32-bit ARMv7 build fine.
const AGENT_BUILDS: [(&str, &str); 3] = [
    ("armeabi-v7a", "armv7"),
    ("arm64-v8a", "armv7"),
    ("armeabi", "armv6"),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("arch({abi_list}) is not supported yet")]
pub struct UnsupportedArchitecture {
    pub abi_list: String,
}

/// Coordinates of the `minicap` prebuilt matching a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinicapIdentity {
    pub abi: String,
    /// SDK level, suffixed with the preview SDK on preview/beta builds (`"25"` + `"1"` → `"251"`)
    pub effective_sdk: String,
}

#[must_use]
pub fn resolve_minicap_identity(device: &Device) -> MinicapIdentity {
    let sdk = device.sdk.to_string();
    let effective_sdk = match device.preview_sdk.as_deref() {
        Some(pre) if !pre.is_empty() && pre != "0" => sdk + pre,
        _ => sdk,
    };
    MinicapIdentity {
        abi: device.abi.clone(),
        effective_sdk,
    }
}

/// File name of the `atx-agent` release archive for a comma-separated ABI
/// list. The first ABI with a known build wins.
pub fn resolve_agent_artifact_name(
    abi_list: &str,
    version: &str,
) -> Result<String, UnsupportedArchitecture> {
    abi_list
        .split(',')
        .map(str::trim)
        .find_map(|abi| AGENT_BUILDS.iter().find(|(a, _)| *a == abi))
        .map(|(_, arch)| format!("atx-agent_{version}_linux_{arch}.tar.gz"))
        .ok_or_else(|| UnsupportedArchitecture {
            abi_list: abi_list.to_string(),
        })
}
