//! The parts of a device's `/status` and `/settings` payloads we consume.
//!
//! Everything else in those documents is ignored on decode.

use crate::device::{DeviceId, DeviceInfo, FirmwareUpdateState};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ShellyStatus {
    #[serde(default)]
    pub mac: Option<String>,
    pub uptime: u64,
    #[serde(default)]
    pub update: UpdateStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateStatus {
    pub has_update: bool,
    pub new_version: String,
    pub old_version: String,
}

#[derive(Debug, Deserialize)]
pub struct ShellySettings {
    #[serde(default)]
    pub name: Option<String>,
    pub device: DeviceSettings,
    #[serde(default)]
    pub hwinfo: Option<HwInfo>,
    #[serde(default)]
    pub fw: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceSettings {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HwInfo {
    pub hw_revision: String,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Fold both payloads into one `DeviceInfo`.
pub fn normalize(host: &str, status: ShellyStatus, settings: ShellySettings) -> DeviceInfo {
    let update = status.update;

    let display_name = non_blank(settings.name)
        .or_else(|| non_blank(settings.device.hostname))
        .unwrap_or_else(|| host.to_string());

    let current_version = non_blank(Some(update.old_version))
        .or_else(|| non_blank(settings.fw))
        .unwrap_or_default();

    let available_version = non_blank(Some(update.new_version))
        .filter(|v| update.has_update && *v != current_version);

    // First candidate that parses as a MAC.
    let mac = [status.mac, settings.device.mac]
        .into_iter()
        .flatten()
        .find(|candidate| DeviceId::from_mac(candidate).is_some());

    DeviceInfo {
        host: host.to_string(),
        mac,
        display_name,
        model: settings.device.device_type,
        hardware_revision: settings.hwinfo.and_then(|hw| non_blank(Some(hw.hw_revision))),
        firmware: FirmwareUpdateState {
            has_update: update.has_update,
            current_version,
            available_version,
        },
        uptime_seconds: status.uptime,
    }
}
