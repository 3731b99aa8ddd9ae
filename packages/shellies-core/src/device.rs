//! Device model: identity, normalized poll results and registry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable device identity.
///
/// Normally the hardware address as 12 upper-case hex digits. Devices that do not
/// report a parsable MAC fall back to the identifier announced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse a MAC address in colon, dash, dot or bare notation.
    pub fn from_mac(mac: &str) -> Option<Self> {
        let hex: String = mac
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();

        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        Some(Self(hex.to_ascii_uppercase()))
    }

    /// Use a discovery hint verbatim (trimmed). Blank hints carry no identity.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let hint = hint.trim();
        if hint.is_empty() {
            None
        } else {
            Some(Self(hint.to_string()))
        }
    }

    /// Pick the identity for a poll result: reported MAC first, then the hint.
    pub fn resolve(info: &DeviceInfo, hint: &str) -> Option<Self> {
        info.mac
            .as_deref()
            .and_then(Self::from_mac)
            .or_else(|| Self::from_hint(hint))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Firmware state as reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareUpdateState {
    pub has_update: bool,
    pub current_version: String,
    pub available_version: Option<String>,
}

/// One successful poll of a device, normalized from its local API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Address the device answered on
    pub host: String,
    /// First hardware address the device reported that parses as a MAC, unnormalized
    pub mac: Option<String>,
    pub display_name: String,
    pub model: String,
    pub hardware_revision: Option<String>,
    pub firmware: FirmwareUpdateState,
    pub uptime_seconds: u64,
}

/// The registry's entry for one physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub host: String,
    #[serde(rename = "name")]
    pub display_name: String,
    pub model: String,
    #[serde(default)]
    pub hardware_revision: Option<String>,
    #[serde(rename = "updateState")]
    pub firmware: FirmwareUpdateState,
    pub uptime_seconds: u64,
    /// When the last successful poll was merged
    pub last_update: DateTime<Utc>,
    /// When the last successful poll was started
    pub polled_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub(crate) fn from_poll(
        id: DeviceId,
        info: DeviceInfo,
        polled_at: DateTime<Utc>,
        last_update: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            host: info.host,
            display_name: info.display_name,
            model: info.model,
            hardware_revision: info.hardware_revision,
            firmware: info.firmware,
            uptime_seconds: info.uptime_seconds,
            last_update,
            polled_at,
        }
    }

    /// Time since the last successful poll. Zero if `last_update` lies in the future.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_update).to_std().unwrap_or(Duration::ZERO)
    }

    /// A record is stale once its age strictly exceeds the threshold.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(mac: Option<&str>) -> DeviceInfo {
        DeviceInfo {
            host: "10.0.0.5".to_string(),
            mac: mac.map(str::to_string),
            display_name: "Kitchen".to_string(),
            model: "SHPLG-S".to_string(),
            hardware_revision: None,
            firmware: FirmwareUpdateState::default(),
            uptime_seconds: 120,
        }
    }

    #[test]
    fn test_from_mac_normalizes_notation() {
        let expected = DeviceId::from_mac("A4CF12345678").unwrap();
        assert_eq!(DeviceId::from_mac("a4:cf:12:34:56:78"), Some(expected.clone()));
        assert_eq!(DeviceId::from_mac("a4-cf-12-34-56-78"), Some(expected.clone()));
        assert_eq!(DeviceId::from_mac(" a4cf.1234.5678 "), Some(expected));
    }

    #[test]
    fn test_from_mac_rejects_garbage() {
        assert_eq!(DeviceId::from_mac(""), None);
        assert_eq!(DeviceId::from_mac("a4:cf:12:34:56"), None);
        assert_eq!(DeviceId::from_mac("zz:cf:12:34:56:78"), None);
    }

    #[test]
    fn test_resolve_prefers_reported_mac() {
        let id = DeviceId::resolve(&info(Some("a4:cf:12:34:56:78")), "shellyplug-s-123456").unwrap();
        assert_eq!(id.as_str(), "A4CF12345678");

        let id = DeviceId::resolve(&info(None), " shellyplug-s-123456 ").unwrap();
        assert_eq!(id.as_str(), "shellyplug-s-123456");

        assert_eq!(DeviceId::resolve(&info(Some("bogus")), "  "), None);
    }

    #[test]
    fn test_staleness_is_strict() {
        let now = Utc::now();
        let id = DeviceId::from_hint("A").unwrap();
        let mut record = DeviceRecord::from_poll(id, info(None), now, now);

        record.last_update = now - chrono::Duration::seconds(60);
        assert!(!record.is_stale(Duration::from_secs(60), now));

        record.last_update = now - chrono::Duration::seconds(61);
        assert!(record.is_stale(Duration::from_secs(60), now));

        record.last_update = now + chrono::Duration::seconds(5);
        assert_eq!(record.age(now), Duration::ZERO);
    }
}
