//! Read-only views over the registry.

use crate::device::DeviceRecord;
use crate::registry::Registry;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Column to order a listing by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Model,
    Uptime,
    /// Most recently polled first
    LastUpdate,
    Firmware,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sort key '{0}' (expected name, model, uptime, last-update or firmware)")]
pub struct UnknownSortKey(pub String);

impl SortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Name => "name",
            SortKey::Model => "model",
            SortKey::Uptime => "uptime",
            SortKey::LastUpdate => "last-update",
            SortKey::Firmware => "firmware",
        }
    }

    fn compare(self, a: &DeviceRecord, b: &DeviceRecord) -> Ordering {
        match self {
            SortKey::Name => a
                .display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase()),
            SortKey::Model => a.model.cmp(&b.model),
            SortKey::Uptime => a.uptime_seconds.cmp(&b.uptime_seconds),
            SortKey::LastUpdate => b.last_update.cmp(&a.last_update),
            SortKey::Firmware => a
                .firmware
                .current_version
                .cmp(&b.firmware.current_version),
        }
    }
}

impl FromStr for SortKey {
    type Err = UnknownSortKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(SortKey::Name),
            "model" | "type" => Ok(SortKey::Model),
            "uptime" => Ok(SortKey::Uptime),
            "last-update" | "last_update" | "lastupdate" | "update" => Ok(SortKey::LastUpdate),
            "firmware" | "software" => Ok(SortKey::Firmware),
            _ => Err(UnknownSortKey(s.to_string())),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable in-place sort; ties keep their incoming order.
pub fn sort_records(records: &mut [DeviceRecord], key: SortKey) {
    records.sort_by(|a, b| key.compare(a, b));
}

/// Point-in-time copy of the registry, ordered by `sort` or by id when `None`.
pub fn list_all(registry: &Registry, sort: Option<SortKey>) -> Vec<DeviceRecord> {
    let mut records = registry.snapshot();
    if let Some(key) = sort {
        sort_records(&mut records, key);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, DeviceInfo, FirmwareUpdateState};
    use chrono::{Duration, Utc};

    fn info(name: &str, model: &str, uptime: u64, firmware: &str) -> DeviceInfo {
        DeviceInfo {
            host: "10.0.0.5".to_string(),
            mac: None,
            display_name: name.to_string(),
            model: model.to_string(),
            hardware_revision: None,
            firmware: FirmwareUpdateState {
                current_version: firmware.to_string(),
                ..FirmwareUpdateState::default()
            },
            uptime_seconds: uptime,
        }
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        let t0 = Utc::now();
        let devices = [
            ("A", "kitchen", "SHPLG-S", 300, "v1.12.2", 30),
            ("B", "Hall", "SHSW-25", 10, "v1.14.0", 10),
            ("C", "attic", "SHPLG-S", 7200, "v1.11.0", 20),
        ];
        for (id, name, model, uptime, fw, offset) in devices {
            let at = t0 + Duration::seconds(offset);
            registry.merge_at(
                DeviceId::from_hint(id).unwrap(),
                info(name, model, uptime, fw),
                at,
                at,
            );
        }
        registry
    }

    fn ids(records: &[DeviceRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_unsorted_listing_is_by_id() {
        assert_eq!(ids(&list_all(&registry(), None)), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_sort_keys() {
        let registry = registry();
        assert_eq!(ids(&list_all(&registry, Some(SortKey::Name))), vec!["C", "B", "A"]);
        assert_eq!(ids(&list_all(&registry, Some(SortKey::Uptime))), vec!["B", "A", "C"]);
        assert_eq!(
            ids(&list_all(&registry, Some(SortKey::LastUpdate))),
            vec!["A", "C", "B"]
        );
        assert_eq!(
            ids(&list_all(&registry, Some(SortKey::Firmware))),
            vec!["C", "A", "B"]
        );
    }

    #[test]
    fn test_sort_is_stable() {
        // A and C share a model and keep their id order.
        assert_eq!(
            ids(&list_all(&registry(), Some(SortKey::Model))),
            vec!["A", "C", "B"]
        );
    }

    #[test]
    fn test_listing_does_not_touch_registry() {
        let registry = registry();
        let before = registry.snapshot();

        let mut listed = list_all(&registry, Some(SortKey::Name));
        listed.clear();

        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn test_parse_accepts_aliases() {
        assert_eq!("Name".parse(), Ok(SortKey::Name));
        assert_eq!("type".parse(), Ok(SortKey::Model));
        assert_eq!("software".parse(), Ok(SortKey::Firmware));
        assert_eq!("update".parse(), Ok(SortKey::LastUpdate));
        assert_eq!(" last-update ".parse(), Ok(SortKey::LastUpdate));
        assert_eq!(
            "colour".parse::<SortKey>(),
            Err(UnknownSortKey("colour".to_string()))
        );
    }
}
