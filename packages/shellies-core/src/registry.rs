//! The registry: the single authoritative map of device id → record.
//!
//! All mutation goes through [`Registry::merge`], which builds a fresh record value
//! and swaps it in under the write lock. Readers only ever get owned copies.

use crate::device::{DeviceId, DeviceInfo, DeviceRecord};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// What a merge did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First successful poll for this id
    Inserted,
    /// Existing record replaced
    Updated,
    /// Rejected: the record already holds a poll that started later
    Superseded,
    /// Rejected: the registry is shutting down
    Closed,
}

impl MergeOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Updated)
    }
}

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<DeviceId, DeviceRecord>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from persisted records. When an id appears more than once
    /// the copy with the newest `last_update` wins.
    pub fn from_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let mut devices: BTreeMap<DeviceId, DeviceRecord> = BTreeMap::new();

        for record in records {
            match devices.get(&record.id) {
                Some(existing) if existing.last_update >= record.last_update => {
                    tracing::debug!("Dropping older duplicate of {}", record.id);
                }
                _ => {
                    devices.insert(record.id.clone(), record);
                }
            }
        }

        Self {
            inner: RwLock::new(Inner {
                devices,
                closed: false,
            }),
        }
    }

    /// Upsert the result of a poll that started at `polled_at`.
    pub fn merge(&self, id: DeviceId, info: DeviceInfo, polled_at: DateTime<Utc>) -> MergeOutcome {
        self.merge_at(id, info, polled_at, Utc::now())
    }

    /// [`Registry::merge`] with an explicit merge time.
    pub fn merge_at(
        &self,
        id: DeviceId,
        info: DeviceInfo,
        polled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let mut inner = self.inner.write();

        if inner.closed {
            return MergeOutcome::Closed;
        }

        let previous = inner
            .devices
            .get(&id)
            .map(|r| (r.polled_at, r.last_update));

        match previous {
            Some((prev_polled_at, _)) if polled_at < prev_polled_at => {
                tracing::debug!(
                    "Ignoring poll of {} started at {}, record already has a poll from {}",
                    id,
                    polled_at.to_rfc3339(),
                    prev_polled_at.to_rfc3339()
                );
                MergeOutcome::Superseded
            }
            Some((_, prev_last_update)) => {
                let record =
                    DeviceRecord::from_poll(id.clone(), info, polled_at, now.max(prev_last_update));
                inner.devices.insert(id, record);
                MergeOutcome::Updated
            }
            None => {
                let record = DeviceRecord::from_poll(id.clone(), info, polled_at, now);
                inner.devices.insert(id, record);
                MergeOutcome::Inserted
            }
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.inner.read().devices.get(id).cloned()
    }

    /// Point-in-time copy of every record, ordered by id.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.inner.read().devices.values().cloned().collect()
    }

    pub fn ids(&self) -> BTreeSet<DeviceId> {
        self.inner.read().devices.keys().cloned().collect()
    }

    /// Ids whose last successful poll is more than `threshold` before `now`.
    pub fn ids_older_than(&self, threshold: Duration, now: DateTime<Utc>) -> BTreeSet<DeviceId> {
        self.inner
            .read()
            .devices
            .values()
            .filter(|r| r.is_stale(threshold, now))
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting merges. Reads keep working.
    pub fn close(&self) {
        self.inner.write().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FirmwareUpdateState;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn info(name: &str, uptime: u64) -> DeviceInfo {
        DeviceInfo {
            host: "10.0.0.5".to_string(),
            mac: None,
            display_name: name.to_string(),
            model: "SHPLG-S".to_string(),
            hardware_revision: Some("prod-2019-03".to_string()),
            firmware: FirmwareUpdateState {
                has_update: false,
                current_version: "v1.12.2".to_string(),
                available_version: None,
            },
            uptime_seconds: uptime,
        }
    }

    fn id(value: &str) -> DeviceId {
        DeviceId::from_hint(value).unwrap()
    }

    #[test]
    fn test_rediscovery_updates_single_record() {
        let registry = Registry::new();
        let t0 = Utc::now();

        let outcome = registry.merge_at(id("A"), info("Kitchen", 120), t0, t0);
        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id("A")).unwrap().uptime_seconds, 120);

        let t1 = t0 + ChronoDuration::seconds(30);
        let outcome = registry.merge_at(id("A"), info("Kitchen", 300), t1, t1);
        assert_eq!(outcome, MergeOutcome::Updated);
        assert_eq!(registry.len(), 1);

        let record = registry.get(&id("A")).unwrap();
        assert_eq!(record.uptime_seconds, 300);
        assert!(record.last_update > t0);
    }

    #[test]
    fn test_older_poll_does_not_overwrite_newer() {
        let registry = Registry::new();
        let started_early = Utc::now();
        let started_late = started_early + ChronoDuration::seconds(2);

        // The later poll completes first.
        registry.merge_at(id("A"), info("New", 300), started_late, started_late);
        let outcome = registry.merge_at(
            id("A"),
            info("Old", 120),
            started_early,
            started_late + ChronoDuration::seconds(1),
        );

        assert_eq!(outcome, MergeOutcome::Superseded);
        let record = registry.get(&id("A")).unwrap();
        assert_eq!(record.display_name, "New");
        assert_eq!(record.uptime_seconds, 300);
        assert_eq!(record.last_update, started_late);
    }

    #[test]
    fn test_identical_merge_only_moves_last_update() {
        let registry = Registry::new();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(10);

        registry.merge_at(id("A"), info("Kitchen", 120), t0, t0);
        let first = registry.get(&id("A")).unwrap();
        registry.merge_at(id("A"), info("Kitchen", 120), t1, t1);
        let second = registry.get(&id("A")).unwrap();

        assert_eq!(second.last_update, t1);
        assert_eq!(
            DeviceRecord {
                last_update: first.last_update,
                polled_at: first.polled_at,
                ..second
            },
            first
        );
    }

    #[test]
    fn test_last_update_never_regresses() {
        let registry = Registry::new();
        let t0 = Utc::now();

        registry.merge_at(id("A"), info("Kitchen", 1), t0, t0);
        // Wall clock stepped back between the two merges.
        registry.merge_at(id("A"), info("Kitchen", 2), t0, t0 - ChronoDuration::seconds(30));

        let record = registry.get(&id("A")).unwrap();
        assert_eq!(record.uptime_seconds, 2);
        assert_eq!(record.last_update, t0);
    }

    #[test]
    fn test_host_change_keeps_identity() {
        let registry = Registry::new();
        let t0 = Utc::now();

        registry.merge_at(id("A"), info("Kitchen", 1), t0, t0);
        let mut moved = info("Kitchen", 2);
        moved.host = "10.0.0.77".to_string();
        registry.merge_at(id("A"), moved, t0, t0);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id("A")).unwrap().host, "10.0.0.77");
    }

    #[test]
    fn test_closed_registry_rejects_merges() {
        let registry = Registry::new();
        let t0 = Utc::now();
        registry.merge_at(id("A"), info("Kitchen", 1), t0, t0);

        registry.close();
        assert!(registry.is_closed());
        assert_eq!(
            registry.merge_at(id("A"), info("Kitchen", 99), t0, t0),
            MergeOutcome::Closed
        );
        assert_eq!(
            registry.merge_at(id("B"), info("Hall", 1), t0, t0),
            MergeOutcome::Closed
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id("A")).unwrap().uptime_seconds, 1);
    }

    #[test]
    fn test_ids_older_than_selects_exactly_stale() {
        let registry = Registry::new();
        let now = Utc::now();

        for (name, age) in [("fresh", 10), ("edge", 60), ("stale", 61), ("ancient", 7200)] {
            let at = now - ChronoDuration::seconds(age);
            registry.merge_at(id(name), info(name, 1), at, at);
        }

        let stale = registry.ids_older_than(Duration::from_secs(60), now);
        assert_eq!(stale, BTreeSet::from([id("ancient"), id("stale")]));
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let registry = Registry::new();
        let t0 = Utc::now();
        registry.merge_at(id("B"), info("Hall", 1), t0, t0);
        registry.merge_at(id("A"), info("Kitchen", 1), t0, t0);

        let mut snapshot = registry.snapshot();
        assert_eq!(
            snapshot.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["A", "B"]
        );

        snapshot[0].display_name = "Tampered".to_string();
        snapshot.clear();
        assert_eq!(registry.get(&id("A")).unwrap().display_name, "Kitchen");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_from_records_keeps_newest_duplicate() {
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(5);
        let old = DeviceRecord::from_poll(id("A"), info("Old", 1), t0, t0);
        let new = DeviceRecord::from_poll(id("A"), info("New", 2), t1, t1);

        let registry = Registry::from_records([new.clone(), old.clone()]);
        assert_eq!(registry.snapshot(), vec![new.clone()]);

        let registry = Registry::from_records([old, new.clone()]);
        assert_eq!(registry.snapshot(), vec![new]);
    }

    #[test]
    fn test_concurrent_distinct_merges_are_not_lost() {
        let registry = Arc::new(Registry::new());
        let t0 = Utc::now();
        registry.merge_at(id("seed"), info("seed", 0), t0, t0);

        let writers = 16;
        std::thread::scope(|scope| {
            for n in 0..writers {
                let registry = registry.clone();
                scope.spawn(move || {
                    let name = format!("device-{n}");
                    registry.merge(id(&name), info(&name, n), Utc::now())
                });
            }

            for _ in 0..writers {
                let registry = registry.clone();
                scope.spawn(move || {
                    let size = registry.snapshot().len();
                    assert!((1..=writers as usize + 1).contains(&size));
                });
            }
        });

        assert_eq!(registry.len(), writers as usize + 1);
    }
}
