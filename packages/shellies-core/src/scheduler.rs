//! Reconciliation: keeps the registry fresh.
//!
//! Two triggers feed the same fetch → merge → save path:
//! - discovery events, polled as soon as they arrive
//! - a periodic staleness sweep, plus a slow full refresh of every known device
//!
//! A single semaphore caps in-flight fetches across both triggers, and a host is
//! never polled twice at once. Fetch failures are logged and leave the registry
//! untouched.

use crate::device::DeviceId;
use crate::discovery::DiscoveryEvent;
use crate::fetcher::{DeviceFetcher, FetchError};
use crate::persistence::SnapshotStore;
use crate::registry::{MergeOutcome, Registry};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(60);
pub const DEFAULT_FULL_REFRESH_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_MAX_CONCURRENT_POLLS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// How often to look for stale records
    pub check_interval: Duration,
    /// Age after which a record is re-polled
    pub staleness_threshold: Duration,
    /// How often every known record is re-polled regardless of age
    pub full_refresh_interval: Duration,
    /// Upper bound on simultaneous fetches
    pub max_concurrent_polls: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
            full_refresh_interval: DEFAULT_FULL_REFRESH_INTERVAL,
            max_concurrent_polls: DEFAULT_MAX_CONCURRENT_POLLS,
        }
    }
}

/// Result of one refresh attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Fetched and handed to the registry
    Merged(MergeOutcome),
    /// Another poll of the same host is running
    AlreadyInFlight,
    /// Shutdown began before the poll finished
    Cancelled,
    /// The id is not in the registry
    Unknown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub selected: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Marks a host as being polled until dropped.
struct InFlight<'a> {
    hosts: &'a Mutex<HashSet<String>>,
    host: String,
}

impl<'a> InFlight<'a> {
    fn claim(hosts: &'a Mutex<HashSet<String>>, host: &str) -> Option<Self> {
        if hosts.lock().insert(host.to_string()) {
            Some(Self {
                hosts,
                host: host.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.hosts.lock().remove(&self.host);
    }
}

pub struct Reconciler<F> {
    registry: Arc<Registry>,
    snapshots: Arc<SnapshotStore>,
    fetcher: F,
    settings: SchedulerSettings,
    permits: Semaphore,
    in_flight: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl<F: DeviceFetcher + 'static> Reconciler<F> {
    pub fn new(
        registry: Arc<Registry>,
        snapshots: Arc<SnapshotStore>,
        fetcher: F,
        settings: SchedulerSettings,
    ) -> Self {
        let permits = Semaphore::new(settings.max_concurrent_polls.max(1));
        Self {
            registry,
            snapshots,
            fetcher,
            settings,
            permits,
            in_flight: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie this reconciler to an externally owned shutdown token.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Stop accepting merges, then cancel in-flight polls.
    pub fn shutdown(&self) {
        self.registry.close();
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn handle_discovery(&self, event: &DiscoveryEvent) -> Result<RefreshOutcome, FetchError> {
        tracing::debug!("Discovered {} @ {}", event.id_hint, event.host);
        self.refresh(&event.id_hint, &event.host).await
    }

    /// Poll `host` and merge the result. `id_hint` names the device only if it
    /// reports no hardware address.
    pub async fn refresh(&self, id_hint: &str, host: &str) -> Result<RefreshOutcome, FetchError> {
        let Some(_claim) = InFlight::claim(&self.in_flight, host) else {
            tracing::debug!("Poll of {} already running, skipping", host);
            return Ok(RefreshOutcome::AlreadyInFlight);
        };

        let _permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(RefreshOutcome::Cancelled),
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(RefreshOutcome::Cancelled),
            },
        };

        let polled_at = Utc::now();
        let info = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(RefreshOutcome::Cancelled),
            result = self.fetcher.fetch(host) => result?,
        };

        let Some(id) = DeviceId::resolve(&info, id_hint) else {
            return Err(FetchError::Malformed {
                host: host.to_string(),
                endpoint: "status",
                reason: "device reported no usable identity".to_string(),
            });
        };

        let name = info.display_name.clone();
        let outcome = self.registry.merge(id.clone(), info, polled_at);

        match outcome {
            MergeOutcome::Inserted => tracing::info!("Adding {} @ {} = {}", id, host, name),
            MergeOutcome::Updated => tracing::debug!("Found {} @ {} = {}", id, host, name),
            MergeOutcome::Superseded => {
                tracing::debug!("Newer poll of {} already merged, dropping result", id)
            }
            MergeOutcome::Closed => {
                tracing::debug!("Registry closed, discarding poll of {}", id);
                return Ok(RefreshOutcome::Cancelled);
            }
        }

        if outcome.is_applied() {
            self.persist();
        }

        Ok(RefreshOutcome::Merged(outcome))
    }

    /// Re-poll a known device at its last known host.
    pub async fn refresh_known(&self, id: &DeviceId) -> Result<RefreshOutcome, FetchError> {
        let Some(host) = self.registry.get(id).map(|r| r.host) else {
            return Ok(RefreshOutcome::Unknown);
        };
        self.refresh(id.as_str(), &host).await
    }

    /// Re-poll the given ids. Failures are logged and counted, never propagated.
    pub async fn sweep(&self, ids: impl IntoIterator<Item = DeviceId>) -> SweepReport {
        let ids: Vec<DeviceId> = ids.into_iter().collect();
        let mut report = SweepReport {
            selected: ids.len(),
            ..SweepReport::default()
        };

        let polls = ids.iter().map(|id| async move { (id, self.refresh_known(id).await) });
        let results = futures::future::join_all(polls).await;

        for (id, result) in results {
            match result {
                Ok(RefreshOutcome::Merged(outcome)) if outcome.is_applied() => report.refreshed += 1,
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!("Failed to refresh {}: {}", id, e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Re-poll every record older than the staleness threshold.
    pub async fn sweep_stale(&self) -> SweepReport {
        let stale = self
            .registry
            .ids_older_than(self.settings.staleness_threshold, Utc::now());

        if !stale.is_empty() {
            tracing::debug!("{} devices are stale, refreshing", stale.len());
        }

        self.sweep(stale).await
    }

    pub async fn sweep_all(&self) -> SweepReport {
        let ids = self.registry.ids();
        tracing::info!("Running full refresh of {} devices", ids.len());
        self.sweep(ids).await
    }

    fn persist(&self) {
        if let Err(e) = self.snapshots.save_registry(&self.registry) {
            tracing::warn!("Failed to save device snapshot: {}", e);
        }
    }

    /// Consume discovery events and run the periodic sweeps until shutdown.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) {
        let mut check = interval(self.settings.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let full_every = self.settings.full_refresh_interval;
        let mut full_refresh = interval_at(Instant::now() + full_every, full_every);
        full_refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut events_open = true;

        tracing::info!(
            "Reconciler started: {} devices, stale after {}s, at most {} concurrent polls",
            self.registry.len(),
            self.settings.staleness_threshold.as_secs(),
            self.settings.max_concurrent_polls.max(1)
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        let this = self.clone();
                        tasks.spawn(async move {
                            if let Err(e) = this.handle_discovery(&event).await {
                                tracing::warn!("Cannot get status of {} @ {}: {}", event.id_hint, event.host, e);
                            }
                        });
                    }
                    None => {
                        tracing::debug!("Discovery channel closed");
                        events_open = false;
                    }
                },
                _ = check.tick() => {
                    let this = self.clone();
                    tasks.spawn(async move {
                        let report = this.sweep_stale().await;
                        if report.selected > 0 {
                            tracing::debug!("Staleness sweep: {:?}", report);
                        }
                    });
                }
                _ = full_refresh.tick() => {
                    let this = self.clone();
                    tasks.spawn(async move {
                        let report = this.sweep_all().await;
                        tracing::info!(
                            "Full refresh done: {} refreshed, {} failed",
                            report.refreshed,
                            report.failed
                        );
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Refresh task failed: {}", e);
                    }
                }
            }
        }

        self.registry.close();
        tracing::info!("Reconciler stopping, waiting for {} tasks", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Refresh task failed: {}", e);
            }
        }
        tracing::info!("Reconciler stopped");
    }
}
