//! Shellies Core Library
//!
//! Keeps an always-fresh inventory of Shelly devices on the local network:
//! - Device polling over the devices' local HTTP API
//! - An in-memory registry keyed by hardware address, merged without lost updates
//! - Write-through JSON snapshots that survive restarts
//! - A reconciler that polls on discovery and re-polls stale devices
//!
//! # Example
//!
//! ```no_run
//! use shellies_core::{config, discovery, fetcher, persistence, registry, scheduler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_agent_config(None);
//!
//!     let snapshots = Arc::new(persistence::SnapshotStore::new(&config.cache_file));
//!     let registry = Arc::new(registry::Registry::from_records(snapshots.load()));
//!     let fetcher = fetcher::HttpFetcher::new(config.fetch_timeout, config.credentials.clone())?;
//!
//!     let reconciler = Arc::new(scheduler::Reconciler::new(
//!         registry,
//!         snapshots,
//!         fetcher,
//!         config.scheduler.clone(),
//!     ));
//!
//!     let (sender, events) = discovery::channel();
//!     let run = tokio::spawn(reconciler.clone().run(events));
//!     discovery::announce_static_hosts(&config.static_hosts, &sender).await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     reconciler.shutdown();
//!     run.await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod discovery;
pub mod fetcher;
pub mod persistence;
pub mod query;
pub mod registry;
pub mod scheduler;

// Re-export commonly used types
pub use config::{AgentConfig, ConfigSource};
pub use device::{DeviceId, DeviceInfo, DeviceRecord, FirmwareUpdateState};
pub use discovery::{DiscoveryEvent, DiscoverySender, StaticHost};
pub use fetcher::{Credentials, DeviceFetcher, FetchError, HttpFetcher};
pub use persistence::{PersistenceError, SnapshotStore};
pub use query::{SortKey, list_all};
pub use registry::{MergeOutcome, Registry};
pub use scheduler::{Reconciler, RefreshOutcome, SchedulerSettings, SweepReport};
