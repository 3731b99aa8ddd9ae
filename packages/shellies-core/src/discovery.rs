//! Discovery events and the channel that carries them to the reconciler.
//!
//! Sources (network listeners, the static host list, an operator's explicit add)
//! only ever hold a [`DiscoverySender`]. Events may arrive in any order and may
//! repeat; the reconciler treats each one as "poll this host now".

use serde::Deserialize;
use tokio::sync::mpsc;

/// Pending events before senders start waiting
pub const DISCOVERY_CHANNEL_CAPACITY: usize = 64;

/// A device was seen at `host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    /// Identifier announced by the source; used only when the device reports no MAC
    pub id_hint: String,
    pub host: String,
}

impl DiscoveryEvent {
    pub fn new(id_hint: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id_hint: id_hint.into(),
            host: host.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySender {
    tx: mpsc::Sender<DiscoveryEvent>,
}

impl DiscoverySender {
    /// Queue an event, waiting for room. Returns false once the reconciler is gone.
    pub async fn announce(&self, event: DiscoveryEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Queue an event without waiting. A full queue drops the event; the device
    /// will be picked up again by its next announcement or the staleness sweep.
    pub fn try_announce(&self, event: DiscoveryEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    "Discovery queue full, dropping {} @ {}",
                    event.id_hint,
                    event.host
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

pub fn channel() -> (DiscoverySender, mpsc::Receiver<DiscoveryEvent>) {
    channel_with_capacity(DISCOVERY_CHANNEL_CAPACITY)
}

pub fn channel_with_capacity(capacity: usize) -> (DiscoverySender, mpsc::Receiver<DiscoveryEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DiscoverySender { tx }, rx)
}

/// A device address pinned in configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticHost {
    pub host: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// Announce every configured host once. Returns how many were queued.
pub async fn announce_static_hosts(hosts: &[StaticHost], sender: &DiscoverySender) -> usize {
    let mut queued = 0;

    for entry in hosts {
        let host = entry.host.trim();
        if host.is_empty() {
            tracing::warn!("Skipping static device entry with empty host");
            continue;
        }

        let hint = entry.id.as_deref().unwrap_or(host);
        if !sender.announce(DiscoveryEvent::new(hint, host)).await {
            tracing::debug!("Reconciler stopped, not announcing remaining static hosts");
            break;
        }
        queued += 1;
    }

    if queued > 0 {
        tracing::info!("Announced {} configured devices", queued);
    }
    queued
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_hosts_use_host_as_default_hint() {
        let (sender, mut events) = channel();
        let hosts = vec![
            StaticHost {
                host: "10.0.0.5".to_string(),
                id: Some("shellyplug-s-345678".to_string()),
            },
            StaticHost {
                host: " ".to_string(),
                id: None,
            },
            StaticHost {
                host: "shelly1.lan".to_string(),
                id: None,
            },
        ];

        assert_eq!(announce_static_hosts(&hosts, &sender).await, 2);
        assert_eq!(
            events.recv().await,
            Some(DiscoveryEvent::new("shellyplug-s-345678", "10.0.0.5"))
        );
        assert_eq!(
            events.recv().await,
            Some(DiscoveryEvent::new("shelly1.lan", "shelly1.lan"))
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (sender, mut events) = channel_with_capacity(1);

        assert!(sender.try_announce(DiscoveryEvent::new("A", "10.0.0.5")));
        assert!(!sender.try_announce(DiscoveryEvent::new("B", "10.0.0.6")));
        assert_eq!(events.recv().await.map(|e| e.id_hint), Some("A".to_string()));
    }

    #[tokio::test]
    async fn test_announce_reports_closed_receiver() {
        let (sender, events) = channel();
        drop(events);

        assert!(!sender.announce(DiscoveryEvent::new("A", "10.0.0.5")).await);
        assert!(!sender.try_announce(DiscoveryEvent::new("A", "10.0.0.5")));
    }
}
