//! Device polling over the local HTTP API.
//!
//! A fetch issues two read-only requests (`/status`, `/settings`) and folds the
//! answers into a [`DeviceInfo`]. Failures come back as [`FetchError`]; there are no
//! retries here, the scheduler decides when to poll again.

pub mod wire;

use crate::device::DeviceInfo;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default per-request timeout
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a poll produced no result. Always transient from the registry's view.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The device did not answer within the configured timeout
    #[error("{host}: request timed out")]
    Timeout { host: String },

    /// Connection refused, reset, DNS failure and the like
    #[error("{host}: network error: {source}")]
    Network {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    /// The device answered with a non-success status
    #[error("{host}: /{endpoint} returned {status}")]
    Status {
        host: String,
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },

    /// The body could not be decoded into the expected payload
    #[error("{host}: malformed /{endpoint} response: {reason}")]
    Malformed {
        host: String,
        endpoint: &'static str,
        reason: String,
    },
}

impl FetchError {
    pub fn host(&self) -> &str {
        match self {
            FetchError::Timeout { host }
            | FetchError::Network { host, .. }
            | FetchError::Status { host, .. }
            | FetchError::Malformed { host, .. } => host,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// Source of device snapshots.
#[async_trait]
pub trait DeviceFetcher: Send + Sync {
    async fn fetch(&self, host: &str) -> Result<DeviceInfo, FetchError>;
}

#[async_trait]
impl<T: DeviceFetcher + ?Sized> DeviceFetcher for Arc<T> {
    async fn fetch(&self, host: &str) -> Result<DeviceInfo, FetchError> {
        (**self).fetch(host).await
    }
}

/// Login for devices with restricted local access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// [`DeviceFetcher`] talking plain HTTP to the device.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, credentials: Option<Credentials>) -> Result<Self> {
        // Devices live on the local network; never route them through a proxy.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            credentials,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        host: &str,
        endpoint: &'static str,
    ) -> Result<T, FetchError> {
        let url = format!("http://{}/{}", host, endpoint);

        let mut request = self.client.get(&url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let resp = request.send().await.map_err(|e| classify(host, e))?;

        if !resp.status().is_success() {
            return Err(FetchError::Status {
                host: host.to_string(),
                endpoint,
                status: resp.status(),
            });
        }

        let body = resp.bytes().await.map_err(|e| classify(host, e))?;

        serde_json::from_slice(&body).map_err(|e| FetchError::Malformed {
            host: host.to_string(),
            endpoint,
            reason: e.to_string(),
        })
    }
}

fn classify(host: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            host: host.to_string(),
        }
    } else {
        FetchError::Network {
            host: host.to_string(),
            source: error,
        }
    }
}

#[async_trait]
impl DeviceFetcher for HttpFetcher {
    async fn fetch(&self, host: &str) -> Result<DeviceInfo, FetchError> {
        let status: wire::ShellyStatus = self.get_json(host, "status").await?;
        let settings: wire::ShellySettings = self.get_json(host, "settings").await?;

        let info = wire::normalize(host, status, settings);
        tracing::debug!(
            "Polled {} ({}): uptime {}s, firmware {}",
            host,
            info.display_name,
            info.uptime_seconds,
            info.firmware.current_version
        );

        Ok(info)
    }
}
