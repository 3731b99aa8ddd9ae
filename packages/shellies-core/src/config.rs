//! Agent configuration.
//!
//! Each setting is resolved independently with priority:
//! 1. Environment variable
//! 2. Config file (`$SHELLIES_CONFIG` or `~/.config/shellies/config.toml`)
//! 3. Default value
//!
//! Bad values never stop the agent; they are logged and replaced by the default.

use crate::discovery::StaticHost;
use crate::fetcher::{Credentials, DEFAULT_FETCH_TIMEOUT};
use crate::persistence::default_snapshot_path;
use crate::scheduler::SchedulerSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an alternate config file
pub const ENV_CONFIG_FILE: &str = "SHELLIES_CONFIG";
pub const ENV_USERNAME: &str = "SHELLY_USERNAME";
pub const ENV_PASSWORD: &str = "SHELLY_PASSWORD";
/// Network interface name or local address to listen for devices on
pub const ENV_INTERFACE: &str = "SHELLY_IFACE";
pub const ENV_CACHE_FILE: &str = "SHELLIES_CACHE_FILE";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    auth: Option<AuthSection>,
    registry: Option<RegistrySection>,
    discovery: Option<DiscoverySection>,
}

#[derive(Debug, Deserialize, Default)]
struct AuthSection {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RegistrySection {
    cache_file: Option<PathBuf>,
    staleness_threshold_secs: Option<u64>,
    check_interval_secs: Option<u64>,
    full_refresh_interval_secs: Option<u64>,
    max_concurrent_polls: Option<usize>,
    fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DiscoverySection {
    interface: Option<String>,
    #[serde(default)]
    hosts: Vec<StaticHost>,
}

/// Where the configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// At least one value came from the environment
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Runtime agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Login sent to every device, if set
    pub credentials: Option<Credentials>,
    pub cache_file: PathBuf,
    /// Interface name or address as configured, unresolved
    pub interface: Option<String>,
    pub static_hosts: Vec<StaticHost>,
    pub scheduler: SchedulerSettings,
    pub fetch_timeout: Duration,
    /// Config file that was read, if any
    pub file: Option<PathBuf>,
    /// Environment variables that overrode a value
    pub env_overrides: Vec<&'static str>,
}

impl AgentConfig {
    /// Highest-priority layer that contributed a value
    pub fn source(&self) -> ConfigSource {
        if !self.env_overrides.is_empty() {
            ConfigSource::Environment
        } else if self.file.is_some() {
            ConfigSource::ConfigFile
        } else {
            ConfigSource::Default
        }
    }
}

/// Get the path to the configuration file
pub fn get_config_file_path() -> Option<PathBuf> {
    if let Some(path) = non_blank(std::env::var(ENV_CONFIG_FILE).ok()) {
        return Some(PathBuf::from(path));
    }

    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("shellies").join("config.toml"))
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/shellies/config.toml".to_string())
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

/// Load the config file, warning about and skipping one that cannot be used
fn load_config_file(path: &Path) -> Option<ConfigFile> {
    if !path.exists() {
        tracing::debug!("No config file at {:?}", path);
        return None;
    }

    match read_config_file(path) {
        Ok(config) => {
            tracing::debug!("Loaded config from {:?}", path);
            Some(config)
        }
        Err(e) => {
            tracing::warn!("Ignoring config file: {:#}", e);
            None
        }
    }
}

/// Load the agent configuration from the environment, `explicit` (or the default
/// config file location) and the built-in defaults.
pub fn load_agent_config(explicit: Option<&Path>) -> AgentConfig {
    let path = explicit.map(Path::to_path_buf).or_else(get_config_file_path);
    let file = path.as_deref().and_then(load_config_file);
    let used = file.as_ref().and(path);

    build(file, used, |key| std::env::var(key).ok())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Seconds → duration, with zero treated as unset.
fn positive_secs(field: &str, value: Option<u64>, default: Duration) -> Duration {
    match value {
        Some(0) => {
            tracing::warn!("{} must be positive, using {}s", field, default.as_secs());
            default
        }
        Some(secs) => Duration::from_secs(secs),
        None => default,
    }
}

fn build(
    file: Option<ConfigFile>,
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> AgentConfig {
    let file = file.unwrap_or_default();
    let auth = file.auth.unwrap_or_default();
    let registry = file.registry.unwrap_or_default();
    let discovery = file.discovery.unwrap_or_default();
    let mut env_overrides = Vec::new();

    let mut from_env = |key: &'static str| {
        let value = non_blank(env(key));
        if value.is_some() {
            env_overrides.push(key);
        }
        value
    };

    let username = from_env(ENV_USERNAME).or_else(|| non_blank(auth.username));
    let interface = from_env(ENV_INTERFACE).or_else(|| non_blank(discovery.interface));

    let cache_file = from_env(ENV_CACHE_FILE)
        .map(PathBuf::from)
        .or(registry.cache_file)
        .or_else(|| match default_snapshot_path() {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("{}, keeping device snapshot in the working directory", e);
                None
            }
        })
        .unwrap_or_else(|| PathBuf::from("devices.json"));

    // Passwords are taken verbatim and only matter alongside a username.
    let credentials = username.map(|username| {
        let password = match env(ENV_PASSWORD) {
            Some(password) => {
                env_overrides.push(ENV_PASSWORD);
                password
            }
            None => auth.password.unwrap_or_default(),
        };
        Credentials { username, password }
    });

    let defaults = SchedulerSettings::default();
    let max_concurrent_polls = match registry.max_concurrent_polls {
        Some(0) => {
            tracing::warn!(
                "max_concurrent_polls must be positive, using {}",
                defaults.max_concurrent_polls
            );
            defaults.max_concurrent_polls
        }
        Some(n) => n,
        None => defaults.max_concurrent_polls,
    };

    let scheduler = SchedulerSettings {
        check_interval: positive_secs(
            "check_interval_secs",
            registry.check_interval_secs,
            defaults.check_interval,
        ),
        staleness_threshold: positive_secs(
            "staleness_threshold_secs",
            registry.staleness_threshold_secs,
            defaults.staleness_threshold,
        ),
        full_refresh_interval: positive_secs(
            "full_refresh_interval_secs",
            registry.full_refresh_interval_secs,
            defaults.full_refresh_interval,
        ),
        max_concurrent_polls,
    };

    let fetch_timeout = positive_secs(
        "fetch_timeout_secs",
        registry.fetch_timeout_secs,
        DEFAULT_FETCH_TIMEOUT,
    );

    AgentConfig {
        credentials,
        cache_file,
        interface,
        static_hosts: discovery.hosts,
        scheduler,
        fetch_timeout,
        file: path,
        env_overrides,
    }
}

/// Resolve a configured interface against `(name, address)` pairs.
///
/// A matching interface name yields its first address; otherwise the value must be
/// one of the local addresses. Anything else is ignored.
pub fn resolve_interface(configured: &str, interfaces: &[(String, IpAddr)]) -> Option<IpAddr> {
    let configured = configured.trim();

    if let Some((_, addr)) = interfaces.iter().find(|(name, _)| name == configured) {
        return Some(*addr);
    }

    let wanted: IpAddr = configured.parse().ok()?;
    interfaces
        .iter()
        .map(|(_, addr)| *addr)
        .find(|addr| *addr == wanted)
}

/// Resolve the configured interface against this host's network interfaces.
pub fn local_interface_address(configured: &str) -> Option<IpAddr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::warn!("Failed to list network interfaces: {}", e);
            return None;
        }
    };

    let resolved = resolve_interface(configured, &interfaces);
    if resolved.is_none() {
        tracing::warn!(
            "Ignoring unknown network interface name or address {}",
            configured
        );
    }
    resolved
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# Shellies Agent Configuration
# Place this file at: ~/.config/shellies/config.toml
# or point SHELLIES_CONFIG at it.

[auth]
# Login for devices with restricted local access
# (overridden by SHELLY_USERNAME / SHELLY_PASSWORD)
# username = "admin"
# password = "secret"

[registry]
# Snapshot file (overridden by SHELLIES_CACHE_FILE)
# cache_file = "/var/lib/shellies/devices.json"
# staleness_threshold_secs = 60
# check_interval_secs = 5
# full_refresh_interval_secs = 21600
# max_concurrent_polls = 4
# fetch_timeout_secs = 5

[discovery]
# Interface name or local address (overridden by SHELLY_IFACE)
# interface = "eth0"

# Devices to poll at startup
# [[discovery.hosts]]
# host = "192.168.1.40"
# id = "shellyplug-s-345678"
"#
    .to_string()
}
