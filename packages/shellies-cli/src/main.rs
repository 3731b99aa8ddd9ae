//! Shellies CLI - headless agent keeping an inventory of Shelly devices fresh
//!
//! This binary can:
//! - Run as a foreground agent (for systemd integration)
//! - Poll a single device and add it to the inventory
//! - List the persisted inventory
//! - Show the resolved configuration

mod daemon;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use shellies_core::config::{self, AgentConfig};
use shellies_core::{
    DeviceFetcher, DeviceId, DeviceRecord, FetchError, HttpFetcher, MergeOutcome, Registry,
    SnapshotStore, SortKey, list_all,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "shellies")]
#[command(version)]
#[command(about = "Keeps an inventory of Shelly devices on the local network")]
#[command(long_about = "
Shellies polls Shelly devices over their local HTTP API and keeps a persisted
inventory of what it found, re-polling devices whose data goes stale.

Quick start:
  1. Add a device:      shellies add 192.168.1.40
  2. Show inventory:    shellies list --sort name
  3. Start the agent:   shellies run

'add' edits the snapshot file and is meant for when the agent is stopped.

Credentials are read from SHELLY_USERNAME / SHELLY_PASSWORD (or a .env file).
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent until SIGINT/SIGTERM
    #[command(alias = "daemon")]
    Run,

    /// Poll one device and add it to the inventory
    ///
    /// Rewrites the snapshot file directly, so use it while `shellies run` is
    /// stopped; a running agent would overwrite the result with its own state.
    /// To have a running agent poll a device, list it under [[discovery.hosts]].
    Add {
        /// Device address (IP or hostname, optionally with :port)
        host: String,

        /// Identifier to use if the device reports no MAC address
        #[arg(long)]
        id: Option<String>,
    },

    /// List the persisted inventory
    #[command(alias = "ls")]
    List {
        /// Sort by name, model, uptime, last-update or firmware
        #[arg(short, long)]
        sort: Option<SortKey>,

        /// Only show devices that are due for a refresh
        #[arg(long)]
        stale_only: bool,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Device credentials may live in a .env file next to the agent.
    dotenvy::dotenv().ok();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("shellies={},shellies_core={}", log_level, log_level).into()
            }),
        )
        .with_target(false)
        .init();

    let config = config::load_agent_config(cli.config.as_deref());

    match &cli.command {
        Commands::Run => daemon::run_daemon(config).await,
        Commands::Add { host, id } => cmd_add(&cli, &config, host, id.as_deref()).await,
        Commands::List { sort, stale_only } => cmd_list(&cli, &config, *sort, *stale_only),
        Commands::Config => cmd_config(&cli, &config),
    }
}

/// A record as printed by `list` and `add`
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListedDevice<'a> {
    #[serde(flatten)]
    record: &'a DeviceRecord,
    age_seconds: u64,
    stale: bool,
}

impl<'a> ListedDevice<'a> {
    fn new(record: &'a DeviceRecord, threshold: Duration) -> Self {
        let now = Utc::now();
        Self {
            record,
            age_seconds: record.age(now).as_secs(),
            stale: record.is_stale(threshold, now),
        }
    }
}

async fn cmd_add(cli: &Cli, config: &AgentConfig, host: &str, id: Option<&str>) -> Result<()> {
    let snapshots = SnapshotStore::new(&config.cache_file);
    let registry = Registry::from_records(snapshots.load());
    let fetcher = HttpFetcher::new(config.fetch_timeout, config.credentials.clone())?;

    let polled_at = Utc::now();
    let info = fetcher
        .fetch(host)
        .await
        .with_context(|| format!("Cannot get status of {}", host))?;

    let hint = id.unwrap_or(host);
    let device_id = DeviceId::resolve(&info, hint).ok_or_else(|| FetchError::Malformed {
        host: host.to_string(),
        endpoint: "status",
        reason: "device reported no usable identity".to_string(),
    })?;

    let outcome = registry.merge(device_id.clone(), info, polled_at);
    tracing::debug!("Merge of {} @ {}: {:?}", device_id, host, outcome);

    if outcome.is_applied() {
        snapshots
            .save_registry(&registry)
            .context("Failed to save device snapshot")?;
    }

    let record = registry
        .get(&device_id)
        .context("Device missing from registry after merge")?;

    match cli.format {
        OutputFormat::Text => {
            println!(
                "{} {} @ {} = {}",
                outcome_label(outcome),
                record.id,
                record.host,
                record.display_name
            );
            println!();
            print_table(&[&record], config.scheduler.staleness_threshold);
        }
        OutputFormat::Json => {
            let listed = ListedDevice::new(&record, config.scheduler.staleness_threshold);
            println!(
                "{}",
                serde_json::json!({
                    "outcome": outcome_key(outcome),
                    "device": listed,
                })
            );
        }
    }

    Ok(())
}

fn cmd_list(cli: &Cli, config: &AgentConfig, sort: Option<SortKey>, stale_only: bool) -> Result<()> {
    let snapshots = SnapshotStore::new(&config.cache_file);
    let registry = Registry::from_records(snapshots.load());
    let threshold = config.scheduler.staleness_threshold;
    let now = Utc::now();

    let records: Vec<DeviceRecord> = list_all(&registry, sort)
        .into_iter()
        .filter(|r| !stale_only || r.is_stale(threshold, now))
        .collect();

    match cli.format {
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No devices in {}", snapshots.path().display());
                return Ok(());
            }
            println!("{} devices:", records.len());
            println!();
            print_table(&records.iter().collect::<Vec<_>>(), threshold);
        }
        OutputFormat::Json => {
            let devices: Vec<ListedDevice<'_>> = records
                .iter()
                .map(|r| ListedDevice::new(r, threshold))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "snapshot": snapshots.path(),
                    "sort": sort.map(|s| s.as_str()),
                    "staleThresholdSecs": threshold.as_secs(),
                    "devices": devices,
                })
            );
        }
    }

    Ok(())
}

fn cmd_config(cli: &Cli, config: &AgentConfig) -> Result<()> {
    let config_path = config
        .file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(config::get_config_file_path_string);
    let interface = config.interface.as_deref().map(|iface| {
        match config::local_interface_address(iface) {
            Some(addr) => format!("{} ({})", iface, addr),
            None => format!("{} (not found, ignored)", iface),
        }
    });
    let scheduler = &config.scheduler;

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:        {}", config_path);
            println!("Source:             {}", config.source());
            println!("Snapshot file:      {}", config.cache_file.display());
            println!(
                "Device login:       {}",
                config
                    .credentials
                    .as_ref()
                    .map(|c| c.username.as_str())
                    .unwrap_or("-")
            );
            println!("Interface:          {}", interface.as_deref().unwrap_or("all"));
            println!("Static devices:     {}", config.static_hosts.len());
            println!("Check interval:     {}s", scheduler.check_interval.as_secs());
            println!("Stale after:        {}s", scheduler.staleness_threshold.as_secs());
            println!("Full refresh:       {}s", scheduler.full_refresh_interval.as_secs());
            println!("Concurrent polls:   {}", scheduler.max_concurrent_polls);
            println!("Fetch timeout:      {}s", config.fetch_timeout.as_secs());
            if !config.env_overrides.is_empty() {
                println!("Set by environment: {}", config.env_overrides.join(", "));
            }
            println!();
            println!("Environment variables:");
            println!("  {} / {} - Device login", config::ENV_USERNAME, config::ENV_PASSWORD);
            println!("  {} - Interface name or address", config::ENV_INTERFACE);
            println!("  {} - Override snapshot file", config::ENV_CACHE_FILE);
            println!("  {} - Override config file", config::ENV_CONFIG_FILE);
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "source": config.source().to_string(),
                    "cache_file": config.cache_file,
                    "username": config.credentials.as_ref().map(|c| &c.username),
                    "interface": interface,
                    "static_hosts": config.static_hosts.len(),
                    "check_interval_secs": scheduler.check_interval.as_secs(),
                    "staleness_threshold_secs": scheduler.staleness_threshold.as_secs(),
                    "full_refresh_interval_secs": scheduler.full_refresh_interval.as_secs(),
                    "max_concurrent_polls": scheduler.max_concurrent_polls,
                    "fetch_timeout_secs": config.fetch_timeout.as_secs(),
                    "env_overrides": config.env_overrides,
                })
            );
        }
    }

    Ok(())
}

fn outcome_label(outcome: MergeOutcome) -> &'static str {
    match outcome {
        MergeOutcome::Inserted => "Added",
        MergeOutcome::Updated => "Updated",
        MergeOutcome::Superseded => "Already newer, not updated:",
        MergeOutcome::Closed => "Not updated:",
    }
}

fn outcome_key(outcome: MergeOutcome) -> &'static str {
    match outcome {
        MergeOutcome::Inserted => "added",
        MergeOutcome::Updated => "updated",
        MergeOutcome::Superseded => "superseded",
        MergeOutcome::Closed => "closed",
    }
}

fn print_table(records: &[&DeviceRecord], threshold: Duration) {
    let now = Utc::now();
    println!(
        "  {:12} {:24} {:10} {:21} {:>9} {:22} {:>8}",
        "ID", "NAME", "MODEL", "HOST", "UPTIME", "FIRMWARE", "AGE"
    );
    for record in records {
        let age = format_duration(record.age(now).as_secs());
        let age = if record.is_stale(threshold, now) {
            format!("{}*", age)
        } else {
            age
        };
        println!(
            "  {:12} {:24} {:10} {:21} {:>9} {:22} {:>8}",
            record.id.as_str(),
            record.display_name,
            record.model,
            record.host,
            format_duration(record.uptime_seconds),
            format_firmware(record),
            age
        );
    }
}

/// Two most significant units, e.g. `3d 4h` or `12m 5s`
fn format_duration(secs: u64) -> String {
    let (days, hours, minutes, seconds) = (
        secs / 86_400,
        secs % 86_400 / 3_600,
        secs % 3_600 / 60,
        secs % 60,
    );
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn format_firmware(record: &DeviceRecord) -> String {
    let current = if record.firmware.current_version.is_empty() {
        "-"
    } else {
        record.firmware.current_version.as_str()
    };
    match &record.firmware.available_version {
        Some(next) if record.firmware.has_update => format!("{} -> {}", current, next),
        _ => current.to_string(),
    }
}
