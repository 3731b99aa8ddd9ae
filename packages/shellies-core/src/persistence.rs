//! Snapshot persistence for the device registry.
//!
//! The file is read once at startup and rewritten in full after every applied
//! merge. It is never the source of truth while the process runs.

use crate::device::DeviceRecord;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR: &str = "shellies";
const SNAPSHOT_FILE: &str = "devices.json";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Could not find data directory")]
    NoDataDir,

    #[error("Failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// On-disk layout. `savedAt` is informational and not read back.
#[derive(Debug, Deserialize)]
struct SnapshotFile {
    devices: Vec<DeviceRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFileRef<'a> {
    saved_at: DateTime<Utc>,
    devices: &'a [DeviceRecord],
}

/// `<data dir>/shellies/devices.json`
pub fn default_snapshot_path() -> Result<PathBuf, PersistenceError> {
    dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .map(|dir| dir.join(APP_DIR).join(SNAPSHOT_FILE))
        .ok_or(PersistenceError::NoDataDir)
}

/// Single owner of the snapshot file.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    // Held across snapshot + write so the newest state is always written last.
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is an empty inventory, not an error.
    pub fn try_load(&self) -> Result<Vec<DeviceRecord>, PersistenceError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No snapshot at {:?}, starting empty", self.path);
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let file: SnapshotFile =
            serde_json::from_str(&content).map_err(|source| PersistenceError::Parse {
                path: self.path.clone(),
                source,
            })?;

        Ok(file.devices)
    }

    /// Startup load: any failure degrades to an empty inventory with a warning.
    pub fn load(&self) -> Vec<DeviceRecord> {
        match self.try_load() {
            Ok(devices) => {
                tracing::info!("Loaded {} devices from {:?}", devices.len(), self.path);
                devices
            }
            Err(e) => {
                tracing::warn!("Ignoring device snapshot: {}", e);
                Vec::new()
            }
        }
    }

    /// Write exactly these records.
    pub fn save(&self, records: &[DeviceRecord]) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        self.write_snapshot(records)
    }

    /// Write the registry's current contents. Returns the number of records written.
    pub fn save_registry(&self, registry: &Registry) -> Result<usize, PersistenceError> {
        let _guard = self.write_lock.lock();
        let snapshot = registry.snapshot();
        self.write_snapshot(&snapshot)?;
        Ok(snapshot.len())
    }

    fn write_snapshot(&self, records: &[DeviceRecord]) -> Result<(), PersistenceError> {
        let write_err = |source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let content = serde_json::to_string_pretty(&SnapshotFileRef {
            saved_at: Utc::now(),
            devices: records,
        })?;

        // Readers only ever see the old file or the complete new one.
        let tmp = self.tmp_path();
        fs::write(&tmp, content).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            write_err(e)
        })?;

        tracing::debug!("Saved snapshot: {} devices", records.len());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }
}
