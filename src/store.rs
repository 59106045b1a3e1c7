use chrono::Utc;
use error_stack::{Result, ResultExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::stage::model::{Device, EffectDef, Group, Scene, SequenceDef};

const BACKUP_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Context(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Devices,
    Scenes,
    Groups,
    Effects,
    Sequences,
}

impl StoreKind {
    fn file_stem(self) -> &'static str {
        match self {
            StoreKind::Devices => "dmx_config",
            StoreKind::Scenes => "dmx_scenes",
            StoreKind::Groups => "dmx_groups",
            StoreKind::Effects => "dmx_effects",
            StoreKind::Sequences => "dmx_sequences",
        }
    }

    fn label(self) -> &'static str {
        match self {
            StoreKind::Devices => "devices",
            StoreKind::Scenes => "scenes",
            StoreKind::Groups => "groups",
            StoreKind::Effects => "effects",
            StoreKind::Sequences => "sequences",
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadedState {
    pub devices: Vec<Device>,
    pub scenes: Vec<Scene>,
    pub groups: Vec<Group>,
    pub effects: Vec<EffectDef>,
    pub sequences: Vec<SequenceDef>,
}

/// JSON file store for the five model collections. Every save replaces the
/// file atomically (write-temp-then-rename) after copying the previous
/// contents into a timestamped backup; backups are kept for seven days.
/// A corrupt primary file falls back to the newest backup on load.
#[derive(Debug)]
pub struct Store {
    data_dir: PathBuf,
    backup_dir: PathBuf,
}

impl Store {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Store, StoreError> {
        let data_dir = data_dir.into();
        let backup_dir = data_dir.join("backups");

        fs::create_dir_all(&backup_dir).change_context_lazy(|| {
            StoreError::Context(format!("Creating data directory {}", data_dir.display()))
        })?;

        Ok(Store {
            data_dir,
            backup_dir,
        })
    }

    pub fn load_all(&self) -> LoadedState {
        LoadedState {
            devices: self.safe_load(StoreKind::Devices),
            scenes: self.safe_load(StoreKind::Scenes),
            groups: self.safe_load(StoreKind::Groups),
            effects: self.safe_load(StoreKind::Effects),
            sequences: self.safe_load(StoreKind::Sequences),
        }
    }

    /// Persist one collection. Errors are logged and absorbed; the caller
    /// keeps its in-memory state and retries on the next save.
    pub fn save(&self, kind: StoreKind, data: &impl Serialize) -> bool {
        match self.try_save(kind, data) {
            Ok(()) => {
                debug!("{} saved successfully", kind.label());
                true
            }
            Err(e) => {
                error!("Failed to save {}: {:?}", kind.label(), e);
                false
            }
        }
    }

    fn file_path(&self, kind: StoreKind) -> PathBuf {
        self.data_dir.join(format!("{}.json", kind.file_stem()))
    }

    fn safe_load<T: DeserializeOwned>(&self, kind: StoreKind) -> Vec<T> {
        let path = self.file_path(kind);

        match read_json::<Vec<T>>(&path) {
            Ok(Some(data)) => {
                info!("Loaded {} {}", data.len(), kind.label());
                data
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("Error loading {}: {:?}", path.display(), e);
                self.restore_from_backup(kind)
            }
        }
    }

    fn restore_from_backup<T: DeserializeOwned>(&self, kind: StoreKind) -> Vec<T> {
        let newest = match self.newest_backup(kind) {
            Some(path) => path,
            None => return Vec::new(),
        };

        info!("Attempting to restore from backup: {}", newest.display());
        match read_json::<Vec<T>>(&newest) {
            Ok(Some(data)) => {
                info!("Successfully restored {} from backup", kind.label());
                data
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("Backup restore failed: {:?}", e);
                Vec::new()
            }
        }
    }

    fn newest_backup(&self, kind: StoreKind) -> Option<PathBuf> {
        let prefix = format!("{}_", kind.file_stem());

        let entries = fs::read_dir(&self.backup_dir).ok()?;
        let mut backups: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(&prefix) && n.ends_with(".json"))
            })
            .collect();

        // Timestamped names sort chronologically.
        backups.sort();
        backups.pop()
    }

    fn try_save(&self, kind: StoreKind, data: &impl Serialize) -> Result<(), StoreError> {
        let into_context =
            || StoreError::Context(format!("Saving {}", kind.label()));

        let path = self.file_path(kind);

        if let Err(e) = self.backup(&path, kind) {
            warn!("Backup creation failed for {}: {:?}", path.display(), e);
        }

        let payload = serde_json::to_vec_pretty(data)
            .map_err(|e| StoreError::Context(format!("Serializing {}: {}", kind.label(), e)))?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, payload).change_context_lazy(into_context)?;
        fs::rename(&temp_path, &path).change_context_lazy(into_context)?;

        Ok(())
    }

    fn backup(&self, path: &Path, kind: StoreKind) -> Result<(), StoreError> {
        if !path.exists() {
            return Ok(());
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup_name = format!("{}_{}.json", kind.file_stem(), timestamp);

        fs::copy(path, self.backup_dir.join(&backup_name)).change_context_lazy(|| {
            StoreError::Context(format!("Creating backup {}", backup_name))
        })?;
        debug!("Backup created: {}", backup_name);

        self.cleanup_old_backups(kind);
        Ok(())
    }

    fn cleanup_old_backups(&self, kind: StoreKind) {
        let prefix = format!("{}_", kind.file_stem());

        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Backup cleanup failed: {}", e);
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }

            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .map_or(false, |age| age > BACKUP_RETENTION);

            if expired {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("Could not delete old backup {}: {}", name, e);
                } else {
                    info!("Deleted old backup: {}", name);
                }
            }
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read(path)
        .change_context_lazy(|| StoreError::Context(format!("Reading {}", path.display())))?;
    let data = serde_json::from_slice(&contents).map_err(|e| {
        error_stack::Report::new(StoreError::Context(format!(
            "JSON decode error in {}: {}",
            path.display(),
            e
        )))
    })?;

    Ok(Some(data))
}
