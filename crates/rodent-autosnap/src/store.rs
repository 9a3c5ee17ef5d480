//! Policy store
//!
//! Durable YAML aggregate of policies and monitors. Saves go through a
//! temporary sibling plus rename so readers never observe a partial write;
//! corrupt or partially valid files are quarantined as `.error.<ts>`
//! siblings and the engine restarts from what survives.

use crate::policy::PersistedConfig;
use crate::validate::validate_policy;
use chrono::Utc;
use rodent_core::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// File name of the aggregate inside the configuration directory.
pub const CONFIG_FILE: &str = "zfs.snapshots.rodent.yml";

/// Durable store for the policy aggregate.
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Store rooted at the given configuration directory.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: config_dir.into().join(CONFIG_FILE),
            write_lock: Mutex::new(()),
        }
    }

    /// Stable on-disk location of the aggregate.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the aggregate.
    ///
    /// Absent file: an empty aggregate is created and returned. Corrupt
    /// file: quarantined, empty aggregate returned. Partially valid file:
    /// the original is quarantined and only valid policies survive.
    pub fn load(&self) -> Result<PersistedConfig> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        if !self.path.exists() {
            let empty = PersistedConfig::default();
            self.save(&empty)?;
            info!("Created empty policy store at {}", self.path.display());
            return Ok(empty);
        }

        let raw = fs::read_to_string(&self.path)?;
        let mut config: PersistedConfig = match serde_yaml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Policy store at {} is corrupt ({}), quarantining",
                    self.path.display(),
                    e
                );
                self.quarantine();
                let empty = PersistedConfig::default();
                self.save(&empty)?;
                return Ok(empty);
            }
        };

        let dropped = Self::drop_invalid_policies(&mut config);
        if dropped > 0 {
            warn!(
                "Policy store at {} held {} invalid policies, quarantining original",
                self.path.display(),
                dropped
            );
            self.quarantine_copy();
            self.save(&config)?;
        }

        Ok(config)
    }

    /// Persist the aggregate: backup the live file best-effort, then write a
    /// temporary sibling and atomically rename it into place.
    pub fn save(&self, config: &PersistedConfig) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| {
            Error::persistence("policy store lock poisoned")
        })?;

        let serialized = serde_yaml::to_string(&config.persistable())?;
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::persistence("policy store path has no parent directory"))?;
        fs::create_dir_all(dir)?;

        if self.path.exists() {
            let backup = sibling(&self.path, "backup");
            if let Err(e) = fs::copy(&self.path, &backup) {
                warn!("Failed to write backup {}: {}", backup.display(), e);
            }
        }

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| Error::persistence(format!("create temporary store file: {}", e)))?;
        tmp.write_all(serialized.as_bytes())
            .map_err(|e| Error::persistence(format!("write temporary store file: {}", e)))?;
        tmp.flush()
            .map_err(|e| Error::persistence(format!("flush temporary store file: {}", e)))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::persistence(format!("replace policy store: {}", e)))?;

        Ok(())
    }

    /// Move the live file aside as `.error.<ts>`. Failures are logged only.
    fn quarantine(&self) {
        let target = sibling(&self.path, "error");
        if let Err(e) = fs::rename(&self.path, &target) {
            warn!("Failed to quarantine {}: {}", self.path.display(), e);
        } else {
            info!("Quarantined policy store to {}", target.display());
        }
    }

    /// Copy the live file to `.error.<ts>`, leaving the original in place
    /// for the follow-up rewrite.
    fn quarantine_copy(&self) {
        let target = sibling(&self.path, "error");
        if let Err(e) = fs::copy(&self.path, &target) {
            warn!("Failed to quarantine {}: {}", self.path.display(), e);
        } else {
            info!("Quarantined policy store to {}", target.display());
        }
    }

    /// Drop policies that fail validation or reuse an id. Returns how many
    /// were dropped; orphaned monitors go with them.
    fn drop_invalid_policies(config: &mut PersistedConfig) -> usize {
        let before = config.policies.len();
        let mut seen = HashSet::new();
        config.policies.retain(|policy| {
            if !seen.insert(policy.id) {
                warn!("Dropping policy with duplicate id {}", policy.id);
                return false;
            }
            match validate_policy(policy) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Dropping invalid policy {} ({}): {}", policy.id, policy.name, e);
                    false
                }
            }
        });

        let ids: HashSet<_> = config.policies.iter().map(|p| p.id).collect();
        config.monitors.retain(|id, _| ids.contains(id));

        before - config.policies.len()
    }
}

fn sibling(path: &Path, label: &str) -> PathBuf {
    let ts = Utc::now().format("%Y-%m-%d-%H%M%S");
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}.{}", label, ts));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ScheduleKind, ScheduleSpec, SnapshotPolicy};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn sample_policy(name: &str) -> SnapshotPolicy {
        SnapshotPolicy {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            dataset: "tank/data".to_string(),
            schedules: vec![ScheduleSpec::new(ScheduleKind::Hourly { interval: 1 })],
            recursive: false,
            snap_name_pattern: "autosnap-%Y".to_string(),
            retention_policy: Default::default(),
            properties: HashMap::new(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_at: None,
            last_run_status: String::new(),
            last_run_error: String::new(),
            monitor_status: None,
        }
    }

    #[test]
    fn test_load_creates_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let config = store.load().unwrap();
        assert!(config.policies.is_empty());
        assert!(store.path().exists());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let mut config = PersistedConfig::default();
        config.policies.push(sample_policy("nightly"));
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.policies.len(), 1);
        assert_eq!(loaded.policies[0].name, "nightly");
    }

    #[test]
    fn test_corrupt_file_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        fs::write(store.path(), "policies: [ {{{ not yaml").unwrap();

        let config = store.load().unwrap();
        assert!(config.policies.is_empty());

        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".error."))
            .collect();
        assert_eq!(quarantined.len(), 1);

        // The live file was rewritten as a valid empty aggregate.
        let reloaded = store.load().unwrap();
        assert!(reloaded.policies.is_empty());
    }

    #[test]
    fn test_partial_validity_keeps_valid_policies() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let good = sample_policy("good");
        let mut bad = sample_policy("bad");
        bad.dataset = String::new();
        let mut config = PersistedConfig::default();
        config.policies.push(good.clone());
        config.policies.push(bad);
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.policies.len(), 1);
        assert_eq!(loaded.policies[0].id, good.id);

        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".error."))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn test_duplicate_ids_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let first = sample_policy("first");
        let mut second = sample_policy("second");
        second.id = first.id;
        let mut config = PersistedConfig::default();
        config.policies.push(first);
        config.policies.push(second);
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.policies.len(), 1);
        assert_eq!(loaded.policies[0].name, "first");
    }

    #[test]
    fn test_backup_written_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.save(&PersistedConfig::default()).unwrap();
        store.save(&PersistedConfig::default()).unwrap();

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup."))
            .collect();
        assert!(!backups.is_empty());
    }
}
