//! In-memory dataset gateway
//!
//! Test double for the engine: datasets and snapshots live in a mutex-held
//! map, creation instants come from a monotonic fake clock, and failures can
//! be injected per operation.

use crate::gateway::{DatasetGateway, SnapshotInfo};
use async_trait::async_trait;
use chrono::Utc;
use rodent_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    datasets: HashSet<String>,
    snapshots: HashMap<String, SnapshotInfo>,
    fail_create: Option<String>,
    fail_destroy: HashSet<String>,
}

/// Thread-safe in-memory gateway.
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    clock: AtomicI64,
    create_calls: AtomicU64,
    destroy_calls: AtomicU64,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock: AtomicI64::new(Utc::now().timestamp()),
            create_calls: AtomicU64::new(0),
            destroy_calls: AtomicU64::new(0),
        }
    }

    /// Register a dataset so snapshots can be taken of it.
    pub fn add_dataset(&self, name: impl Into<String>) {
        self.state.lock().unwrap().datasets.insert(name.into());
    }

    /// Seed a snapshot with an explicit creation instant.
    pub fn add_snapshot(&self, full_name: impl Into<String>, creation: i64) {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .insert(full_name.into(), SnapshotInfo::with_creation(creation));
    }

    /// Make the next create calls fail with the given message.
    pub fn fail_create(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_create = Some(message.into());
    }

    /// Clear an injected create failure.
    pub fn clear_create_failure(&self) {
        self.state.lock().unwrap().fail_create = None;
    }

    /// Make destroys of the given full name fail.
    pub fn fail_destroy(&self, full_name: impl Into<String>) {
        self.state.lock().unwrap().fail_destroy.insert(full_name.into());
    }

    /// All snapshot full names, sorted.
    pub fn snapshot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .snapshots
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn create_call_count(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_call_count(&self) -> u64 {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    fn next_creation(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatasetGateway for MemoryGateway {
    async fn create_snapshot(
        &self,
        dataset: &str,
        short_name: &str,
        recursive: bool,
        properties: &HashMap<String, String>,
    ) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let creation = self.next_creation();
        let mut state = self.state.lock().unwrap();

        if let Some(msg) = state.fail_create.clone() {
            return Err(Error::gateway("create_snapshot", dataset, msg));
        }
        if !state.datasets.contains(dataset) {
            return Err(Error::gateway(
                "create_snapshot",
                dataset,
                format!("dataset does not exist: {}", dataset),
            ));
        }

        let mut targets = vec![dataset.to_string()];
        if recursive {
            let child_prefix = format!("{}/", dataset);
            targets.extend(
                state
                    .datasets
                    .iter()
                    .filter(|d| d.starts_with(&child_prefix))
                    .cloned(),
            );
        }

        for target in targets {
            let full_name = format!("{}@{}", target, short_name);
            if state.snapshots.contains_key(&full_name) {
                return Err(Error::gateway(
                    "create_snapshot",
                    dataset,
                    format!("snapshot already exists: {}", full_name),
                ));
            }
            let mut info = SnapshotInfo::with_creation(creation);
            for (key, value) in properties {
                info.properties.insert(key.clone(), value.clone());
            }
            state.snapshots.insert(full_name, info);
        }
        Ok(())
    }

    async fn list_snapshots(
        &self,
        dataset: &str,
        recursive: bool,
    ) -> Result<HashMap<String, SnapshotInfo>> {
        let state = self.state.lock().unwrap();
        let own_prefix = format!("{}@", dataset);
        let child_prefix = format!("{}/", dataset);

        Ok(state
            .snapshots
            .iter()
            .filter(|(name, _)| {
                name.starts_with(&own_prefix) || (recursive && name.starts_with(&child_prefix))
            })
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect())
    }

    async fn destroy_snapshot(&self, full_name: &str, _force: bool) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let dataset = full_name.split('@').next().unwrap_or(full_name).to_string();
        let mut state = self.state.lock().unwrap();

        if state.fail_destroy.contains(full_name) {
            return Err(Error::gateway(
                "destroy_snapshot",
                dataset,
                format!("destroy refused: {}", full_name),
            ));
        }
        if state.snapshots.remove(full_name).is_none() {
            return Err(Error::gateway(
                "destroy_snapshot",
                dataset,
                format!("no such snapshot: {}", full_name),
            ));
        }
        Ok(())
    }
}
