//! Dataset gateway contract
//!
//! The policy engine talks to storage only through this trait. Production
//! backs it with the `zfs` CLI; tests back it with an in-memory gateway.

use async_trait::async_trait;
use rodent_core::Result;
use std::collections::HashMap;

/// Per-snapshot property set as reported by the backend.
///
/// Every entry exposes a `creation` property carrying seconds since the Unix
/// epoch, either numeric or as a decimal string.
#[derive(Debug, Clone, Default)]
pub struct SnapshotInfo {
    pub properties: HashMap<String, String>,
}

impl SnapshotInfo {
    /// Build an info record from a creation instant.
    pub fn with_creation(creation: i64) -> Self {
        Self {
            properties: HashMap::from([("creation".to_string(), creation.to_string())]),
        }
    }

    /// Parse the creation instant (seconds since the Unix epoch).
    pub fn creation(&self) -> Option<i64> {
        self.properties.get("creation")?.trim().parse().ok()
    }
}

/// Blocking-style storage operations the engine depends on.
///
/// Implementations must be safe to invoke concurrently from multiple
/// firings.
#[async_trait]
pub trait DatasetGateway: Send + Sync {
    /// Create `dataset@short_name`, optionally recursively, with the given
    /// snapshot properties.
    async fn create_snapshot(
        &self,
        dataset: &str,
        short_name: &str,
        recursive: bool,
        properties: &HashMap<String, String>,
    ) -> Result<()>;

    /// List snapshots of `dataset` (and of its descendants when
    /// `recursive`), keyed by full name (`<dataset>@<short>`).
    async fn list_snapshots(
        &self,
        dataset: &str,
        recursive: bool,
    ) -> Result<HashMap<String, SnapshotInfo>>;

    /// Destroy a snapshot by full name.
    async fn destroy_snapshot(&self, full_name: &str, force: bool) -> Result<()>;
}

/// Split a full snapshot name into (dataset, short name).
pub fn split_full_name(full_name: &str) -> Option<(&str, &str)> {
    full_name.split_once('@')
}
