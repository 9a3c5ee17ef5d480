//! Policy manager
//!
//! Façade over the store, validator, expander and scheduler. All HTTP/RPC
//! handlers go through here. A single reader/writer lock protects the
//! in-memory aggregate, the job-handle map and the in-flight firing keys;
//! gateway calls and persistence happen outside the lock.

use crate::expand::{default_pattern, expand, pattern_prefix};
use crate::policy::{
    run_status, EditPolicyParams, JobMonitor, MonitorStatus, PersistedConfig, RunResult,
    SnapshotPolicy,
};
use crate::scheduler::{FireOutcome, JobExecutor, JobKey, Scheduler};
use crate::store::ConfigStore;
use crate::validate::validate_policy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rodent_core::{Error, Result};
use rodent_zfs::DatasetGateway;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deadline applied to on-demand runs.
pub const RUN_DEADLINE: Duration = Duration::from_secs(60);

/// Grace period granted to in-flight firings on shutdown.
pub const STOP_GRACE: Duration = Duration::from_secs(30);

/// Engine status served by the HTTP/RPC surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub policy_count: usize,
    pub registered_jobs: usize,
    pub config_path: String,
}

/// Outcome of removing a policy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoveResult {
    /// Full names destroyed alongside the policy.
    pub removed_snapshots: Vec<String>,
    /// Full names that could not be destroyed; removal still succeeds.
    pub failed_snapshots: Vec<String>,
}

struct ManagerState {
    config: PersistedConfig,
    handles: HashMap<Uuid, Vec<JobKey>>,
    inflight: HashSet<JobKey>,
}

struct ManagerInner {
    state: RwLock<ManagerState>,
    store: ConfigStore,
    gateway: Arc<dyn DatasetGateway>,
    scheduler: Scheduler,
    running: AtomicBool,
}

/// Façade orchestrating store, validator, expander and scheduler.
#[derive(Clone)]
pub struct PolicyManager {
    inner: Arc<ManagerInner>,
}

impl PolicyManager {
    pub fn new(store: ConfigStore, gateway: Arc<dyn DatasetGateway>, scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                state: RwLock::new(ManagerState {
                    config: PersistedConfig::default(),
                    handles: HashMap::new(),
                    inflight: HashSet::new(),
                }),
                store,
                gateway,
                scheduler,
                running: AtomicBool::new(false),
            }),
        }
    }

    fn executor(&self) -> Arc<dyn JobExecutor> {
        Arc::new(ManagerExecutor {
            inner: self.inner.clone(),
        })
    }

    /// Load the aggregate from disk and register every enabled policy.
    pub async fn load_config(&self) -> Result<()> {
        let config = self.inner.store.load()?;

        let mut state = self.inner.state.write().await;
        for policy_id in state.handles.keys().copied().collect::<Vec<_>>() {
            self.inner.scheduler.deregister(policy_id).await;
        }
        state.handles.clear();
        state.config = config;

        let policies = state.config.policies.clone();
        for policy in &policies {
            if policy.enabled {
                let keys = self.inner.scheduler.register(policy, self.executor()).await?;
                state.handles.insert(policy.id, keys);
            }
        }
        info!(
            "Loaded {} policies from {}",
            state.config.policies.len(),
            self.inner.store.path().display()
        );
        Ok(())
    }

    /// Persist the current aggregate.
    pub async fn save_config(&self) -> Result<()> {
        let snapshot = self.inner.state.read().await.config.persistable();
        self.inner.store.save(&snapshot)
    }

    /// Allow registered jobs to fire. Non-blocking.
    pub fn start(&self) {
        self.inner.scheduler.start();
        self.inner.running.store(true, Ordering::SeqCst);
        info!("Policy manager started");
    }

    /// Stop the scheduler, waiting up to the grace period for in-flight
    /// firings, then persist the aggregate best-effort.
    pub async fn stop(&self) {
        self.inner.scheduler.stop(STOP_GRACE).await;
        self.inner.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.save_config().await {
            warn!("Final save on shutdown failed: {}", e);
        }
        info!("Policy manager stopped");
    }

    pub async fn status(&self) -> EngineStatus {
        let state = self.inner.state.read().await;
        EngineStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            policy_count: state.config.policies.len(),
            registered_jobs: self.inner.scheduler.job_count().await,
            config_path: self.inner.store.path().display().to_string(),
        }
    }

    /// Admit a new policy: validate, append, register its jobs, persist.
    pub async fn add_policy(&self, params: EditPolicyParams) -> Result<SnapshotPolicy> {
        let now = Utc::now();
        let policy = build_policy(params, now);
        validate_policy(&policy)?;

        {
            let mut state = self.inner.state.write().await;
            if state.config.find_policy(policy.id).is_some() {
                return Err(Error::validation_with(
                    format!("policy id already exists: {}", policy.id),
                    [("id".to_string(), policy.id.to_string())],
                ));
            }
            state.config.policies.push(policy.clone());
            if policy.enabled {
                let keys = self
                    .inner
                    .scheduler
                    .register(&policy, self.executor())
                    .await?;
                state.handles.insert(policy.id, keys);
            }
        }

        // The policy is live in memory and its jobs are registered even if
        // this save fails; the caller may retry or remove.
        if let Err(e) = self.save_config().await {
            return Err(Error::persistence(format!(
                "policy {} admitted but not persisted: {}",
                policy.id, e
            )));
        }
        info!("Added policy {} ({})", policy.name, policy.id);
        Ok(policy)
    }

    /// Replace a policy's definition, preserving provenance fields, and
    /// swap its registered jobs.
    pub async fn update_policy(
        &self,
        id: Uuid,
        params: EditPolicyParams,
    ) -> Result<SnapshotPolicy> {
        let updated = {
            let mut state = self.inner.state.write().await;
            let existing = state
                .config
                .find_policy(id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("policy not found: {}", id)))?;

            let mut updated = build_policy(params, Utc::now());
            updated.id = id;
            updated.created_at = existing.created_at;
            updated.last_run_at = existing.last_run_at;
            updated.last_run_status = existing.last_run_status;
            updated.last_run_error = existing.last_run_error;
            validate_policy(&updated)?;

            self.inner.scheduler.deregister(id).await;
            state.handles.remove(&id);

            if let Some(slot) = state.config.find_policy_mut(id) {
                *slot = updated.clone();
            }
            if updated.enabled {
                let keys = self
                    .inner
                    .scheduler
                    .register(&updated, self.executor())
                    .await?;
                state.handles.insert(id, keys);
            }
            updated
        };

        self.save_config().await?;
        info!("Updated policy {} ({})", updated.name, id);
        Ok(updated)
    }

    /// Remove a policy and its monitor; optionally destroy its snapshots
    /// best-effort.
    pub async fn remove_policy(&self, id: Uuid, remove_snapshots: bool) -> Result<RemoveResult> {
        let removed = {
            let mut state = self.inner.state.write().await;
            let index = state
                .config
                .policies
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| Error::not_found(format!("policy not found: {}", id)))?;
            let removed = state.config.policies.remove(index);
            state.config.monitors.remove(&id);
            state.handles.remove(&id);
            state.inflight.retain(|key| key.policy_id != id);
            removed
        };
        self.inner.scheduler.deregister(id).await;

        let mut result = RemoveResult::default();
        if remove_snapshots {
            result = destroy_policy_snapshots(&*self.inner.gateway, &removed).await;
            if !result.failed_snapshots.is_empty() {
                warn!(
                    "Removed policy {} but {} snapshots could not be destroyed",
                    id,
                    result.failed_snapshots.len()
                );
            }
        }

        self.save_config().await?;
        info!("Removed policy {} ({})", removed.name, id);
        Ok(result)
    }

    pub async fn get_policy(&self, id: Uuid) -> Result<SnapshotPolicy> {
        let state = self.inner.state.read().await;
        let mut policy = state
            .config
            .find_policy(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("policy not found: {}", id)))?;
        policy.monitor_status = state.config.monitors.get(&id).map(|m| m.status);
        Ok(policy)
    }

    pub async fn list_policies(&self) -> Vec<SnapshotPolicy> {
        let state = self.inner.state.read().await;
        state
            .config
            .policies
            .iter()
            .map(|p| {
                let mut policy = p.clone();
                policy.monitor_status = state.config.monitors.get(&p.id).map(|m| m.status);
                policy
            })
            .collect()
    }

    pub async fn list_monitors(&self) -> HashMap<Uuid, JobMonitor> {
        self.inner.state.read().await.config.monitors.clone()
    }

    /// Run one schedule of a policy on the caller's thread, or expand the
    /// snapshot name it would produce when `dry_run`.
    pub async fn run_policy(
        &self,
        id: Uuid,
        schedule_index: usize,
        dry_run: bool,
    ) -> Result<RunResult> {
        let policy = {
            let state = self.inner.state.read().await;
            state
                .config
                .find_policy(id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("policy not found: {}", id)))?
        };
        if schedule_index >= policy.schedules.len() {
            return Err(Error::validation_with(
                format!(
                    "schedule index {} out of range for policy with {} schedules",
                    schedule_index,
                    policy.schedules.len()
                ),
                [
                    ("id".to_string(), id.to_string()),
                    ("schedule_index".to_string(), schedule_index.to_string()),
                ],
            ));
        }

        if dry_run {
            let now = Utc::now();
            return Ok(RunResult {
                policy_id: id,
                schedule_index,
                dataset_name: policy.dataset.clone(),
                snap_short_name: expand(&effective_pattern(&policy), now),
                created_at: now,
                pruned: Vec::new(),
                error: None,
                dry_run: true,
            });
        }

        let key = JobKey::new(id, schedule_index);
        // The firing keeps running (and cleans up) in the background if the
        // deadline expires; only the caller is cut loose.
        let handle = tokio::spawn(execute_firing(self.inner.clone(), key, true));
        match tokio::time::timeout(RUN_DEADLINE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::internal(format!("firing task failed: {}", join_err))),
            Err(_) => Err(Error::cancelled(format!(
                "run of policy {} exceeded the {}s deadline",
                id,
                RUN_DEADLINE.as_secs()
            ))),
        }
    }
}

/// Scheduler-facing side of the manager.
struct ManagerExecutor {
    inner: Arc<ManagerInner>,
}

#[async_trait]
impl JobExecutor for ManagerExecutor {
    async fn fire(&self, key: JobKey) -> FireOutcome {
        match execute_firing(self.inner.clone(), key, false).await {
            Ok(result) => {
                match &result.error {
                    Some(e) => warn!(
                        "Firing ({}, {}) finished with error: {}",
                        key.policy_id, key.schedule_index, e
                    ),
                    None => debug!(
                        "Firing ({}, {}) created {}",
                        key.policy_id, key.schedule_index, result.snap_short_name
                    ),
                }
                FireOutcome::Completed
            }
            Err(e) => {
                debug!(
                    "Firing ({}, {}) dropped: {}",
                    key.policy_id, key.schedule_index, e
                );
                FireOutcome::Skipped
            }
        }
    }

    async fn note_next_run(&self, key: JobKey, at: DateTime<Utc>) {
        let mut state = self.inner.state.write().await;
        let monitor = state
            .config
            .monitors
            .entry(key.policy_id)
            .or_insert_with(|| JobMonitor::new(key.policy_id));
        monitor.next_run_at = Some(at);
    }
}

fn effective_pattern(policy: &SnapshotPolicy) -> String {
    if policy.snap_name_pattern.is_empty() {
        default_pattern(&policy.name)
    } else {
        policy.snap_name_pattern.clone()
    }
}

fn build_policy(params: EditPolicyParams, now: DateTime<Utc>) -> SnapshotPolicy {
    let name = params.name;
    let snap_name_pattern = if params.snap_name_pattern.is_empty() {
        default_pattern(&name)
    } else {
        params.snap_name_pattern
    };
    SnapshotPolicy {
        id: params.id.unwrap_or_else(Uuid::new_v4),
        name,
        description: params.description,
        dataset: params.dataset,
        schedules: params.schedules,
        recursive: params.recursive,
        snap_name_pattern,
        retention_policy: params.retention_policy,
        properties: params.properties,
        enabled: params.enabled,
        created_at: now,
        updated_at: now,
        last_run_at: None,
        last_run_status: String::new(),
        last_run_error: String::new(),
        monitor_status: None,
    }
}

struct TaskOutcome {
    short_name: String,
    created: bool,
    pruned: Vec<String>,
    create_error: Option<String>,
    sweep_error: Option<String>,
}

/// One full firing: admit, mark running, run the task body, record the
/// outcome, persist. Serialized per key by the in-flight set. `manual`
/// firings (RunPolicy) may target a disabled policy; scheduled ones must
/// not.
async fn execute_firing(inner: Arc<ManagerInner>, key: JobKey, manual: bool) -> Result<RunResult> {
    let now = Utc::now();

    // Admit and mark running.
    let (policy, running_snapshot) = {
        let mut state = inner.state.write().await;
        let policy = state
            .config
            .find_policy(key.policy_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("policy not found: {}", key.policy_id)))?;
        if !manual && !policy.enabled {
            return Err(Error::scheduler(format!(
                "policy {} is disabled",
                key.policy_id
            )));
        }
        if key.schedule_index >= policy.schedules.len() {
            return Err(Error::scheduler(format!(
                "schedule index {} no longer exists on policy {}",
                key.schedule_index, key.policy_id
            )));
        }
        if !state.inflight.insert(key) {
            return Err(Error::scheduler(format!(
                "firing of ({}, {}) already in flight",
                key.policy_id, key.schedule_index
            )));
        }

        let monitor = state
            .config
            .monitors
            .entry(key.policy_id)
            .or_insert_with(|| JobMonitor::new(key.policy_id));
        monitor.schedule_id = key.schedule_index;
        monitor.status = MonitorStatus::Running;
        if let Some(slot) = state.config.find_policy_mut(key.policy_id) {
            slot.last_run_status = run_status::RUNNING.to_string();
        }
        (policy, state.config.persistable())
    };
    if let Err(e) = inner.store.save(&running_snapshot) {
        warn!("Failed to persist running state: {}", e);
    }

    let started = std::time::Instant::now();
    let outcome = run_task(&*inner.gateway, &policy, now).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    // Record the outcome.
    let final_snapshot = {
        let mut state = inner.state.write().await;
        state.inflight.remove(&key);

        let limited = policy.schedules[key.schedule_index].limited_runs;
        let monitor = state
            .config
            .monitors
            .entry(key.policy_id)
            .or_insert_with(|| JobMonitor::new(key.policy_id));
        monitor.run_count += 1;
        monitor.last_run_at = Some(now);
        monitor.last_duration = elapsed_ms;
        monitor.last_error = outcome
            .create_error
            .clone()
            .or_else(|| outcome.sweep_error.clone())
            .unwrap_or_default();
        monitor.status = if outcome.created {
            MonitorStatus::Success
        } else {
            MonitorStatus::Error
        };
        if limited > 0 && monitor.run_count >= u64::from(limited) {
            monitor.status = MonitorStatus::Completed;
        }
        let monitor_status = monitor.status;

        if let Some(slot) = state.config.find_policy_mut(key.policy_id) {
            slot.last_run_at = Some(now);
            if outcome.created {
                slot.last_run_status = if monitor_status == MonitorStatus::Completed {
                    run_status::COMPLETED.to_string()
                } else {
                    run_status::SUCCESS.to_string()
                };
                // A failed sweep is annotated without demoting the run.
                slot.last_run_error = outcome.sweep_error.clone().unwrap_or_default();
            } else {
                slot.last_run_status = run_status::ERROR.to_string();
                slot.last_run_error = outcome.create_error.clone().unwrap_or_default();
            }
        }
        state.config.persistable()
    };
    if let Err(e) = inner.store.save(&final_snapshot) {
        warn!("Failed to persist firing outcome: {}", e);
    }

    Ok(RunResult {
        policy_id: key.policy_id,
        schedule_index: key.schedule_index,
        dataset_name: policy.dataset.clone(),
        snap_short_name: outcome.short_name,
        created_at: now,
        pruned: outcome.pruned,
        error: outcome.create_error.or(outcome.sweep_error),
        dry_run: false,
    })
}

/// Task body: expand the name, create the snapshot, sweep retention.
async fn run_task(
    gateway: &dyn DatasetGateway,
    policy: &SnapshotPolicy,
    now: DateTime<Utc>,
) -> TaskOutcome {
    let short_name = expand(&effective_pattern(policy), now);

    if let Err(e) = gateway
        .create_snapshot(
            &policy.dataset,
            &short_name,
            policy.recursive,
            &policy.properties,
        )
        .await
    {
        return TaskOutcome {
            short_name,
            created: false,
            pruned: Vec::new(),
            create_error: Some(e.to_string()),
            sweep_error: None,
        };
    }

    let (pruned, sweep_error) = if policy.retention_policy.is_configured() {
        retention_sweep(gateway, policy, now).await
    } else {
        (Vec::new(), None)
    };

    TaskOutcome {
        short_name,
        created: true,
        pruned,
        create_error: None,
        sweep_error,
    }
}

/// Enforce `count` and `older_than` on the policy's dataset. Returns the
/// destroyed full names and an optional error annotation.
async fn retention_sweep(
    gateway: &dyn DatasetGateway,
    policy: &SnapshotPolicy,
    now: DateTime<Utc>,
) -> (Vec<String>, Option<String>) {
    let listing = match gateway
        .list_snapshots(&policy.dataset, policy.recursive)
        .await
    {
        Ok(listing) => listing,
        Err(e) => return (Vec::new(), Some(format!("retention listing failed: {}", e))),
    };

    let retention = &policy.retention_policy;
    let keep: HashSet<&str> = retention.keep_named_snap.iter().map(String::as_str).collect();
    let own_prefix = format!("{}@", policy.dataset);
    let child_prefix = format!("{}/", policy.dataset);

    // Short names present on the root dataset; descendant snapshots join
    // the sweep only when they share one of them.
    let root_shorts: HashSet<&str> = listing
        .keys()
        .filter_map(|name| name.strip_prefix(own_prefix.as_str()))
        .collect();

    let mut eligible: Vec<(String, i64)> = listing
        .iter()
        .filter_map(|(full_name, info)| {
            let short = rodent_zfs::split_full_name(full_name)?.1;
            if keep.contains(short) {
                return None;
            }
            let on_root = full_name.starts_with(&own_prefix);
            let on_child = policy.recursive
                && full_name.starts_with(&child_prefix)
                && root_shorts.contains(short);
            if !on_root && !on_child {
                return None;
            }
            // Snapshots with an unreadable creation instant are left alone.
            let creation = info.creation()?;
            Some((full_name.clone(), creation))
        })
        .collect();

    // Newest first; ties break lexicographically descending.
    eligible.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut marked: Vec<&str> = Vec::new();
    for (index, (full_name, creation)) in eligible.iter().enumerate() {
        let over_count = retention.count > 0 && index >= retention.count as usize;
        let over_age = retention.older_than > 0
            && now.timestamp() - creation > retention.older_than as i64;
        if over_count || over_age {
            marked.push(full_name);
        }
    }

    let mut pruned = Vec::new();
    let mut first_failure: Option<String> = None;
    let mut failures = 0usize;
    for full_name in marked {
        match gateway
            .destroy_snapshot(full_name, retention.force_destroy)
            .await
        {
            Ok(()) => pruned.push(full_name.to_string()),
            Err(e) => {
                failures += 1;
                if first_failure.is_none() {
                    first_failure = Some(e.to_string());
                }
                warn!("Retention destroy failed for {}: {}", full_name, e);
            }
        }
    }

    let error = if failures == 0 {
        None
    } else if pruned.is_empty() {
        first_failure
    } else {
        Some(format!(
            "retention destroyed {} snapshots but {} failed",
            pruned.len(),
            failures
        ))
    };

    (pruned, error)
}

/// Destroy every snapshot owned by the policy (short name starts with the
/// pattern's literal prefix). Best-effort.
async fn destroy_policy_snapshots(
    gateway: &dyn DatasetGateway,
    policy: &SnapshotPolicy,
) -> RemoveResult {
    let pattern = effective_pattern(policy);
    let prefix = pattern_prefix(&pattern).to_string();

    let listing = match gateway
        .list_snapshots(&policy.dataset, policy.recursive)
        .await
    {
        Ok(listing) => listing,
        Err(e) => {
            warn!(
                "Could not list snapshots of {} while removing policy: {}",
                policy.dataset, e
            );
            return RemoveResult::default();
        }
    };

    let mut result = RemoveResult::default();
    for full_name in listing.keys() {
        let Some((_, short)) = rodent_zfs::split_full_name(full_name) else {
            continue;
        };
        if prefix.is_empty() || !short.starts_with(&prefix) {
            continue;
        }
        match gateway
            .destroy_snapshot(full_name, policy.retention_policy.force_destroy)
            .await
        {
            Ok(()) => result.removed_snapshots.push(full_name.clone()),
            Err(e) => {
                warn!("Failed to destroy {}: {}", full_name, e);
                result.failed_snapshots.push(full_name.clone());
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{RetentionPolicy, ScheduleKind, ScheduleSpec};
    use rodent_zfs::MemoryGateway;
    use tempfile::TempDir;

    fn fixture() -> (PolicyManager, Arc<MemoryGateway>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        gateway.add_dataset("tank/data");
        let manager = PolicyManager::new(
            ConfigStore::new(dir.path()),
            gateway.clone(),
            Scheduler::new(),
        );
        (manager, gateway, dir)
    }

    fn hourly_params(name: &str) -> EditPolicyParams {
        EditPolicyParams {
            id: None,
            name: name.to_string(),
            description: String::new(),
            dataset: "tank/data".to_string(),
            schedules: vec![ScheduleSpec::new(ScheduleKind::Hourly { interval: 1 })],
            recursive: false,
            snap_name_pattern: String::new(),
            retention_policy: RetentionPolicy::default(),
            properties: HashMap::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_add_defaults_pattern_and_persists() {
        let (manager, _gateway, _dir) = fixture();
        manager.load_config().await.unwrap();

        let policy = manager.add_policy(hourly_params("nightly")).await.unwrap();
        assert_eq!(policy.snap_name_pattern, "autosnap-nightly-%Y-%m-%d-%H%M%S");
        assert_eq!(policy.created_at, policy.updated_at);

        let listed = manager.list_policies().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(manager.get_policy(policy.id).await.unwrap().name, "nightly");
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_id() {
        let (manager, _gateway, _dir) = fixture();
        manager.load_config().await.unwrap();

        let policy = manager.add_policy(hourly_params("first")).await.unwrap();
        let mut params = hourly_params("second");
        params.id = Some(policy.id);
        let err = manager.add_policy(params).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert_eq!(err.metadata().get("id").unwrap(), &policy.id.to_string());
    }

    #[tokio::test]
    async fn test_update_preserves_provenance() {
        let (manager, _gateway, _dir) = fixture();
        manager.load_config().await.unwrap();

        let policy = manager.add_policy(hourly_params("nightly")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut params = hourly_params("renamed");
        params.schedules = vec![ScheduleSpec::new(ScheduleKind::Hourly { interval: 2 })];
        let updated = manager.update_policy(policy.id, params).await.unwrap();

        assert_eq!(updated.created_at, policy.created_at);
        assert!(updated.updated_at > policy.updated_at);
        assert_eq!(updated.name, "renamed");
    }

    #[tokio::test]
    async fn test_update_missing_policy() {
        let (manager, _gateway, _dir) = fixture();
        manager.load_config().await.unwrap();
        let err = manager
            .update_policy(Uuid::new_v4(), hourly_params("x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_dry_run_is_deterministic_and_gateway_free() {
        let (manager, gateway, _dir) = fixture();
        manager.load_config().await.unwrap();
        let policy = manager.add_policy(hourly_params("nightly")).await.unwrap();

        let a = manager.run_policy(policy.id, 0, true).await.unwrap();
        let b = manager.run_policy(policy.id, 0, true).await.unwrap();
        // Same second: identical name either way in practice; assert on the
        // prefix to stay clock-safe, and on zero gateway traffic always.
        assert!(a.snap_short_name.starts_with("autosnap-nightly-"));
        assert!(b.snap_short_name.starts_with("autosnap-nightly-"));
        assert!(a.dry_run);
        assert_eq!(gateway.create_call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_rejects_bad_schedule_index() {
        let (manager, _gateway, _dir) = fixture();
        manager.load_config().await.unwrap();
        let policy = manager.add_policy(hourly_params("nightly")).await.unwrap();
        let err = manager.run_policy(policy.id, 3, false).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert_eq!(err.metadata().get("schedule_index").unwrap(), "3");
    }

    #[tokio::test]
    async fn test_run_creates_snapshot_and_updates_monitor() {
        let (manager, gateway, _dir) = fixture();
        manager.load_config().await.unwrap();
        let policy = manager.add_policy(hourly_params("nightly")).await.unwrap();

        let result = manager.run_policy(policy.id, 0, false).await.unwrap();
        assert!(result.error.is_none());
        assert_eq!(gateway.snapshot_names().len(), 1);

        let refreshed = manager.get_policy(policy.id).await.unwrap();
        assert_eq!(refreshed.last_run_status, run_status::SUCCESS);
        assert_eq!(refreshed.monitor_status, Some(MonitorStatus::Success));

        let monitors = manager.list_monitors().await;
        assert_eq!(monitors.get(&policy.id).unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn test_run_records_gateway_failure() {
        let (manager, gateway, _dir) = fixture();
        manager.load_config().await.unwrap();
        let policy = manager.add_policy(hourly_params("nightly")).await.unwrap();

        gateway.fail_create("pool is suspended");
        let result = manager.run_policy(policy.id, 0, false).await.unwrap();
        assert!(result.error.as_deref().unwrap().contains("pool is suspended"));

        let refreshed = manager.get_policy(policy.id).await.unwrap();
        assert_eq!(refreshed.last_run_status, run_status::ERROR);
        assert!(refreshed.last_run_error.contains("pool is suspended"));
    }

    #[tokio::test]
    async fn test_retention_count_enforced() {
        let (manager, gateway, _dir) = fixture();
        manager.load_config().await.unwrap();

        let mut params = hourly_params("nightly");
        params.retention_policy.count = 2;
        params.snap_name_pattern = "keeper-%Y%m%d%H%M%S".to_string();
        let policy = manager.add_policy(params).await.unwrap();

        gateway.add_snapshot("tank/data@keeper-old1", 100);
        gateway.add_snapshot("tank/data@keeper-old2", 200);
        gateway.add_snapshot("tank/data@keeper-old3", 300);

        let result = manager.run_policy(policy.id, 0, false).await.unwrap();
        assert!(result.error.is_none());
        // Three seeded plus the fresh one, pruned back down to two.
        assert_eq!(result.pruned.len(), 2);
        assert_eq!(gateway.snapshot_names().len(), 2);
    }

    #[tokio::test]
    async fn test_retention_age_enforced() {
        let (manager, gateway, _dir) = fixture();
        manager.load_config().await.unwrap();

        let mut params = hourly_params("nightly");
        params.retention_policy.older_than = 3600;
        let policy = manager.add_policy(params).await.unwrap();

        let now = Utc::now().timestamp();
        gateway.add_snapshot("tank/data@autosnap-nightly-ancient", now - 7200);
        gateway.add_snapshot("tank/data@autosnap-nightly-recent", now - 60);

        let result = manager.run_policy(policy.id, 0, false).await.unwrap();
        assert_eq!(result.pruned, vec!["tank/data@autosnap-nightly-ancient".to_string()]);

        let names = gateway.snapshot_names();
        assert!(names.contains(&"tank/data@autosnap-nightly-recent".to_string()));
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn test_retention_respects_keep_named() {
        let (manager, gateway, _dir) = fixture();
        manager.load_config().await.unwrap();

        let mut params = hourly_params("nightly");
        params.retention_policy.count = 1;
        params.retention_policy.keep_named_snap = vec!["baseline".to_string()];
        let policy = manager.add_policy(params).await.unwrap();

        gateway.add_snapshot("tank/data@baseline", 10);
        gateway.add_snapshot("tank/data@autosnap-nightly-stale", 20);

        manager.run_policy(policy.id, 0, false).await.unwrap();
        let names = gateway.snapshot_names();
        assert!(names.contains(&"tank/data@baseline".to_string()));
        assert!(!names.contains(&"tank/data@autosnap-nightly-stale".to_string()));
    }

    #[tokio::test]
    async fn test_retention_failure_keeps_run_successful() {
        let (manager, gateway, _dir) = fixture();
        manager.load_config().await.unwrap();

        let mut params = hourly_params("nightly");
        params.retention_policy.count = 1;
        let policy = manager.add_policy(params).await.unwrap();

        gateway.add_snapshot("tank/data@autosnap-nightly-stuck", 50);
        gateway.fail_destroy("tank/data@autosnap-nightly-stuck");

        let result = manager.run_policy(policy.id, 0, false).await.unwrap();
        assert!(result.error.is_some());

        let refreshed = manager.get_policy(policy.id).await.unwrap();
        assert_eq!(refreshed.last_run_status, run_status::SUCCESS);
        assert!(!refreshed.last_run_error.is_empty());
    }

    #[tokio::test]
    async fn test_remove_with_snapshots() {
        let (manager, gateway, _dir) = fixture();
        manager.load_config().await.unwrap();
        let policy = manager.add_policy(hourly_params("nightly")).await.unwrap();

        manager.run_policy(policy.id, 0, false).await.unwrap();
        assert_eq!(gateway.snapshot_names().len(), 1);
        gateway.add_snapshot("tank/data@manual-backup", 999);

        let outcome = manager.remove_policy(policy.id, true).await.unwrap();
        assert_eq!(outcome.removed_snapshots.len(), 1);
        assert!(manager.list_policies().await.is_empty());
        // Foreign snapshots survive policy removal.
        assert_eq!(gateway.snapshot_names(), vec!["tank/data@manual-backup".to_string()]);
    }

    #[tokio::test]
    async fn test_at_most_one_firing_per_key() {
        let (manager, _gateway, _dir) = fixture();
        manager.load_config().await.unwrap();
        let policy = manager.add_policy(hourly_params("nightly")).await.unwrap();
        let key = JobKey::new(policy.id, 0);

        manager.inner.state.write().await.inflight.insert(key);
        let err = manager.run_policy(policy.id, 0, false).await.unwrap_err();
        assert_eq!(err.code(), "SCHEDULER");
        manager.inner.state.write().await.inflight.remove(&key);

        // With the key released the firing goes through again.
        assert!(manager.run_policy(policy.id, 0, false).await.is_ok());
    }
}
