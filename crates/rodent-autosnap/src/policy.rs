//! Policy model
//!
//! Entities persisted by the policy store and exchanged over the HTTP/RPC
//! surface. Schedules are a tagged variant over the ten recurrence kinds so
//! translation can match exhaustively instead of carrying empty fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

fn default_true() -> bool {
    true
}

fn default_calendar_interval() -> u32 {
    1
}

/// One recurrence rule. Cadence kinds carry an interval, calendar kinds a
/// wall-clock anchor, and the remaining kinds their own parameters.
///
/// Durations (`duration`, `min_duration`, `max_duration`) are integer
/// seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    Secondly {
        #[serde(default)]
        interval: u32,
    },
    Minutely {
        #[serde(default)]
        interval: u32,
    },
    Hourly {
        #[serde(default)]
        interval: u32,
    },
    Daily {
        #[serde(default = "default_calendar_interval")]
        interval: u32,
        #[serde(default)]
        at_time: String,
    },
    Weekly {
        #[serde(default = "default_calendar_interval")]
        interval: u32,
        #[serde(default)]
        at_time: String,
        /// 0 = Sunday .. 6 = Saturday
        #[serde(default)]
        week_day: u8,
    },
    Monthly {
        #[serde(default = "default_calendar_interval")]
        interval: u32,
        #[serde(default)]
        at_time: String,
        #[serde(default)]
        day_of_month: u8,
    },
    /// Fires once per year on (month, day_of_month) at `at_time`. The
    /// interval field of other kinds has no counterpart here: yearly
    /// recurrence is a pure calendar anchor.
    Yearly {
        #[serde(default)]
        at_time: String,
        #[serde(default)]
        day_of_month: u8,
        #[serde(default)]
        month: u8,
    },
    /// Single firing at the schedule's `start_time`. A start time already in
    /// the past fires immediately once the scheduler is started.
    Onetime,
    Duration {
        #[serde(default)]
        duration: u64,
    },
    /// Next interval drawn uniformly from [min_duration, max_duration] after
    /// each firing.
    Random {
        #[serde(default)]
        min_duration: u64,
        #[serde(default)]
        max_duration: u64,
    },
}

impl ScheduleKind {
    /// The serialized tag, used in error metadata.
    pub fn name(&self) -> &'static str {
        match self {
            ScheduleKind::Secondly { .. } => "secondly",
            ScheduleKind::Minutely { .. } => "minutely",
            ScheduleKind::Hourly { .. } => "hourly",
            ScheduleKind::Daily { .. } => "daily",
            ScheduleKind::Weekly { .. } => "weekly",
            ScheduleKind::Monthly { .. } => "monthly",
            ScheduleKind::Yearly { .. } => "yearly",
            ScheduleKind::Onetime => "onetime",
            ScheduleKind::Duration { .. } => "duration",
            ScheduleKind::Random { .. } => "random",
        }
    }
}

/// One schedule of a policy: a recurrence rule plus the optional firing
/// window and run limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(flatten)]
    pub kind: ScheduleKind,

    /// Earliest firing; also the firing instant for `onetime`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Latest firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Stop after this many attempted firings; 0 = unlimited. A firing
    /// counts once the task body has returned, success or error; dropped
    /// ticks do not count.
    #[serde(default)]
    pub limited_runs: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ScheduleSpec {
    pub fn new(kind: ScheduleKind) -> Self {
        Self {
            kind,
            start_time: None,
            end_time: None,
            limited_runs: 0,
            enabled: true,
        }
    }
}

/// Pruning rule for snapshots created by one policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many snapshots; 0 disables count pruning.
    #[serde(default)]
    pub count: u32,

    /// Destroy snapshots older than this many seconds; 0 disables age
    /// pruning.
    #[serde(default)]
    pub older_than: u64,

    #[serde(default)]
    pub force_destroy: bool,

    /// Short names that must never be pruned.
    #[serde(default)]
    pub keep_named_snap: Vec<String>,
}

impl RetentionPolicy {
    pub fn is_configured(&self) -> bool {
        self.count > 0 || self.older_than > 0
    }
}

/// Last-run status values recorded on policies.
pub mod run_status {
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
}

/// User-declared snapshot automation for one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub dataset: String,

    /// 1 to 5 schedules, each independently valid.
    pub schedules: Vec<ScheduleSpec>,

    #[serde(default)]
    pub recursive: bool,

    /// Snapshot-name template; defaulted to
    /// `autosnap-<name>-%Y-%m-%d-%H%M%S` when empty.
    #[serde(default)]
    pub snap_name_pattern: String,

    #[serde(default)]
    pub retention_policy: RetentionPolicy,

    /// Properties passed through to snapshot creation.
    #[serde(default)]
    pub properties: HashMap<String, String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// One of `success|error|running|completed` or empty before any run.
    #[serde(default)]
    pub last_run_status: String,
    #[serde(default)]
    pub last_run_error: String,

    /// Projection of the policy's monitor status, filled on read paths and
    /// never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_status: Option<MonitorStatus>,
}

impl SnapshotPolicy {
    /// Strip read-path projections before the policy is persisted.
    pub fn persistable(&self) -> Self {
        let mut p = self.clone();
        p.monitor_status = None;
        p
    }
}

/// Observable state of one policy's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
    Completed,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Idle => "idle",
            MonitorStatus::Running => "running",
            MonitorStatus::Success => "success",
            MonitorStatus::Error => "error",
            MonitorStatus::Completed => "completed",
        }
    }
}

/// Execution bookkeeping for one policy, keyed by policy id in the
/// persisted aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMonitor {
    pub policy_id: Uuid,
    /// Index into the policy's schedule list of the last firing.
    #[serde(default)]
    pub schedule_id: usize,
    #[serde(default)]
    pub status: MonitorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    /// Duration of the last firing, in milliseconds.
    #[serde(default)]
    pub last_duration: u64,
    #[serde(default)]
    pub last_error: String,
}

impl JobMonitor {
    pub fn new(policy_id: Uuid) -> Self {
        Self {
            policy_id,
            schedule_id: 0,
            status: MonitorStatus::Idle,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            last_duration: 0,
            last_error: String::new(),
        }
    }
}

/// Durable aggregate: ordered policies plus per-policy monitors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default)]
    pub policies: Vec<SnapshotPolicy>,
    #[serde(default)]
    pub monitors: HashMap<Uuid, JobMonitor>,
}

impl PersistedConfig {
    pub fn find_policy(&self, id: Uuid) -> Option<&SnapshotPolicy> {
        self.policies.iter().find(|p| p.id == id)
    }

    pub fn find_policy_mut(&mut self, id: Uuid) -> Option<&mut SnapshotPolicy> {
        self.policies.iter_mut().find(|p| p.id == id)
    }

    /// Clone with read-path projections stripped, ready for serialization.
    pub fn persistable(&self) -> Self {
        Self {
            policies: self.policies.iter().map(SnapshotPolicy::persistable).collect(),
            monitors: self.monitors.clone(),
        }
    }
}

/// Outcome of a single firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub policy_id: Uuid,
    pub schedule_index: usize,
    pub dataset_name: String,
    pub snap_short_name: String,
    pub created_at: DateTime<Utc>,
    /// Full names of snapshots destroyed by the retention sweep.
    #[serde(default)]
    pub pruned: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Parameters accepted by policy create/update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditPolicyParams {
    /// Optional on create; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dataset: String,
    #[serde(default)]
    pub schedules: Vec<ScheduleSpec>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub snap_name_pattern: String,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}
