//! Scheduler core
//!
//! Owns the job registry keyed by (policy id, schedule index). Each job is a
//! spawned loop that computes its next firing instant from the schedule,
//! sleeps until then, and hands the firing to the executor. Firings of one
//! key are strictly serialized: a tick that lands while the previous firing
//! is still in flight is dropped, not queued.

use crate::policy::{ScheduleKind, ScheduleSpec, SnapshotPolicy};
use crate::validate::parse_at_time;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc};
use rand::Rng;
use rodent_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of one job: a policy and one of its schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub policy_id: Uuid,
    pub schedule_index: usize,
}

impl JobKey {
    pub fn new(policy_id: Uuid, schedule_index: usize) -> Self {
        Self {
            policy_id,
            schedule_index,
        }
    }
}

/// What happened to a tick handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// The task body ran to completion (success or error).
    Completed,
    /// A previous firing of the same key was still in flight; the tick was
    /// dropped.
    Skipped,
}

/// Receives firings and next-run projections from the scheduler.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run the task body for one tick of `key`.
    async fn fire(&self, key: JobKey) -> FireOutcome;

    /// The scheduler computed the next firing instant for `key`.
    async fn note_next_run(&self, key: JobKey, at: DateTime<Utc>) {
        let _ = (key, at);
    }
}

struct Job {
    schedule_index: usize,
    handle: JoinHandle<()>,
}

struct Shared {
    jobs: tokio::sync::Mutex<HashMap<Uuid, Vec<Job>>>,
    started_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

/// Multi-recurrence job scheduler.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (started_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                jobs: tokio::sync::Mutex::new(HashMap::new()),
                started_tx,
                shutdown_tx,
            }),
        }
    }

    /// Allow registered jobs to begin firing. Non-blocking.
    pub fn start(&self) {
        self.shared.started_tx.send_replace(true);
        info!("Scheduler started");
    }

    /// Refuse new firings and wait up to `grace` for in-flight firings,
    /// aborting whatever remains.
    pub async fn stop(&self, grace: Duration) {
        self.shared.shutdown_tx.send_replace(true);
        self.shared.started_tx.send_replace(false);

        let deadline = tokio::time::Instant::now() + grace;
        let mut jobs = self.shared.jobs.lock().await;
        for (policy_id, entries) in jobs.drain() {
            for mut job in entries {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if tokio::time::timeout(remaining, &mut job.handle).await.is_err() {
                    warn!(
                        "Job ({}, {}) did not drain in time, aborting",
                        policy_id, job.schedule_index
                    );
                    job.handle.abort();
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Register every enabled schedule of an enabled policy. Returns the
    /// keys of the registered jobs; a disabled policy registers nothing.
    pub async fn register(
        &self,
        policy: &SnapshotPolicy,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Vec<JobKey>> {
        if !policy.enabled {
            return Ok(Vec::new());
        }
        if *self.shared.shutdown_tx.borrow() {
            return Err(Error::scheduler("scheduler is shut down"));
        }

        let mut keys = Vec::new();
        let mut entries = Vec::new();

        for (index, spec) in policy.schedules.iter().enumerate() {
            if !spec.enabled {
                continue;
            }
            let key = JobKey::new(policy.id, index);
            let handle = tokio::spawn(run_job(
                key,
                spec.clone(),
                executor.clone(),
                self.shared.started_tx.subscribe(),
                self.shared.shutdown_tx.subscribe(),
            ));
            entries.push(Job {
                schedule_index: index,
                handle,
            });
            keys.push(key);
        }

        let mut jobs = self.shared.jobs.lock().await;
        if let Some(old) = jobs.insert(policy.id, entries) {
            for job in old {
                job.handle.abort();
            }
        }
        debug!("Registered {} jobs for policy {}", keys.len(), policy.id);
        Ok(keys)
    }

    /// Remove every job of a policy. Jobs that already ran to completion
    /// abort as a no-op.
    pub async fn deregister(&self, policy_id: Uuid) {
        let removed = self.shared.jobs.lock().await.remove(&policy_id);
        if let Some(entries) = removed {
            for job in &entries {
                job.handle.abort();
            }
            debug!("Deregistered {} jobs for policy {}", entries.len(), policy_id);
        }
    }

    /// Number of live (not yet finished) jobs across all policies.
    pub async fn job_count(&self) -> usize {
        self.shared
            .jobs
            .lock()
            .await
            .values()
            .flatten()
            .filter(|job| !job.handle.is_finished())
            .count()
    }

    /// Schedule indexes currently registered for a policy.
    pub async fn registered_keys(&self, policy_id: Uuid) -> Vec<JobKey> {
        self.shared
            .jobs
            .lock()
            .await
            .get(&policy_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|job| JobKey::new(policy_id, job.schedule_index))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job(
    key: JobKey,
    spec: ScheduleSpec,
    executor: Arc<dyn JobExecutor>,
    mut started_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Hold every firing until the scheduler is started.
    while !*started_rx.borrow() {
        tokio::select! {
            res = started_rx.changed() => {
                if res.is_err() {
                    return;
                }
            }
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }

    let mut prev: Option<DateTime<Utc>> = None;
    let mut completed: u32 = 0;

    loop {
        let now = Utc::now();
        let Some(fire_at) = next_fire(&spec, prev, now) else {
            break;
        };
        if let Some(end) = spec.end_time {
            if fire_at > end {
                break;
            }
        }
        executor.note_next_run(key, fire_at).await;

        // Sleep until the firing instant, watching for shutdown.
        let remaining = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !remaining.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
        if *shutdown_rx.borrow() {
            return;
        }

        prev = Some(fire_at);
        match executor.fire(key).await {
            FireOutcome::Completed => {
                completed += 1;
                if spec.limited_runs > 0 && completed >= spec.limited_runs {
                    debug!(
                        "Job ({}, {}) reached its run limit of {}",
                        key.policy_id, key.schedule_index, spec.limited_runs
                    );
                    break;
                }
            }
            FireOutcome::Skipped => {
                debug!(
                    "Job ({}, {}) tick dropped, previous firing still in flight",
                    key.policy_id, key.schedule_index
                );
            }
        }
    }
}

/// Translate a schedule into its next firing instant strictly after `now`
/// (or at `now` when due immediately). `prev` is the previous firing; ticks
/// that fell while a firing was in flight are skipped, keeping the cadence
/// anchored to the first firing.
fn next_fire(
    spec: &ScheduleSpec,
    prev: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // Earliest instant a firing may happen.
    let after = match spec.start_time {
        Some(start) if start > now => start,
        _ => now,
    };

    match &spec.kind {
        ScheduleKind::Secondly { interval } => {
            periodic(prev, now, after, secs(u64::from(*interval)))
        }
        ScheduleKind::Minutely { interval } => {
            periodic(prev, now, after, secs(u64::from(*interval) * 60))
        }
        ScheduleKind::Hourly { interval } => {
            periodic(prev, now, after, secs(u64::from(*interval) * 3600))
        }
        ScheduleKind::Duration { duration } => periodic(prev, now, after, secs(*duration)),
        ScheduleKind::Random {
            min_duration,
            max_duration,
        } => {
            let span = rand::thread_rng().gen_range(*min_duration..=*max_duration);
            let base = match prev {
                Some(p) if p > now => p,
                Some(_) | None => after,
            };
            base.checked_add_signed(secs(span)?)
        }
        ScheduleKind::Onetime => {
            if prev.is_some() {
                return None;
            }
            // A start time already in the past fires immediately.
            Some(spec.start_time?.max(now))
        }
        ScheduleKind::Daily { interval, at_time } => {
            let (h, m, s) = at_time_fields(at_time)?;
            match prev {
                None => {
                    let mut cand = at_clock(after.date_naive(), h, m, s)?;
                    while cand < after {
                        cand = cand.checked_add_days(Days::new(1))?;
                    }
                    Some(cand)
                }
                Some(p) => advance_by_days(p, now, u64::from((*interval).max(1))),
            }
        }
        ScheduleKind::Weekly {
            interval,
            at_time,
            week_day,
        } => {
            let (h, m, s) = at_time_fields(at_time)?;
            match prev {
                None => {
                    let mut cand = at_clock(after.date_naive(), h, m, s)?;
                    for _ in 0..8 {
                        if cand.weekday().num_days_from_sunday() == u32::from(*week_day)
                            && cand >= after
                        {
                            return Some(cand);
                        }
                        cand = cand.checked_add_days(Days::new(1))?;
                    }
                    None
                }
                Some(p) => advance_by_days(p, now, u64::from((*interval).max(1)) * 7),
            }
        }
        ScheduleKind::Monthly {
            interval,
            at_time,
            day_of_month,
        } => {
            let (h, m, s) = at_time_fields(at_time)?;
            let step = (*interval).max(1);
            let day = u32::from(*day_of_month);
            // Months lacking the requested day are skipped.
            match prev {
                None => {
                    let (mut year, mut month) = (after.year(), after.month());
                    for _ in 0..48 {
                        if let Some(cand) = calendar_candidate(year, month, day, h, m, s) {
                            if cand >= after {
                                return Some(cand);
                            }
                        }
                        (year, month) = add_months(year, month, 1);
                    }
                    None
                }
                Some(p) => {
                    let (mut year, mut month) = (p.year(), p.month());
                    for _ in 0..480 {
                        (year, month) = add_months(year, month, step);
                        if let Some(cand) = calendar_candidate(year, month, day, h, m, s) {
                            if cand > now {
                                return Some(cand);
                            }
                        }
                    }
                    None
                }
            }
        }
        ScheduleKind::Yearly {
            at_time,
            day_of_month,
            month,
        } => {
            let (h, m, s) = at_time_fields(at_time)?;
            let mut year = match prev {
                None => after.year(),
                Some(p) => p.year() + 1,
            };
            // Leap-day anchors skip common years.
            for _ in 0..16 {
                if let Some(cand) =
                    calendar_candidate(year, u32::from(*month), u32::from(*day_of_month), h, m, s)
                {
                    if cand >= after && cand > prev.unwrap_or(DateTime::<Utc>::MIN_UTC) {
                        return Some(cand);
                    }
                }
                year += 1;
            }
            None
        }
    }
}

fn secs(value: u64) -> Option<chrono::Duration> {
    chrono::Duration::try_seconds(i64::try_from(value).ok()?)
}

fn at_time_fields(at_time: &str) -> Option<(u32, u32, u32)> {
    match parse_at_time(at_time) {
        Ok(fields) => Some(fields),
        Err(e) => {
            warn!("Unusable at_time in registered schedule: {}", e);
            None
        }
    }
}

fn at_clock(date: NaiveDate, h: u32, m: u32, s: u32) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&date.and_hms_opt(h, m, s)?))
}

fn calendar_candidate(
    year: i32,
    month: u32,
    day: u32,
    h: u32,
    m: u32,
    s: u32,
) -> Option<DateTime<Utc>> {
    at_clock(NaiveDate::from_ymd_opt(year, month, day)?, h, m, s)
}

/// Fixed-period recurrence: first firing one period after now (or at a
/// future start time), later firings one period after the previous, with
/// missed ticks skipped.
fn periodic(
    prev: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    after: DateTime<Utc>,
    period: Option<chrono::Duration>,
) -> Option<DateTime<Utc>> {
    let period = period?;
    if period <= chrono::Duration::zero() {
        return None;
    }
    match prev {
        None if after > now => Some(after),
        None => after.checked_add_signed(period),
        Some(p) => {
            let mut next = p.checked_add_signed(period)?;
            while next <= now {
                next = next.checked_add_signed(period)?;
            }
            Some(next)
        }
    }
}

fn advance_by_days(prev: DateTime<Utc>, now: DateTime<Utc>, days: u64) -> Option<DateTime<Utc>> {
    let mut next = prev.checked_add_days(Days::new(days))?;
    while next <= now {
        next = next.checked_add_days(Days::new(days))?;
    }
    Some(next)
}

fn add_months(year: i32, month: u32, step: u32) -> (i32, u32) {
    let zero_based = (month - 1) + step;
    (year + (zero_based / 12) as i32, zero_based % 12 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn spec(kind: ScheduleKind) -> ScheduleSpec {
        ScheduleSpec::new(kind)
    }

    #[test]
    fn test_secondly_first_and_following() {
        let s = spec(ScheduleKind::Secondly { interval: 3 });
        let now = utc(2025, 5, 15, 12, 0, 0);
        assert_eq!(next_fire(&s, None, now).unwrap(), utc(2025, 5, 15, 12, 0, 3));
        let prev = utc(2025, 5, 15, 12, 0, 3);
        assert_eq!(
            next_fire(&s, Some(prev), now).unwrap(),
            utc(2025, 5, 15, 12, 0, 6)
        );
    }

    #[test]
    fn test_overrun_ticks_dropped() {
        let s = spec(ScheduleKind::Secondly { interval: 3 });
        // The firing at 12:00:03 ran long; it is now 12:00:11. The ticks at
        // :06 and :09 are gone; cadence stays anchored.
        let now = utc(2025, 5, 15, 12, 0, 11);
        let prev = utc(2025, 5, 15, 12, 0, 3);
        assert_eq!(
            next_fire(&s, Some(prev), now).unwrap(),
            utc(2025, 5, 15, 12, 0, 12)
        );
    }

    #[test]
    fn test_start_time_anchors_first_firing() {
        let mut s = spec(ScheduleKind::Minutely { interval: 5 });
        s.start_time = Some(utc(2025, 5, 15, 13, 0, 0));
        let now = utc(2025, 5, 15, 12, 0, 0);
        assert_eq!(next_fire(&s, None, now).unwrap(), utc(2025, 5, 15, 13, 0, 0));
    }

    #[test]
    fn test_daily_at_time() {
        let s = spec(ScheduleKind::Daily {
            interval: 1,
            at_time: "03:30".to_string(),
        });
        let now = utc(2025, 5, 15, 12, 0, 0);
        assert_eq!(next_fire(&s, None, now).unwrap(), utc(2025, 5, 16, 3, 30, 0));

        let before_anchor = utc(2025, 5, 15, 2, 0, 0);
        assert_eq!(
            next_fire(&s, None, before_anchor).unwrap(),
            utc(2025, 5, 15, 3, 30, 0)
        );
    }

    #[test]
    fn test_daily_multi_day_interval() {
        let s = spec(ScheduleKind::Daily {
            interval: 3,
            at_time: "00:00".to_string(),
        });
        let prev = utc(2025, 5, 15, 0, 0, 0);
        let now = utc(2025, 5, 15, 0, 0, 1);
        assert_eq!(
            next_fire(&s, Some(prev), now).unwrap(),
            utc(2025, 5, 18, 0, 0, 0)
        );
    }

    #[test]
    fn test_weekly_finds_weekday() {
        // 2025-05-15 is a Thursday; week_day 1 = Monday.
        let s = spec(ScheduleKind::Weekly {
            interval: 1,
            at_time: "04:00".to_string(),
            week_day: 1,
        });
        let now = utc(2025, 5, 15, 12, 0, 0);
        let next = next_fire(&s, None, now).unwrap();
        assert_eq!(next, utc(2025, 5, 19, 4, 0, 0));
        assert_eq!(next.weekday().num_days_from_sunday(), 1);
    }

    #[test]
    fn test_monthly_skips_short_months() {
        let s = spec(ScheduleKind::Monthly {
            interval: 1,
            at_time: "01:00".to_string(),
            day_of_month: 31,
        });
        // From mid-April (30 days): the next month with a 31st is May.
        let now = utc(2025, 4, 15, 0, 0, 0);
        assert_eq!(next_fire(&s, None, now).unwrap(), utc(2025, 5, 31, 1, 0, 0));
    }

    #[test]
    fn test_yearly_anchor() {
        let s = spec(ScheduleKind::Yearly {
            at_time: "00:30".to_string(),
            day_of_month: 1,
            month: 3,
        });
        let now = utc(2025, 5, 15, 0, 0, 0);
        assert_eq!(next_fire(&s, None, now).unwrap(), utc(2026, 3, 1, 0, 30, 0));

        let prev = utc(2026, 3, 1, 0, 30, 0);
        assert_eq!(
            next_fire(&s, Some(prev), utc(2026, 3, 1, 0, 30, 1)).unwrap(),
            utc(2027, 3, 1, 0, 30, 0)
        );
    }

    #[test]
    fn test_yearly_leap_day_skips_common_years() {
        let s = spec(ScheduleKind::Yearly {
            at_time: "00:00".to_string(),
            day_of_month: 29,
            month: 2,
        });
        let now = utc(2025, 3, 1, 0, 0, 0);
        assert_eq!(next_fire(&s, None, now).unwrap(), utc(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn test_onetime_past_fires_immediately_and_once() {
        let mut s = spec(ScheduleKind::Onetime);
        s.start_time = Some(utc(2025, 1, 1, 0, 0, 0));
        let now = utc(2025, 5, 15, 12, 0, 0);
        assert_eq!(next_fire(&s, None, now).unwrap(), now);
        assert!(next_fire(&s, Some(now), now).is_none());
    }

    #[test]
    fn test_random_within_bounds() {
        let s = spec(ScheduleKind::Random {
            min_duration: 10,
            max_duration: 20,
        });
        let now = utc(2025, 5, 15, 12, 0, 0);
        for _ in 0..32 {
            let next = next_fire(&s, None, now).unwrap();
            let gap = (next - now).num_seconds();
            assert!((10..=20).contains(&gap), "gap {} out of bounds", gap);
        }
    }

    #[test]
    fn test_add_months_wraps_year() {
        assert_eq!(add_months(2025, 11, 1), (2025, 12));
        assert_eq!(add_months(2025, 12, 1), (2026, 1));
        assert_eq!(add_months(2025, 6, 18), (2026, 12));
    }

    struct CountingExecutor {
        fires: AtomicU32,
    }

    #[async_trait]
    impl JobExecutor for CountingExecutor {
        async fn fire(&self, _key: JobKey) -> FireOutcome {
            self.fires.fetch_add(1, Ordering::SeqCst);
            FireOutcome::Completed
        }
    }

    fn sample_policy(schedules: Vec<ScheduleSpec>) -> SnapshotPolicy {
        SnapshotPolicy {
            id: Uuid::new_v4(),
            name: "p".to_string(),
            description: String::new(),
            dataset: "tank/data".to_string(),
            schedules,
            recursive: false,
            snap_name_pattern: String::new(),
            retention_policy: Default::default(),
            properties: Default::default(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_at: None,
            last_run_status: String::new(),
            last_run_error: String::new(),
            monitor_status: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_runs_stops_firing() {
        let scheduler = Scheduler::new();
        let executor = Arc::new(CountingExecutor {
            fires: AtomicU32::new(0),
        });
        let mut spec = ScheduleSpec::new(ScheduleKind::Secondly { interval: 1 });
        spec.limited_runs = 2;
        let policy = sample_policy(vec![spec]);

        scheduler.register(&policy, executor.clone()).await.unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(executor.fires.load(Ordering::SeqCst), 2);
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_schedule_not_registered() {
        let scheduler = Scheduler::new();
        let executor = Arc::new(CountingExecutor {
            fires: AtomicU32::new(0),
        });
        let mut disabled = ScheduleSpec::new(ScheduleKind::Secondly { interval: 1 });
        disabled.enabled = false;
        let enabled = ScheduleSpec::new(ScheduleKind::Hourly { interval: 1 });
        let policy = sample_policy(vec![disabled, enabled]);

        let keys = scheduler.register(&policy, executor).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].schedule_index, 1);
        scheduler.stop(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_firings_before_start() {
        let scheduler = Scheduler::new();
        let executor = Arc::new(CountingExecutor {
            fires: AtomicU32::new(0),
        });
        let policy = sample_policy(vec![ScheduleSpec::new(ScheduleKind::Secondly {
            interval: 1,
        })]);

        scheduler.register(&policy, executor.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(executor.fires.load(Ordering::SeqCst), 0);
        scheduler.stop(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_silences_jobs() {
        let scheduler = Scheduler::new();
        let executor = Arc::new(CountingExecutor {
            fires: AtomicU32::new(0),
        });
        let policy = sample_policy(vec![ScheduleSpec::new(ScheduleKind::Secondly {
            interval: 1,
        })]);

        scheduler.register(&policy, executor.clone()).await.unwrap();
        scheduler.start();
        scheduler.deregister(policy.id).await;
        let settled = executor.fires.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(executor.fires.load(Ordering::SeqCst), settled);
        scheduler.stop(Duration::from_millis(10)).await;
    }
}
