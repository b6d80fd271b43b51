//! In-process timer for the recurring sync tasks.
//!
//! A registry maps job ids to a [`Schedule`] and its next fire time. One loop
//! sleeps until the earliest fire time, runs whatever is due through a
//! [`TaskRunner`], and wakes early whenever the registry changes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::SyncError;
use crate::settings::SyncSettings;
use crate::sync::SyncService;

pub const DAILY_SYNC: &str = "daily_sync";
pub const NEW_EPISODES_CHECK: &str = "new_episodes_check";
pub const ANALYTICS_CALCULATION: &str = "analytics_calculation";
pub const CLEANUP_OLD_DATA: &str = "cleanup_old_data";

/// Longest the loop sleeps when nothing is scheduled or firing is paused.
const IDLE_WAKEUP: StdDuration = StdDuration::from_secs(3_600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Every day at `hour:minute` UTC.
    DailyAt { hour: u32, minute: u32 },
    /// On the hour, whenever the UTC hour is a multiple of `hours`.
    EveryHours { hours: u32 },
    /// Once a week at `hour:minute` UTC.
    WeeklyAt {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
}

impl Schedule {
    /// First fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Schedule::DailyAt { hour, minute } => {
                let mut candidate = at_time(after, hour, minute);
                if candidate <= after {
                    candidate += Duration::days(1);
                }
                candidate
            }
            Schedule::EveryHours { hours } => {
                let step = hours.clamp(1, 24);
                let mut candidate = at_time(after, after.hour(), 0) + Duration::hours(1);
                while candidate.hour() % step != 0 {
                    candidate += Duration::hours(1);
                }
                candidate
            }
            Schedule::WeeklyAt {
                weekday,
                hour,
                minute,
            } => {
                let mut candidate = at_time(after, hour, minute);
                while candidate.weekday() != weekday || candidate <= after {
                    candidate += Duration::days(1);
                }
                candidate
            }
        }
    }
}

fn at_time(day: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0).unwrap_or_default();
    day.date_naive().and_time(time).and_utc()
}

#[derive(Debug, Clone)]
struct ScheduledJob {
    name: String,
    schedule: Schedule,
    next_fire: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub next_run: Option<DateTime<Utc>>,
}

/// Executes one scheduled task by id.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task_id: &str) -> Result<()>;
}

#[derive(Default)]
struct Registry {
    jobs: BTreeMap<String, ScheduledJob>,
    paused: bool,
}

#[derive(Default)]
pub struct Scheduler {
    registry: Mutex<Registry>,
    wake: Notify,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the job with this id.
    pub fn register(&self, id: &str, name: &str, schedule: Schedule) {
        self.register_at(id, name, schedule, Utc::now());
    }

    pub fn register_at(&self, id: &str, name: &str, schedule: Schedule, now: DateTime<Utc>) {
        let next_fire = schedule.next_fire_after(now);
        let replaced = self
            .registry
            .lock()
            .jobs
            .insert(
                id.to_string(),
                ScheduledJob {
                    name: name.to_string(),
                    schedule,
                    next_fire,
                },
            )
            .is_some();
        info!(job = id, replaced, next_run = %next_fire, "scheduled job registered");
        self.wake.notify_one();
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.registry.lock().jobs.remove(id).is_some();
        self.wake.notify_one();
        removed
    }

    pub fn reschedule_daily_sync(&self, hour: u32) {
        self.register(DAILY_SYNC, "Daily full sync", Schedule::DailyAt { hour, minute: 0 });
    }

    pub fn pause(&self) {
        self.registry.lock().paused = true;
        info!("scheduler paused");
        self.wake.notify_one();
    }

    /// Resumes firing. Fire times missed while paused are skipped.
    pub fn resume(&self) {
        let now = Utc::now();
        {
            let mut registry = self.registry.lock();
            registry.paused = false;
            for job in registry.jobs.values_mut() {
                if job.next_fire <= now {
                    job.next_fire = job.schedule.next_fire_after(now);
                }
            }
        }
        info!("scheduler resumed");
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.registry.lock().paused
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        let registry = self.registry.lock();
        registry
            .jobs
            .iter()
            .map(|(id, job)| JobInfo {
                id: id.clone(),
                name: job.name.clone(),
                schedule: job.schedule,
                next_run: (!registry.paused).then_some(job.next_fire),
            })
            .collect()
    }

    pub fn next_run(&self, id: &str) -> Option<DateTime<Utc>> {
        let registry = self.registry.lock();
        if registry.paused {
            return None;
        }
        registry.jobs.get(id).map(|job| job.next_fire)
    }

    /// Ids due at `now`, earliest first. Each returned job is advanced to
    /// its next fire time after `now`.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut registry = self.registry.lock();
        if registry.paused {
            return Vec::new();
        }
        let mut due: Vec<(DateTime<Utc>, String)> = registry
            .jobs
            .iter()
            .filter(|(_, job)| job.next_fire <= now)
            .map(|(id, job)| (job.next_fire, id.clone()))
            .collect();
        due.sort();
        for (_, id) in &due {
            if let Some(job) = registry.jobs.get_mut(id) {
                job.next_fire = job.schedule.next_fire_after(now);
            }
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    fn sleep_duration(&self, now: DateTime<Utc>) -> StdDuration {
        let registry = self.registry.lock();
        if registry.paused {
            return IDLE_WAKEUP;
        }
        registry
            .jobs
            .values()
            .map(|job| job.next_fire)
            .min()
            .map(|next| (next - now).to_std().unwrap_or(StdDuration::ZERO))
            .map_or(IDLE_WAKEUP, |wait| wait.min(IDLE_WAKEUP))
    }

    /// Runs until `shutdown` is cancelled. Due tasks run one after another.
    pub async fn run(self: Arc<Self>, runner: Arc<dyn TaskRunner>, shutdown: CancellationToken) {
        info!("scheduler loop started");
        loop {
            for task_id in self.take_due(Utc::now()) {
                info!(task = task_id.as_str(), "running scheduled task");
                if let Err(err) = runner.run_task(&task_id).await {
                    error!(task = task_id.as_str(), "scheduled task failed: {err:#}");
                }
            }

            let wait = self.sleep_duration(Utc::now());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("scheduler loop stopped");
    }
}

/// Registers the four recurring jobs of the sync service.
pub fn register_default_jobs(scheduler: &Scheduler, settings: &SyncSettings) {
    scheduler.reschedule_daily_sync(settings.sync_schedule_hour);
    scheduler.register(
        NEW_EPISODES_CHECK,
        "New episodes check",
        Schedule::EveryHours { hours: 6 },
    );
    scheduler.register(
        ANALYTICS_CALCULATION,
        "Daily analytics calculation",
        Schedule::DailyAt { hour: 3, minute: 0 },
    );
    scheduler.register(
        CLEANUP_OLD_DATA,
        "Cleanup old analytics",
        Schedule::WeeklyAt {
            weekday: Weekday::Sun,
            hour: 4,
            minute: 0,
        },
    );
}

/// Disabled or overlapping runs are expected on a timer and only logged.
fn skip_expected<T>(task_id: &str, result: Result<T, SyncError>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(SyncError::Disabled(reason)) => {
            info!(task = task_id, "skipping scheduled task: {reason}");
            Ok(())
        }
        Err(SyncError::AlreadyRunning) => {
            warn!(task = task_id, "skipping scheduled task, a sync is already running");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl TaskRunner for SyncService {
    async fn run_task(&self, task_id: &str) -> Result<()> {
        match task_id {
            DAILY_SYNC => skip_expected(task_id, self.run_full_sync().await),
            NEW_EPISODES_CHECK => skip_expected(task_id, self.check_new_episodes().await),
            ANALYTICS_CALCULATION => skip_expected(task_id, self.recalculate_analytics().await),
            CLEANUP_OLD_DATA => skip_expected(task_id, self.cleanup_old_data().await),
            other => {
                warn!(task = other, "unknown scheduled task");
                Ok(())
            }
        }
    }
}
