//! Timer-driven backups
//!
//! [`BackupScheduler`] runs on tokio. It takes a FULL backup every day at a
//! configured local time and, optionally, an INCREMENTAL one every N hours.
//! Failed runs are logged and recorded in [`SchedulerStatus::last_run`]; they
//! never stop the loop.
//!
//! ```rust,no_run
//! use backstop::{BackupManager, BackupScheduler, ScheduleConfig};
//! use std::sync::Arc;
//!
//! # async fn run(manager: Arc<BackupManager>) -> backstop::Result<()> {
//! let mut scheduler = BackupScheduler::new(manager, ScheduleConfig::default());
//! scheduler.start()?;
//! println!("{}", scheduler.status().message());
//! scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::config::ScheduleConfig;
use crate::error::{BackupError, Result};
use crate::manager::BackupManager;
use crate::types::{BackupKind, OperationReport};
use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Whether the scheduler is doing anything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    /// Scheduling is switched off in the configuration
    Disabled,
    /// Enabled but not started
    Stopped,
    /// Loop is running
    Running,
}

/// One completed scheduled run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledRun {
    /// Kind requested
    pub kind: BackupKind,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
    /// Outcome
    pub outcome: OperationReport,
}

/// Snapshot of the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Current state
    pub state: SchedulerState,
    /// Configured daily time (`HH:MM`)
    pub daily_at: String,
    /// Next daily FULL backup
    pub next_full: Option<DateTime<Local>>,
    /// Next INCREMENTAL backup
    pub next_incremental: Option<DateTime<Local>>,
    /// Most recent run
    pub last_run: Option<ScheduledRun>,
}

impl SchedulerStatus {
    /// Earliest upcoming run
    pub fn next_run(&self) -> Option<DateTime<Local>> {
        match (self.next_full, self.next_incremental) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// One-line description
    pub fn message(&self) -> String {
        match self.state {
            SchedulerState::Disabled => "Automatic backup disabled".to_string(),
            SchedulerState::Stopped => "Scheduler stopped".to_string(),
            SchedulerState::Running => match self.next_run() {
                Some(next) => format!("Automatic backup active, next run {}", next.format("%Y-%m-%d %H:%M")),
                None => "Automatic backup active".to_string(),
            },
        }
    }
}

/// Next occurrence of `at` (hour, minute) strictly after `now`
///
/// Today if the time is still ahead, tomorrow otherwise. A local time that
/// does not exist on a given day (DST gap) moves on to the following day.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, at: (u32, u32)) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    for offset in 0..3 {
        let Some(day) = today.checked_add_days(chrono::Days::new(offset)) else {
            break;
        };
        let Some(naive) = day.and_hms_opt(at.0, at.1, 0) else {
            break;
        };
        if let Some(candidate) = tz.from_local_datetime(&naive).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
    }
    now.clone() + ChronoDuration::days(1)
}

#[derive(Debug, Default)]
struct Shared {
    next_full: Option<DateTime<Local>>,
    next_incremental: Option<DateTime<Local>>,
    last_run: Option<ScheduledRun>,
}

/// Daily FULL plus periodic INCREMENTAL backups
pub struct BackupScheduler {
    manager: Arc<BackupManager>,
    config: ScheduleConfig,
    shared: Arc<Mutex<Shared>>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl BackupScheduler {
    /// Scheduler over a manager; nothing runs until [`start`](Self::start)
    pub fn new(manager: Arc<BackupManager>, config: ScheduleConfig) -> Self {
        Self {
            manager,
            config,
            shared: Arc::new(Mutex::new(Shared::default())),
            shutdown: None,
            handle: None,
        }
    }

    /// Whether the loop is running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the scheduling loop on the current tokio runtime
    ///
    /// Starting a running scheduler does nothing.
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidConfiguration`] if scheduling is disabled or
    ///   the configuration is invalid
    /// - [`BackupError::Internal`] outside a tokio runtime
    pub fn start(&mut self) -> Result<()> {
        if !self.config.enabled {
            return Err(BackupError::InvalidConfiguration(
                "automatic backup is disabled".to_string(),
            ));
        }
        if self.is_running() {
            warn!("Scheduler already running");
            return Ok(());
        }
        self.config.validate()?;
        let daily_at = self.config.daily_time()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BackupError::internal(format!("scheduler needs a tokio runtime: {}", e)))?;

        let (tx, rx) = watch::channel(false);
        let every = self.config.incremental_every_hours.map(|h| ChronoDuration::hours(h as i64));
        let now = Local::now();
        let first = Upcoming {
            full: next_daily_run(&now, daily_at),
            incremental: every.map(|d| now + d),
        };
        first.publish(&self.shared);
        let handle = runtime.spawn(run_loop(
            Arc::clone(&self.manager),
            Arc::clone(&self.shared),
            daily_at,
            every,
            first,
            rx,
        ));
        self.shutdown = Some(tx);
        self.handle = Some(handle);
        info!("Backup scheduler started (daily at {})", self.config.daily_at);
        Ok(())
    }

    /// Stop the loop, waiting for a run in progress to finish
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
        let mut shared = self.shared.lock();
        shared.next_full = None;
        shared.next_incremental = None;
        info!("Backup scheduler stopped");
    }

    /// Current state and upcoming runs
    pub fn status(&self) -> SchedulerStatus {
        let state = if !self.config.enabled {
            SchedulerState::Disabled
        } else if self.is_running() {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        };
        let shared = self.shared.lock();
        let running = state == SchedulerState::Running;
        SchedulerStatus {
            state,
            daily_at: self.config.daily_at.clone(),
            next_full: shared.next_full.filter(|_| running),
            next_incremental: shared.next_incremental.filter(|_| running),
            last_run: shared.last_run.clone(),
        }
    }
}

/// Due times of the next FULL and INCREMENTAL runs
#[derive(Debug, Clone, Copy)]
struct Upcoming {
    full: DateTime<Local>,
    incremental: Option<DateTime<Local>>,
}

impl Upcoming {
    fn publish(&self, shared: &Mutex<Shared>) {
        let mut s = shared.lock();
        s.next_full = Some(self.full);
        s.next_incremental = self.incremental;
    }

    /// The run that comes first; FULL wins a tie
    fn due(&self) -> (BackupKind, DateTime<Local>) {
        match self.incremental {
            Some(incremental) if incremental < self.full => (BackupKind::Incremental, incremental),
            _ => (BackupKind::Full, self.full),
        }
    }
}

async fn run_loop(
    manager: Arc<BackupManager>,
    shared: Arc<Mutex<Shared>>,
    daily_at: (u32, u32),
    every: Option<ChronoDuration>,
    mut upcoming: Upcoming,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        upcoming.publish(&shared);

        let (kind, due) = upcoming.due();
        debug!("Next scheduled backup: {} at {}", kind, due);
        let wait = (due - Local::now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                let outcome = run_once(&manager, kind).await;
                shared.lock().last_run = Some(ScheduledRun {
                    kind,
                    finished_at: Utc::now(),
                    outcome,
                });
                match kind {
                    BackupKind::Incremental => upcoming.incremental = every.map(|d| Local::now() + d),
                    _ => upcoming.full = next_daily_run(&Local::now(), daily_at),
                }
            }
            _ = shutdown.changed() => {
                debug!("Scheduler loop shutting down");
                break;
            }
        }
    }
}

async fn run_once(manager: &Arc<BackupManager>, kind: BackupKind) -> OperationReport {
    let span = info_span!("scheduled_backup", run = %Uuid::new_v4(), %kind);
    async {
        info!("Starting automatic backup");
        let result = manager.create_backup_async(kind, None).await;
        match &result {
            Ok(created) => info!("Automatic backup {} complete", created.info.id),
            Err(e) => error!("Automatic backup failed: {}", e),
        }
        OperationReport::from_result(&result, |created| format!("created {}", created.info.id))
    }
    .instrument(span)
    .await
}
