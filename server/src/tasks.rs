//! Periodic maintenance: promoting due jobs, purging the dead set, reaping
//! expired reservations and stale workers, and backups.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::constants::HEARTBEAT_TTL_SECS;
use crate::manager::Manager;
use crate::storage::{SetKind, Store};
use crate::workers::Workers;

pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs one pass and returns how many items it touched.
    fn execute(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct TaskStats {
    pub runs: u64,
    pub walltime_ns: u64,
    pub period_secs: u64,
}

struct Registered {
    task: Box<dyn Task>,
    period_secs: u64,
    runs: AtomicU64,
    walltime_ns: AtomicU64,
}

impl Registered {
    fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        let started = Instant::now();
        let outcome = self.task.execute(now);
        let elapsed = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.walltime_ns.fetch_add(elapsed, Ordering::Relaxed);
        outcome
    }
}

/// Runs registered tasks on a one-second tick. A task with period `p`
/// runs on every tick where the unix time is a multiple of `p`.
#[derive(Default)]
pub struct TaskRunner {
    tasks: Vec<Registered>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, period_secs: u64, task: impl Task + 'static) {
        self.tasks.push(Registered {
            task: Box::new(task),
            period_secs: period_secs.max(1),
            runs: AtomicU64::new(0),
            walltime_ns: AtomicU64::new(0),
        });
    }

    /// Runs, in registration order, every task due at `now`. Failures are
    /// logged and do not stop the other tasks.
    pub fn tick(&self, now: DateTime<Utc>) {
        let secs = now.timestamp();
        for registered in &self.tasks {
            if secs.rem_euclid(registered.period_secs as i64) != 0 {
                continue;
            }
            match registered.run(now) {
                Ok(0) => {}
                Ok(count) => {
                    tracing::debug!(task = registered.task.name(), count, "task finished");
                }
                Err(err) => {
                    tracing::error!(task = registered.task.name(), error = ?err, "task failed");
                }
            }
        }
    }

    /// Runs a single task immediately, regardless of its period.
    pub fn run_named(&self, name: &str, now: DateTime<Utc>) -> Result<usize> {
        let registered = self
            .tasks
            .iter()
            .find(|registered| registered.task.name() == name)
            .ok_or_else(|| anyhow!("unknown task {name}"))?;
        registered.run(now)
    }

    pub fn stats(&self) -> BTreeMap<String, TaskStats> {
        self.tasks
            .iter()
            .map(|registered| {
                (
                    registered.task.name().to_string(),
                    TaskStats {
                        runs: registered.runs.load(Ordering::Relaxed),
                        walltime_ns: registered.walltime_ns.load(Ordering::Relaxed),
                        period_secs: registered.period_secs,
                    },
                )
            })
            .collect()
    }

    /// Ticks until `shutdown` flips to true. Each tick runs on the blocking
    /// pool.
    pub async fn run(self: Arc<Self>, clock: Arc<dyn Clock>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Tasks do synchronous SQLite work; keep it off the
                    // runtime's worker threads.
                    let runner = self.clone();
                    let now = clock.now();
                    let ticked = tokio::task::spawn_blocking(move || runner.tick(now)).await;
                    if let Err(err) = ticked {
                        tracing::error!(error = %err, "task tick aborted");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("task runner stopped");
    }
}

/// Enqueues due jobs from the scheduled or retries set.
pub struct PromoteTask {
    manager: Arc<Manager>,
    kind: SetKind,
}

impl PromoteTask {
    pub fn new(manager: Arc<Manager>, kind: SetKind) -> Self {
        Self { manager, kind }
    }
}

impl Task for PromoteTask {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn execute(&self, now: DateTime<Utc>) -> Result<usize> {
        self.manager
            .promote_due(self.kind, now)
            .with_context(|| format!("promoting due {} jobs", self.kind.name()))
    }
}

/// Drops dead jobs whose retention ran out.
pub struct DeadPurgeTask {
    store: Arc<Store>,
}

impl DeadPurgeTask {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl Task for DeadPurgeTask {
    fn name(&self) -> &'static str {
        "dead"
    }

    fn execute(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self
            .store
            .dead()
            .remove_before(now)
            .context("purging dead jobs")?;
        Ok(purged.len())
    }
}

pub struct ReservationReaperTask {
    manager: Arc<Manager>,
}

impl ReservationReaperTask {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

impl Task for ReservationReaperTask {
    fn name(&self) -> &'static str {
        "reservations"
    }

    fn execute(&self, now: DateTime<Utc>) -> Result<usize> {
        self.manager
            .reap_expired(now)
            .context("reaping expired reservations")
    }
}

pub struct HeartbeatReaperTask {
    workers: Arc<Workers>,
}

impl HeartbeatReaperTask {
    pub fn new(workers: Arc<Workers>) -> Self {
        Self { workers }
    }
}

impl Task for HeartbeatReaperTask {
    fn name(&self) -> &'static str {
        "heartbeats"
    }

    fn execute(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .workers
            .reap_heartbeats(now - TimeDelta::seconds(HEARTBEAT_TTL_SECS)))
    }
}

pub struct BackupTask {
    store: Arc<Store>,
    keep: usize,
}

impl BackupTask {
    pub fn new(store: Arc<Store>, keep: usize) -> Self {
        Self { store, keep }
    }
}

impl Task for BackupTask {
    fn name(&self) -> &'static str {
        "backup"
    }

    fn execute(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.backup(now).context("writing backup")?;
        let purged = self
            .store
            .purge_backups(self.keep)
            .context("purging old backups")?;
        Ok(1 + purged)
    }
}
