//! Persistent storage: named priority queues and sorted sets over one
//! SQLite file.

pub mod keys;
pub mod kv;
pub mod queue;
pub mod sorted;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use faktory_protocol::MutateTarget;

use crate::constants::{
    BACKUP_DIRNAME, BACKUP_FILE_PREFIX, DB_FILENAME, DEAD_SET, RETRIES_SET, SCHEDULED_SET,
    WORKING_SET,
};
use crate::error::StorageError;
use crate::job::is_valid_queue_name;

use self::keys::{KeyRange, namespace, namespace_of, prefix_successor};
use self::kv::{Batch, Family, Kv};
pub use self::queue::Queue;
use self::queue::PAUSED_META_PREFIX;
pub use self::sorted::{SetEntry, SortedSet, glob_regex};

const PROCESSED_COUNTER: &str = "processed";
const FAILURES_COUNTER: &str = "failures";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    Scheduled,
    Retries,
    Dead,
    Working,
}

impl SetKind {
    pub fn name(self) -> &'static str {
        match self {
            SetKind::Scheduled => SCHEDULED_SET,
            SetKind::Retries => RETRIES_SET,
            SetKind::Dead => DEAD_SET,
            SetKind::Working => WORKING_SET,
        }
    }
}

impl From<MutateTarget> for SetKind {
    fn from(target: MutateTarget) -> Self {
        match target {
            MutateTarget::Scheduled => SetKind::Scheduled,
            MutateTarget::Retries => SetKind::Retries,
            MutateTarget::Dead => SetKind::Dead,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct DayStats {
    pub date: NaiveDate,
    pub processed: i64,
    pub failures: i64,
}

#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    kv: Arc<Kv>,
    queues: RwLock<BTreeMap<String, Arc<Queue>>>,
    scheduled: SortedSet,
    retries: SortedSet,
    dead: SortedSet,
    working: SortedSet,
    max_queue_size: u64,
    shutdown: watch::Sender<bool>,
}

impl Store {
    /// Opens (or creates) the store under `dir`, rebuilding queue state
    /// from what is on disk. `max_queue_size == 0` disables the limit.
    pub fn open(dir: &Path, max_queue_size: u64) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let kv = Arc::new(Kv::open(&dir.join(DB_FILENAME))?);
        let (shutdown, _) = watch::channel(false);

        let paused: Vec<String> = kv
            .meta_keys(PAUSED_META_PREFIX)?
            .into_iter()
            .filter_map(|key| key.strip_prefix(PAUSED_META_PREFIX).map(str::to_string))
            .collect();
        let mut names = stored_queue_names(&kv)?;
        names.extend(paused.iter().cloned());

        let mut queues = BTreeMap::new();
        for name in names {
            if queues.contains_key(&name) {
                continue;
            }
            let queue = Queue::open(
                &name,
                kv.clone(),
                max_queue_size,
                paused.contains(&name),
                shutdown.subscribe(),
            )?;
            queues.insert(name, Arc::new(queue));
        }

        let store = Self {
            dir: dir.to_path_buf(),
            scheduled: SortedSet::open(SCHEDULED_SET, kv.clone())?,
            retries: SortedSet::open(RETRIES_SET, kv.clone())?,
            dead: SortedSet::open(DEAD_SET, kv.clone())?,
            working: SortedSet::open(WORKING_SET, kv.clone())?,
            kv,
            queues: RwLock::new(queues),
            max_queue_size,
            shutdown,
        };
        tracing::info!(
            path = %store.kv.path().display(),
            queues = store.queues.read().len(),
            scheduled = store.scheduled.size(),
            retries = store.retries.size(),
            dead = store.dead.size(),
            working = store.working.size(),
            "store opened"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn set(&self, kind: SetKind) -> &SortedSet {
        match kind {
            SetKind::Scheduled => &self.scheduled,
            SetKind::Retries => &self.retries,
            SetKind::Dead => &self.dead,
            SetKind::Working => &self.working,
        }
    }

    pub fn scheduled(&self) -> &SortedSet {
        &self.scheduled
    }

    pub fn retries(&self) -> &SortedSet {
        &self.retries
    }

    pub fn dead(&self) -> &SortedSet {
        &self.dead
    }

    pub fn working(&self) -> &SortedSet {
        &self.working
    }

    /// Returns the named queue, creating it on first use.
    pub fn get_queue(&self, name: &str) -> Result<Arc<Queue>, StorageError> {
        if !is_valid_queue_name(name) {
            return Err(StorageError::InvalidQueueName(name.to_string()));
        }
        if let Some(queue) = self.queues.read().get(name) {
            return Ok(queue.clone());
        }
        let mut queues = self.queues.write();
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }
        let queue = Arc::new(Queue::open(
            name,
            self.kv.clone(),
            self.max_queue_size,
            false,
            self.shutdown.subscribe(),
        )?);
        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    pub fn existing_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().get(name).cloned()
    }

    /// Every known queue, in name order.
    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.queues.read().values().cloned().collect()
    }

    pub fn each_queue(&self, mut f: impl FnMut(&Queue)) {
        for queue in self.queues() {
            f(&queue);
        }
    }

    /// Drops a queue and all of its jobs. An instance still held by a
    /// session stays registered, so later pushes through it keep using
    /// its sequence marks.
    pub fn remove_queue(&self, name: &str) -> Result<u64, StorageError> {
        let mut queues = self.queues.write();
        let Some(queue) = queues.get(name) else {
            return Ok(0);
        };
        let removed = queue.clear()?;
        queue.resume()?;
        if Arc::strong_count(queue) == 1 {
            queues.remove(name);
        }
        tracing::info!(queue = %name, removed, "queue removed");
        Ok(removed)
    }

    pub fn total_enqueued(&self) -> u64 {
        self.queues.read().values().map(|queue| queue.size()).sum()
    }

    pub fn incr_processed(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let day = daily_counter(PROCESSED_COUNTER, now.date_naive());
        self.kv
            .write(Batch::new().incr(PROCESSED_COUNTER, 1).incr(day, 1))?;
        Ok(())
    }

    /// A failure counts as both processed and failed.
    pub fn incr_failures(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let date = now.date_naive();
        self.kv.write(
            Batch::new()
                .incr(PROCESSED_COUNTER, 1)
                .incr(FAILURES_COUNTER, 1)
                .incr(daily_counter(PROCESSED_COUNTER, date), 1)
                .incr(daily_counter(FAILURES_COUNTER, date), 1),
        )?;
        Ok(())
    }

    pub fn total_processed(&self) -> Result<i64, StorageError> {
        self.kv.counter(PROCESSED_COUNTER)
    }

    pub fn total_failures(&self) -> Result<i64, StorageError> {
        self.kv.counter(FAILURES_COUNTER)
    }

    /// Daily counters for the `days` days ending with `today`, oldest first.
    pub fn history(&self, days: u32, today: NaiveDate) -> Result<Vec<DayStats>, StorageError> {
        let mut history = Vec::with_capacity(days as usize);
        for back in (0..days).rev() {
            let date = today - TimeDelta::days(i64::from(back));
            history.push(DayStats {
                date,
                processed: self.kv.counter(&daily_counter(PROCESSED_COUNTER, date))?,
                failures: self.kv.counter(&daily_counter(FAILURES_COUNTER, date))?,
            });
        }
        Ok(history)
    }

    /// Deletes every job, set entry, counter and pause flag.
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut queues = self.queues.write();
        let holds: Vec<_> = queues.values().map(|queue| queue.hold()).collect();
        self.kv.clear()?;
        for hold in holds {
            hold.reset();
        }
        queues.retain(|_, queue| Arc::strong_count(queue) > 1);
        for set in [&self.scheduled, &self.retries, &self.dead, &self.working] {
            set.resync()?;
        }
        tracing::info!("store flushed");
        Ok(())
    }

    /// Writes a point-in-time copy to `<dir>/backups/faktory-<ts>.db`.
    pub fn backup(&self, now: DateTime<Utc>) -> Result<PathBuf, StorageError> {
        let dir = self.dir.join(BACKUP_DIRNAME);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "{BACKUP_FILE_PREFIX}{}.db",
            now.format("%Y%m%dT%H%M%S%.6fZ")
        ));
        self.kv.backup_to(&path)?;
        tracing::info!(path = %path.display(), "backup written");
        Ok(path)
    }

    /// Keeps the newest `keep` backups and deletes the rest.
    pub fn purge_backups(&self, keep: usize) -> Result<usize, StorageError> {
        let dir = self.dir.join(BACKUP_DIRNAME);
        if !dir.exists() {
            return Ok(0);
        }
        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(BACKUP_FILE_PREFIX) {
                backups.push(entry.path());
            }
        }
        backups.sort();
        let excess = backups.len().saturating_sub(keep);
        for path in backups.iter().take(excess) {
            std::fs::remove_file(path)?;
            tracing::debug!(path = %path.display(), "old backup removed");
        }
        Ok(excess)
    }

    /// Wakes every blocked pop with nothing; later pops still work.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

fn daily_counter(name: &str, date: NaiveDate) -> String {
    format!("{name}:{}", date.format("%Y-%m-%d"))
}

/// Distinct queue names present in the queue table, found by seeking past
/// each name's key range rather than reading every entry.
fn stored_queue_names(kv: &Kv) -> Result<Vec<String>, StorageError> {
    let mut names = Vec::new();
    let mut cursor = KeyRange {
        start: Vec::new(),
        end: None,
    };
    while let Some((key, _)) = kv.first_in(Family::Queues, &cursor)? {
        let Some(name) = namespace_of(&key) else {
            cursor = cursor.after(&key);
            continue;
        };
        let next = prefix_successor(&namespace(name));
        names.push(name.to_string());
        match next {
            Some(start) => cursor = KeyRange { start, end: None },
            None => break,
        }
    }
    Ok(names)
}
