use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::error::StorageError;
use crate::storage::keys::{
    KeyRange, bucket_prefix, decode_queue_key, namespace, prefix_successor, queue_key,
};
use crate::storage::kv::{Batch, Entry, Family, Kv};

pub(crate) const PAUSED_META_PREFIX: &str = "paused:";

/// Sequence window of one priority bucket: `low` is the next sequence that
/// may still hold an entry, `high` the next one to assign.
#[derive(Debug, Clone, Copy, Default)]
struct Marks {
    low: u64,
    high: u64,
}

#[derive(Debug)]
struct Waiter {
    deadline: Instant,
    notify: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct QueueState {
    // Keyed by inverted priority, so iteration starts at the highest priority.
    marks: BTreeMap<u8, Marks>,
    waiters: VecDeque<Waiter>,
}

/// A persistent priority queue with blocking pop.
#[derive(Debug)]
pub struct Queue {
    name: String,
    prefix: Vec<u8>,
    kv: Arc<Kv>,
    state: Mutex<QueueState>,
    size: AtomicU64,
    paused: AtomicBool,
    max_size: u64,
    shutdown: watch::Receiver<bool>,
}

impl Queue {
    pub(crate) fn open(
        name: &str,
        kv: Arc<Kv>,
        max_size: u64,
        paused: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, StorageError> {
        let prefix = namespace(name);
        let marks = scan_marks(&kv, &prefix)?;
        let size = kv.count(Family::Queues, &KeyRange::prefix(&prefix))?;
        Ok(Self {
            name: name.to_string(),
            prefix,
            kv,
            state: Mutex::new(QueueState {
                marks,
                waiters: VecDeque::new(),
            }),
            size: AtomicU64::new(size),
            paused: AtomicBool::new(paused),
            max_size,
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn push(&self, priority: u8, payload: &[u8]) -> Result<(), StorageError> {
        self.push_with_batch(priority, payload, Batch::new())
            .map(|_| ())
    }

    /// Appends `payload` and commits `batch` in the same transaction.
    ///
    /// Returns `false` if the batch was rejected (a `take` found nothing), in
    /// which case the queue is unchanged.
    pub fn push_with_batch(
        &self,
        priority: u8,
        payload: &[u8],
        batch: Batch,
    ) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        let size = self.size();
        if self.max_size > 0 && size >= self.max_size {
            return Err(StorageError::QueueFull {
                queue: self.name.clone(),
                size,
                max: self.max_size,
            });
        }

        let inverted = 255 - priority;
        let seq = state.marks.get(&inverted).map_or(0, |marks| marks.high);
        let batch = batch.put(
            Family::Queues,
            queue_key(&self.prefix, inverted, seq),
            payload.to_vec(),
        );
        if self.kv.write(batch)?.is_none() {
            return Ok(false);
        }

        let marks = state.marks.entry(inverted).or_insert(Marks {
            low: seq,
            high: seq,
        });
        marks.high = seq + 1;
        self.size.fetch_add(1, Ordering::AcqRel);
        wake_one(&mut state.waiters);
        Ok(true)
    }

    /// Non-blocking pop of the highest-priority, oldest entry.
    pub fn pop(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let mut state = self.state.lock();
        self.pop_locked(&mut state)
    }

    fn pop_locked(&self, state: &mut QueueState) -> Result<Option<Vec<u8>>, StorageError> {
        for (&inverted, marks) in state.marks.iter_mut() {
            if marks.low >= marks.high {
                continue;
            }
            let range = KeyRange::between(
                queue_key(&self.prefix, inverted, marks.low),
                queue_key(&self.prefix, inverted, marks.high),
            );
            match self.kv.take_first(Family::Queues, &range)? {
                Some((key, payload)) => {
                    let seq = decode_queue_key(&self.prefix, &key)
                        .map_or(marks.low, |(_, seq)| seq);
                    marks.low = seq + 1;
                    self.note_removed(1)?;
                    return Ok(Some(payload));
                }
                None => marks.low = marks.high,
            }
        }
        Ok(None)
    }

    /// Pops, waiting for a push until `deadline`. Returns `None` on timeout
    /// or when the store shuts down.
    pub async fn blocking_pop(&self, deadline: Instant) -> Result<Option<Vec<u8>>, StorageError> {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow_and_update() {
                return Ok(None);
            }
            let woken = {
                let mut state = self.state.lock();
                if let Some(payload) = self.pop_locked(&mut state)? {
                    return Ok(Some(payload));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                let now = Instant::now();
                state
                    .waiters
                    .retain(|waiter| waiter.deadline > now && !waiter.notify.is_closed());
                let (notify, woken) = oneshot::channel();
                state.waiters.push_back(Waiter { deadline, notify });
                woken
            };
            tokio::select! {
                _ = woken => {}
                _ = shutdown.changed() => return Ok(None),
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    pub fn clear(&self) -> Result<u64, StorageError> {
        let mut state = self.state.lock();
        let removed = self
            .kv
            .delete_range(Family::Queues, &KeyRange::prefix(&self.prefix))?;
        for marks in state.marks.values_mut() {
            marks.low = marks.high;
        }
        self.size.store(0, Ordering::Release);
        Ok(removed)
    }

    /// Blocks pushes and pops until the returned hold is reset or dropped.
    pub(crate) fn hold(&self) -> QueueHold<'_> {
        QueueHold {
            queue: self,
            state: self.state.lock(),
        }
    }

    /// Visits entries in pop order until `f` returns `false`.
    pub fn each(&self, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> Result<(), StorageError> {
        let mut range = KeyRange::prefix(&self.prefix);
        loop {
            let page = self.kv.scan(Family::Queues, &range, 0, Some(100))?;
            let Some((last, _)) = page.last() else {
                return Ok(());
            };
            let next = range.after(last);
            for (key, payload) in &page {
                if !f(key, payload) {
                    return Ok(());
                }
            }
            range = next;
        }
    }

    pub fn page(&self, offset: u64, count: u64) -> Result<Vec<Entry>, StorageError> {
        self.kv.scan(
            Family::Queues,
            &KeyRange::prefix(&self.prefix),
            offset,
            Some(count),
        )
    }

    /// Deletes entries by key; keys outside this queue are ignored.
    pub fn delete(&self, keys: &[Vec<u8>]) -> Result<u64, StorageError> {
        let _state = self.state.lock();
        let batch = keys
            .iter()
            .filter(|key| key.starts_with(&self.prefix))
            .fold(Batch::new(), |batch, key| {
                batch.delete(Family::Queues, key.clone())
            });
        if batch.is_empty() {
            return Ok(0);
        }
        let deleted = self.kv.write(batch)?.map_or(0, |applied| applied.deleted);
        self.note_removed(deleted)?;
        Ok(deleted)
    }

    /// Head entry of every non-empty priority bucket.
    pub fn heads(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        let state = self.state.lock();
        let mut heads = Vec::new();
        for (&inverted, marks) in &state.marks {
            if marks.low >= marks.high {
                continue;
            }
            let range = KeyRange::between(
                queue_key(&self.prefix, inverted, marks.low),
                queue_key(&self.prefix, inverted, marks.high),
            );
            if let Some((_, payload)) = self.kv.first_in(Family::Queues, &range)? {
                heads.push(payload);
            }
        }
        Ok(heads)
    }

    pub fn pause(&self) -> Result<(), StorageError> {
        self.kv.meta_put(&paused_key(&self.name), "1")?;
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), StorageError> {
        self.kv.meta_delete(&paused_key(&self.name))?;
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn note_removed(&self, count: u64) -> Result<(), StorageError> {
        if count == 0 {
            return Ok(());
        }
        let previous = self.size.fetch_sub(count, Ordering::AcqRel);
        if previous < count {
            let actual = self
                .kv
                .count(Family::Queues, &KeyRange::prefix(&self.prefix))?;
            tracing::warn!(queue = %self.name, actual, "queue size underflow, resynced");
            self.size.store(actual, Ordering::Release);
        }
        Ok(())
    }
}

/// Exclusive access to a queue while its rows are dropped elsewhere.
pub(crate) struct QueueHold<'a> {
    queue: &'a Queue,
    state: MutexGuard<'a, QueueState>,
}

impl QueueHold<'_> {
    /// Forgets every entry after the backing rows were deleted. Sequences
    /// keep counting up, so a caller still holding this instance never
    /// reuses a key.
    pub(crate) fn reset(mut self) {
        for marks in self.state.marks.values_mut() {
            marks.low = marks.high;
        }
        self.queue.size.store(0, Ordering::Release);
        self.queue.paused.store(false, Ordering::Release);
    }
}

pub(crate) fn paused_key(name: &str) -> String {
    format!("{PAUSED_META_PREFIX}{name}")
}

/// Signals the first waiter that is still listening and not past its
/// deadline; stale waiters are dropped on the way.
fn wake_one(waiters: &mut VecDeque<Waiter>) {
    let now = Instant::now();
    while let Some(waiter) = waiters.pop_front() {
        if waiter.deadline <= now || waiter.notify.is_closed() {
            continue;
        }
        if waiter.notify.send(()).is_ok() {
            return;
        }
    }
}

/// Rebuilds the per-priority sequence window by seeking to the first and
/// last key of each bucket.
fn scan_marks(kv: &Kv, prefix: &[u8]) -> Result<BTreeMap<u8, Marks>, StorageError> {
    let mut marks = BTreeMap::new();
    let queue_range = KeyRange::prefix(prefix);
    let mut cursor = queue_range.clone();
    while let Some((key, _)) = kv.first_in(Family::Queues, &cursor)? {
        let Some((inverted, low)) = decode_queue_key(prefix, &key) else {
            cursor = cursor.after(&key);
            continue;
        };
        let bucket = bucket_prefix(prefix, inverted);
        let bucket_range = KeyRange::prefix(&bucket);
        let high = kv
            .last_in(Family::Queues, &bucket_range)?
            .and_then(|(key, _)| decode_queue_key(prefix, &key))
            .map_or(low, |(_, seq)| seq);
        marks.insert(
            inverted,
            Marks {
                low,
                high: high + 1,
            },
        );
        match prefix_successor(&bucket) {
            Some(next) if queue_range.end.as_ref().is_none_or(|end| &next < end) => {
                cursor = KeyRange {
                    start: next,
                    end: queue_range.end.clone(),
                };
            }
            _ => break,
        }
    }
    Ok(marks)
}
