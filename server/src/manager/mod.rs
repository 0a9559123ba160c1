//! Job lifecycle: push, fetch with reservation, ack, fail and the
//! background transitions between queues and sorted sets.

pub mod middleware;
mod mutate;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use faktory_protocol::{FailPayload, WorkerState};

use crate::clock::{Clock, format_ts, parse_ts};
use crate::constants::{
    DEAD_TTL_SECS, FETCH_TIMEOUT, MAX_BACKOFF_SECS, MAX_BACKTRACE_LINES, MAX_ERRTYPE_LEN,
    MAX_MESSAGE_LEN, RESERVATION_EXPIRED_ERRTYPE, RESERVATION_EXPIRED_MESSAGE,
};
use crate::error::{JobError, RuntimeError, StorageError};
use crate::job::{Failure, Job};
use crate::storage::{SetKind, Store};
use crate::workers::Workers;

pub use self::middleware::{Middleware, MiddlewareContext, MiddlewareError, Next};

/// A fetched job bound to the worker that holds it until `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reservation {
    pub job: Job,
    pub reserved_at: String,
    pub expires_at: String,
    pub wid: String,
}

/// Why a reserved job did not complete.
#[derive(Debug, Clone, Default)]
pub struct FailureReport {
    pub errtype: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

impl From<FailPayload> for FailureReport {
    fn from(payload: FailPayload) -> Self {
        Self {
            errtype: payload.errtype,
            message: payload.message,
            backtrace: payload.backtrace,
        }
    }
}

pub struct Manager {
    store: Arc<Store>,
    workers: Arc<Workers>,
    clock: Arc<dyn Clock>,
    reservations: RwLock<HashMap<String, Reservation>>,
    push_chain: RwLock<Vec<Arc<dyn Middleware>>>,
    fetch_chain: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Manager {
    pub fn new(store: Arc<Store>, workers: Arc<Workers>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            workers,
            clock,
            reservations: RwLock::new(HashMap::new()),
            push_chain: RwLock::new(Vec::new()),
            fetch_chain: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn add_push_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.push_chain.write().push(middleware);
    }

    pub fn add_fetch_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.fetch_chain.write().push(middleware);
    }

    /// Validates and stores a job: into `scheduled` when `at` is in the
    /// future, otherwise onto its queue.
    pub async fn push(&self, mut job: Job) -> Result<(), JobError> {
        let now = self.clock.now();
        job.normalize(now)?;

        let chain = self.push_chain.read().clone();
        let mut ctx = MiddlewareContext::new(job, None, now);
        match Next::new(&chain).run(&mut ctx).await {
            Ok(()) if ctx.completed() => {}
            Ok(()) | Err(MiddlewareError::Discard) => {
                tracing::debug!(jid = %ctx.job.jid, "push discarded by middleware");
                return Ok(());
            }
            Err(MiddlewareError::Halt(message)) => return Err(JobError::Halted(message)),
        }
        self.enqueue(ctx.job, now)
    }

    fn enqueue(&self, mut job: Job, now: DateTime<Utc>) -> Result<(), JobError> {
        if let Some(at) = job.scheduled_at()
            && at > now
        {
            let payload = serde_json::to_vec(&job)?;
            self.store.scheduled().add(at, &job.jid, &payload)?;
            tracing::debug!(jid = %job.jid, at = %format_ts(at), "job scheduled");
            return Ok(());
        }
        job.enqueued_at = Some(format_ts(now));
        let queue = self.store.get_queue(&job.queue)?;
        let payload = serde_json::to_vec(&job)?;
        queue.push(job.priority_byte(), &payload)?;
        tracing::debug!(jid = %job.jid, queue = %job.queue, "job enqueued");
        Ok(())
    }

    /// Pushes each job independently. The result maps the jid of every
    /// rejected job to its error; an empty map means all were accepted.
    pub async fn push_bulk(&self, jobs: Vec<Value>) -> BTreeMap<String, String> {
        let mut errors = BTreeMap::new();
        for raw in jobs {
            let jid = raw
                .get("jid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let outcome = match serde_json::from_value::<Job>(raw) {
                Ok(job) => self.push(job).await,
                Err(err) => Err(JobError::from(err)),
            };
            if let Err(err) = outcome {
                errors.insert(jid, err.to_string());
            }
        }
        errors
    }

    /// Reserves the next job from `queues` (tried in order) for `wid`,
    /// waiting up to two seconds on the first open queue when all are empty.
    pub async fn fetch(&self, wid: &str, queues: &[String]) -> Result<Option<Job>, JobError> {
        let deadline = Instant::now() + FETCH_TIMEOUT;
        if self
            .workers
            .state(wid)
            .is_some_and(|state| state != WorkerState::Running)
        {
            tokio::time::sleep_until(deadline).await;
            return Ok(None);
        }

        loop {
            let Some(payload) = self.pop_any(queues, deadline).await? else {
                return Ok(None);
            };
            let job: Job = match serde_json::from_slice(&payload) {
                Ok(job) => job,
                Err(err) => {
                    RuntimeError::capture(format!("dropping undecodable queued job: {err}")).log();
                    continue;
                }
            };
            let reservation = self.reserve(wid, job)?;

            let chain = self.fetch_chain.read().clone();
            let mut ctx = MiddlewareContext::new(
                reservation.job.clone(),
                Some(wid.to_string()),
                self.clock.now(),
            );
            match Next::new(&chain).run(&mut ctx).await {
                Ok(()) if ctx.completed() => return Ok(Some(ctx.job)),
                Ok(()) | Err(MiddlewareError::Discard) => {
                    tracing::debug!(jid = %reservation.job.jid, "fetch discarded by middleware");
                    self.release(&reservation.job.jid)?;
                }
                Err(MiddlewareError::Halt(message)) => return Err(JobError::Halted(message)),
            }
        }
    }

    async fn pop_any(
        &self,
        queues: &[String],
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>, JobError> {
        let mut first_open = None;
        for name in queues {
            let queue = self.store.get_queue(name)?;
            if queue.is_paused() {
                continue;
            }
            if let Some(payload) = queue.pop()? {
                return Ok(Some(payload));
            }
            if first_open.is_none() {
                first_open = Some(queue);
            }
        }
        match first_open {
            Some(queue) => Ok(queue.blocking_pop(deadline).await?),
            None => {
                tokio::time::sleep_until(deadline).await;
                Ok(None)
            }
        }
    }

    /// Records the lease in the working set and the in-memory index.
    pub fn reserve(&self, wid: &str, job: Job) -> Result<Reservation, JobError> {
        let now = self.clock.now();
        let expires = now + TimeDelta::seconds(job.reserve_for_secs());
        let reservation = Reservation {
            job,
            reserved_at: format_ts(now),
            expires_at: format_ts(expires),
            wid: wid.to_string(),
        };
        let payload = serde_json::to_vec(&reservation)?;
        let jid = reservation.job.jid.clone();

        let mut index = self.reservations.write();
        self.store.working().add(expires, &jid, &payload)?;
        index.insert(jid, reservation.clone());
        Ok(reservation)
    }

    fn release(&self, jid: &str) -> Result<Option<Reservation>, JobError> {
        let mut index = self.reservations.write();
        let Some(reservation) = index.get(jid) else {
            return Ok(None);
        };
        self.store
            .working()
            .remove_element(&reservation.expires_at, jid)?;
        Ok(index.remove(jid))
    }

    /// Completes a reserved job. Acking an unknown jid succeeds.
    pub fn ack(&self, jid: &str) -> Result<(), JobError> {
        if self.release(jid)?.is_none() {
            tracing::debug!(jid, "ack for unknown reservation");
            return Ok(());
        }
        self.store.incr_processed(self.clock.now())?;
        Ok(())
    }

    /// Records a failed delivery and routes the job to retries or dead.
    pub fn fail(&self, payload: FailPayload) -> Result<(), JobError> {
        let mut index = self.reservations.write();
        let Some(reservation) = index.get(&payload.jid).cloned() else {
            return Err(JobError::NotFound(payload.jid));
        };
        let jid = payload.jid.clone();
        self.process_failure(reservation, payload.into())?;
        index.remove(&jid);
        Ok(())
    }

    fn process_failure(
        &self,
        reservation: Reservation,
        report: FailureReport,
    ) -> Result<(), JobError> {
        let now = self.clock.now();
        let working = self.store.working();
        let mut job = reservation.job;
        let source = working.key_at(&reservation.expires_at, &job.jid);
        self.store.incr_failures(now)?;

        if job.retry() == 0 {
            working.remove(&source)?;
            tracing::info!(jid = %job.jid, "job failed with retry disabled, dropped");
            return Ok(());
        }

        let retry_count = job
            .failure
            .as_ref()
            .map_or(0, |failure| failure.retry_count.saturating_add(1));
        let mut failure = Failure {
            retry_count,
            failed_at: format_ts(now),
            next_at: None,
            message: truncate(&report.message, MAX_MESSAGE_LEN),
            errtype: truncate(&report.errtype, MAX_ERRTYPE_LEN),
            backtrace: report
                .backtrace
                .into_iter()
                .take(MAX_BACKTRACE_LINES)
                .collect(),
        };
        let (target, at) = if job.retries_exhausted(retry_count) {
            (self.store.dead(), now + TimeDelta::seconds(DEAD_TTL_SECS))
        } else {
            let next = now + TimeDelta::seconds(backoff_seconds(retry_count, &mut rand::rng()));
            failure.next_at = Some(format_ts(next));
            (self.store.retries(), next)
        };
        job.failure = Some(failure);

        let payload = serde_json::to_vec(&job)?;
        let moved = working.move_to(target, &source, at, |_| Ok(payload.clone()))?;
        if !moved {
            target.add(at, &job.jid, &payload)?;
        }
        tracing::info!(
            jid = %job.jid,
            retry_count,
            target = target.name(),
            next_at = %format_ts(at),
            "job failed"
        );
        Ok(())
    }

    /// Fails every reservation that expired at or before `now`. Returns
    /// how many jobs were routed to retries or dead.
    ///
    /// Ack and fail change the working set under the index lock, so a due
    /// entry with no index entry is an orphan and is failed like any other.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize, JobError> {
        let working = self.store.working();
        let mut reaped = 0;
        for entry in working.due(now, None)? {
            let mut index = self.reservations.write();
            if working.get(&entry.key)?.is_none() {
                continue;
            }
            let reservation: Reservation = match entry.decode() {
                Ok(reservation) => reservation,
                Err(err) => {
                    RuntimeError::capture(format!(
                        "dropping undecodable reservation {}: {err}",
                        entry.jid
                    ))
                    .log();
                    working.remove(&entry.key)?;
                    continue;
                }
            };
            match index.get(&entry.jid) {
                Some(held) if held.expires_at != entry.ts => {
                    working.remove(&entry.key)?;
                    continue;
                }
                Some(_) => {}
                None => tracing::warn!(jid = %entry.jid, "orphaned reservation found"),
            }

            tracing::info!(jid = %entry.jid, wid = %reservation.wid, "reservation expired");
            self.process_failure(
                reservation,
                FailureReport {
                    errtype: RESERVATION_EXPIRED_ERRTYPE.to_string(),
                    message: RESERVATION_EXPIRED_MESSAGE.to_string(),
                    backtrace: Vec::new(),
                },
            )?;
            index.remove(&entry.jid);
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Rebuilds the reservation index from the persisted working set.
    pub fn recover_reservations(&self) -> Result<usize, JobError> {
        let mut index = self.reservations.write();
        index.clear();
        self.store.working().each(|entry| {
            match entry.decode::<Reservation>() {
                Ok(mut reservation) => {
                    reservation.expires_at = entry.ts.clone();
                    index.insert(entry.jid.clone(), reservation);
                }
                Err(err) => RuntimeError::capture(format!(
                    "skipping undecodable reservation {}: {err}",
                    entry.jid
                ))
                .log(),
            }
            true
        })?;
        let recovered = index.len();
        if recovered > 0 {
            tracing::info!(recovered, "reservations recovered");
        }
        Ok(recovered)
    }

    /// Moves every due job in `kind` (scheduled or retries) onto its queue.
    /// Jobs for paused or full queues stay where they are.
    pub fn promote_due(&self, kind: SetKind, now: DateTime<Utc>) -> Result<usize, JobError> {
        let set = self.store.set(kind);
        let mut promoted = 0;
        for entry in set.due(now, None)? {
            let mut job: Job = match entry.decode() {
                Ok(job) => job,
                Err(err) => {
                    RuntimeError::capture(format!(
                        "dropping undecodable {} entry {}: {err}",
                        set.name(),
                        entry.jid
                    ))
                    .log();
                    set.remove(&entry.key)?;
                    continue;
                }
            };
            let queue = match self.store.get_queue(&job.queue) {
                Ok(queue) => queue,
                Err(err) => {
                    tracing::warn!(jid = %job.jid, error = %err, "cannot promote job");
                    continue;
                }
            };
            if queue.is_paused() {
                continue;
            }
            job.enqueued_at = Some(format_ts(now));
            let payload = serde_json::to_vec(&job)?;
            match set.requeue_into(&entry.key, &queue, job.priority_byte(), &payload) {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(err @ StorageError::QueueFull { .. }) => {
                    tracing::warn!(jid = %job.jid, error = %err, "promotion deferred");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if promoted > 0 {
            tracing::debug!(set = set.name(), promoted, "due jobs enqueued");
        }
        Ok(promoted)
    }

    /// Seconds the oldest job in `name` has been waiting; 0 when empty.
    pub fn queue_latency(&self, name: &str) -> Result<f64, JobError> {
        let Some(queue) = self.store.existing_queue(name) else {
            return Ok(0.0);
        };
        let now = self.clock.now();
        let oldest = queue
            .heads()?
            .iter()
            .filter_map(|payload| serde_json::from_slice::<Job>(payload).ok())
            .filter_map(|job| job.enqueued_at.as_deref().and_then(parse_ts))
            .min();
        Ok(oldest.map_or(0.0, |oldest| {
            (now - oldest).num_milliseconds().max(0) as f64 / 1000.0
        }))
    }

    pub fn reservation(&self, jid: &str) -> Option<Reservation> {
        self.reservations.read().get(jid).cloned()
    }

    pub fn working_count(&self) -> usize {
        self.reservations.read().len()
    }

    pub fn flush(&self) -> Result<(), JobError> {
        let mut index = self.reservations.write();
        self.store.flush()?;
        index.clear();
        Ok(())
    }
}

/// Delay before retry number `count` (0-indexed):
/// `count⁴ + 15 + rand[0, 30·(count+1))` seconds.
pub fn backoff_seconds(count: i64, rng: &mut impl Rng) -> i64 {
    let count = count.max(0);
    let jitter = rng.random_range(0..30i64.saturating_mul(count.saturating_add(1)));
    count
        .saturating_pow(4)
        .saturating_add(15)
        .saturating_add(jitter)
        .min(MAX_BACKOFF_SECS)
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
