use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use faktory_protocol::{BeatPayload, Hello, WorkerState};

use crate::clock::Clock;
use crate::error::WorkerError;

/// Identity a consumer declared in its `HELLO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientData {
    pub hostname: String,
    pub wid: String,
    pub pid: i64,
    pub labels: Vec<String>,
    pub version: u32,
}

impl From<&Hello> for ClientData {
    fn from(hello: &Hello) -> Self {
        Self {
            hostname: hello.hostname.clone(),
            wid: hello.wid.clone(),
            pid: hello.pid,
            labels: hello.labels.clone(),
            version: hello.v,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WorkerRecord {
    pub wid: String,
    pub hostname: String,
    pub pid: i64,
    pub labels: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_kb: Option<u64>,
}

/// Consumers seen recently, keyed by `wid`.
pub struct Workers {
    clock: Arc<dyn Clock>,
    records: RwLock<HashMap<String, WorkerRecord>>,
}

impl Workers {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Refreshes the worker's heartbeat, registering it first when
    /// `allow_create` is set.
    pub fn heartbeat(
        &self,
        client: &ClientData,
        allow_create: bool,
    ) -> Result<WorkerRecord, WorkerError> {
        let now = self.clock.now();
        let mut records = self.records.write();
        if let Some(record) = records.get_mut(&client.wid) {
            record.last_heartbeat = now;
            return Ok(record.clone());
        }
        if !allow_create {
            return Err(WorkerError::NotFound(client.wid.clone()));
        }
        let record = WorkerRecord {
            wid: client.wid.clone(),
            hostname: client.hostname.clone(),
            pid: client.pid,
            labels: client.labels.clone(),
            started_at: now,
            last_heartbeat: now,
            state: WorkerState::Running,
            rss_kb: None,
        };
        tracing::info!(wid = %record.wid, hostname = %record.hostname, pid = record.pid, "worker registered");
        records.insert(record.wid.clone(), record.clone());
        Ok(record)
    }

    /// Applies a `BEAT` and returns the state the worker should be in.
    pub fn beat(&self, beat: &BeatPayload) -> Result<WorkerState, WorkerError> {
        let reported = match beat.current_state.as_deref() {
            Some(raw) => Some(
                WorkerState::parse(raw).ok_or_else(|| WorkerError::InvalidState(raw.to_string()))?,
            ),
            None => None,
        };
        let now = self.clock.now();
        let mut records = self.records.write();
        let record = records
            .get_mut(&beat.wid)
            .ok_or_else(|| WorkerError::NotFound(beat.wid.clone()))?;
        record.last_heartbeat = now;
        if beat.rss_kb.is_some() {
            record.rss_kb = beat.rss_kb;
        }
        if let Some(reported) = reported {
            record.state = record.state.max(reported);
        }
        Ok(record.state)
    }

    /// Moves a worker forward to `state`. A request to go back is ignored.
    pub fn signal(&self, wid: &str, state: WorkerState) -> Result<WorkerState, WorkerError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(wid)
            .ok_or_else(|| WorkerError::NotFound(wid.to_string()))?;
        if state > record.state {
            tracing::info!(wid, from = record.state.as_str(), to = state.as_str(), "worker signalled");
            record.state = state;
        }
        Ok(record.state)
    }

    pub fn reap_heartbeats(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|wid, record| {
            let alive = record.last_heartbeat >= cutoff;
            if !alive {
                tracing::info!(wid = %wid, last_heartbeat = %record.last_heartbeat, "worker expired");
            }
            alive
        });
        before - records.len()
    }

    pub fn state(&self, wid: &str) -> Option<WorkerState> {
        self.records.read().get(wid).map(|record| record.state)
    }

    pub fn get(&self, wid: &str) -> Option<WorkerRecord> {
        self.records.read().get(wid).cloned()
    }

    pub fn count(&self) -> usize {
        self.records.read().len()
    }

    /// Snapshot of every record, ordered by `wid`.
    pub fn list(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|left, right| left.wid.cmp(&right.wid));
        records
    }
}
