use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::clock::{Clock, ManualClock};
use crate::manager::Manager;
use crate::storage::Store;
use crate::workers::{ClientData, Workers};

/// A store in a fresh temp dir, wired to a manual clock.
pub struct TestContext {
    pub dir: Arc<TempDir>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<Store>,
    pub workers: Arc<Workers>,
    pub manager: Arc<Manager>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_max_queue_size(0)
    }

    pub fn with_max_queue_size(max_queue_size: u64) -> Self {
        let dir = Arc::new(tempfile::tempdir().expect("temp dir"));
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_001, 0)
                .single()
                .expect("valid timestamp"),
        ));
        Self::build(dir, clock, max_queue_size)
    }

    /// A second context over the same files and clock, as after a restart.
    pub fn reopen(&self) -> Self {
        Self::build(self.dir.clone(), self.clock.clone(), 0)
    }

    pub fn register_worker(&self, wid: &str) {
        let client = ClientData {
            hostname: "test-host".to_string(),
            wid: wid.to_string(),
            pid: 1,
            labels: Vec::new(),
            version: 2,
        };
        self.workers
            .heartbeat(&client, true)
            .expect("register worker");
    }

    fn build(dir: Arc<TempDir>, clock: Arc<ManualClock>, max_queue_size: u64) -> Self {
        let store = Arc::new(Store::open(dir.path(), max_queue_size).expect("open store"));
        let shared_clock: Arc<dyn Clock> = clock.clone();
        let workers = Arc::new(Workers::new(shared_clock.clone()));
        let manager = Arc::new(Manager::new(store.clone(), workers.clone(), shared_clock));
        Self {
            dir,
            clock,
            store,
            workers,
            manager,
        }
    }
}
