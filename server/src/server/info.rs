use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::error::JobError;
use crate::server::Server;

/// Builds the `INFO` document.
pub(crate) fn snapshot(server: &Server) -> Result<Value, JobError> {
    let now = server.clock.now();
    let store = &server.store;

    let mut queues = BTreeMap::new();
    store.each_queue(|queue| {
        queues.insert(queue.name().to_string(), queue.size());
    });

    Ok(json!({
        "server_utc_time": now.format("%H:%M:%S UTC").to_string(),
        "now": crate::clock::format_ts(now),
        "faktory": {
            "total_enqueued": store.total_enqueued(),
            "total_queues": queues.len(),
            "total_failures": store.total_failures()?,
            "total_processed": store.total_processed()?,
            "total_workers": server.workers.count(),
            "queues": queues,
            "tasks": server.tasks.stats(),
        },
        "server": {
            "faktory_version": crate::VERSION,
            "uptime": server.stats.uptime_secs(),
            "connections": server.stats.connections(),
            "command_count": server.stats.command_count(),
            "used_memory_mb": used_memory_mb(),
        },
    }))
}

/// Resident set size in MiB, or 0 where `/proc` is unavailable.
fn used_memory_mb() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss_kb(&status))
        .map_or(0, |kb| kb / 1024)
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}
