use chrono::TimeDelta;
use serde_json::Value;

use faktory_protocol::{MutateCommand, MutateFilter, MutateOp};

use crate::clock::format_ts;
use crate::constants::DEAD_TTL_SECS;
use crate::error::{JobError, RuntimeError};
use crate::job::Job;
use crate::manager::Manager;
use crate::storage::{SetEntry, SetKind, SortedSet, glob_regex};

impl Manager {
    /// Applies a bulk operation to the matching members of a sorted set.
    /// Returns how many entries were affected.
    pub fn mutate(&self, op: &MutateOp) -> Result<usize, JobError> {
        let kind = SetKind::from(op.target);
        let set = self.store.set(kind);
        let filter = op.filter.clone().unwrap_or_default();

        if op.cmd == MutateCommand::Clear && filter.is_empty() {
            let removed = set.clear()?;
            tracing::info!(set = set.name(), removed, "set cleared");
            return Ok(removed as usize);
        }

        let matches = self.matching(set, &filter)?;
        let mut affected = 0;
        for entry in &matches {
            let done = match op.cmd {
                MutateCommand::Clear | MutateCommand::Discard => set.remove(&entry.key)?,
                MutateCommand::Kill => self.kill(kind, set, entry)?,
                MutateCommand::Requeue => self.requeue(set, entry)?,
            };
            if done {
                affected += 1;
            }
        }
        tracing::info!(
            set = set.name(),
            cmd = ?op.cmd,
            matched = matches.len(),
            affected,
            "set mutated"
        );
        Ok(affected)
    }

    fn matching(
        &self,
        set: &SortedSet,
        filter: &MutateFilter,
    ) -> Result<Vec<SetEntry>, JobError> {
        let pattern = filter.regexp.as_deref().map(glob_regex).transpose()?;
        let mut matches = Vec::new();
        set.each(|entry| {
            if !filter.jids.is_empty() && !filter.jids.contains(&entry.jid) {
                return true;
            }
            if let Some(pattern) = &pattern
                && !pattern.is_match(&entry.payload)
            {
                return true;
            }
            if let Some(jobtype) = &filter.jobtype {
                let actual = serde_json::from_slice::<Value>(&entry.payload)
                    .ok()
                    .and_then(|value| value.get("jobtype").and_then(Value::as_str).map(str::to_string));
                if actual.as_deref() != Some(jobtype.as_str()) {
                    return true;
                }
            }
            matches.push(entry.clone());
            true
        })?;
        Ok(matches)
    }

    fn kill(&self, kind: SetKind, set: &SortedSet, entry: &SetEntry) -> Result<bool, JobError> {
        if kind == SetKind::Dead {
            return Ok(false);
        }
        let at = self.clock.now() + TimeDelta::seconds(DEAD_TTL_SECS);
        Ok(set.move_to(self.store.dead(), &entry.key, at, Ok)?)
    }

    fn requeue(&self, set: &SortedSet, entry: &SetEntry) -> Result<bool, JobError> {
        let mut job: Job = match entry.decode() {
            Ok(job) => job,
            Err(err) => {
                RuntimeError::capture(format!(
                    "cannot requeue undecodable {} entry {}: {err}",
                    set.name(),
                    entry.jid
                ))
                .log();
                return Ok(false);
            }
        };
        let queue = self.store.get_queue(&job.queue)?;
        job.enqueued_at = Some(format_ts(self.clock.now()));
        let payload = serde_json::to_vec(&job)?;
        Ok(set.requeue_into(&entry.key, &queue, job.priority_byte(), &payload)?)
    }
}
