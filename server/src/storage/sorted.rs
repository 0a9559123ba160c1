use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use regex::bytes::Regex;
use serde::de::DeserializeOwned;

use crate::clock::{format_ts, parse_ts};
use crate::error::StorageError;
use crate::storage::keys::{KeyRange, namespace, set_key, set_range_through, split_set_key};
use crate::storage::kv::{Batch, Family, Kv};
use crate::storage::queue::Queue;

const PAGE_SIZE: u64 = 100;

/// One member of a sorted set, with its key split back into parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetEntry {
    pub key: Vec<u8>,
    pub ts: String,
    pub jid: String,
    pub payload: Vec<u8>,
}

impl SetEntry {
    fn from_row(prefix: &[u8], key: Vec<u8>, payload: Vec<u8>) -> Option<Self> {
        let (ts, jid) = split_set_key(prefix, &key)?;
        Some(Self {
            key,
            ts,
            jid,
            payload,
        })
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        parse_ts(&self.ts)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// A persistent set ordered by `(timestamp, jid)`.
#[derive(Debug)]
pub struct SortedSet {
    name: String,
    prefix: Vec<u8>,
    kv: Arc<Kv>,
    size: AtomicU64,
}

impl SortedSet {
    pub(crate) fn open(name: &str, kv: Arc<Kv>) -> Result<Self, StorageError> {
        let prefix = namespace(name);
        let size = kv.count(Family::Sets, &KeyRange::prefix(&prefix))?;
        Ok(Self {
            name: name.to_string(),
            prefix,
            kv,
            size: AtomicU64::new(size),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn key_for(&self, ts: DateTime<Utc>, jid: &str) -> Vec<u8> {
        self.key_at(&format_ts(ts), jid)
    }

    /// Key for an already formatted timestamp.
    pub fn key_at(&self, ts: &str, jid: &str) -> Vec<u8> {
        set_key(&self.prefix, ts, jid)
    }

    pub fn add(&self, ts: DateTime<Utc>, jid: &str, payload: &[u8]) -> Result<(), StorageError> {
        let batch = Batch::new().put(Family::Sets, self.key_for(ts, jid), payload.to_vec());
        if let Some(applied) = self.kv.write(batch)? {
            self.size.fetch_add(applied.created, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<SetEntry>, StorageError> {
        let Some(payload) = self.kv.get(Family::Sets, key)? else {
            return Ok(None);
        };
        Ok(SetEntry::from_row(&self.prefix, key.to_vec(), payload))
    }

    pub fn remove(&self, key: &[u8]) -> Result<bool, StorageError> {
        if !key.starts_with(&self.prefix) {
            return Ok(false);
        }
        let deleted = self
            .kv
            .write(Batch::new().delete(Family::Sets, key.to_vec()))?
            .map_or(0, |applied| applied.deleted);
        self.note_removed(deleted)?;
        Ok(deleted > 0)
    }

    pub fn remove_element(&self, ts: &str, jid: &str) -> Result<bool, StorageError> {
        self.remove(&self.key_at(ts, jid))
    }

    /// Deletes and returns every entry with timestamp `<= ts`, oldest first.
    pub fn remove_before(&self, ts: DateTime<Utc>) -> Result<Vec<SetEntry>, StorageError> {
        let range = set_range_through(&self.prefix, &format_ts(ts));
        let rows = self.kv.take_range(Family::Sets, &range)?;
        self.note_removed(rows.len() as u64)?;
        Ok(self.entries(rows))
    }

    /// Entries with timestamp `<= ts`, oldest first, left in place.
    pub fn due(
        &self,
        ts: DateTime<Utc>,
        limit: Option<u64>,
    ) -> Result<Vec<SetEntry>, StorageError> {
        let range = set_range_through(&self.prefix, &format_ts(ts));
        let rows = self.kv.scan(Family::Sets, &range, 0, limit)?;
        Ok(self.entries(rows))
    }

    /// Moves the entry at `key` into `target` at `new_ts`, rewriting its
    /// payload with `mutator`. The delete and the insert commit together.
    ///
    /// Returns `false` when the entry no longer exists.
    pub fn move_to<F>(
        &self,
        target: &SortedSet,
        key: &[u8],
        new_ts: DateTime<Utc>,
        mutator: F,
    ) -> Result<bool, StorageError>
    where
        F: FnOnce(Vec<u8>) -> Result<Vec<u8>, StorageError>,
    {
        let Some(entry) = self.get(key)? else {
            return Ok(false);
        };
        let payload = mutator(entry.payload)?;
        let batch = Batch::new()
            .take(Family::Sets, entry.key)
            .put(Family::Sets, target.key_for(new_ts, &entry.jid), payload);
        let Some(applied) = self.kv.write(batch)? else {
            return Ok(false);
        };
        self.note_removed(1)?;
        target.size.fetch_add(applied.created, Ordering::AcqRel);
        Ok(true)
    }

    /// Pushes `payload` onto `queue` and deletes `key` from this set in one
    /// transaction. Returns `false` if another caller removed the entry first.
    pub fn requeue_into(
        &self,
        key: &[u8],
        queue: &Queue,
        priority: u8,
        payload: &[u8],
    ) -> Result<bool, StorageError> {
        let moved = queue.push_with_batch(
            priority,
            payload,
            Batch::new().take(Family::Sets, key.to_vec()),
        )?;
        if moved {
            self.note_removed(1)?;
        }
        Ok(moved)
    }

    /// Visits entries in order until `f` returns `false`.
    pub fn each(&self, mut f: impl FnMut(&SetEntry) -> bool) -> Result<(), StorageError> {
        let mut range = KeyRange::prefix(&self.prefix);
        loop {
            let rows = self.kv.scan(Family::Sets, &range, 0, Some(PAGE_SIZE))?;
            let Some((last, _)) = rows.last() else {
                return Ok(());
            };
            let next = range.after(last);
            for entry in self.entries(rows) {
                if !f(&entry) {
                    return Ok(());
                }
            }
            range = next;
        }
    }

    pub fn page(&self, offset: u64, count: u64) -> Result<Vec<SetEntry>, StorageError> {
        let rows = self.kv.scan(
            Family::Sets,
            &KeyRange::prefix(&self.prefix),
            offset,
            Some(count),
        )?;
        Ok(self.entries(rows))
    }

    /// Like [`SortedSet::each`], restricted to entries whose raw payload
    /// matches the glob `pattern` (`*` and `?` wildcards).
    pub fn find(
        &self,
        pattern: &str,
        mut f: impl FnMut(&SetEntry) -> bool,
    ) -> Result<(), StorageError> {
        let matcher = glob_regex(pattern)?;
        self.each(|entry| !matcher.is_match(&entry.payload) || f(entry))
    }

    pub fn clear(&self) -> Result<u64, StorageError> {
        let removed = self
            .kv
            .delete_range(Family::Sets, &KeyRange::prefix(&self.prefix))?;
        self.size.store(0, Ordering::Release);
        Ok(removed)
    }

    /// Recounts the backing rows.
    pub fn resync(&self) -> Result<u64, StorageError> {
        let actual = self
            .kv
            .count(Family::Sets, &KeyRange::prefix(&self.prefix))?;
        self.size.store(actual, Ordering::Release);
        Ok(actual)
    }

    fn note_removed(&self, count: u64) -> Result<(), StorageError> {
        if count == 0 {
            return Ok(());
        }
        let previous = self.size.fetch_sub(count, Ordering::AcqRel);
        if previous < count {
            let actual = self.resync()?;
            tracing::warn!(set = %self.name, actual, "set size underflow, resynced");
        }
        Ok(())
    }

    fn entries(&self, rows: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<SetEntry> {
        rows.into_iter()
            .filter_map(|(key, payload)| SetEntry::from_row(&self.prefix, key, payload))
            .collect()
    }
}

/// Anchored byte regex for a `*`/`?` glob.
pub fn glob_regex(pattern: &str) -> Result<Regex, StorageError> {
    let mut source = String::from("(?s)^");
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                source.push_str(&regex::escape(&literal));
                literal.clear();
                source.push_str(if ch == '*' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }
    source.push_str(&regex::escape(&literal));
    source.push('$');
    Ok(Regex::new(&source)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use tokio::sync::watch;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn open() -> (tempfile::TempDir, Arc<Kv>) {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(Kv::open(&dir.path().join("sets.db")).unwrap());
        (dir, kv)
    }

    #[test]
    fn remove_before_is_inclusive_and_ordered() {
        let (_dir, kv) = open();
        let set = SortedSet::open("retries", kv).unwrap();
        set.add(t(30), "cccccccc", b"c").unwrap();
        set.add(t(10), "aaaaaaaa", b"a").unwrap();
        set.add(t(20), "bbbbbbbb", b"b").unwrap();
        set.add(t(20), "abbbbbbb", b"ab").unwrap();
        assert_eq!(set.size(), 4);

        let removed = set.remove_before(t(20)).unwrap();
        let jids: Vec<_> = removed.iter().map(|entry| entry.jid.as_str()).collect();
        assert_eq!(jids, vec!["aaaaaaaa", "abbbbbbb", "bbbbbbbb"]);
        assert_eq!(removed[0].at(), Some(t(10)));
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn due_leaves_entries_in_place() {
        let (_dir, kv) = open();
        let set = SortedSet::open("scheduled", kv).unwrap();
        set.add(t(1), "aaaaaaaa", b"a").unwrap();
        set.add(t(5), "bbbbbbbb", b"b").unwrap();
        assert_eq!(set.due(t(1), Some(10)).unwrap().len(), 1);
        assert_eq!(set.size(), 2);
        assert!(set.remove_element(&format_ts(t(1)), "aaaaaaaa").unwrap());
        assert!(!set.remove_element(&format_ts(t(1)), "aaaaaaaa").unwrap());
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn move_to_is_all_or_nothing() {
        let (_dir, kv) = open();
        let retries = SortedSet::open("retries", kv.clone()).unwrap();
        let dead = SortedSet::open("dead", kv.clone()).unwrap();
        retries.add(t(1), "aaaaaaaa", b"job").unwrap();
        let key = retries.key_for(t(1), "aaaaaaaa");

        let moved = retries
            .move_to(&dead, &key, t(100), |payload| {
                let mut payload = payload;
                payload.extend_from_slice(b"!");
                Ok(payload)
            })
            .unwrap();
        assert!(moved);
        assert_eq!((retries.size(), dead.size()), (0, 1));
        let entry = dead.get(&dead.key_for(t(100), "aaaaaaaa")).unwrap().unwrap();
        assert_eq!(entry.payload, b"job!");

        let again = retries
            .move_to(&dead, &key, t(200), |payload| Ok(payload))
            .unwrap();
        assert!(!again);
        assert_eq!(dead.size(), 1);

        let reopened = SortedSet::open("dead", kv).unwrap();
        assert_eq!(reopened.size(), 1);
    }

    #[test]
    fn requeue_into_pushes_and_removes_once() {
        let (_dir, kv) = open();
        let (_tx, rx) = watch::channel(false);
        let queue = Queue::open("default", kv.clone(), 0, false, rx).unwrap();
        let scheduled = SortedSet::open("scheduled", kv).unwrap();
        scheduled.add(t(1), "aaaaaaaa", b"job").unwrap();
        let key = scheduled.key_for(t(1), "aaaaaaaa");

        assert!(scheduled.requeue_into(&key, &queue, 5, b"job").unwrap());
        assert!(!scheduled.requeue_into(&key, &queue, 5, b"job").unwrap());
        assert_eq!(scheduled.size(), 0);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.pop().unwrap(), Some(b"job".to_vec()));
    }

    #[test]
    fn find_matches_glob_against_payload() {
        let (_dir, kv) = open();
        let set = SortedSet::open("dead", kv).unwrap();
        set.add(t(1), "aaaaaaaa", br#"{"jobtype":"SendEmail"}"#).unwrap();
        set.add(t(2), "bbbbbbbb", br#"{"jobtype":"Resize"}"#).unwrap();
        set.add(t(3), "cccccccc", br#"{"jobtype":"SendSms"}"#).unwrap();

        let mut found = Vec::new();
        set.find("*\"Send*", |entry| {
            found.push(entry.jid.clone());
            true
        })
        .unwrap();
        assert_eq!(found, vec!["aaaaaaaa".to_string(), "cccccccc".to_string()]);

        let matcher = glob_regex("a?c.d").unwrap();
        assert!(matcher.is_match(b"abc.d"));
        assert!(!matcher.is_match(b"abcxd"));
        assert!(!matcher.is_match(b"zabc.d"));
    }

    #[test]
    fn page_and_clear() {
        let (_dir, kv) = open();
        let set = SortedSet::open("dead", kv).unwrap();
        for (secs, jid) in [(1, "aaaaaaaa"), (2, "bbbbbbbb"), (3, "cccccccc")] {
            set.add(t(secs), jid, b"{}").unwrap();
        }
        let page = set.page(1, 5).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].jid, "bbbbbbbb");
        assert_eq!(set.clear().unwrap(), 3);
        assert_eq!(set.size(), 0);
        assert_eq!(set.resync().unwrap(), 0);
    }
}
