//! Byte-key layout shared by queues and sorted sets.
//!
//! Queue entries: `name ∥ 0xFF ∥ (255 - priority) ∥ be_u64(sequence)`.
//! Set entries: `name ∥ 0xFF ∥ timestamp ∥ '|' ∥ jid`.

pub const SEPARATOR: u8 = 0xFF;
pub const JID_SEPARATOR: u8 = b'|';
const AFTER_JID_SEPARATOR: u8 = b'}';

/// Half-open byte range `[start, end)`; `end == None` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: prefix.to_vec(),
            end: prefix_successor(prefix),
        }
    }

    pub fn between(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// The same range, starting just after `key`.
    pub fn after(&self, key: &[u8]) -> Self {
        let mut start = key.to_vec();
        start.push(0);
        Self {
            start,
            end: self.end.clone(),
        }
    }
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last != 0xFF {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

pub fn namespace(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 1);
    key.extend_from_slice(name.as_bytes());
    key.push(SEPARATOR);
    key
}

pub fn bucket_prefix(prefix: &[u8], inverted: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1);
    key.extend_from_slice(prefix);
    key.push(inverted);
    key
}

pub fn queue_key(prefix: &[u8], inverted: u8, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 9);
    key.extend_from_slice(prefix);
    key.push(inverted);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Splits a queue key into its inverted priority byte and sequence.
pub fn decode_queue_key(prefix: &[u8], key: &[u8]) -> Option<(u8, u64)> {
    let rest = key.strip_prefix(prefix)?;
    let (&inverted, seq) = rest.split_first()?;
    let seq: [u8; 8] = seq.try_into().ok()?;
    Some((inverted, u64::from_be_bytes(seq)))
}

/// Name part of any namespaced key.
pub fn namespace_of(key: &[u8]) -> Option<&str> {
    let end = key.iter().position(|byte| *byte == SEPARATOR)?;
    std::str::from_utf8(&key[..end]).ok()
}

pub fn set_key(prefix: &[u8], ts: &str, jid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + ts.len() + jid.len() + 1);
    key.extend_from_slice(prefix);
    key.extend_from_slice(ts.as_bytes());
    key.push(JID_SEPARATOR);
    key.extend_from_slice(jid.as_bytes());
    key
}

pub fn split_set_key(prefix: &[u8], key: &[u8]) -> Option<(String, String)> {
    let rest = key.strip_prefix(prefix)?;
    let split = rest.iter().position(|byte| *byte == JID_SEPARATOR)?;
    let ts = std::str::from_utf8(&rest[..split]).ok()?;
    let jid = std::str::from_utf8(&rest[split + 1..]).ok()?;
    Some((ts.to_string(), jid.to_string()))
}

/// Every set entry whose timestamp is `<= ts`.
pub fn set_range_through(prefix: &[u8], ts: &str) -> KeyRange {
    let mut end = Vec::with_capacity(prefix.len() + ts.len() + 1);
    end.extend_from_slice(prefix);
    end.extend_from_slice(ts.as_bytes());
    end.push(AFTER_JID_SEPARATOR);
    KeyRange::between(prefix.to_vec(), end)
}
