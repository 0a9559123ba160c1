use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::{format_ts, parse_ts};
use crate::constants::{
    DEFAULT_PRIORITY, DEFAULT_QUEUE, DEFAULT_RESERVE_FOR_SECS, DEFAULT_RETRY,
    MAX_RESERVE_FOR_SECS, MIN_JID_LEN, MIN_RESERVE_FOR_SECS,
};
use crate::error::JobError;

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Failure {
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default)]
    pub failed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub errtype: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<String>,
}

/// A unit of work as clients submit it and workers receive it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    #[serde(default)]
    pub jid: String,
    #[serde(default)]
    pub jobtype: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_for: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
}

impl Job {
    pub fn new(jid: impl Into<String>, jobtype: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            jid: jid.into(),
            jobtype: jobtype.into(),
            queue: default_queue(),
            args: Some(args),
            priority: DEFAULT_PRIORITY,
            retry: None,
            reserve_for: None,
            at: None,
            created_at: None,
            enqueued_at: None,
            failure: None,
            custom: None,
        }
    }

    /// Checks the required fields and fills in defaults before a push.
    pub fn normalize(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        if self.jid.len() < MIN_JID_LEN {
            return Err(JobError::Invalid(
                "jobs must have a reasonable jid parameter".to_string(),
            ));
        }
        if self.jobtype.is_empty() {
            return Err(JobError::Invalid(
                "jobs must have a jobtype parameter".to_string(),
            ));
        }
        if self.args.is_none() {
            return Err(JobError::Invalid(
                "jobs must have an args parameter".to_string(),
            ));
        }
        if self.queue.is_empty() {
            self.queue = default_queue();
        }
        if !is_valid_queue_name(&self.queue) {
            return Err(JobError::Invalid(format!(
                "invalid queue name '{}'",
                self.queue
            )));
        }
        if !(1..=9).contains(&self.priority) {
            self.priority = DEFAULT_PRIORITY;
        }
        if self.retry.is_none() {
            self.retry = Some(DEFAULT_RETRY);
        }
        if self.created_at.is_none() {
            self.created_at = Some(format_ts(now));
        }
        if self.at.as_deref().is_some_and(str::is_empty) {
            self.at = None;
        }
        if let Some(at) = &self.at
            && parse_ts(at).is_none()
        {
            return Err(JobError::Invalid(format!("invalid 'at' timestamp '{at}'")));
        }
        Ok(())
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.at.as_deref().and_then(parse_ts)
    }

    pub fn retry(&self) -> i64 {
        self.retry.unwrap_or(DEFAULT_RETRY)
    }

    /// Whether the failure numbered `retry_count` (0-indexed) is the last
    /// delivery this job gets. Negative `retry` never runs out.
    pub fn retries_exhausted(&self, retry_count: i64) -> bool {
        let retry = self.retry();
        retry >= 0 && retry_count.saturating_add(1) >= retry
    }

    pub fn reserve_for_secs(&self) -> i64 {
        match self.reserve_for {
            Some(secs) if secs > 0 => secs.clamp(MIN_RESERVE_FOR_SECS, MAX_RESERVE_FOR_SECS),
            _ => DEFAULT_RESERVE_FOR_SECS,
        }
    }

    /// Queue priority as a storage byte. Only valid after [`Job::normalize`].
    pub fn priority_byte(&self) -> u8 {
        u8::try_from(self.priority).unwrap_or(DEFAULT_PRIORITY as u8)
    }
}

pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-'))
}
