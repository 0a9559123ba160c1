use serde::{Deserialize, Serialize};

use crate::frame::ProtocolError;
use crate::handshake::Hello;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    pub jid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FailPayload {
    pub jid: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errtype: String,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

/// Lifecycle state of a consumer process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Running,
    Quiet,
    Terminate,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Quiet => "quiet",
            WorkerState::Terminate => "terminate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "running" => Some(WorkerState::Running),
            "quiet" => Some(WorkerState::Quiet),
            "terminate" => Some(WorkerState::Terminate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BeatPayload {
    pub wid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rss_kb: Option<u64>,
}

/// Bulk reply to `BEAT` when the server wants the worker to change state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeatReply {
    pub state: WorkerState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutateCommand {
    Kill,
    Requeue,
    Discard,
    Clear,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutateTarget {
    Retries,
    Scheduled,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MutateFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobtype: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,
}

impl MutateFilter {
    pub fn is_empty(&self) -> bool {
        self.jobtype.is_none() && self.jids.is_empty() && self.regexp.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutateOp {
    pub cmd: MutateCommand,
    pub target: MutateTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<MutateFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    Pause,
    Resume,
    Remove,
    Latency,
}

impl QueueAction {
    fn parse(value: &str) -> Result<Self, ProtocolError> {
        match value.to_ascii_uppercase().as_str() {
            "PAUSE" => Ok(QueueAction::Pause),
            "RESUME" => Ok(QueueAction::Resume),
            "REMOVE" => Ok(QueueAction::Remove),
            "LATENCY" => Ok(QueueAction::Latency),
            _ => Err(ProtocolError::UnknownQueueAction(value.to_string())),
        }
    }
}

/// A parsed request line.
///
/// `PUSH` and `PUSHB` keep their JSON payload raw: job validation belongs to
/// the server, which reports per-job errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Hello(Hello),
    Push(String),
    PushBulk(String),
    Fetch(Vec<String>),
    Ack(AckPayload),
    Fail(FailPayload),
    Beat(BeatPayload),
    Info,
    Flush,
    Queue {
        action: QueueAction,
        names: Vec<String>,
    },
    Mutate(MutateOp),
    Track(String),
    End,
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Hello(_) => "HELLO",
            Command::Push(_) => "PUSH",
            Command::PushBulk(_) => "PUSHB",
            Command::Fetch(_) => "FETCH",
            Command::Ack(_) => "ACK",
            Command::Fail(_) => "FAIL",
            Command::Beat(_) => "BEAT",
            Command::Info => "INFO",
            Command::Flush => "FLUSH",
            Command::Queue { .. } => "QUEUE",
            Command::Mutate(_) => "MUTATE",
            Command::Track(_) => "TRACK",
            Command::End => "END",
        }
    }

    pub fn parse_bytes(line: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::parse(line)
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let (verb, payload) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match verb.to_ascii_uppercase().as_str() {
            "HELLO" => Ok(Command::Hello(json_payload("HELLO", payload)?)),
            "PUSH" => Ok(Command::Push(raw_payload("PUSH", payload)?)),
            "PUSHB" => Ok(Command::PushBulk(raw_payload("PUSHB", payload)?)),
            "FETCH" => Ok(Command::Fetch(tokens(payload))),
            "ACK" => Ok(Command::Ack(json_payload("ACK", payload)?)),
            "FAIL" => Ok(Command::Fail(json_payload("FAIL", payload)?)),
            "BEAT" => Ok(Command::Beat(json_payload("BEAT", payload)?)),
            "INFO" => Ok(Command::Info),
            "FLUSH" => Ok(Command::Flush),
            "QUEUE" => {
                let mut parts = tokens(payload).into_iter();
                let action = parts.next().ok_or(ProtocolError::MissingPayload("QUEUE"))?;
                Ok(Command::Queue {
                    action: QueueAction::parse(&action)?,
                    names: parts.collect(),
                })
            }
            "MUTATE" => Ok(Command::Mutate(json_payload("MUTATE", payload)?)),
            "TRACK" => Ok(Command::Track(payload.to_string())),
            "END" => Ok(Command::End),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn raw_payload(verb: &'static str, payload: &str) -> Result<String, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::MissingPayload(verb));
    }
    Ok(payload.to_string())
}

fn json_payload<T: serde::de::DeserializeOwned>(
    verb: &'static str,
    payload: &str,
) -> Result<T, ProtocolError> {
    let raw = raw_payload(verb, payload)?;
    Ok(serde_json::from_str(&raw)?)
}

fn tokens(payload: &str) -> Vec<String> {
    payload.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fetch_queue_list() {
        let command = Command::parse("FETCH critical default  bulk").unwrap();
        assert_eq!(
            command,
            Command::Fetch(vec![
                "critical".to_string(),
                "default".to_string(),
                "bulk".to_string()
            ])
        );
    }

    #[test]
    fn push_keeps_raw_json() {
        let command = Command::parse(r#"PUSH {"jid":"abcdefgh","args":[1, 2]}"#).unwrap();
        assert_eq!(
            command,
            Command::Push(r#"{"jid":"abcdefgh","args":[1, 2]}"#.to_string())
        );
        assert!(matches!(
            Command::parse("PUSH").unwrap_err(),
            ProtocolError::MissingPayload("PUSH")
        ));
    }

    #[test]
    fn parses_fail_with_defaults() {
        let command = Command::parse(r#"FAIL {"jid":"abcdefgh"}"#).unwrap();
        let Command::Fail(payload) = command else {
            panic!("expected FAIL");
        };
        assert_eq!(payload.jid, "abcdefgh");
        assert!(payload.backtrace.is_empty());
        assert!(payload.message.is_empty());
    }

    #[test]
    fn parses_queue_subcommands() {
        let command = Command::parse("QUEUE pause default critical").unwrap();
        assert_eq!(
            command,
            Command::Queue {
                action: QueueAction::Pause,
                names: vec!["default".to_string(), "critical".to_string()],
            }
        );
        assert!(matches!(
            Command::parse("QUEUE EXPLODE default").unwrap_err(),
            ProtocolError::UnknownQueueAction(_)
        ));
    }

    #[test]
    fn parses_mutate_op() {
        let command = Command::parse(
            r#"MUTATE {"cmd":"kill","target":"retries","filter":{"jobtype":"SendEmail","jids":["a"]}}"#,
        )
        .unwrap();
        let Command::Mutate(op) = command else {
            panic!("expected MUTATE");
        };
        assert_eq!(op.cmd, MutateCommand::Kill);
        assert_eq!(op.target, MutateTarget::Retries);
        let filter = op.filter.unwrap();
        assert_eq!(filter.jobtype.as_deref(), Some("SendEmail"));
        assert_eq!(filter.jids, vec!["a".to_string()]);
    }

    #[test]
    fn rejects_unknown_verbs_and_bad_utf8() {
        assert!(matches!(
            Command::parse("LPUSH x").unwrap_err(),
            ProtocolError::UnknownCommand(_)
        ));
        assert!(matches!(
            Command::parse_bytes(&[0x50, 0xff, 0xfe]).unwrap_err(),
            ProtocolError::InvalidUtf8
        ));
        assert!(matches!(
            Command::parse("ACK {not json").unwrap_err(),
            ProtocolError::Json(_)
        ));
    }

    #[test]
    fn worker_state_orders_forward() {
        assert!(WorkerState::Running < WorkerState::Quiet);
        assert!(WorkerState::Quiet < WorkerState::Terminate);
        assert_eq!(WorkerState::parse(""), Some(WorkerState::Running));
        assert_eq!(WorkerState::parse("bogus"), None);
    }
}
