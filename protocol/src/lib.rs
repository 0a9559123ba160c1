//! Line protocol spoken between faktory clients and the server.
//!
//! Requests are `VERB [payload]\r\n` lines. Replies are RESP-style frames:
//! `+` simple lines, `-` errors, `:` integers and `$` bulk strings.

pub mod codec;
pub mod command;
pub mod frame;
pub mod handshake;

pub use codec::{read_line, read_reply, write_reply, write_request};
pub use command::{
    AckPayload, BeatPayload, BeatReply, Command, FailPayload, MutateCommand, MutateFilter,
    MutateOp, MutateTarget, QueueAction, WorkerState,
};
pub use frame::{ProtocolError, Reply, decode_reply};
pub use handshake::{Hello, Hi, hash_password, verify_password};

/// Version advertised in the `HI` greeting.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound for a single request or reply line.
pub const MAX_LINE_LEN: usize = 16 * 1024 * 1024;
