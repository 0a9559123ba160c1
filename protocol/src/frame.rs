use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("invalid UTF-8 in request")]
    InvalidUtf8,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0} requires a payload")]
    MissingPayload(&'static str),
    #[error("unknown QUEUE subcommand: {0}")]
    UnknownQueueAction(String),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error("connection closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A single server reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
}

impl Reply {
    pub fn ok() -> Self {
        Self::Simple("OK".to_string())
    }

    /// Builds an `-ERR <message>` reply. Line breaks are flattened so the
    /// frame stays on one line.
    pub fn err(message: impl AsRef<str>) -> Self {
        let flat = message.as_ref().replace(['\r', '\n'], " ");
        Self::Error(format!("ERR {flat}"))
    }

    pub fn nil() -> Self {
        Self::Bulk(None)
    }

    pub fn bulk(payload: impl Into<Vec<u8>>) -> Self {
        Self::Bulk(Some(payload.into()))
    }

    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Self::Bulk(Some(serde_json::to_vec(value)?)))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Simple(text) => {
                out.push(b'+');
                out.extend_from_slice(text.as_bytes());
            }
            Self::Error(text) => {
                out.push(b'-');
                out.extend_from_slice(text.as_bytes());
            }
            Self::Integer(value) => {
                out.push(b':');
                out.extend_from_slice(value.to_string().as_bytes());
            }
            Self::Bulk(None) => out.extend_from_slice(b"$-1"),
            Self::Bulk(Some(payload)) => {
                out.push(b'$');
                out.extend_from_slice(payload.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(payload);
            }
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Decodes one reply from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame,
/// otherwise the reply and the number of bytes it consumed.
pub fn decode_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, ProtocolError> {
    let Some(line_end) = find_crlf(buf) else {
        return Ok(None);
    };
    if line_end == 0 {
        return Err(ProtocolError::MalformedReply("empty line".to_string()));
    }
    let body = std::str::from_utf8(&buf[1..line_end]).map_err(|_| ProtocolError::InvalidUtf8)?;
    let header_len = line_end + 2;
    let reply = match buf[0] {
        b'+' => Reply::Simple(body.to_string()),
        b'-' => Reply::Error(body.to_string()),
        b':' => Reply::Integer(
            body.parse()
                .map_err(|_| ProtocolError::MalformedReply(format!("bad integer '{body}'")))?,
        ),
        b'$' => {
            let length: i64 = body
                .parse()
                .map_err(|_| ProtocolError::MalformedReply(format!("bad bulk length '{body}'")))?;
            if length < 0 {
                return Ok(Some((Reply::Bulk(None), header_len)));
            }
            let length = length as usize;
            let total = header_len + length + 2;
            if buf.len() < total {
                return Ok(None);
            }
            if &buf[header_len + length..total] != b"\r\n" {
                return Err(ProtocolError::MalformedReply(
                    "bulk payload not terminated by CRLF".to_string(),
                ));
            }
            let payload = buf[header_len..header_len + length].to_vec();
            return Ok(Some((Reply::Bulk(Some(payload)), total)));
        }
        other => {
            return Err(ProtocolError::MalformedReply(format!(
                "unexpected type byte 0x{other:02x}"
            )));
        }
    };
    Ok(Some((reply, header_len)))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}
