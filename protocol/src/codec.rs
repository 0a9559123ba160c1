use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{ProtocolError, Reply};

/// Reads one `\n`-terminated line, stripping the trailing `\r\n`.
///
/// Returns `Ok(None)` at end of stream. A line longer than `limit` is
/// consumed up to its terminator and reported as
/// [`ProtocolError::LineTooLong`], so the caller can keep reading.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut overflow = false;
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }
            match available.iter().position(|byte| *byte == b'\n') {
                Some(index) => {
                    if !overflow {
                        line.extend_from_slice(&available[..index]);
                    }
                    (true, index + 1)
                }
                None => {
                    if !overflow {
                        line.extend_from_slice(available);
                    }
                    (false, available.len())
                }
            }
        };
        reader.consume(used);
        if line.len() > limit {
            overflow = true;
            line.clear();
        }
        if done {
            break;
        }
    }
    if overflow {
        return Err(ProtocolError::LineTooLong { limit });
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&reply.encode()).await?;
    writer.flush().await
}

/// Writes a client request line: `VERB payload\r\n`.
pub async fn write_request<W>(writer: &mut W, verb: &str, payload: Option<&str>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = String::with_capacity(verb.len() + payload.map_or(0, str::len) + 3);
    line.push_str(verb);
    if let Some(payload) = payload {
        line.push(' ');
        line.push_str(payload);
    }
    line.push_str("\r\n");
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Reads a single reply frame, as a client would.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader, crate::MAX_LINE_LEN)
        .await?
        .ok_or(ProtocolError::Closed)?;
    let Some((&kind, rest)) = line.split_first() else {
        return Err(ProtocolError::MalformedReply("empty line".to_string()));
    };
    let text = String::from_utf8(rest.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?;
    match kind {
        b'+' => Ok(Reply::Simple(text)),
        b'-' => Ok(Reply::Error(text)),
        b':' => text
            .parse()
            .map(Reply::Integer)
            .map_err(|_| ProtocolError::MalformedReply(format!("bad integer '{text}'"))),
        b'$' => {
            let length: i64 = text
                .parse()
                .map_err(|_| ProtocolError::MalformedReply(format!("bad bulk length '{text}'")))?;
            if length < 0 {
                return Ok(Reply::Bulk(None));
            }
            let mut payload = vec![0u8; length as usize + 2];
            reader.read_exact(&mut payload).await?;
            if !payload.ends_with(b"\r\n") {
                return Err(ProtocolError::MalformedReply(
                    "bulk payload not terminated by CRLF".to_string(),
                ));
            }
            payload.truncate(length as usize);
            Ok(Reply::Bulk(Some(payload)))
        }
        other => Err(ProtocolError::MalformedReply(format!(
            "unexpected type byte 0x{other:02x}"
        ))),
    }
}
