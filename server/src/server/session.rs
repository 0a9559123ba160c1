use std::net::SocketAddr;

use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::Instrument;

use faktory_protocol::{
    Command, Hi, MAX_LINE_LEN, PROTOCOL_VERSION, ProtocolError, Reply, hash_password, read_line,
    verify_password, write_reply,
};

use crate::constants::HANDSHAKE_TIMEOUT;
use crate::error::WorkerError;
use crate::server::{Server, commands};
use crate::workers::ClientData;

const MIN_HASH_ITERATIONS: u32 = 4000;
const MAX_HASH_ITERATIONS: u32 = 8096;

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("Invalid password")]
    InvalidPassword,
    #[error("expected HELLO, got {0}")]
    ExpectedHello(&'static str),
    #[error("connection closed during handshake")]
    Closed,
    #[error("handshake timed out")]
    Timeout,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runs one client connection to completion.
pub(crate) async fn serve<S>(server: &Server, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let span = tracing::info_span!("session", %peer, wid = tracing::field::Empty);
    run(server, stream).instrument(span).await
}

async fn run<S>(server: &Server, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut shutdown = server.shutdown.subscribe();

    let outcome = tokio::select! {
        outcome = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake(server, &mut reader, &mut writer),
        ) => outcome.unwrap_or(Err(HandshakeError::Timeout)),
        _ = shutdown_signalled(&mut shutdown) => Err(HandshakeError::ShuttingDown),
    };
    let client = match outcome {
        Ok(client) => client,
        Err(err) => {
            tracing::info!(error = %err, "handshake rejected");
            let _ = write_reply(&mut writer, &Reply::err(err.to_string())).await;
            let _ = writer.shutdown().await;
            return;
        }
    };
    if client.wid.is_empty() {
        tracing::debug!("producer connected");
    } else {
        tracing::Span::current().record("wid", client.wid.as_str());
        tracing::debug!("consumer connected");
    }

    loop {
        let line = tokio::select! {
            line = read_line(&mut reader, MAX_LINE_LEN) => line,
            _ = shutdown_signalled(&mut shutdown) => break,
        };
        let reply = match line {
            Ok(Some(line)) => match Command::parse_bytes(&line) {
                Ok(Command::End) => break,
                Ok(command) => {
                    server.stats.record_command();
                    commands::dispatch(server, &client, command).await
                }
                Err(err) => Reply::err(err.to_string()),
            },
            Ok(None) => break,
            Err(err @ ProtocolError::LineTooLong { .. }) => Reply::err(err.to_string()),
            Err(err) => {
                tracing::debug!(error = %err, "read failed");
                break;
            }
        };
        if let Err(err) = write_reply(&mut writer, &reply).await {
            tracing::debug!(error = %err, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!("session closed");
}

/// Resolves once shutdown is requested, including before this call.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn handshake<R, W>(
    server: &Server,
    reader: &mut R,
    writer: &mut W,
) -> Result<ClientData, HandshakeError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let challenge = server.options.password.as_deref().map(|password| {
        let salt = hex::encode(rand::random::<[u8; 8]>());
        let iterations = rand::rng().random_range(MIN_HASH_ITERATIONS..=MAX_HASH_ITERATIONS);
        (password, salt, iterations)
    });
    let hi = Hi {
        v: PROTOCOL_VERSION,
        salt: challenge.as_ref().map(|(_, salt, _)| salt.clone()),
        iterations: challenge.as_ref().map(|(_, _, iterations)| *iterations),
    };
    let greeting = Reply::Simple(format!("HI {}", serde_json::to_string(&hi)?));
    write_reply(writer, &greeting).await?;

    let line = read_line(reader, MAX_LINE_LEN)
        .await?
        .ok_or(HandshakeError::Closed)?;
    let hello = match Command::parse_bytes(&line)? {
        Command::Hello(hello) => hello,
        other => return Err(HandshakeError::ExpectedHello(other.verb())),
    };

    if let Some((password, salt, iterations)) = &challenge {
        // Clients before protocol 2 hash exactly once.
        let iterations = if hello.v < 2 { 1 } else { *iterations };
        let expected = hash_password(password, salt, iterations);
        let provided = hello.pwdhash.as_deref().unwrap_or_default();
        if !verify_password(&expected, provided) {
            return Err(HandshakeError::InvalidPassword);
        }
    }

    let client = ClientData::from(&hello);
    if hello.is_consumer() {
        server.workers.heartbeat(&client, true)?;
    }
    write_reply(writer, &Reply::ok()).await?;
    Ok(client)
}
