use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use faktory_protocol::{BeatReply, Command, ProtocolError, QueueAction, Reply, WorkerState};

use crate::error::{JobError, StorageError, WorkerError};
use crate::job::Job;
use crate::server::{Server, info};
use crate::workers::ClientData;

#[derive(Debug, Error)]
enum CommandError {
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Executes one command and renders its reply; failures become `-ERR`.
pub(crate) async fn dispatch(server: &Server, client: &ClientData, command: Command) -> Reply {
    let verb = command.verb();
    match execute(server, client, command).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::debug!(command = verb, error = %err, "command failed");
            Reply::err(err.to_string())
        }
    }
}

async fn execute(
    server: &Server,
    client: &ClientData,
    command: Command,
) -> Result<Reply, CommandError> {
    match command {
        Command::Push(raw) => {
            let job: Job = serde_json::from_str(&raw)?;
            server.manager.push(job).await?;
            Ok(Reply::ok())
        }
        Command::PushBulk(raw) => {
            let jobs: Vec<Value> = serde_json::from_str(&raw)?;
            let errors = server.manager.push_bulk(jobs).await;
            Ok(Reply::json(&errors)?)
        }
        Command::Fetch(queues) => {
            if queues.is_empty() {
                return Err(CommandError::Rejected(
                    "FETCH requires at least one queue".to_string(),
                ));
            }
            match server.manager.fetch(&client.wid, &queues).await? {
                Some(job) => Ok(Reply::json(&job)?),
                None => Ok(Reply::nil()),
            }
        }
        Command::Ack(payload) => {
            server.manager.ack(&payload.jid)?;
            Ok(Reply::ok())
        }
        Command::Fail(payload) => {
            server.manager.fail(payload)?;
            Ok(Reply::ok())
        }
        Command::Beat(payload) => match server.workers.beat(&payload)? {
            WorkerState::Running => Ok(Reply::ok()),
            state => Ok(Reply::json(&BeatReply { state })?),
        },
        Command::Info => Ok(Reply::json(&info::snapshot(server)?)?),
        Command::Flush => {
            if server.options.is_production() {
                return Err(CommandError::Rejected(
                    "FLUSH is not allowed in production".to_string(),
                ));
            }
            server.manager.flush()?;
            Ok(Reply::ok())
        }
        Command::Queue { action, names } => queue_command(server, action, names),
        Command::Mutate(op) => {
            server.manager.mutate(&op)?;
            Ok(Reply::ok())
        }
        Command::Track(_) => Err(CommandError::Rejected(
            "TRACK is not supported".to_string(),
        )),
        Command::Hello(_) => Err(CommandError::Rejected(
            "HELLO is only valid during the handshake".to_string(),
        )),
        Command::End => Ok(Reply::ok()),
    }
}

fn queue_command(
    server: &Server,
    action: QueueAction,
    names: Vec<String>,
) -> Result<Reply, CommandError> {
    if names.is_empty() {
        return Err(CommandError::Rejected(
            "QUEUE requires at least one queue name".to_string(),
        ));
    }
    let names = if names.iter().any(|name| name == "*") {
        server
            .store
            .queues()
            .iter()
            .map(|queue| queue.name().to_string())
            .collect()
    } else {
        names
    };

    match action {
        QueueAction::Pause => {
            for name in &names {
                server.store.get_queue(name)?.pause()?;
                tracing::info!(queue = %name, "queue paused");
            }
        }
        QueueAction::Resume => {
            for name in &names {
                server.store.get_queue(name)?.resume()?;
                tracing::info!(queue = %name, "queue resumed");
            }
        }
        QueueAction::Remove => {
            for name in &names {
                server.store.remove_queue(name)?;
            }
        }
        QueueAction::Latency => {
            let mut latencies = BTreeMap::new();
            for name in names {
                let latency = server.manager.queue_latency(&name)?;
                latencies.insert(name, latency);
            }
            return Ok(Reply::json(&latencies)?);
        }
    }
    Ok(Reply::ok())
}
