//! TCP front end: accepts connections, runs one session task per client and
//! drives the maintenance task runner until shutdown.

mod commands;
mod info;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use faktory_config::{ServerOptions, TlsFiles};

use crate::clock::{Clock, SystemClock};
use crate::constants::{
    DEAD_TASK_PERIOD_SECS, HANDSHAKE_TIMEOUT, HEARTBEAT_TASK_PERIOD_SECS,
    REAPER_TASK_PERIOD_SECS, RETRIES_TASK_PERIOD_SECS, SCHEDULED_TASK_PERIOD_SECS,
};
use crate::manager::Manager;
use crate::storage::{SetKind, Store};
use crate::tasks::{
    BackupTask, DeadPurgeTask, HeartbeatReaperTask, PromoteTask, ReservationReaperTask,
    TaskRunner,
};
use crate::workers::Workers;

/// Counters reported by `INFO`.
#[derive(Debug)]
pub struct ServerStats {
    connections: AtomicU64,
    command_count: AtomicU64,
    started_at: Instant,
}

impl ServerStats {
    fn new() -> Self {
        Self {
            connections: AtomicU64::new(0),
            command_count: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Currently open client connections.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn command_count(&self) -> u64 {
        self.command_count.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub(crate) fn record_command(&self) {
        self.command_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Triggers an orderly shutdown of a running [`Server`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }
}

pub struct Server {
    options: ServerOptions,
    clock: Arc<dyn Clock>,
    store: Arc<Store>,
    workers: Arc<Workers>,
    manager: Arc<Manager>,
    tasks: Arc<TaskRunner>,
    stats: ServerStats,
    shutdown: Arc<watch::Sender<bool>>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Result<Self> {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Opens the store, restores reservations left by a previous run and
    /// registers the maintenance tasks.
    pub fn with_clock(options: ServerOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Arc::new(
            Store::open(&options.storage_dir, options.queue_max_size).with_context(|| {
                format!("failed to open store in {}", options.storage_dir.display())
            })?,
        );
        let workers = Arc::new(Workers::new(clock.clone()));
        let manager = Arc::new(Manager::new(
            store.clone(),
            workers.clone(),
            clock.clone(),
        ));
        manager
            .recover_reservations()
            .context("failed to recover reservations")?;

        let mut tasks = TaskRunner::new();
        tasks.register(
            SCHEDULED_TASK_PERIOD_SECS,
            PromoteTask::new(manager.clone(), SetKind::Scheduled),
        );
        tasks.register(
            RETRIES_TASK_PERIOD_SECS,
            PromoteTask::new(manager.clone(), SetKind::Retries),
        );
        tasks.register(DEAD_TASK_PERIOD_SECS, DeadPurgeTask::new(store.clone()));
        tasks.register(
            REAPER_TASK_PERIOD_SECS,
            ReservationReaperTask::new(manager.clone()),
        );
        tasks.register(
            HEARTBEAT_TASK_PERIOD_SECS,
            HeartbeatReaperTask::new(workers.clone()),
        );
        if options.is_production() {
            tasks.register(
                options.backup_frequency.as_secs(),
                BackupTask::new(store.clone(), options.backup_count),
            );
        }

        let tls = options.tls.as_ref().map(load_tls).transpose()?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            options,
            clock,
            store,
            workers,
            manager,
            tasks: Arc::new(tasks),
            stats: ServerStats::new(),
            shutdown: Arc::new(shutdown),
            tls,
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }

    pub fn tasks(&self) -> &Arc<TaskRunner> {
        &self.tasks
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown.clone(),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.options.binding)
            .await
            .with_context(|| format!("failed to bind {}", self.options.binding))?;
        self.serve(listener).await
    }

    /// Serves clients on `listener` until shutdown, then waits for every
    /// session and the task runner to finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let address = listener.local_addr().context("listener has no address")?;
        tracing::info!(
            %address,
            environment = %self.options.environment,
            tls = self.tls.is_some(),
            "faktory listening"
        );

        let runner = tokio::spawn(
            self.tasks
                .clone()
                .run(self.clock.clone(), self.shutdown.subscribe()),
        );
        let mut shutdown = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        sessions.spawn(async move { server.handle(stream, peer).await });
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "session task panicked");
                    }
                }
            }
        }

        tracing::info!(sessions = sessions.len(), "shutting down");
        drop(listener);
        self.store.close();
        while let Some(joined) = sessions.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "session task panicked");
            }
        }
        if let Err(err) = runner.await {
            tracing::error!(error = %err, "task runner panicked");
        }
        tracing::info!("faktory stopped");
        Ok(())
    }

    async fn handle(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %err, "failed to set TCP_NODELAY");
        }
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        match &self.tls {
            Some(acceptor) => {
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => session::serve(&self, tls, peer).await,
                    Ok(Err(err)) => tracing::warn!(%peer, error = %err, "TLS handshake failed"),
                    Err(_) => tracing::warn!(%peer, "TLS handshake timed out"),
                }
            }
            None => session::serve(&self, stream, peer).await,
        }
        self.stats.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

fn load_tls(files: &TlsFiles) -> Result<TlsAcceptor> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let certs = CertificateDer::pem_file_iter(&files.certificate)
        .with_context(|| format!("failed to read {}", files.certificate.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid certificate in {}", files.certificate.display()))?;
    let key = PrivateKeyDer::from_pem_file(&files.private_key)
        .with_context(|| format!("failed to read {}", files.private_key.display()))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate or key")?;
    tracing::info!(certificate = %files.certificate.display(), "TLS enabled");
    Ok(TlsAcceptor::from(Arc::new(config)))
}
