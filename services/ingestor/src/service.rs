//! Service lifecycle: start, stop, join.
//!
//! `start` loads any existing table, binds the listener and spawns the
//! acceptor and scheduler tasks.  `stop` raises the shared stop signal.
//! `join` waits for the acceptor (and through it every connection), then the
//! scheduler, and finally performs one unconditional flush so nothing
//! appended before the stop is lost.

use crate::acceptor::{Acceptor, AcceptorSummary};
use crate::buffer::IngestBuffer;
use crate::config::ServiceConfig;
use crate::handler::ConnectionSettings;
use crate::scheduler::{FlushError, FlushReport, FlushStatus, Persister, run_scheduler};
use fm_store::{SharedTable, StoreError};
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load existing table: {0}")]
    Load(#[from] StoreError),
    #[error("table load task failed: {0}")]
    LoadTask(#[from] tokio::task::JoinError),
}

/// What the service did over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub acceptor: AcceptorSummary,
    pub periodic_flushes: u64,
    pub final_flush: FlushReport,
}

pub struct IngestService {
    local_addr: SocketAddr,
    buffer: IngestBuffer,
    persister: Persister,
    shutdown_tx: watch::Sender<bool>,
    acceptor: JoinHandle<AcceptorSummary>,
    scheduler: JoinHandle<u64>,
}

impl IngestService {
    /// Load, bind and spawn.  A bind failure leaves nothing running.
    pub async fn start(config: ServiceConfig) -> Result<Self, ServiceError> {
        let table = SharedTable::new(&config.storage.table_path, config.storage.lock_timeout);

        let loader = table.clone();
        let existing = tokio::task::spawn_blocking(move || loader.load()).await??;
        let buffer = match existing {
            Some(records) => {
                info!(
                    path = %table.table_path().display(),
                    rows = records.len(),
                    "loaded persisted table"
                );
                IngestBuffer::from_records(records)
            }
            None => {
                info!(path = %table.table_path().display(), "no persisted table yet; starting empty");
                IngestBuffer::new()
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = ConnectionSettings {
            idle_timeout: config.listen.idle_timeout,
            max_frame_bytes: config.listen.max_frame_bytes,
        };
        let addr = config.listen.bind_addr();
        info!(addr = %addr, "attempting to bind");
        let acceptor = Acceptor::bind(&addr, buffer.clone(), settings, shutdown_rx.clone())
            .await
            .map_err(|source| {
                error!(addr = %addr, error = %source, "failed to bind");
                ServiceError::Bind {
                    addr: addr.clone(),
                    source,
                }
            })?;
        let local_addr = acceptor.local_addr().map_err(|source| ServiceError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!(addr = %local_addr, "listening for sensor connections");

        let persister = Persister::new(buffer.clone(), table, config.retention);
        let acceptor = tokio::spawn(acceptor.run());
        let scheduler = tokio::spawn(run_scheduler(persister.clone(), config.flush, shutdown_rx));

        Ok(IngestService {
            local_addr,
            buffer,
            persister,
            shutdown_tx,
            acceptor,
            scheduler,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn buffer(&self) -> &IngestBuffer {
        &self.buffer
    }

    pub fn flush_status(&self) -> FlushStatus {
        self.persister.status()
    }

    /// Request a cooperative stop.  Workers notice within one idle timeout.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for every worker, then flush one last time.
    ///
    /// Returns only after `stop` has been called (or the service's stop
    /// sender is otherwise signalled).  The final flush is attempted even if
    /// earlier periodic flushes failed.
    pub async fn join(self) -> Result<ShutdownReport, FlushError> {
        let acceptor = self.acceptor.await.unwrap_or_else(|e| {
            warn!(error = %e, "acceptor task failed");
            AcceptorSummary::default()
        });
        let periodic_flushes = self.scheduler.await.unwrap_or_else(|e| {
            warn!(error = %e, "scheduler task failed");
            0
        });

        let final_flush = match self.persister.flush().await {
            Ok(report) => {
                info!(rows = report.rows, "final flush complete");
                report
            }
            Err(e) => {
                error!(error = %e, "final flush failed");
                return Err(e);
            }
        };

        Ok(ShutdownReport {
            acceptor,
            periodic_flushes,
            final_flush,
        })
    }

    /// `stop` then `join`.
    pub async fn shutdown(self) -> Result<ShutdownReport, FlushError> {
        self.stop();
        self.join().await
    }
}
