//! Retention and persistence scheduler.
//!
//! One long-lived task waits for the next firing of the flush schedule (or
//! the stop signal), then trims the buffer to the retention window and
//! rewrites the shared table under the exclusive interprocess lock.  The
//! first flush happens one full period after start, never at startup.
//!
//! A failed flush is logged and recorded in [`FlushStatus`]; ingestion keeps
//! running in memory and the next firing tries again.

use crate::buffer::{IngestBuffer, TrimReport};
use crate::retention::RetentionPolicy;
use chrono::{DateTime, Days, Local, TimeZone, Utc};
use fm_store::{SharedTable, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSchedule {
    Interval(Duration),
    /// Every local midnight.
    DailyAtMidnight,
}

impl FlushSchedule {
    /// Time from `now` until the next firing.
    pub fn next_delay(&self, now: DateTime<Local>) -> Duration {
        match self {
            FlushSchedule::Interval(period) => *period,
            FlushSchedule::DailyAtMidnight => (next_local_midnight(now) - now)
                .to_std()
                .unwrap_or(Duration::ZERO),
        }
    }
}

fn next_local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    let fallback = now + chrono::TimeDelta::days(1);
    let Some(tomorrow) = now.date_naive().checked_add_days(Days::new(1)) else {
        return fallback;
    };
    let Some(midnight) = tomorrow.and_hms_opt(0, 0, 0) else {
        return fallback;
    };
    // A DST jump can skip local midnight; fall back to the first valid
    // instant of the day.
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            (1..=3)
                .filter_map(|h| tomorrow.and_hms_opt(h, 0, 0))
                .find_map(|t| Local.from_local_datetime(&t).earliest())
        })
        .unwrap_or(fallback)
}

// ---------------------------------------------------------------------------
// Flush
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("writing table: {0}")]
    Store(#[from] StoreError),
    #[error("flush task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub rows: usize,
    pub trim: TrimReport,
}

/// Flush outcomes, for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub succeeded: u64,
    pub failed: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FlushStatus {
    inner: Arc<Mutex<FlushStats>>,
}

impl FlushStatus {
    pub async fn get(&self) -> FlushStats {
        self.inner.lock().await.clone()
    }

    async fn record(&self, result: &Result<FlushReport, FlushError>, at: DateTime<Utc>) {
        let mut stats = self.inner.lock().await;
        match result {
            Ok(_) => {
                stats.succeeded += 1;
                stats.last_success = Some(at);
                stats.last_error = None;
            }
            Err(e) => {
                stats.failed += 1;
                stats.last_error = Some(e.to_string());
            }
        }
    }
}

/// Trims the buffer and writes it to the shared table.
#[derive(Debug, Clone)]
pub struct Persister {
    buffer: IngestBuffer,
    table: SharedTable,
    policy: RetentionPolicy,
    status: FlushStatus,
}

impl Persister {
    pub fn new(buffer: IngestBuffer, table: SharedTable, policy: RetentionPolicy) -> Self {
        Persister {
            buffer,
            table,
            policy,
            status: FlushStatus::default(),
        }
    }

    pub fn status(&self) -> FlushStatus {
        self.status.clone()
    }

    pub async fn flush(&self) -> Result<FlushReport, FlushError> {
        self.flush_at(Utc::now()).await
    }

    /// Flush with an explicit notion of "now" for the retention window.
    pub async fn flush_at(&self, now: DateTime<Utc>) -> Result<FlushReport, FlushError> {
        let (rows, trim) = self.buffer.trim_and_snapshot(&self.policy, now).await;
        let count = rows.len();
        let table = self.table.clone();
        let result = match tokio::task::spawn_blocking(move || table.store(&rows)).await {
            Ok(Ok(())) => Ok(FlushReport { rows: count, trim }),
            Ok(Err(e)) => Err(FlushError::from(e)),
            Err(e) => Err(FlushError::from(e)),
        };
        self.status.record(&result, now).await;
        result
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

/// Run periodic flushes until stop is requested.  Returns the number of
/// periodic flushes attempted.  The final shutdown flush is not done here;
/// the service does it after every connection has drained.
pub async fn run_scheduler(
    persister: Persister,
    schedule: FlushSchedule,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut attempts = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let delay = schedule.next_delay(Local::now());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        attempts += 1;
        match persister.flush().await {
            Ok(report) => info!(
                rows = report.rows,
                expired = report.trim.expired,
                unparsable_dropped = report.trim.unparsable_dropped,
                "flushed table"
            ),
            Err(e) => error!(error = %e, "periodic flush failed; records remain buffered in memory"),
        }
    }
    attempts
}
