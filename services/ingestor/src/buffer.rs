//! In-memory ingestion buffer.
//!
//! The series lives behind a single mutex and is only reachable through
//! `IngestBuffer` methods.  Handles are cheap to clone and all share one
//! series.

use crate::retention::{RetentionPolicy, Verdict};
use chrono::{DateTime, Utc};
use fm_protocol::Record;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct IngestBuffer {
    series: Arc<Mutex<Vec<Record>>>,
}

/// What a trim kept and discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub kept: usize,
    pub expired: usize,
    pub unparsable_kept: usize,
    pub unparsable_dropped: usize,
}

impl TrimReport {
    pub fn dropped(&self) -> usize {
        self.expired + self.unparsable_dropped
    }
}

impl IngestBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing series, e.g. the table loaded at startup.
    pub fn from_records(records: Vec<Record>) -> Self {
        IngestBuffer {
            series: Arc::new(Mutex::new(records)),
        }
    }

    /// Append records in the order given.
    pub async fn append(&self, records: impl IntoIterator<Item = Record>) {
        self.series.lock().await.extend(records);
    }

    /// An independent copy of the series as of now.
    pub async fn snapshot(&self) -> Vec<Record> {
        self.series.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.series.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.series.lock().await.is_empty()
    }

    /// Drop every record the policy does not keep.  Survivors keep their
    /// relative order.
    pub async fn trim(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> TrimReport {
        let mut series = self.series.lock().await;
        trim_in_place(&mut series, policy, now)
    }

    /// Trim and copy in one critical section, so the copy is exactly the
    /// trimmed series.
    pub async fn trim_and_snapshot(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> (Vec<Record>, TrimReport) {
        let mut series = self.series.lock().await;
        let report = trim_in_place(&mut series, policy, now);
        (series.clone(), report)
    }
}

fn trim_in_place(series: &mut Vec<Record>, policy: &RetentionPolicy, now: DateTime<Utc>) -> TrimReport {
    let mut report = TrimReport::default();
    series.retain(|record| {
        let verdict = policy.classify(&record.timestamp, now);
        match verdict {
            Verdict::InWindow => report.kept += 1,
            Verdict::OutOfWindow => report.expired += 1,
            Verdict::UnparsableKept => {
                report.kept += 1;
                report.unparsable_kept += 1;
            }
            Verdict::UnparsableDropped => report.unparsable_dropped += 1,
        }
        verdict.keeps()
    });
    report
}
