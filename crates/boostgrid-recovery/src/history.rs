//! Bounded error history and handler statistics.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use boostgrid_core::time::incremental_mean;
use boostgrid_core::{ErrorKind, InstanceId, TaskId};

use crate::classify::Classification;

/// One handled error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub message: String,
    pub classification: Classification,
    pub task_id: Option<TaskId>,
    pub instance_id: Option<InstanceId>,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

struct HistoryEntry {
    record: ErrorRecord,
    at: Instant,
}

/// Append-only history, oldest entries trimmed past `limit`.
pub(crate) struct ErrorHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl ErrorHistory {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub(crate) fn push(&mut self, record: ErrorRecord, at: Instant) {
        self.entries.push_back(HistoryEntry { record, at });
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// Errors of `kind` on `instance_id` no older than `window`.
    pub(crate) fn count_recent(
        &self,
        instance_id: &str,
        kind: ErrorKind,
        now: Instant,
        window: Duration,
    ) -> usize {
        self.entries
            .iter()
            .rev()
            .take_while(|e| now.saturating_duration_since(e.at) <= window)
            .filter(|e| {
                e.record.classification.error_type == kind
                    && e.record.instance_id.as_deref() == Some(instance_id)
            })
            .count()
    }

    /// Newest first.
    pub(crate) fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        self.entries
            .iter()
            .rev()
            .take(limit)
            .map(|e| e.record.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Aggregate error-handling statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub recovered_errors: u64,
    pub fallback_activations: u64,
    pub panics_handled: u64,
    /// Mean over successful recoveries only.
    pub avg_recovery_time_ms: f64,
    pub errors_by_type: BTreeMap<ErrorKind, u64>,
    pub errors_by_instance: BTreeMap<InstanceId, u64>,
}

impl ErrorStats {
    pub(crate) fn record_error(&mut self, kind: ErrorKind, instance_id: Option<&str>) {
        self.total_errors += 1;
        if kind == ErrorKind::Panic {
            self.panics_handled += 1;
        }
        *self.errors_by_type.entry(kind).or_default() += 1;
        if let Some(id) = instance_id {
            *self.errors_by_instance.entry(id.to_string()).or_default() += 1;
        }
    }

    pub(crate) fn record_recovery(&mut self, duration: Duration) {
        self.recovered_errors += 1;
        self.avg_recovery_time_ms = incremental_mean(
            self.avg_recovery_time_ms,
            duration.as_secs_f64() * 1000.0,
            self.recovered_errors,
        );
    }
}
