//! Metrics collection for capture sessions.
//!
//! Tracks tick scheduling, skip reasons, and report outcomes for one loop,
//! plus a bounded error history. Used for diagnostics; the snapshot is
//! serializable so a debug surface can display it directly.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CaptureError;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Record of an error that occurred during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when the error occurred (seconds)
    pub timestamp: u64,
    /// Category tag ("device", "transport", "malformed", "session")
    pub kind: String,
    pub message: String,
}

/// Point-in-time view of a session's counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopStats {
    /// Ticks the scheduler offered to the loop.
    pub ticks: u64,
    /// Ticks skipped because a report was still in flight.
    pub skipped_in_flight: u64,
    /// Ticks skipped because the source had no sample yet.
    pub skipped_not_ready: u64,
    pub reports_ok: u64,
    pub reports_failed: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Per-session metrics collector. One owner, short critical sections.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    stats: LoopStats,
    errors: VecDeque<ErrorRecord>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick_seen(&mut self) {
        self.stats.ticks += 1;
    }

    pub fn tick_skipped_in_flight(&mut self) {
        self.stats.skipped_in_flight += 1;
    }

    pub fn tick_skipped_not_ready(&mut self) {
        self.stats.skipped_not_ready += 1;
    }

    pub fn report_ok(&mut self) {
        self.stats.reports_ok += 1;
    }

    pub fn report_failed(&mut self, error: &CaptureError) {
        self.stats.reports_failed += 1;
        let record = ErrorRecord {
            timestamp: unix_now(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        };
        self.stats.last_error = Some(record.clone());
        self.errors.push_back(record);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_front();
        }
    }

    pub fn snapshot(&self) -> LoopStats {
        self.stats.clone()
    }

    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }
}
