//! Collector health counters and the read-only snapshot consumed by dashboards.
//!
//! Counters are plain atomics so every stage can bump them without locking.
//! Individual malformed events are never surfaced here, only totals.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rugs_common::{Alert, SessionSummary};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::tracker::{SharedTracker, TrackerStats, read_tracker};

/// Number of summaries exposed in a snapshot.
pub const RECENT_SESSIONS: usize = 10;

/// Running totals for the whole collector.
#[derive(Debug, Default)]
pub struct CollectorStats {
    pub events_received: AtomicU64,
    pub validation_errors: AtomicU64,
    pub persistence_errors: AtomicU64,
    pub connection_drops: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub baseline_markers: AtomicU64,
    pub duplicate_markers: AtomicU64,
    pub sessions_recorded: AtomicU64,
    pub sessions_rejected: AtomicU64,
    pub records_written: AtomicU64,
    pub files_created: AtomicU64,
    pub bytes_written: AtomicU64,
    pub connected: AtomicBool,
    /// Epoch milliseconds of the last received event, 0 if none.
    pub last_event_ms: AtomicI64,
}

impl CollectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received event.
    pub fn mark_event(&self, at: DateTime<Utc>) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.last_event_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Returns true if connected and an event arrived within `timeout` of `now`.
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if !self.connected.load(Ordering::Relaxed) {
            return false;
        }
        let last = self.last_event_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let age_ms = now.timestamp_millis().saturating_sub(last);
        age_ms >= 0 && (age_ms as u128) <= timeout.as_millis()
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            connection_drops: self.connection_drops.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            baseline_markers: self.baseline_markers.load(Ordering::Relaxed),
            duplicate_markers: self.duplicate_markers.load(Ordering::Relaxed),
            sessions_recorded: self.sessions_recorded.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            files_created: self.files_created.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let c = self.counters();
        info!(
            "Health: connected={}, events={}, sessions={}, written={}, validation_errors={}, persistence_errors={}, drops={}",
            self.connected.load(Ordering::Relaxed),
            c.events_received,
            c.sessions_recorded,
            c.records_written,
            c.validation_errors,
            c.persistence_errors,
            c.connection_drops,
        );
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub events_received: u64,
    pub validation_errors: u64,
    pub persistence_errors: u64,
    pub connection_drops: u64,
    pub reconnect_attempts: u64,
    pub baseline_markers: u64,
    pub duplicate_markers: u64,
    pub sessions_recorded: u64,
    pub sessions_rejected: u64,
    pub records_written: u64,
    pub files_created: u64,
    pub bytes_written: u64,
}

/// Read-only view of collector state for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorSnapshot {
    pub taken_at: DateTime<Utc>,
    pub total_sessions: u64,
    pub total_files: u64,
    pub total_bytes: u64,
    /// Newest last.
    pub recent_sessions: Vec<SessionSummary>,
    pub is_collector_alive: bool,
    /// Alerts produced within the recent-alert window.
    pub alerts: Vec<Alert>,
    pub validation_errors: u64,
    pub persistence_errors: u64,
    pub connection_drops: u64,
    pub sequence: TrackerStats,
    pub counters: CounterSnapshot,
}

/// Cloneable accessor that assembles snapshots on demand.
#[derive(Clone)]
pub struct StatsHandle {
    stats: Arc<CollectorStats>,
    tracker: SharedTracker,
    alive_timeout: Duration,
}

impl StatsHandle {
    pub fn new(stats: Arc<CollectorStats>, tracker: SharedTracker, alive_timeout: Duration) -> Self {
        Self {
            stats,
            tracker,
            alive_timeout,
        }
    }

    pub fn stats(&self) -> &Arc<CollectorStats> {
        &self.stats
    }

    pub fn snapshot(&self) -> CollectorSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> CollectorSnapshot {
        let counters = self.stats.counters();
        let (sequence, recent_sessions, alerts) = {
            let tracker = read_tracker(&self.tracker);
            (
                tracker.stats(),
                tracker.recent_summaries(RECENT_SESSIONS),
                tracker.recent_alerts(now),
            )
        };

        CollectorSnapshot {
            taken_at: now,
            total_sessions: sequence.total_sessions,
            total_files: counters.files_created,
            total_bytes: counters.bytes_written,
            recent_sessions,
            is_collector_alive: self.stats.is_alive(now, self.alive_timeout),
            alerts,
            validation_errors: counters.validation_errors,
            persistence_errors: counters.persistence_errors,
            connection_drops: counters.connection_drops,
            sequence,
            counters,
        }
    }
}

/// Atomically replace `path` with the JSON snapshot.
pub fn write_status_file(path: &Path, snapshot: &CollectorSnapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}
