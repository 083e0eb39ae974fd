//! Cross-session sequence tracking and pattern alerts.
//!
//! Keeps a bounded history of session summaries and evaluates three
//! independent rules after every new summary:
//!
//! - **HighPeakThenEarlyTermination** (HIGH): the previous session peaked
//!   above the high-peak threshold and the current one terminated early.
//! - **EarlyTerminationCluster** (MEDIUM): at least `cluster_min_early` of the
//!   last `cluster_window` sessions terminated early.
//! - **AbnormalPeakAverage** (LOW): the mean peak over the last
//!   `average_window` sessions exceeds the average threshold.
//!
//! ## Architecture
//!
//! ```text
//! [SessionAnalyzer] --> [SequenceTracker::track] --> [Alert]s --> [SessionRecord]
//!                              |
//!                              +--> ring buffer of summaries (cap 100)
//!                              +--> alert log (cap 50)
//! ```

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use rugs_common::{
    Alert, AlertEvidence, AlertSeverity, AlertType, RingBuffer, SequenceMetadata, SessionSummary,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration for sequence tracking.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Summaries retained for rolling statistics.
    pub summary_capacity: usize,
    /// Alerts retained before the oldest is evicted.
    pub alert_capacity: usize,
    /// Prior-session peak above which an early termination is notable.
    pub high_peak_threshold: f64,
    pub cluster_window: usize,
    pub cluster_min_early: usize,
    pub average_window: usize,
    pub average_peak_threshold: f64,
    /// Window for the rolling rates in [`TrackerStats`].
    pub stats_window: usize,
    /// Alerts older than this are excluded from recent queries.
    pub recent_alert_age: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            summary_capacity: 100,
            alert_capacity: 50,
            high_peak_threshold: 50.0,
            cluster_window: 5,
            cluster_min_early: 3,
            average_window: 5,
            average_peak_threshold: 30.0,
            stats_window: 10,
            recent_alert_age: Duration::from_secs(5 * 60),
        }
    }
}

/// Rolling statistics over tracked sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStats {
    pub total_sessions: u64,
    /// Fraction of the last `stats_window` sessions that terminated early.
    pub early_termination_rate: f64,
    /// Mean peak over the last `stats_window` sessions.
    pub average_peak: f64,
    /// Alerts produced since startup, including evicted ones.
    pub total_alerts: u64,
    pub sessions_this_hour: u64,
}

/// Result of tracking one summary.
#[derive(Debug, Clone)]
pub struct TrackOutcome {
    pub alerts: Vec<Alert>,
    pub sequence: SequenceMetadata,
}

/// Bounded history of session summaries with pattern detection.
pub struct SequenceTracker {
    config: TrackerConfig,
    summaries: RingBuffer<SessionSummary>,
    alerts: RingBuffer<Alert>,
    total_sessions: u64,
    total_alerts: u64,
    current_hour: Option<(NaiveDate, u32)>,
    hourly_sessions: u64,
    last_close: Option<DateTime<Utc>>,
}

impl SequenceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            summaries: RingBuffer::new(config.summary_capacity),
            alerts: RingBuffer::new(config.alert_capacity),
            config,
            total_sessions: 0,
            total_alerts: 0,
            current_hour: None,
            hourly_sessions: 0,
            last_close: None,
        }
    }

    /// Track a summary closed now and return any alerts it triggered.
    pub fn track(&mut self, summary: SessionSummary) -> Vec<Alert> {
        self.track_at(summary, Utc::now()).alerts
    }

    /// Track a summary for a session closed at `closed_at`.
    pub fn track_at(&mut self, summary: SessionSummary, closed_at: DateTime<Utc>) -> TrackOutcome {
        let hour = (closed_at.date_naive(), closed_at.hour());
        if self.current_hour != Some(hour) {
            self.current_hour = Some(hour);
            self.hourly_sessions = 0;
        }
        self.hourly_sessions += 1;
        self.total_sessions += 1;

        let time_since_prior_close_seconds = self
            .last_close
            .map(|prior| (closed_at - prior).num_milliseconds() as f64 / 1000.0);
        self.last_close = Some(closed_at);

        self.summaries.push(summary);

        let alerts: Vec<Alert> = [
            self.check_high_peak_then_early(),
            self.check_early_cluster(),
            self.check_peak_average(),
        ]
        .into_iter()
        .flatten()
        .map(|alert| alert.at(closed_at))
        .collect();

        for alert in &alerts {
            warn!("Sequence alert [{}] {}: {}", alert.severity, alert.alert_type, alert.description);
            self.alerts.push(alert.clone());
            self.total_alerts += 1;
        }

        TrackOutcome {
            alerts,
            sequence: SequenceMetadata {
                session_number: self.total_sessions,
                hourly_session_number: self.hourly_sessions,
                time_since_prior_close_seconds,
            },
        }
    }

    fn check_high_peak_then_early(&self) -> Option<Alert> {
        let current = self.summaries.last()?;
        let prior = self.summaries.previous()?;
        if prior.peak_value <= self.config.high_peak_threshold || !current.is_early_termination {
            return None;
        }

        Some(Alert::new(
            AlertType::HighPeakThenEarlyTermination,
            AlertSeverity::High,
            format!(
                "session {} peaked at {:.2}x, next session {} terminated at tick {}",
                prior.session_id, prior.peak_value, current.session_id, current.termination_tick
            ),
            AlertEvidence::PeakThenEarly {
                prior_session_id: prior.session_id.clone(),
                prior_peak: prior.peak_value,
                session_id: current.session_id.clone(),
                termination_tick: current.termination_tick,
            },
        ))
    }

    fn check_early_cluster(&self) -> Option<Alert> {
        let window = self.config.cluster_window;
        if window == 0 || self.summaries.len() < window {
            return None;
        }

        let members: Vec<String> = self
            .summaries
            .last_n(window)
            .filter(|s| s.is_early_termination)
            .map(|s| s.session_id.clone())
            .collect();
        if members.len() < self.config.cluster_min_early {
            return None;
        }

        Some(Alert::new(
            AlertType::EarlyTerminationCluster,
            AlertSeverity::Medium,
            format!(
                "{} of the last {} sessions terminated early",
                members.len(),
                window
            ),
            AlertEvidence::Cluster { members, window },
        ))
    }

    fn check_peak_average(&self) -> Option<Alert> {
        let window = self.config.average_window;
        if window == 0 || self.summaries.len() < window {
            return None;
        }

        let (peaks, session_ids): (Vec<f64>, Vec<String>) = self
            .summaries
            .last_n(window)
            .map(|s| (s.peak_value, s.session_id.clone()))
            .unzip();
        let average = peaks.iter().sum::<f64>() / peaks.len() as f64;
        if average <= self.config.average_peak_threshold {
            return None;
        }

        Some(Alert::new(
            AlertType::AbnormalPeakAverage,
            AlertSeverity::Low,
            format!("average peak over the last {window} sessions is {average:.2}x"),
            AlertEvidence::PeakAverage {
                average,
                peaks,
                session_ids,
            },
        ))
    }

    pub fn stats(&self) -> TrackerStats {
        let window: Vec<&SessionSummary> = self.summaries.last_n(self.config.stats_window).collect();
        let (early_termination_rate, average_peak) = if window.is_empty() {
            (0.0, 0.0)
        } else {
            let n = window.len() as f64;
            let early = window.iter().filter(|s| s.is_early_termination).count() as f64;
            let peak_sum: f64 = window.iter().map(|s| s.peak_value).sum();
            (early / n, peak_sum / n)
        };

        TrackerStats {
            total_sessions: self.total_sessions,
            early_termination_rate,
            average_peak,
            total_alerts: self.total_alerts,
            sessions_this_hour: self.hourly_sessions,
        }
    }

    /// Newest `n` summaries, oldest first.
    pub fn recent_summaries(&self, n: usize) -> Vec<SessionSummary> {
        self.summaries.last_n(n).cloned().collect()
    }

    /// Alerts produced within the recent-alert window before `now`.
    pub fn recent_alerts(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let max_age = chrono::Duration::from_std(self.config.recent_alert_age)
            .unwrap_or(chrono::Duration::MAX);
        self.alerts
            .iter()
            .filter(|a| now.signed_duration_since(a.produced_at) <= max_age)
            .cloned()
            .collect()
    }

    /// Every retained alert, oldest first.
    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    /// Every retained summary, oldest first.
    pub fn summaries(&self) -> impl Iterator<Item = &SessionSummary> {
        self.summaries.iter()
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }
}

/// Tracker shared between the pipeline (writer) and snapshot readers.
pub type SharedTracker = Arc<RwLock<SequenceTracker>>;

pub fn create_shared_tracker(config: TrackerConfig) -> SharedTracker {
    Arc::new(RwLock::new(SequenceTracker::new(config)))
}

/// Read access that survives a poisoned lock.
pub fn read_tracker(tracker: &SharedTracker) -> RwLockReadGuard<'_, SequenceTracker> {
    tracker.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write access that survives a poisoned lock.
pub fn write_tracker(tracker: &SharedTracker) -> RwLockWriteGuard<'_, SequenceTracker> {
    tracker.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rugs_common::{EventTypeCounts, TimingStats, TradeStats, is_early_termination};

    fn summary(id: &str, peak: f64, tick: u64) -> SessionSummary {
        SessionSummary {
            session_id: id.to_string(),
            peak_value: peak,
            termination_tick: tick,
            is_early_termination: is_early_termination(tick),
            duration: 10.0,
            event_type_counts: EventTypeCounts::default(),
            trade_stats: TradeStats::default(),
            timing_stats: TimingStats::default(),
            price_range: None,
            validation_errors: 0,
        }
    }

    fn count(alerts: &[Alert], alert_type: AlertType) -> usize {
        alerts.iter().filter(|a| a.alert_type == alert_type).count()
    }

    #[test]
    fn test_high_peak_then_early_termination() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());

        assert!(tracker.track(summary("g1", 67.3, 45)).is_empty());
        let alerts = tracker.track(summary("g2", 1.2, 4));

        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.alert_type, AlertType::HighPeakThenEarlyTermination);
        assert_eq!(alert.severity, AlertSeverity::High);
        assert_eq!(alert.session_ids(), vec!["g1", "g2"]);
        assert_eq!(tracker.stats().total_alerts, 1);
    }

    #[test]
    fn test_high_peak_requires_strictly_greater() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());
        tracker.track(summary("g1", 50.0, 100));
        let alerts = tracker.track(summary("g2", 1.0, 2));
        assert_eq!(count(&alerts, AlertType::HighPeakThenEarlyTermination), 0);
    }

    #[test]
    fn test_early_termination_cluster() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());
        tracker.track(summary("a", 2.0, 50));
        tracker.track(summary("b", 1.1, 3));
        tracker.track(summary("c", 2.0, 60));
        tracker.track(summary("d", 1.0, 1));
        let alerts = tracker.track(summary("e", 1.0, 8));

        assert_eq!(count(&alerts, AlertType::EarlyTerminationCluster), 1);
        let cluster = alerts
            .iter()
            .find(|a| a.alert_type == AlertType::EarlyTerminationCluster)
            .unwrap();
        assert_eq!(cluster.severity, AlertSeverity::Medium);
        match &cluster.evidence {
            AlertEvidence::Cluster { members, window } => {
                assert_eq!(members, &vec!["b".to_string(), "d".to_string(), "e".to_string()]);
                assert_eq!(*window, 5);
            }
            other => panic!("unexpected evidence {other:?}"),
        }
    }

    #[test]
    fn test_cluster_needs_full_window() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());
        tracker.track(summary("a", 1.0, 1));
        tracker.track(summary("b", 1.0, 2));
        let alerts = tracker.track(summary("c", 1.0, 3));
        assert_eq!(count(&alerts, AlertType::EarlyTerminationCluster), 0);
    }

    #[test]
    fn test_abnormal_peak_average() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());
        for (i, peak) in [20.0, 40.0, 35.0, 30.0].iter().enumerate() {
            tracker.track(summary(&format!("s{i}"), *peak, 100));
        }
        let alerts = tracker.track(summary("s4", 40.0, 100));

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::AbnormalPeakAverage);
        assert_eq!(alerts[0].severity, AlertSeverity::Low);
        match &alerts[0].evidence {
            AlertEvidence::PeakAverage { average, peaks, .. } => {
                assert!((average - 33.0).abs() < 1e-9);
                assert_eq!(peaks.len(), 5);
            }
            other => panic!("unexpected evidence {other:?}"),
        }
    }

    #[test]
    fn test_all_rules_can_fire_together() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());
        tracker.track(summary("a", 1.0, 2));
        tracker.track(summary("b", 1.0, 3));
        tracker.track(summary("c", 70.0, 90));
        tracker.track(summary("d", 80.0, 90));
        let alerts = tracker.track(summary("e", 1.5, 4));

        assert_eq!(alerts.len(), 3);
        assert_eq!(count(&alerts, AlertType::HighPeakThenEarlyTermination), 1);
        assert_eq!(count(&alerts, AlertType::EarlyTerminationCluster), 1);
        assert_eq!(count(&alerts, AlertType::AbnormalPeakAverage), 1);
    }

    #[test]
    fn test_ring_buffer_keeps_last_100() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());
        for i in 0..150 {
            tracker.track(summary(&format!("s{i}"), 2.0, 20));
        }

        assert_eq!(tracker.len(), 100);
        let ids: Vec<&str> = tracker.summaries().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids.first(), Some(&"s50"));
        assert_eq!(ids.last(), Some(&"s149"));
        assert_eq!(tracker.stats().total_sessions, 150);
    }

    #[test]
    fn test_alert_log_capacity() {
        let config = TrackerConfig {
            alert_capacity: 3,
            ..Default::default()
        };
        let mut tracker = SequenceTracker::new(config);
        for i in 0..10 {
            tracker.track(summary(&format!("hi{i}"), 80.0, 50));
            tracker.track(summary(&format!("lo{i}"), 1.0, 1));
        }

        assert_eq!(tracker.alerts().count(), 3);
        assert!(tracker.stats().total_alerts > 3);
    }

    #[test]
    fn test_recent_alerts_window() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        tracker.track_at(summary("g1", 70.0, 40), t0);
        tracker.track_at(summary("g2", 1.0, 2), t0 + chrono::Duration::seconds(5));

        assert_eq!(tracker.recent_alerts(t0 + chrono::Duration::minutes(2)).len(), 1);
        assert!(tracker.recent_alerts(t0 + chrono::Duration::minutes(10)).is_empty());
        assert_eq!(tracker.alerts().count(), 1, "old alerts are not purged");
    }

    #[test]
    fn test_sequence_metadata_and_hour_rollover() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 59, 0).unwrap();

        let first = tracker.track_at(summary("a", 2.0, 20), t0);
        assert_eq!(first.sequence.session_number, 1);
        assert_eq!(first.sequence.hourly_session_number, 1);
        assert_eq!(first.sequence.time_since_prior_close_seconds, None);

        let second = tracker.track_at(summary("b", 2.0, 20), t0 + chrono::Duration::seconds(90));
        assert_eq!(second.sequence.session_number, 2);
        assert_eq!(second.sequence.hourly_session_number, 1, "rolled into 13h");
        assert_eq!(second.sequence.time_since_prior_close_seconds, Some(90.0));

        let third = tracker.track_at(summary("c", 2.0, 20), t0 + chrono::Duration::seconds(120));
        assert_eq!(third.sequence.hourly_session_number, 2);
        assert_eq!(tracker.stats().sessions_this_hour, 2);
    }

    #[test]
    fn test_rolling_stats_window() {
        let mut tracker = SequenceTracker::new(TrackerConfig::default());
        for i in 0..10 {
            tracker.track(summary(&format!("old{i}"), 100.0, 1));
        }
        for i in 0..10 {
            let tick = if i % 2 == 0 { 5 } else { 50 };
            tracker.track(summary(&format!("new{i}"), 2.0, tick));
        }

        let stats = tracker.stats();
        assert_eq!(stats.total_sessions, 20);
        assert!((stats.early_termination_rate - 0.5).abs() < 1e-9);
        assert!((stats.average_peak - 2.0).abs() < 1e-9);
    }
}
