//! Shared types for the rugs session collector.
//!
//! Multipliers and volumes arrive as JSON floats and stay `f64` through the
//! analytics. Values that need more than 53 bits (epoch nanoseconds) are
//! carried as `rust_decimal::Decimal` and serialized as strings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A session whose final tick is below this value terminated early.
pub const EARLY_TERMINATION_TICK: u64 = 10;

/// Returns true if a session ending at `tick` counts as an early termination.
pub fn is_early_termination(tick: u64) -> bool {
    tick < EARLY_TERMINATION_TICK
}

/// Canonical event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Periodic game state (price, tick, terminal marker fields).
    StateUpdate,
    /// A participant buy or sell.
    Trade,
    /// Anything else the transport delivers.
    Other,
}

impl EventKind {
    /// Maps a transport event name to its canonical kind.
    pub fn from_event_name(name: &str) -> Self {
        match name {
            "gameStateUpdate" | "state_update" | "stateUpdate" => EventKind::StateUpdate,
            "standard/newTrade" | "newTrade" | "trade" => EventKind::Trade,
            _ => EventKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateUpdate => "state_update",
            EventKind::Trade => "trade",
            EventKind::Other => "other",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A normalized transport event.
///
/// Events are ordered by arrival. The payload is preserved verbatim even
/// when it fails shape validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Arrival time.
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Transport event name before normalization.
    pub name: String,
    pub payload: Value,
    /// False if the payload failed shape validation.
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, name: impl Into<String>, payload: Value) -> Self {
        let name = name.into();
        Self {
            timestamp,
            kind: EventKind::from_event_name(&name),
            name,
            payload,
            valid: true,
        }
    }

    /// Returns true if this event signals the end of a round.
    ///
    /// A terminal marker is a state update whose `gameHistory` holds at least
    /// one completed round.
    pub fn is_terminal_marker(&self) -> bool {
        self.kind == EventKind::StateUpdate
            && self
                .payload
                .get("gameHistory")
                .and_then(Value::as_array)
                .is_some_and(|history| !history.is_empty())
    }

    /// Reads a finite numeric payload field. Non-numeric values are absent.
    pub fn number(&self, field: &str) -> Option<f64> {
        number_field(&self.payload, field)
    }

    /// Reads a non-negative integral payload field.
    pub fn counter(&self, field: &str) -> Option<u64> {
        counter_field(&self.payload, field)
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Game identifier carried by the payload, if any.
    pub fn game_id(&self) -> Option<&str> {
        self.string("gameId").filter(|id| !id.is_empty())
    }

    /// Most recent completed round in a terminal marker's history.
    pub fn latest_history_entry(&self) -> Option<&Value> {
        self.payload
            .get("gameHistory")
            .and_then(Value::as_array)
            .and_then(|history| history.first())
    }

    /// Arrival time in epoch nanoseconds.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1000))
    }
}

/// Reads a finite number from `value[field]`.
pub fn number_field(value: &Value, field: &str) -> Option<f64> {
    value
        .get(field)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
}

/// Reads a non-negative integer from `value[field]`, accepting integral floats.
pub fn counter_field(value: &Value, field: &str) -> Option<u64> {
    let raw = value.get(field)?;
    if let Some(v) = raw.as_u64() {
        return Some(v);
    }
    raw.as_f64()
        .filter(|v| v.is_finite() && *v >= 0.0 && v.fract() == 0.0)
        .map(|v| v as u64)
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// Closed by the next terminal marker.
    Normal,
    /// Transport dropped while recording.
    Disconnected,
    /// Process shutdown while recording.
    Shutdown,
    /// Uncaught defect while recording.
    Error,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "NORMAL",
            CloseReason::Disconnected => "DISCONNECTED",
            CloseReason::Shutdown => "SHUTDOWN",
            CloseReason::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-kind event counts within a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTypeCounts {
    pub state_update: u64,
    pub trade: u64,
    pub other: u64,
}

impl EventTypeCounts {
    pub fn record(&mut self, kind: EventKind) {
        match kind {
            EventKind::StateUpdate => self.state_update += 1,
            EventKind::Trade => self.trade += 1,
            EventKind::Other => self.other += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.state_update + self.trade + self.other
    }
}

/// Inter-arrival statistics over consecutive state updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingStats {
    /// Mean interval in milliseconds.
    pub avg_interval: f64,
    /// Population standard deviation in milliseconds.
    pub stddev_interval: f64,
    pub max_interval: f64,
    pub interval_count: u64,
    /// Intervals longer than the suspicious gap threshold.
    pub suspicious_gap_count: u64,
}

/// Per-participant trade totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantStats {
    pub trades: u64,
    pub volume: f64,
}

/// Trade activity within a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeStats {
    pub buy_count: u64,
    pub sell_count: u64,
    pub total_volume: f64,
    pub unique_participants: u64,
    #[serde(default)]
    pub participants: BTreeMap<String, ParticipantStats>,
    #[serde(default)]
    pub volume_by_tick: BTreeMap<u64, f64>,
}

impl TradeStats {
    pub fn total_trades(&self) -> u64 {
        self.buy_count + self.sell_count
    }

    /// Drops the per-participant and per-tick breakdowns.
    pub fn without_detail(mut self) -> Self {
        self.participants.clear();
        self.volume_by_tick.clear();
        self
    }
}

/// Observed price bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

impl PriceRange {
    pub fn new(value: f64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn include(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Derived analytics for one closed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub peak_value: f64,
    pub termination_tick: u64,
    pub is_early_termination: bool,
    /// Seconds between the first and last buffered event.
    pub duration: f64,
    pub event_type_counts: EventTypeCounts,
    pub trade_stats: TradeStats,
    pub timing_stats: TimingStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_range: Option<PriceRange>,
    #[serde(default)]
    pub validation_errors: u64,
}

/// Kinds of cross-session patterns the tracker reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    /// A high-peak session immediately followed by an early termination.
    HighPeakThenEarlyTermination,
    /// Several early terminations within a short window.
    EarlyTerminationCluster,
    /// Mean peak over a short window is unusually high.
    AbnormalPeakAverage,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighPeakThenEarlyTermination => "HighPeakThenEarlyTermination",
            AlertType::EarlyTerminationCluster => "EarlyTerminationCluster",
            AlertType::AbnormalPeakAverage => "AbnormalPeakAverage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HighPeakThenEarlyTermination" => Some(AlertType::HighPeakThenEarlyTermination),
            "EarlyTerminationCluster" => Some(AlertType::EarlyTerminationCluster),
            "AbnormalPeakAverage" => Some(AlertType::AbnormalPeakAverage),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Low => write!(f, "LOW"),
            AlertSeverity::Medium => write!(f, "MEDIUM"),
            AlertSeverity::High => write!(f, "HIGH"),
        }
    }
}

/// Supporting data for an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AlertEvidence {
    #[serde(rename_all = "camelCase")]
    PeakThenEarly {
        prior_session_id: String,
        prior_peak: f64,
        session_id: String,
        termination_tick: u64,
    },
    #[serde(rename_all = "camelCase")]
    Cluster {
        /// Ids of the early-terminating sessions in the window.
        members: Vec<String>,
        window: usize,
    },
    #[serde(rename_all = "camelCase")]
    PeakAverage {
        average: f64,
        peaks: Vec<f64>,
        session_ids: Vec<String>,
    },
}

/// A detected cross-session pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub description: String,
    pub evidence: AlertEvidence,
    pub produced_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        description: impl Into<String>,
        evidence: AlertEvidence,
    ) -> Self {
        Self {
            alert_type,
            severity,
            description: description.into(),
            evidence,
            produced_at: Utc::now(),
        }
    }

    /// Override the production time.
    pub fn at(mut self, produced_at: DateTime<Utc>) -> Self {
        self.produced_at = produced_at;
        self
    }

    /// Session ids cited by this alert.
    pub fn session_ids(&self) -> Vec<&str> {
        match &self.evidence {
            AlertEvidence::PeakThenEarly {
                prior_session_id,
                session_id,
                ..
            } => vec![prior_session_id.as_str(), session_id.as_str()],
            AlertEvidence::Cluster { members, .. } => members.iter().map(String::as_str).collect(),
            AlertEvidence::PeakAverage { session_ids, .. } => {
                session_ids.iter().map(String::as_str).collect()
            }
        }
    }
}
