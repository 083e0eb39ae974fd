//! Persisted session record schema.
//!
//! One record is written per closed session. String-typed fields:
//! every `*Nanos` value in `timing` is an epoch-nanosecond integer encoded as
//! a decimal string, because it exceeds the 53-bit integer range that JSON
//! consumers can represent exactly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Alert, CloseReason, Event, SessionSummary};

/// Position of a session in the collector's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceMetadata {
    /// 1-based count of sessions tracked since startup.
    pub session_number: u64,
    /// 1-based count of sessions tracked in the current wall-clock hour.
    pub hourly_session_number: u64,
    /// Seconds since the previous session closed, if there was one.
    pub time_since_prior_close_seconds: Option<f64>,
}

/// High-resolution timing, as decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordTiming {
    #[serde(with = "rust_decimal::serde::str")]
    pub recording_start_nanos: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub recording_end_nanos: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_event_nanos: Decimal,
}

impl RecordTiming {
    pub fn from_nanos(start: i64, end: i64, last_event: i64) -> Self {
        Self {
            recording_start_nanos: Decimal::from(start),
            recording_end_nanos: Decimal::from(end),
            last_event_nanos: Decimal::from(last_event),
        }
    }
}

/// Which collector build and profile produced a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMetadata {
    pub collector_version: String,
    pub profile: String,
}

/// The JSON object written for each closed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub recording_start: DateTime<Utc>,
    pub recording_end: DateTime<Utc>,
    pub duration_seconds: f64,
    pub close_reason: CloseReason,
    pub total_events: u64,
    pub summary: SessionSummary,
    pub sequence_metadata: SequenceMetadata,
    pub collection_metadata: CollectionMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<RecordTiming>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<Alert>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventTypeCounts, TimingStats, TradeStats};
    use rust_decimal_macros::dec;

    fn sample_record() -> SessionRecord {
        let start = DateTime::parse_from_rfc3339("2025-06-01T12:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339("2025-06-01T12:00:09.5Z")
            .unwrap()
            .with_timezone(&Utc);
        SessionRecord {
            session_id: "20250601-abc".to_string(),
            recording_start: start,
            recording_end: end,
            duration_seconds: 9.376543211,
            close_reason: CloseReason::Normal,
            total_events: 48,
            summary: SessionSummary {
                session_id: "20250601-abc".to_string(),
                peak_value: 3.84,
                termination_tick: 45,
                is_early_termination: false,
                duration: 9.3,
                event_type_counts: EventTypeCounts {
                    state_update: 47,
                    trade: 1,
                    other: 0,
                },
                trade_stats: TradeStats::default(),
                timing_stats: TimingStats::default(),
                price_range: None,
                validation_errors: 0,
            },
            sequence_metadata: SequenceMetadata {
                session_number: 3,
                hourly_session_number: 1,
                time_since_prior_close_seconds: Some(0.25),
            },
            collection_metadata: CollectionMetadata {
                collector_version: "0.1.0".to_string(),
                profile: "timing".to_string(),
            },
            timing: Some(RecordTiming::from_nanos(
                start.timestamp_nanos_opt().unwrap(),
                end.timestamp_nanos_opt().unwrap(),
                9_007_199_254_740_993,
            )),
            alerts: Vec::new(),
            events: None,
        }
    }

    #[test]
    fn test_nanos_serialized_as_strings() {
        let record = sample_record();
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        let timing = &json["timing"];
        assert_eq!(timing["recordingStartNanos"], "1748779200123456789");
        assert_eq!(timing["lastEventNanos"], "9007199254740993");
        assert!(timing["recordingEndNanos"].is_string());
    }

    #[test]
    fn test_record_round_trip() {
        let record = sample_record();
        let text = serde_json::to_string(&record).unwrap();
        let parsed: SessionRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(
            parsed.timing.as_ref().unwrap().last_event_nanos,
            dec!(9007199254740993)
        );
    }

    #[test]
    fn test_float_fields_round_trip_exactly() {
        let mut record = sample_record();
        record.duration_seconds = 4281.937402156183;
        record.summary.peak_value = 1.0000000000000002;
        record.summary.timing_stats.avg_interval = 250.33333333333334;
        record.summary.timing_stats.stddev_interval = 911.6760726776201;
        record.summary.trade_stats.total_volume = 0.1 + 0.2;

        let text = serde_json::to_string(&record).unwrap();
        let parsed: SessionRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(
            parsed.summary.timing_stats.stddev_interval.to_bits(),
            911.6760726776201f64.to_bits()
        );
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_optional_sections_omitted() {
        let mut record = sample_record();
        record.timing = None;
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert!(json.get("timing").is_none());
        assert!(json.get("events").is_none());
        assert!(json.get("alerts").is_none());
        assert_eq!(json["closeReason"], "NORMAL");
        assert_eq!(json["sequenceMetadata"]["hourlySessionNumber"], 1);
    }
}
