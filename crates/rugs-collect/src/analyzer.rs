//! Per-session analytics.
//!
//! [`SessionAnalyzer::analyze`] turns a closed session's event buffer into a
//! [`SessionSummary`] in one pass. It never fails: malformed numeric fields
//! are treated as absent.
//!
//! The first event of a session is the seeding terminal marker, which
//! describes the previous round. It counts toward event totals and timing but
//! not toward price, tick or peak. If the last event is a terminal marker its
//! outcome fields override the streamed values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rugs_common::{
    Event, EventKind, EventTypeCounts, ParticipantStats, PriceRange, SessionSummary, TimingStats,
    TradeStats, counter_field, is_early_termination, number_field,
};

use crate::normalizer::{TradeSide, TradeView};
use crate::recorder::Session;

/// Analyzer thresholds.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// State-update intervals longer than this count as suspicious gaps.
    pub suspicious_gap_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            suspicious_gap_ms: 2000,
        }
    }
}

/// Outcome fields carried by a closing terminal marker.
#[derive(Debug, Clone, Copy, Default)]
struct TerminalOverride {
    peak: Option<f64>,
    tick: Option<u64>,
}

impl TerminalOverride {
    fn from_marker(marker: &Event) -> Self {
        let latest = marker.latest_history_entry();
        let peak = marker
            .number("peakMultiplier")
            .or_else(|| latest.and_then(|h| number_field(h, "peakMultiplier")));
        let tick = latest
            .and_then(|h| counter_field(h, "tickCount"))
            .or_else(|| marker.counter("finalTick"));
        Self { peak, tick }
    }
}

/// Welford accumulator for inter-arrival intervals.
#[derive(Debug, Default)]
struct IntervalAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
    max: f64,
    gaps: u64,
}

impl IntervalAccumulator {
    fn push(&mut self, interval_ms: f64, gap_threshold_ms: f64) {
        self.count += 1;
        let delta = interval_ms - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (interval_ms - self.mean);
        self.max = self.max.max(interval_ms);
        if interval_ms > gap_threshold_ms {
            self.gaps += 1;
        }
    }

    fn finish(self) -> TimingStats {
        let stddev = if self.count > 0 {
            (self.m2 / self.count as f64).sqrt()
        } else {
            0.0
        };
        TimingStats {
            avg_interval: self.mean,
            stddev_interval: stddev,
            max_interval: self.max,
            interval_count: self.count,
            suspicious_gap_count: self.gaps,
        }
    }
}

/// Stateless summary builder.
pub struct SessionAnalyzer {
    config: AnalyzerConfig,
}

impl SessionAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, session: &Session) -> SessionSummary {
        let gap_threshold = self.config.suspicious_gap_ms as f64;

        let mut counts = EventTypeCounts::default();
        let mut intervals = IntervalAccumulator::default();
        let mut last_update: Option<DateTime<Utc>> = None;
        let mut peak: Option<f64> = None;
        let mut tick: Option<u64> = None;
        let mut price_range: Option<PriceRange> = None;
        let mut trades = TradeStats::default();
        let mut participants: BTreeMap<String, ParticipantStats> = BTreeMap::new();
        let mut validation_errors = 0;

        let last_index = session.events.len().saturating_sub(1);
        let override_ = session
            .last_event()
            .filter(|e| last_index > 0 && e.is_terminal_marker())
            .map(TerminalOverride::from_marker)
            .unwrap_or_default();

        for (index, event) in session.events.iter().enumerate() {
            counts.record(event.kind);
            if !event.valid {
                validation_errors += 1;
            }

            match event.kind {
                EventKind::StateUpdate => {
                    if let Some(prev) = last_update {
                        intervals.push(interval_ms(prev, event.timestamp), gap_threshold);
                    }
                    last_update = Some(event.timestamp);

                    if index == 0 || event.is_terminal_marker() {
                        continue;
                    }
                    if let Some(price) = event.number("price") {
                        peak = Some(peak.map_or(price, |p| p.max(price)));
                        match price_range.as_mut() {
                            Some(range) => range.include(price),
                            None => price_range = Some(PriceRange::new(price)),
                        }
                    }
                    if let Some(t) = event.counter("tick") {
                        tick = Some(tick.map_or(t, |current| current.max(t)));
                    }
                }
                EventKind::Trade => {
                    let Some(trade) = TradeView::from_event(event) else {
                        continue;
                    };
                    match trade.side {
                        TradeSide::Buy => trades.buy_count += 1,
                        TradeSide::Sell => trades.sell_count += 1,
                    }
                    trades.total_volume += trade.quantity;

                    let entry = participants.entry(trade.participant.to_string()).or_default();
                    entry.trades += 1;
                    entry.volume += trade.quantity;

                    if let Some(bucket) = trade.tick.or(tick) {
                        *trades.volume_by_tick.entry(bucket).or_insert(0.0) += trade.quantity;
                    }
                }
                EventKind::Other => {}
            }
        }

        trades.unique_participants = participants.len() as u64;
        trades.participants = participants;

        // A session with no observed tick is not an early termination.
        let observed_tick = override_.tick.or(tick);
        let peak_value = override_.peak.or(peak).unwrap_or(0.0);

        SessionSummary {
            session_id: session.resolved_id(),
            peak_value,
            termination_tick: observed_tick.unwrap_or(0),
            is_early_termination: observed_tick.is_some_and(is_early_termination),
            duration: duration_seconds(&session.events),
            event_type_counts: counts,
            trade_stats: trades,
            timing_stats: intervals.finish(),
            price_range,
            validation_errors,
        }
    }
}

/// Milliseconds between arrivals, clamped at zero for reordered events.
fn interval_ms(prev: DateTime<Utc>, next: DateTime<Utc>) -> f64 {
    let delta = next.signed_duration_since(prev);
    let micros = delta
        .num_microseconds()
        .unwrap_or_else(|| delta.num_milliseconds().saturating_mul(1000));
    (micros as f64 / 1000.0).max(0.0)
}

fn duration_seconds(events: &[Event]) -> f64 {
    match (events.first(), events.last()) {
        (Some(first), Some(last)) => {
            let millis = last.timestamp.signed_duration_since(first.timestamp).num_milliseconds();
            (millis as f64 / 1000.0).max(0.0)
        }
        _ => 0.0,
    }
}
