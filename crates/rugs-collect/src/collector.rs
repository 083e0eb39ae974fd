//! Single-consumer session pipeline.
//!
//! All recorder transitions happen here, driven by one ordered signal stream:
//!
//! ```text
//! [ConnectionSupervisor] --signals--> [Collector]
//!                                        |  SessionRecorder::observe / force_close
//!                                        |  SessionAnalyzer::analyze
//!                                        |  SequenceTracker::track_at
//!                                        v
//!                              unbounded queue --> [writer task] --> disk
//! ```
//!
//! Tracking runs inline with the close so the tracker always reflects closed
//! sessions in order. Only file I/O is moved off the critical path.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rugs_common::{
    CloseReason, CollectionMetadata, RecordTiming, SessionRecord, SessionSummary,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::analyzer::SessionAnalyzer;
use crate::config::{CollectConfig, Profile, RecordOptions};
use crate::recorder::{ClosedSession, SessionRecorder, SessionStatus};
use crate::stats::{CollectorStats, StatsHandle};
use crate::supervisor::SupervisorSignal;
use crate::tracker::{SharedTracker, TrackOutcome, create_shared_tracker, write_tracker};
use crate::writer::{PersistenceWriter, spawn_writer_task};

/// Errors that stop the pipeline.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Fatal collector error: {0}")]
    Fatal(String),

    #[error("Persistence queue closed")]
    ChannelClosed,
}

/// Totals returned when the pipeline stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorReport {
    /// Sessions closed and queued for persistence.
    pub sessions: u64,
    /// Records the writer task processed before exiting.
    pub records_written: u64,
}

/// Owns the recorder and feeds closed sessions through analysis, tracking and
/// persistence.
pub struct Collector {
    recorder: SessionRecorder,
    analyzer: SessionAnalyzer,
    tracker: SharedTracker,
    profile: Profile,
    options: RecordOptions,
    stats: Arc<CollectorStats>,
    alive_timeout: Duration,
    records: Option<mpsc::UnboundedSender<SessionRecord>>,
    writer_task: Option<JoinHandle<u64>>,
    /// Session handed off by the recorder but not yet queued.
    pending: Option<ClosedSession>,
    sessions: u64,
}

impl Collector {
    /// Build the pipeline and spawn its writer task.
    pub fn new(config: &CollectConfig, stats: Arc<CollectorStats>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = PersistenceWriter::new(config.output.root.clone(), stats.clone());
        let writer_task = spawn_writer_task(writer, rx);

        Self {
            recorder: SessionRecorder::new(stats.clone()),
            analyzer: SessionAnalyzer::new(config.analyzer.clone()),
            tracker: create_shared_tracker(config.tracker.clone()),
            profile: config.profile,
            options: config.record_options(),
            stats,
            alive_timeout: config.alive_timeout,
            records: Some(tx),
            writer_task: Some(writer_task),
            pending: None,
            sessions: 0,
        }
    }

    /// Read-only accessor for dashboards and the health task.
    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle::new(self.stats.clone(), self.tracker.clone(), self.alive_timeout)
    }

    pub fn recorder_status(&self) -> SessionStatus {
        self.recorder.status()
    }

    /// Apply one supervisor signal.
    pub fn handle_signal(&mut self, signal: SupervisorSignal) -> Result<(), CollectorError> {
        match signal {
            SupervisorSignal::Event(event) => {
                if let Some(closed) = self.recorder.observe(event) {
                    self.pending = Some(closed);
                    self.close_pending()?;
                }
            }
            SupervisorSignal::ForceClose(reason) => {
                if let Some(closed) = self.recorder.force_close(reason, Utc::now()) {
                    self.pending = Some(closed);
                    self.close_pending()?;
                }
            }
            SupervisorSignal::Connected => info!("Feed connected"),
            SupervisorSignal::Disconnected(reason) => warn!("Feed disconnected: {}", reason),
            SupervisorSignal::Reconnecting(attempt) => info!("Reconnect attempt {}", attempt),
        }
        Ok(())
    }

    /// Consume signals until the stream ends or shutdown is requested.
    ///
    /// The active session is closed with SHUTDOWN and the persistence queue is
    /// drained before returning. A panic while handling a signal closes the
    /// active session with ERROR and returns [`CollectorError::Fatal`].
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<SupervisorSignal>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<CollectorReport, CollectorError> {
        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        info!("Signal stream ended");
                        break;
                    };
                    if let Err(e) = self.guarded(|c| c.handle_signal(signal)) {
                        error!("Collector failed: {e}");
                        self.finish(CloseReason::Error).await;
                        return Err(e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Collector: shutdown signal received");
                    while let Ok(signal) = signals.try_recv() {
                        if let Err(e) = self.guarded(|c| c.handle_signal(signal)) {
                            error!("Collector failed while draining: {e}");
                            self.finish(CloseReason::Error).await;
                            return Err(e);
                        }
                    }
                    break;
                }
            }
        }

        Ok(self.finish(CloseReason::Shutdown).await)
    }

    fn guarded<F>(&mut self, f: F) -> Result<(), CollectorError>
    where
        F: FnOnce(&mut Self) -> Result<(), CollectorError>,
    {
        match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(panic) => Err(CollectorError::Fatal(panic_message(panic.as_ref()))),
        }
    }

    /// Close the active session, flush the queue and wait for the writer.
    ///
    /// A session whose close was interrupted is closed first, with `reason`.
    async fn finish(&mut self, reason: CloseReason) -> CollectorReport {
        if let Some(interrupted) = self.pending.as_mut() {
            interrupted.reason = reason;
            if let Err(e) = self.guarded(Self::close_pending) {
                warn!("Interrupted session could not be queued: {e}");
                self.pending = None;
            }
        }

        if let Some(closed) = self.recorder.force_close(reason, Utc::now()) {
            self.pending = Some(closed);
            if let Err(e) = self.guarded(Self::close_pending) {
                warn!("Final session could not be queued: {e}");
                self.pending = None;
            }
        }

        // Dropping the sender lets the writer drain and exit.
        self.records.take();
        let records_written = match self.writer_task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                error!("Persistence writer task failed: {e}");
                0
            }),
            None => 0,
        };

        self.stats.log_stats();
        CollectorReport {
            sessions: self.sessions,
            records_written,
        }
    }

    /// Analyze, track and queue the pending session.
    ///
    /// The session stays pending until analysis and tracking complete.
    fn close_pending(&mut self) -> Result<(), CollectorError> {
        let Some(closing) = self.pending.as_ref() else {
            return Ok(());
        };
        let summary = self.analyzer.analyze(&closing.session);
        let outcome = write_tracker(&self.tracker).track_at(summary.clone(), closing.closed_at);
        let Some(closed) = self.pending.take() else {
            return Ok(());
        };

        info!(
            "Session {} closed ({}): peak={:.2}x tick={} early={} events={} alerts={}",
            summary.session_id,
            closed.reason,
            summary.peak_value,
            summary.termination_tick,
            summary.is_early_termination,
            closed.session.len(),
            outcome.alerts.len()
        );

        let record = self.build_record(closed, summary, outcome);
        self.sessions += 1;

        self.records
            .as_ref()
            .ok_or(CollectorError::ChannelClosed)?
            .send(record)
            .map_err(|_| CollectorError::ChannelClosed)
    }

    fn build_record(
        &self,
        closed: ClosedSession,
        mut summary: SessionSummary,
        outcome: TrackOutcome,
    ) -> SessionRecord {
        let ClosedSession {
            session,
            reason,
            closed_at,
        } = closed;

        if !self.options.include_trade_detail {
            summary.trade_stats = summary.trade_stats.without_detail();
        }

        let timing = if self.options.include_timing {
            let last_event = session.last_event().map_or(closed_at, |e| e.timestamp);
            Some(RecordTiming::from_nanos(
                epoch_nanos(session.started_at),
                epoch_nanos(closed_at),
                epoch_nanos(last_event),
            ))
        } else {
            None
        };

        let duration_ms = closed_at
            .signed_duration_since(session.started_at)
            .num_milliseconds()
            .max(0);

        SessionRecord {
            session_id: summary.session_id.clone(),
            recording_start: session.started_at,
            recording_end: closed_at,
            duration_seconds: duration_ms as f64 / 1000.0,
            close_reason: reason,
            total_events: session.len() as u64,
            summary,
            sequence_metadata: outcome.sequence,
            collection_metadata: CollectionMetadata {
                collector_version: env!("CARGO_PKG_VERSION").to_string(),
                profile: self.profile.as_str().to_string(),
            },
            timing,
            alerts: outcome.alerts,
            events: self.options.include_events.then_some(session.events),
        }
    }
}

fn epoch_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_micros().saturating_mul(1000))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
