//! Session segmentation state machine.
//!
//! The recorder owns at most one active session and decides session
//! boundaries from event content alone:
//!
//! ```text
//!            marker #1 (baseline)        marker
//!   Idle{no baseline} ─────────> Idle{baseline} ─────────> Recording(session)
//!         ^                                                   │   │
//!         │            force_close(reason)                    │   │ marker: close, reopen
//!         └───────────────────────────────────────────────────┘   └──> Recording(next)
//! ```
//!
//! A terminal marker ends one round and starts the next, so the same event is
//! appended to the closing session and seeds the new one.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use rugs_common::{CloseReason, Event};
use tracing::{debug, info, warn};

use crate::stats::CollectorStats;

/// A session's ordered event buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Provisional id assigned at open.
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub events: Vec<Event>,
}

impl Session {
    fn open(id: String, seed: Event) -> Self {
        Self {
            id,
            started_at: seed.timestamp,
            events: vec![seed],
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first_event(&self) -> Option<&Event> {
        self.events.first()
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Game id reported by the session's own events.
    ///
    /// The seed marker belongs to the previous round and is skipped.
    pub fn game_id(&self) -> Option<&str> {
        self.events.iter().skip(1).find_map(Event::game_id)
    }

    /// Resolved id: the reported game id, else the provisional id.
    pub fn resolved_id(&self) -> String {
        self.game_id()
            .map(str::to_string)
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn invalid_events(&self) -> u64 {
        self.events.iter().filter(|e| !e.valid).count() as u64
    }
}

/// A session handed off for analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedSession {
    pub session: Session,
    pub reason: CloseReason,
    pub closed_at: DateTime<Utc>,
}

/// Externally visible recorder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle { baseline_established: bool },
    Recording,
}

enum RecorderState {
    Idle { baseline_established: bool },
    Recording(Session),
}

/// Turns the ordered event feed into closed sessions.
pub struct SessionRecorder {
    state: RecorderState,
    stats: Arc<CollectorStats>,
    /// Payload of the last terminal marker while no other event has followed
    /// it. A repeat of it is a transport duplicate.
    last_marker: Option<serde_json::Value>,
    opened: u64,
}

impl SessionRecorder {
    pub fn new(stats: Arc<CollectorStats>) -> Self {
        Self {
            state: RecorderState::Idle {
                baseline_established: false,
            },
            stats,
            last_marker: None,
            opened: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match &self.state {
            RecorderState::Idle {
                baseline_established,
            } => SessionStatus::Idle {
                baseline_established: *baseline_established,
            },
            RecorderState::Recording(_) => SessionStatus::Recording,
        }
    }

    pub fn active_session(&self) -> Option<&Session> {
        match &self.state {
            RecorderState::Recording(session) => Some(session),
            RecorderState::Idle { .. } => None,
        }
    }

    /// Feed one event. Returns the session it closed, if any.
    pub fn observe(&mut self, event: Event) -> Option<ClosedSession> {
        if !event.valid {
            self.stats.validation_errors.fetch_add(1, Ordering::Relaxed);
        }

        if !event.is_terminal_marker() {
            self.last_marker = None;
            if let RecorderState::Recording(session) = &mut self.state {
                session.events.push(event);
            }
            return None;
        }

        if self.last_marker.as_ref() == Some(&event.payload) {
            self.stats.duplicate_markers.fetch_add(1, Ordering::Relaxed);
            debug!("Ignoring duplicate terminal marker");
            return None;
        }
        self.last_marker = Some(event.payload.clone());

        let closed_at = event.timestamp;
        let state = std::mem::replace(
            &mut self.state,
            RecorderState::Idle {
                baseline_established: true,
            },
        );

        match state {
            RecorderState::Idle {
                baseline_established: false,
            } => {
                self.stats.baseline_markers.fetch_add(1, Ordering::Relaxed);
                info!("Baseline terminal marker observed, recording starts at the next one");
                None
            }
            RecorderState::Idle {
                baseline_established: true,
            } => {
                let session = self.open_session(event);
                info!("Recording started: {}", session.id);
                self.state = RecorderState::Recording(session);
                None
            }
            RecorderState::Recording(mut session) => {
                session.events.push(event.clone());
                let next = self.open_session(event);
                debug!("Session {} closed, {} opened", session.id, next.id);
                self.state = RecorderState::Recording(next);
                self.finish(session, CloseReason::Normal, closed_at)
            }
        }
    }

    /// Close the active session with `reason` and return to idle.
    ///
    /// A no-op while idle. The baseline must be re-established before the
    /// next session opens.
    pub fn force_close(&mut self, reason: CloseReason, at: DateTime<Utc>) -> Option<ClosedSession> {
        if !matches!(self.state, RecorderState::Recording(_)) {
            return None;
        }

        let state = std::mem::replace(
            &mut self.state,
            RecorderState::Idle {
                baseline_established: false,
            },
        );
        self.last_marker = None;

        match state {
            RecorderState::Recording(session) => {
                info!("Force-closing session {} ({})", session.id, reason);
                self.finish(session, reason, at)
            }
            RecorderState::Idle { .. } => None,
        }
    }

    fn open_session(&mut self, seed: Event) -> Session {
        self.opened += 1;
        let id = format!("{}-{:04}", seed.timestamp.format("%Y%m%d-%H%M%S%.3f"), self.opened);
        Session::open(id, seed)
    }

    fn finish(
        &self,
        session: Session,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Option<ClosedSession> {
        if session.is_empty() {
            self.stats.sessions_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Rejecting session {} with no events", session.id);
            return None;
        }

        self.stats.sessions_recorded.fetch_add(1, Ordering::Relaxed);
        Some(ClosedSession {
            session,
            reason,
            closed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{Value, json};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::milliseconds(ms)
    }

    fn tick(ms: i64, game: &str, tick: u64) -> Event {
        Event::new(
            at(ms),
            "gameStateUpdate",
            json!({"gameId": game, "tick": tick, "price": 1.0 + tick as f64 / 10.0}),
        )
    }

    fn marker(ms: i64, finished: &str) -> Event {
        Event::new(
            at(ms),
            "gameStateUpdate",
            json!({"gameHistory": [{"id": finished, "peakMultiplier": 2.0}]}),
        )
    }

    fn recorder() -> (SessionRecorder, Arc<CollectorStats>) {
        let stats = Arc::new(CollectorStats::new());
        (SessionRecorder::new(stats.clone()), stats)
    }

    #[test]
    fn test_first_marker_only_sets_baseline() {
        let (mut recorder, stats) = recorder();
        assert!(recorder.observe(tick(0, "g0", 5)).is_none());
        assert!(recorder.observe(marker(100, "g0")).is_none());

        assert_eq!(
            recorder.status(),
            SessionStatus::Idle {
                baseline_established: true
            }
        );
        assert_eq!(stats.baseline_markers.load(Ordering::Relaxed), 1);
        assert!(recorder.active_session().is_none());
    }

    #[test]
    fn test_second_marker_starts_recording() {
        let (mut recorder, _) = recorder();
        recorder.observe(marker(0, "g0"));
        assert!(recorder.observe(marker(100, "g1")).is_none());

        assert_eq!(recorder.status(), SessionStatus::Recording);
        let session = recorder.active_session().unwrap();
        assert_eq!(session.len(), 1, "seeded with the marker itself");
        assert_eq!(session.started_at, at(100));
    }

    #[test]
    fn test_marker_closes_and_reopens() {
        let (mut recorder, stats) = recorder();
        recorder.observe(marker(0, "g0"));
        recorder.observe(marker(100, "g1"));
        recorder.observe(tick(200, "g2", 1));
        recorder.observe(tick(450, "g2", 2));

        let closed = recorder.observe(marker(700, "g2")).unwrap();
        assert_eq!(closed.reason, CloseReason::Normal);
        assert_eq!(closed.closed_at, at(700));
        assert_eq!(closed.session.len(), 4, "closing marker is appended");
        assert!(closed.session.last_event().unwrap().is_terminal_marker());
        assert_eq!(closed.session.resolved_id(), "g2");

        let next = recorder.active_session().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next.first_event(), closed.session.last_event());
        assert_eq!(stats.sessions_recorded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_events_ignored_while_idle() {
        let (mut recorder, _) = recorder();
        recorder.observe(tick(0, "g0", 1));
        recorder.observe(marker(50, "g0"));
        recorder.observe(tick(100, "g1", 1));
        recorder.observe(marker(150, "g1"));

        assert_eq!(recorder.active_session().unwrap().len(), 1);
    }

    #[test]
    fn test_force_close_while_recording() {
        let (mut recorder, _) = recorder();
        recorder.observe(marker(0, "g0"));
        recorder.observe(marker(100, "g1"));
        recorder.observe(tick(200, "g2", 1));

        let closed = recorder
            .force_close(CloseReason::Disconnected, at(300))
            .unwrap();
        assert_eq!(closed.reason, CloseReason::Disconnected);
        assert_eq!(closed.session.len(), 2);
        assert_eq!(
            recorder.status(),
            SessionStatus::Idle {
                baseline_established: false
            }
        );

        // Baseline must be re-established after a reconnect.
        assert!(recorder.observe(marker(400, "g2")).is_none());
        assert!(recorder.active_session().is_none());
        recorder.observe(marker(500, "g3"));
        assert_eq!(recorder.status(), SessionStatus::Recording);
    }

    #[test]
    fn test_force_close_while_idle_is_noop() {
        let (mut recorder, stats) = recorder();
        assert!(recorder.force_close(CloseReason::Shutdown, at(0)).is_none());

        recorder.observe(marker(0, "g0"));
        assert!(recorder.force_close(CloseReason::Disconnected, at(10)).is_none());
        assert_eq!(
            recorder.status(),
            SessionStatus::Idle {
                baseline_established: true
            },
            "idle state is left untouched"
        );
        assert_eq!(stats.sessions_recorded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_duplicate_marker_ignored() {
        let (mut recorder, stats) = recorder();
        recorder.observe(marker(0, "g0"));
        recorder.observe(marker(100, "g1"));

        let mut dup = marker(100, "g1");
        dup.timestamp = at(120);
        assert!(recorder.observe(dup).is_none());
        assert_eq!(stats.duplicate_markers.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.active_session().unwrap().len(), 1);
    }

    #[test]
    fn test_repeated_marker_after_ticks_closes_session() {
        let (mut recorder, stats) = recorder();
        let mut closed = 0;
        for round in 0..5i64 {
            let base = round * 1000;
            if recorder.observe(marker(base, "same")).is_some() {
                closed += 1;
            }
            recorder.observe(tick(base + 250, "g", 1));
            recorder.observe(tick(base + 500, "g", 2));
        }

        assert_eq!(closed, 3);
        assert_eq!(stats.duplicate_markers.load(Ordering::Relaxed), 0);
        assert_eq!(recorder.status(), SessionStatus::Recording);
    }

    #[test]
    fn test_invalid_events_recorded_and_counted() {
        let (mut recorder, stats) = recorder();
        recorder.observe(marker(0, "g0"));
        recorder.observe(marker(100, "g1"));

        let mut bad = Event::new(at(150), "gameStateUpdate", json!({"price": "NaN"}));
        bad.valid = false;
        recorder.observe(bad);

        let session = recorder.active_session().unwrap();
        assert_eq!(session.len(), 2);
        assert_eq!(session.invalid_events(), 1);
        assert_eq!(session.events[1].payload["price"], Value::from("NaN"));
        assert_eq!(stats.validation_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_provisional_id_without_game_id() {
        let (mut recorder, _) = recorder();
        recorder.observe(marker(0, "g0"));
        recorder.observe(marker(100, "g1"));
        let closed = recorder.observe(marker(200, "g2")).unwrap();

        assert_eq!(closed.session.resolved_id(), closed.session.id);
        assert!(closed.session.id.starts_with("20250601-120000.100-"));
    }
}
