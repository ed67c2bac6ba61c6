//! Session tracking.
//!
//! A session is the protocol activity between two power cycles. A power cycle
//! shows up as the one-byte `00` marker from both devices within a short
//! window. Long silences also split sessions, since captures often miss the
//! marker of a restart.

use crate::anomaly::Anomaly;
use crate::capture::Device;
use crate::constants::{DEFAULT_IDLE_GAP_SECS, DEFAULT_PAIRING_WINDOW_SECS};
use crate::frame::Frame;
use crate::state::State;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Phases that should not appear before at least one of the listed phases in the same session
pub const PREREQUISITES: &[(State, &[State])] = &[
    (State::HandshakeInit, &[State::SessionStart]),
    (State::HandshakeAck, &[State::SessionStart]),
    (State::DeviceId, &[State::SessionStart]),
    (State::AuthChallenge, &[State::SessionStart]),
    (State::AuthResponse, &[State::SessionStart]),
    (State::ResetConfirm, &[State::ResetCommand]),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum spacing of the two power-cycle markers
    pub pairing_window_secs: u64,
    /// Silence that closes a session; `None` disables gap splitting
    pub idle_gap_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pairing_window_secs: DEFAULT_PAIRING_WINDOW_SECS,
            idle_gap_secs: Some(DEFAULT_IDLE_GAP_SECS),
        }
    }
}

/// Content of a session entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Headerless power-cycle marker
    Marker,
    /// A decoded frame; `verified` is false when checksum or CRC did not match
    Frame { frame: Frame, verified: bool },
}

impl Message {
    pub fn frame(&self) -> Option<&Frame> {
        match self {
            Message::Marker => None,
            Message::Frame { frame, .. } => Some(frame),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub line: usize,
    pub timestamp: u64,
    pub device: Device,
    pub message: Message,
    pub state: State,
}

/// Why a session started or ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    StartOfCapture,
    PowerCycle,
    IdleGap,
    EndOfCapture,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: usize,
    pub opened_by: Boundary,
    pub closed_by: Boundary,
    pub entries: Vec<SessionEntry>,
    pub anomalies: Vec<Anomaly>,
    seen: HashSet<State>,
    flagged: HashSet<State>,
}

impl Session {
    fn new(id: usize, opened_by: Boundary) -> Self {
        Self {
            id,
            opened_by,
            closed_by: Boundary::EndOfCapture,
            entries: Vec::new(),
            anomalies: Vec::new(),
            seen: HashSet::new(),
            flagged: HashSet::new(),
        }
    }

    fn push(&mut self, entry: SessionEntry) {
        if let Some((_, required)) = PREREQUISITES.iter().find(|(s, _)| *s == entry.state) {
            let satisfied = required.iter().any(|r| self.seen.contains(r));
            if !satisfied && self.flagged.insert(entry.state) {
                warn!(session = self.id, line = entry.line, "{} before {:?}", entry.state, required);
                self.anomalies.push(Anomaly::OutOfOrderPhase {
                    session: self.id,
                    timestamp: entry.timestamp,
                    line: entry.line,
                    state: entry.state,
                    expected_after: required.to_vec(),
                });
            }
        }
        self.seen.insert(entry.state);
        self.entries.push(entry);
    }

    pub fn states(&self) -> Vec<State> {
        self.entries.iter().map(|e| e.state).collect()
    }

    pub fn first_timestamp(&self) -> Option<u64> {
        self.entries.first().map(|e| e.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.entries.last().map(|e| e.timestamp)
    }

    /// `last_timestamp - first_timestamp`, zero for an empty session
    pub fn duration(&self) -> u64 {
        match (self.first_timestamp(), self.last_timestamp()) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        }
    }

    pub fn distinct_states(&self) -> usize {
        self.seen.len()
    }

    pub fn has_authentication(&self) -> bool {
        self.seen.iter().any(|s| s.is_authentication())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            opened_by: self.opened_by,
            closed_by: self.closed_by,
            start: self.first_timestamp(),
            end: self.last_timestamp(),
            duration_secs: self.duration(),
            frame_count: self.entries.len(),
            states: self.states(),
            distinct_states: self.distinct_states(),
            has_authentication: self.has_authentication(),
            anomalies: self.anomalies.clone(),
        }
    }
}

/// What collaborators see of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: usize,
    pub opened_by: Boundary,
    pub closed_by: Boundary,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub duration_secs: u64,
    pub frame_count: usize,
    pub states: Vec<State>,
    pub distinct_states: usize,
    pub has_authentication: bool,
    pub anomalies: Vec<Anomaly>,
}

/// Splits a time-ordered stream of classified entries into sessions.
///
/// A power-cycle marker is held until the other device's marker arrives or the
/// pairing window passes. Entries observed meanwhile are held with it, so a
/// confirmed power cycle opens its session at the first marker.
#[derive(Debug)]
pub struct SessionTracker {
    config: SessionConfig,
    closed: Vec<Session>,
    current: Option<Session>,
    /// A marker waiting for its partner from the other device
    pending_marker: Option<SessionEntry>,
    /// Entries that arrived after `pending_marker`
    held: Vec<SessionEntry>,
}

impl SessionTracker {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            closed: Vec::new(),
            current: None,
            pending_marker: None,
            held: Vec::new(),
        }
    }

    /// Add the next entry.
    ///
    /// Returns the session id of every entry this call released, in arrival
    /// order. The list is empty while entries are held behind an unpaired marker.
    pub fn observe(&mut self, entry: SessionEntry) -> Vec<usize> {
        let mut placed = Vec::new();
        let within_window = self
            .pending_marker
            .as_ref()
            .map(|first| entry.timestamp.saturating_sub(first.timestamp) <= self.config.pairing_window_secs);

        match within_window {
            Some(true) if entry.state != State::PowerReset => {
                self.held.push(entry);
                return placed;
            }
            Some(true) if self.pending_marker.as_ref().is_some_and(|m| m.device != entry.device) => {
                if let Some(first) = self.pending_marker.take() {
                    let id = self.open(Boundary::PowerCycle);
                    debug!(session = id, "Power cycle at {}..{}", first.timestamp, entry.timestamp);
                    placed.push(self.push_current(first));
                    for held in std::mem::take(&mut self.held) {
                        placed.push(self.push_current(held));
                    }
                    placed.push(self.push_current(entry));
                }
                return placed;
            }
            Some(_) => placed.extend(self.flush()),
            None => {}
        }

        if entry.state == State::PowerReset {
            self.pending_marker = Some(entry);
        } else {
            placed.push(self.place(entry));
        }
        placed
    }

    /// Release a marker still waiting for its partner, and everything held behind it,
    /// into the open session. Returns their session ids in arrival order.
    pub fn flush(&mut self) -> Vec<usize> {
        let Some(lone) = self.pending_marker.take() else {
            return Vec::new();
        };
        let mut placed = vec![self.place(lone)];
        for held in std::mem::take(&mut self.held) {
            placed.push(self.place(held));
        }
        placed
    }

    /// Id of the open session, if any
    pub fn current_id(&self) -> Option<usize> {
        self.current.as_ref().map(|s| s.id)
    }

    /// Sessions closed so far
    pub fn closed(&self) -> &[Session] {
        &self.closed
    }

    /// Flush the pending marker, close the open session, and return all sessions in order.
    pub fn finish(mut self) -> Vec<Session> {
        self.flush();
        self.close(Boundary::EndOfCapture);
        info!("Capture split into {} sessions", self.closed.len());
        self.closed
    }

    /// Put an entry in the open session, opening one if none is open or the link was idle too long.
    fn place(&mut self, entry: SessionEntry) -> usize {
        let idle = match (&self.current, self.config.idle_gap_secs) {
            (Some(session), Some(gap)) => session
                .last_timestamp()
                .is_some_and(|last| entry.timestamp.saturating_sub(last) > gap),
            _ => false,
        };
        if idle {
            self.open(Boundary::IdleGap);
        } else if self.current.is_none() {
            self.open(Boundary::StartOfCapture);
        }
        self.push_current(entry)
    }

    fn push_current(&mut self, entry: SessionEntry) -> usize {
        let session = self
            .current
            .get_or_insert_with(|| Session::new(self.closed.len() + 1, Boundary::StartOfCapture));
        session.push(entry);
        session.id
    }

    fn open(&mut self, reason: Boundary) -> usize {
        self.close(reason);
        let opened_by = if self.closed.is_empty() && reason != Boundary::PowerCycle {
            Boundary::StartOfCapture
        } else {
            reason
        };
        let id = self.closed.len() + 1;
        info!(session = id, "Session opened ({:?})", opened_by);
        self.current = Some(Session::new(id, opened_by));
        id
    }

    fn close(&mut self, reason: Boundary) {
        if let Some(mut session) = self.current.take() {
            session.closed_by = reason;
            info!(
                session = session.id,
                frames = session.entries.len(),
                "Session closed ({:?})",
                reason
            );
            self.closed.push(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(line: usize, timestamp: u64, device: Device) -> SessionEntry {
        SessionEntry {
            line,
            timestamp,
            device,
            message: Message::Marker,
            state: State::PowerReset,
        }
    }

    fn entry(line: usize, timestamp: u64, state: State) -> SessionEntry {
        SessionEntry {
            line,
            timestamp,
            device: Device::Machine,
            message: Message::Marker,
            state,
        }
    }

    #[test]
    fn test_marker_pair_opens_session() {
        let mut tracker = SessionTracker::new(SessionConfig::default());
        assert_eq!(tracker.observe(entry(1, 100, State::SessionStart)), vec![1]);
        assert!(tracker.observe(marker(2, 110, Device::Modem)).is_empty());
        assert_eq!(tracker.observe(marker(3, 112, Device::Machine)), vec![2, 2]);
        assert_eq!(tracker.observe(entry(4, 113, State::SessionStart)), vec![2]);

        let sessions = tracker.finish();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].closed_by, Boundary::PowerCycle);
        assert_eq!(sessions[1].opened_by, Boundary::PowerCycle);
        assert_eq!(
            sessions[1].states(),
            vec![State::PowerReset, State::PowerReset, State::SessionStart]
        );
    }

    #[test]
    fn test_markers_outside_window_do_not_pair() {
        let mut tracker = SessionTracker::new(SessionConfig::default());
        tracker.observe(marker(1, 100, Device::Modem));
        tracker.observe(marker(2, 106, Device::Machine));
        let sessions = tracker.finish();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entries.len(), 2);
    }

    #[test]
    fn test_frame_between_markers_joins_new_session() {
        let mut tracker = SessionTracker::new(SessionConfig::default());
        assert_eq!(tracker.observe(entry(1, 90, State::SessionStart)), vec![1]);
        assert!(tracker.observe(marker(2, 100, Device::Modem)).is_empty());
        assert!(tracker.observe(entry(3, 101, State::SessionStart)).is_empty());
        assert_eq!(tracker.observe(marker(4, 102, Device::Machine)), vec![2, 2, 2]);
        assert_eq!(tracker.observe(entry(5, 103, State::SessionStart)), vec![2]);

        let sessions = tracker.finish();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].opened_by, Boundary::PowerCycle);
        let lines: Vec<usize> = sessions[1].entries.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_held_entries_released_when_window_passes() {
        let mut tracker = SessionTracker::new(SessionConfig::default());
        tracker.observe(entry(1, 90, State::SessionStart));
        tracker.observe(marker(2, 100, Device::Modem));
        assert!(tracker.observe(entry(3, 104, State::SessionStart)).is_empty());
        assert_eq!(tracker.observe(entry(4, 106, State::SessionStart)), vec![1, 1, 1]);
        // partner too late
        assert!(tracker.observe(marker(5, 107, Device::Machine)).is_empty());
        assert_eq!(tracker.flush(), vec![1]);

        let sessions = tracker.finish();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entries.len(), 5);
    }

    #[test]
    fn test_same_device_markers_do_not_pair() {
        let mut tracker = SessionTracker::new(SessionConfig::default());
        tracker.observe(marker(1, 100, Device::Modem));
        tracker.observe(marker(2, 101, Device::Modem));
        let sessions = tracker.finish();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].opened_by, Boundary::StartOfCapture);
    }

    #[test]
    fn test_out_of_order_reported_once() {
        let mut tracker = SessionTracker::new(SessionConfig::default());
        tracker.observe(entry(1, 100, State::AuthChallenge));
        tracker.observe(entry(2, 101, State::AuthChallenge));
        let sessions = tracker.finish();
        assert_eq!(sessions[0].anomalies.len(), 1);
        assert!(matches!(
            sessions[0].anomalies[0],
            Anomaly::OutOfOrderPhase {
                state: State::AuthChallenge,
                line: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_gap_splitting_disabled() {
        let config = SessionConfig {
            idle_gap_secs: None,
            ..SessionConfig::default()
        };
        let mut tracker = SessionTracker::new(config);
        tracker.observe(entry(1, 100, State::SessionStart));
        tracker.observe(entry(2, 1000, State::HeartbeatAck));
        assert_eq!(tracker.finish().len(), 1);
    }

    #[test]
    fn test_summary() {
        let mut tracker = SessionTracker::new(SessionConfig::default());
        tracker.observe(entry(1, 100, State::SessionStart));
        tracker.observe(entry(2, 104, State::AuthChallenge));
        tracker.observe(entry(3, 107, State::SessionStart));
        let summary = tracker.finish()[0].summary();
        assert_eq!(summary.duration_secs, 7);
        assert_eq!(summary.distinct_states, 2);
        assert!(summary.has_authentication);
        assert!(summary.anomalies.is_empty());
    }
}
