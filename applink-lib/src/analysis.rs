//! Capture analysis pipeline.
//!
//! Records flow through one linear pass, in time order:
//! codec (unstuff, decode, verify) → classifier → session tracker →
//! challenge/response tracker. Nothing here is fatal: lines and frames that
//! cannot be used are counted by reason and the pass continues.

use crate::anomaly::Anomaly;
use crate::auth::{AuthFindings, ChallengeResponsePair, ChallengeResponseTracker};
use crate::capture::{Capture, CaptureRecord};
use crate::classifier::{classify, is_power_cycle_marker};
use crate::config::{AnalyzerConfig, Validation};
use crate::error::FrameError;
use crate::frame::FrameCodec;
use crate::session::{Message, Session, SessionEntry, SessionSummary, SessionTracker};
use crate::state::State;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Counts gathered while ingesting a capture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Records that reached the codec
    pub records: usize,
    /// Frames decoded and kept
    pub frames: usize,
    /// Power-cycle markers
    pub markers: usize,
    /// Frames kept despite a checksum or CRC mismatch (lenient validation only)
    pub unverified: usize,
    /// Skipped lines and frames, keyed by reason
    pub skipped: BTreeMap<&'static str, usize>,
}

impl IngestStats {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    fn skip(&mut self, reason: &'static str) {
        *self.skipped.entry(reason).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub count: usize,
}

/// Serializable view of one analyzed capture
#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub sessions: Vec<SessionSummary>,
    pub pairs: Vec<ChallengeResponsePair>,
    pub duplicate_challenges: Vec<Anomaly>,
    pub slow_responses: Vec<Anomaly>,
    /// Every finding: per-session anomalies in session order, then duplicates
    pub anomalies: Vec<Anomaly>,
    /// Consecutive state pairs within sessions, most frequent first
    pub transitions: Vec<Transition>,
    pub state_counts: BTreeMap<State, usize>,
    pub distinct_challenges: usize,
    pub stats: IngestStats,
}

impl CaptureReport {
    pub fn anomaly_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for anomaly in &self.anomalies {
            *counts.entry(anomaly.kind()).or_insert(0) += 1;
        }
        counts
    }
}

/// Full result of a pass: the sessions with their decoded frames, plus tracker findings
#[derive(Debug, Clone)]
pub struct Analysis {
    pub sessions: Vec<Session>,
    pub auth: AuthFindings,
    pub distinct_challenges: usize,
    pub stats: IngestStats,
}

impl Analysis {
    pub fn report(&self) -> CaptureReport {
        let mut sessions: Vec<SessionSummary> = self.sessions.iter().map(Session::summary).collect();
        for anomaly in self.auth.anomalies.iter().chain(&self.auth.slow_responses) {
            let Some(id) = anomaly.session() else { continue };
            if let Some(summary) = sessions.iter_mut().find(|s| s.id == id) {
                summary.anomalies.push(anomaly.clone());
            }
        }

        let anomalies = sessions
            .iter()
            .flat_map(|s| s.anomalies.iter().cloned())
            .chain(self.auth.duplicate_challenges.iter().cloned())
            .collect();

        CaptureReport {
            sessions,
            pairs: self.auth.pairs.clone(),
            duplicate_challenges: self.auth.duplicate_challenges.clone(),
            slow_responses: self.auth.slow_responses.clone(),
            anomalies,
            transitions: self.transitions(),
            state_counts: self.state_counts(),
            distinct_challenges: self.distinct_challenges,
            stats: self.stats.clone(),
        }
    }

    pub fn transitions(&self) -> Vec<Transition> {
        let mut counts: HashMap<(State, State), usize> = HashMap::new();
        for session in &self.sessions {
            for pair in session.entries.windows(2) {
                *counts.entry((pair[0].state, pair[1].state)).or_insert(0) += 1;
            }
        }
        let mut transitions: Vec<Transition> = counts
            .into_iter()
            .map(|((from, to), count)| Transition { from, to, count })
            .collect();
        transitions.sort_by(|a, b| b.count.cmp(&a.count).then(a.from.cmp(&b.from)).then(a.to.cmp(&b.to)));
        transitions
    }

    pub fn state_counts(&self) -> BTreeMap<State, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.sessions.iter().flat_map(|s| &s.entries) {
            *counts.entry(entry.state).or_insert(0) += 1;
        }
        counts
    }
}

/// Single-pass analyzer. Feed records in time order, then call [`Analyzer::finish`].
#[derive(Debug)]
pub struct Analyzer {
    codec: FrameCodec,
    validation: Validation,
    sessions: SessionTracker,
    auth: ChallengeResponseTracker,
    /// One slot per entry the session tracker has not released yet, holding auth entries
    unplaced: VecDeque<Option<SessionEntry>>,
    stats: IngestStats,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            codec: FrameCodec::new(config.codec),
            validation: config.validation,
            sessions: SessionTracker::new(config.session),
            auth: ChallengeResponseTracker::new(config.auth),
            unplaced: VecDeque::new(),
            stats: IngestStats::default(),
        }
    }

    /// Sort `capture` by time and run it through a fresh analyzer.
    pub fn analyze(config: AnalyzerConfig, capture: Capture) -> Analysis {
        let mut analyzer = Self::new(config);
        for (&reason, &count) in capture.skipped() {
            *analyzer.stats.skipped.entry(reason).or_insert(0) += count;
        }
        for record in capture.into_time_order().records() {
            analyzer.ingest(record);
        }
        analyzer.finish()
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn ingest(&mut self, record: &CaptureRecord) {
        self.stats.records += 1;
        let Some((message, state)) = self.decode(record) else {
            return;
        };
        debug!(line = record.line, device = %record.device, "{}", state);

        let entry = SessionEntry {
            line: record.line,
            timestamp: record.timestamp,
            device: record.device,
            message,
            state,
        };
        self.unplaced.push_back(state.is_authentication().then(|| entry.clone()));
        let placed = self.sessions.observe(entry);
        self.track_auth(placed);
    }

    /// Feed auth entries to the challenge tracker once their session is known.
    fn track_auth(&mut self, placed: Vec<usize>) {
        for session in placed {
            if let Some(Some(entry)) = self.unplaced.pop_front() {
                self.auth.observe(session, &entry);
            }
        }
    }

    fn decode(&mut self, record: &CaptureRecord) -> Option<(Message, State)> {
        if is_power_cycle_marker(&record.bytes) {
            self.stats.markers += 1;
            return Some((Message::Marker, State::PowerReset));
        }

        let decoded = self
            .codec
            .unstuff(&record.bytes)
            .and_then(|image| Ok((self.codec.decode_image(&image)?, image)));
        let ((frame, fault), image) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.skip(record, &e);
                return None;
            }
        };

        let verified = match (fault, self.validation) {
            (None, _) => true,
            (Some(e), Validation::Strict) => {
                self.skip(record, &e);
                return None;
            }
            (Some(e), Validation::Lenient) => {
                debug!(line = record.line, "Keeping unverified frame: {}", e);
                self.stats.unverified += 1;
                false
            }
        };

        self.stats.frames += 1;
        let state = classify(&image, record.device);
        Some((Message::Frame { frame, verified }, state))
    }

    fn skip(&mut self, record: &CaptureRecord, err: &FrameError) {
        warn!(line = record.line, bytes = %record.hex_string(), "Skipping frame: {}", err);
        self.stats.skip(err.kind());
    }

    pub fn finish(mut self) -> Analysis {
        let placed = self.sessions.flush();
        self.track_auth(placed);
        let distinct_challenges = self.auth.distinct_challenges();
        let sessions = self.sessions.finish();
        let auth = self.auth.finish();
        info!(
            records = self.stats.records,
            frames = self.stats.frames,
            skipped = self.stats.skipped_total(),
            sessions = sessions.len(),
            pairs = auth.pairs.len(),
            duplicates = auth.duplicate_challenges.len(),
            "Analysis complete"
        );
        Analysis {
            sessions,
            auth,
            distinct_challenges,
            stats: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Device, render_line};
    use crate::frame::{Frame, FrameType};

    fn frame_line(codec: &FrameCodec, device: Device, ts: u64, frame: &Frame) -> String {
        render_line(device, ts, &codec.encode_frame(frame).unwrap())
    }

    #[test]
    fn test_strict_skips_bad_checksum() {
        // checksum byte should be 0x0a
        let capture = Capture::parse("modem 100 - ff ff 0a 00 00 00 00 00 00 00 00 00 00\n");
        let analysis = Analyzer::analyze(AnalyzerConfig::default(), capture);
        assert_eq!(analysis.stats.frames, 0);
        assert_eq!(analysis.stats.skipped.get("checksum_mismatch"), Some(&1));
        assert!(analysis.sessions.is_empty());
    }

    #[test]
    fn test_lenient_keeps_bad_checksum() {
        let capture = Capture::parse("modem 100 - ff ff 0a 00 00 00 00 00 00 00 00 00 00\n");
        let config = AnalyzerConfig {
            validation: Validation::Lenient,
            ..AnalyzerConfig::default()
        };
        let analysis = Analyzer::analyze(config, capture);
        assert_eq!(analysis.stats.unverified, 1);
        let entry = &analysis.sessions[0].entries[0];
        assert_eq!(entry.state, State::SessionStart);
        assert!(matches!(entry.message, Message::Frame { verified: false, .. }));
    }

    #[test]
    fn test_line_and_frame_skips_are_merged() {
        let text = "garbage\nmodem 100 - 12 34\nmodem 101 - 00\n";
        let analysis = Analyzer::analyze(AnalyzerConfig::default(), Capture::parse(text));
        assert_eq!(analysis.stats.skipped.get("missing_separator"), Some(&1));
        assert_eq!(analysis.stats.skipped.get("header_mismatch"), Some(&1));
        assert_eq!(analysis.stats.markers, 1);
        assert_eq!(analysis.stats.skipped_total(), 2);
    }

    #[test]
    fn test_transitions_stay_within_sessions() {
        let codec = FrameCodec::default();
        let start = Frame::new(0x00, 0x40, FrameType::PowerUpAck, vec![0x00]);
        let text = [
            frame_line(&codec, Device::Modem, 100, &start),
            frame_line(&codec, Device::Modem, 101, &start),
            // idle gap
            frame_line(&codec, Device::Modem, 200, &start),
        ]
        .join("\n");
        let report = Analyzer::analyze(AnalyzerConfig::default(), Capture::parse(&text)).report();
        assert_eq!(report.sessions.len(), 2);
        assert_eq!(
            report.transitions,
            vec![Transition {
                from: State::SessionStart,
                to: State::SessionStart,
                count: 1
            }]
        );
        assert_eq!(report.state_counts.get(&State::SessionStart), Some(&3));
    }
}
