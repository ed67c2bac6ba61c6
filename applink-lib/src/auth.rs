//! Challenge/response tracking for the link authentication exchange.
//!
//! # Exchange
//!
//! 1. The appliance sends an authentication frame carrying an 8-byte challenge
//!    (a rolling code that should never repeat)
//! 2. The module answers with an authentication frame carrying the encrypted response
//!
//! Responses are paired with the oldest unanswered challenge of the same
//! session. Challenge values are tracked across the whole capture, because a
//! repeated challenge is what makes a captured response replayable.

use crate::anomaly::{Anomaly, ChallengeOccurrence, serialize_hex};
use crate::constants::{CHALLENGE_SIZE, DEFAULT_SLOW_RESPONSE_SECS};
use crate::session::SessionEntry;
use crate::state::State;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};

/// 8-byte challenge value
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Challenge(pub [u8; CHALLENGE_SIZE]);

impl Challenge {
    /// Challenge bytes at `offset` in an authentication payload
    pub fn from_payload(payload: &[u8], offset: usize) -> Option<Self> {
        let bytes = payload.get(offset..offset.checked_add(CHALLENGE_SIZE)?)?;
        Some(Self(bytes.try_into().ok()?))
    }

    pub fn as_bytes(&self) -> &[u8; CHALLENGE_SIZE] {
        &self.0
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Challenge({})", hex::encode(self.0))
    }
}

impl Serialize for Challenge {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Latency above this many seconds is reported as slow
    pub slow_response_secs: u64,
    /// Where the challenge value starts in the authentication payload
    pub challenge_offset: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            slow_response_secs: DEFAULT_SLOW_RESPONSE_SECS,
            challenge_offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeResponsePair {
    pub session: usize,
    pub challenge: Challenge,
    pub challenged_at: u64,
    pub challenge_line: usize,
    #[serde(serialize_with = "serialize_hex")]
    pub response: Vec<u8>,
    pub responded_at: u64,
    pub response_line: usize,
}

impl ChallengeResponsePair {
    pub fn latency(&self) -> u64 {
        self.responded_at.saturating_sub(self.challenged_at)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingChallenge {
    challenge: Challenge,
    timestamp: u64,
    line: usize,
}

/// Everything the tracker found over one capture
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthFindings {
    pub pairs: Vec<ChallengeResponsePair>,
    /// `DuplicateChallenge` records, ordered by first occurrence
    pub duplicate_challenges: Vec<Anomaly>,
    /// `SlowResponse` records, in response order
    pub slow_responses: Vec<Anomaly>,
    /// Unmatched responses, unanswered and truncated challenges
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Default)]
pub struct ChallengeResponseTracker {
    config: AuthConfig,
    occurrences: HashMap<Challenge, Vec<ChallengeOccurrence>>,
    pending: HashMap<usize, VecDeque<PendingChallenge>>,
    pairs: Vec<ChallengeResponsePair>,
    slow: Vec<Anomaly>,
    anomalies: Vec<Anomaly>,
}

impl ChallengeResponseTracker {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Feed a classified entry; anything but a decoded authentication frame is ignored.
    pub fn observe(&mut self, session: usize, entry: &SessionEntry) {
        let Some(frame) = entry.message.frame() else {
            return;
        };
        match entry.state {
            State::AuthChallenge => self.on_challenge(session, entry.timestamp, entry.line, &frame.payload),
            State::AuthResponse => self.on_response(session, entry.timestamp, entry.line, &frame.payload),
            _ => {}
        }
    }

    pub fn on_challenge(&mut self, session: usize, timestamp: u64, line: usize, payload: &[u8]) {
        let Some(challenge) = Challenge::from_payload(payload, self.config.challenge_offset) else {
            warn!(session, line, "Authentication frame too short for a challenge");
            self.anomalies.push(Anomaly::TruncatedChallenge {
                session,
                timestamp,
                line,
                payload_len: payload.len(),
            });
            return;
        };
        debug!(session, line, %challenge, "Challenge");

        self.occurrences.entry(challenge).or_default().push(ChallengeOccurrence {
            session,
            timestamp,
            line,
        });
        self.pending.entry(session).or_default().push_back(PendingChallenge {
            challenge,
            timestamp,
            line,
        });
    }

    pub fn on_response(&mut self, session: usize, timestamp: u64, line: usize, payload: &[u8]) {
        let Some(pending) = self.pending.get_mut(&session).and_then(|q| q.pop_front()) else {
            warn!(session, line, "Response without a pending challenge");
            self.anomalies.push(Anomaly::UnmatchedResponse {
                session,
                timestamp,
                line,
                response: payload.to_vec(),
            });
            return;
        };

        let pair = ChallengeResponsePair {
            session,
            challenge: pending.challenge,
            challenged_at: pending.timestamp,
            challenge_line: pending.line,
            response: payload.to_vec(),
            responded_at: timestamp,
            response_line: line,
        };
        let latency = pair.latency();
        if latency > self.config.slow_response_secs {
            warn!(session, line, latency, "Slow response to {}", pair.challenge);
            self.slow.push(Anomaly::SlowResponse {
                session,
                challenge: pair.challenge,
                challenged_at: pair.challenged_at,
                responded_at: pair.responded_at,
                latency_secs: latency,
            });
        }
        debug!(session, line, latency, "Paired response with {}", pair.challenge);
        self.pairs.push(pair);
    }

    pub fn pairs(&self) -> &[ChallengeResponsePair] {
        &self.pairs
    }

    /// Challenges seen more than once, ordered by first occurrence
    pub fn duplicates(&self) -> Vec<Anomaly> {
        let mut repeated: Vec<(&Challenge, &Vec<ChallengeOccurrence>)> =
            self.occurrences.iter().filter(|(_, occ)| occ.len() > 1).collect();
        repeated.sort_by_key(|(_, occ)| (occ[0].timestamp, occ[0].line));
        repeated
            .into_iter()
            .map(|(challenge, occ)| Anomaly::DuplicateChallenge {
                challenge: *challenge,
                occurrences: occ.clone(),
            })
            .collect()
    }

    /// Number of distinct challenge values seen
    pub fn distinct_challenges(&self) -> usize {
        self.occurrences.len()
    }

    /// Report leftovers as unanswered and hand back everything found.
    pub fn finish(mut self) -> AuthFindings {
        let duplicate_challenges = self.duplicates();
        for dup in &duplicate_challenges {
            warn!("Duplicate challenge: {}", dup);
        }

        let mut sessions: Vec<usize> = self.pending.keys().copied().collect();
        sessions.sort_unstable();
        for session in sessions {
            for left in self.pending.remove(&session).unwrap_or_default() {
                self.anomalies.push(Anomaly::UnansweredChallenge {
                    session,
                    timestamp: left.timestamp,
                    line: left.line,
                    challenge: left.challenge,
                });
            }
        }

        AuthFindings {
            pairs: self.pairs,
            duplicate_challenges,
            slow_responses: self.slow,
            anomalies: self.anomalies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(challenge: [u8; 8]) -> Vec<u8> {
        let mut p = challenge.to_vec();
        p.extend_from_slice(&[0xAA; 20]);
        p
    }

    #[test]
    fn test_challenge_from_payload() {
        let p = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert_eq!(Challenge::from_payload(&p, 0), Some(Challenge([1, 2, 3, 4, 5, 6, 7, 8])));
        assert_eq!(Challenge::from_payload(&p, 2), Some(Challenge([3, 4, 5, 6, 7, 8, 9, 10])));
        assert_eq!(Challenge::from_payload(&p, 3), None);
        assert_eq!(Challenge::from_payload(&p, usize::MAX), None);
    }

    #[test]
    fn test_fifo_pairing_within_session() {
        let mut tracker = ChallengeResponseTracker::new(AuthConfig::default());
        tracker.on_challenge(1, 100, 1, &payload([1; 8]));
        tracker.on_challenge(1, 101, 2, &payload([2; 8]));
        tracker.on_response(1, 102, 3, &[0xEE; 28]);
        tracker.on_response(1, 103, 4, &[0xDD; 28]);
        let findings = tracker.finish();
        assert_eq!(findings.pairs.len(), 2);
        assert_eq!(findings.pairs[0].challenge, Challenge([1; 8]));
        assert_eq!(findings.pairs[1].challenge, Challenge([2; 8]));
        assert!(findings.anomalies.is_empty());
    }

    #[test]
    fn test_pending_challenges_do_not_cross_sessions() {
        let mut tracker = ChallengeResponseTracker::new(AuthConfig::default());
        tracker.on_challenge(1, 100, 1, &payload([1; 8]));
        tracker.on_response(2, 101, 2, &[0xEE; 28]);
        let findings = tracker.finish();
        assert!(findings.pairs.is_empty());
        assert_eq!(findings.anomalies.len(), 2);
        assert_eq!(findings.anomalies[0].kind(), "unmatched_response");
        assert_eq!(findings.anomalies[1].kind(), "unanswered_challenge");
    }

    #[test]
    fn test_slow_response_threshold_is_exclusive() {
        let mut tracker = ChallengeResponseTracker::new(AuthConfig::default());
        tracker.on_challenge(1, 100, 1, &payload([1; 8]));
        tracker.on_response(1, 130, 2, &[0xEE; 28]);
        tracker.on_challenge(1, 200, 3, &payload([2; 8]));
        tracker.on_response(1, 231, 4, &[0xEE; 28]);
        tracker.on_challenge(1, 300, 5, &payload([3; 8]));
        tracker.on_response(1, 300, 6, &[0xEE; 28]);
        let findings = tracker.finish();
        assert_eq!(findings.slow_responses.len(), 1);
        assert!(matches!(
            findings.slow_responses[0],
            Anomaly::SlowResponse { latency_secs: 31, .. }
        ));
    }

    #[test]
    fn test_truncated_challenge() {
        let mut tracker = ChallengeResponseTracker::new(AuthConfig::default());
        tracker.on_challenge(1, 100, 7, &[0x10, 0x02]);
        let findings = tracker.finish();
        assert_eq!(
            findings.anomalies,
            vec![Anomaly::TruncatedChallenge {
                session: 1,
                timestamp: 100,
                line: 7,
                payload_len: 2
            }]
        );
    }
}
