//! Findings about the analyzed link. Anomalies are recorded and surfaced,
//! never raised as errors.

use crate::auth::Challenge;
use crate::state::State;
use serde::{Serialize, Serializer};
use std::fmt;

/// One sighting of a challenge value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChallengeOccurrence {
    pub session: usize,
    pub timestamp: u64,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// A phase appeared before any of the phases that normally precede it
    OutOfOrderPhase {
        session: usize,
        timestamp: u64,
        line: usize,
        state: State,
        expected_after: Vec<State>,
    },
    /// A response with no pending challenge in its session
    UnmatchedResponse {
        session: usize,
        timestamp: u64,
        line: usize,
        #[serde(serialize_with = "serialize_hex")]
        response: Vec<u8>,
    },
    /// A challenge still waiting for a response when the capture ended
    UnansweredChallenge {
        session: usize,
        timestamp: u64,
        line: usize,
        challenge: Challenge,
    },
    /// An authentication frame too short to carry a challenge value
    TruncatedChallenge {
        session: usize,
        timestamp: u64,
        line: usize,
        payload_len: usize,
    },
    /// The same challenge value was issued more than once in the capture
    DuplicateChallenge {
        challenge: Challenge,
        occurrences: Vec<ChallengeOccurrence>,
    },
    /// Response latency above the configured threshold
    SlowResponse {
        session: usize,
        challenge: Challenge,
        challenged_at: u64,
        responded_at: u64,
        latency_secs: u64,
    },
}

impl Anomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            Anomaly::OutOfOrderPhase { .. } => "out_of_order_phase",
            Anomaly::UnmatchedResponse { .. } => "unmatched_response",
            Anomaly::UnansweredChallenge { .. } => "unanswered_challenge",
            Anomaly::TruncatedChallenge { .. } => "truncated_challenge",
            Anomaly::DuplicateChallenge { .. } => "duplicate_challenge",
            Anomaly::SlowResponse { .. } => "slow_response",
        }
    }

    /// Session the finding belongs to; duplicates span the whole capture
    pub fn session(&self) -> Option<usize> {
        match self {
            Anomaly::OutOfOrderPhase { session, .. }
            | Anomaly::UnmatchedResponse { session, .. }
            | Anomaly::UnansweredChallenge { session, .. }
            | Anomaly::TruncatedChallenge { session, .. }
            | Anomaly::SlowResponse { session, .. } => Some(*session),
            Anomaly::DuplicateChallenge { .. } => None,
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::OutOfOrderPhase {
                session,
                line,
                state,
                expected_after,
                ..
            } => write!(
                f,
                "session {}: {} at line {} before any of {:?}",
                session, state, line, expected_after
            ),
            Anomaly::UnmatchedResponse { session, line, .. } => {
                write!(f, "session {}: response at line {} has no pending challenge", session, line)
            }
            Anomaly::UnansweredChallenge {
                session,
                line,
                challenge,
                ..
            } => write!(f, "session {}: challenge {} at line {} never answered", session, challenge, line),
            Anomaly::TruncatedChallenge {
                session,
                line,
                payload_len,
                ..
            } => write!(
                f,
                "session {}: auth frame at line {} has {} payload bytes, too short for a challenge",
                session, line, payload_len
            ),
            Anomaly::DuplicateChallenge { challenge, occurrences } => {
                write!(f, "challenge {} issued {} times:", challenge, occurrences.len())?;
                for o in occurrences {
                    write!(f, " [session {} t={} line {}]", o.session, o.timestamp, o.line)?;
                }
                Ok(())
            }
            Anomaly::SlowResponse {
                session,
                challenge,
                latency_secs,
                ..
            } => write!(
                f,
                "session {}: response to {} took {}s",
                session, challenge, latency_secs
            ),
        }
    }
}

pub(crate) fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}
