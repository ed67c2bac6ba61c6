use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Protocol phase a frame belongs to.
///
/// Declaration order is classification priority; see [`crate::classifier::RULES`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    PowerReset,
    SessionStart,
    ControllerReady,
    HandshakeInit,
    HandshakeAck,
    DeviceId,
    FirmwareInfo,
    ModelInfo,
    SerialInfo,
    AuthChallenge,
    AuthResponse,
    StatusQuery,
    StatusResponse,
    DataResponse,
    QueryAck,
    ProgramCommand,
    ResetCommand,
    ResetConfirm,
    HeartbeatAck,
    ControlSignal,
    ComplexCommand,
    TimestampSync,
    Unknown,
}

impl State {
    pub const ALL: [State; 23] = [
        State::PowerReset,
        State::SessionStart,
        State::ControllerReady,
        State::HandshakeInit,
        State::HandshakeAck,
        State::DeviceId,
        State::FirmwareInfo,
        State::ModelInfo,
        State::SerialInfo,
        State::AuthChallenge,
        State::AuthResponse,
        State::StatusQuery,
        State::StatusResponse,
        State::DataResponse,
        State::QueryAck,
        State::ProgramCommand,
        State::ResetCommand,
        State::ResetConfirm,
        State::HeartbeatAck,
        State::ControlSignal,
        State::ComplexCommand,
        State::TimestampSync,
        State::Unknown,
    ];

    pub fn is_authentication(self) -> bool {
        matches!(self, State::AuthChallenge | State::AuthResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_labels() {
        assert_eq!(State::AuthChallenge.to_string(), "AUTH_CHALLENGE");
        assert_eq!(State::DeviceId.as_ref(), "DEVICE_ID");
        assert_eq!(State::from_str("SESSION_START"), Ok(State::SessionStart));
    }

    #[test]
    fn test_all_in_priority_order() {
        assert!(State::ALL.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(State::ALL.last(), Some(&State::Unknown));
    }
}
