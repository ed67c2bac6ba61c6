//! Protocol phase classification.
//!
//! Classification is a first-match scan over an ordered rule table. Several
//! phases share the same lead bytes and are told apart only by a marker byte
//! sequence later in the frame or by which device sent it, so table order is
//! the precedence.

use crate::capture::Device;
use crate::constants::{FRAME_HEADER, POWER_CYCLE_MARKER};
use crate::error::FrameError;
use crate::frame::{Frame, FrameCodec};
use crate::state::State;

/// What a rule matches against the unstuffed wire image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// The whole message equals these bytes (headerless control messages)
    Exact(&'static [u8]),
    /// `ff ff` header followed by `lead`; if set, `marker` must occur after the lead
    Framed {
        lead: &'static [u8],
        marker: Option<&'static [u8]>,
    },
}

impl Pattern {
    pub fn matches(&self, wire: &[u8]) -> bool {
        match *self {
            Pattern::Exact(bytes) => wire == bytes,
            Pattern::Framed { lead, marker } => {
                let Some(rest) = wire.strip_prefix(&FRAME_HEADER[..]) else {
                    return false;
                };
                let Some(after_lead) = rest.strip_prefix(lead) else {
                    return false;
                };
                marker.is_none_or(|m| contains(after_lead, m))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub state: State,
    pub pattern: Pattern,
    pub device: Option<Device>,
}

impl Rule {
    const fn framed(state: State, lead: &'static [u8], marker: &'static [u8]) -> Self {
        Rule {
            state,
            pattern: Pattern::Framed {
                lead,
                marker: Some(marker),
            },
            device: None,
        }
    }

    const fn from_device(state: State, lead: &'static [u8], device: Device) -> Self {
        Rule {
            state,
            pattern: Pattern::Framed { lead, marker: None },
            device: Some(device),
        }
    }

    pub fn matches(&self, wire: &[u8], device: Device) -> bool {
        self.device.is_none_or(|d| d == device) && self.pattern.matches(wire)
    }
}

/// Rule table in priority order.
///
/// Lead bytes are the length byte and the first address byte as seen in captures.
pub const RULES: &[Rule] = &[
    Rule {
        state: State::PowerReset,
        pattern: Pattern::Exact(POWER_CYCLE_MARKER),
        device: None,
    },
    Rule {
        state: State::SessionStart,
        pattern: Pattern::Framed {
            lead: &[0x0A, 0x00],
            marker: None,
        },
        device: None,
    },
    Rule::framed(State::ControllerReady, &[0x08, 0x40], &[0x70]),
    Rule::framed(State::HandshakeInit, &[0x0A, 0x40], &[0x01, 0x4D, 0x01]),
    Rule::framed(State::HandshakeAck, &[0x08, 0x40], &[0x73]),
    Rule::framed(State::DeviceId, &[0x19, 0x40], &[0x11, 0x00, 0xF0]),
    Rule::framed(State::FirmwareInfo, &[0x2E, 0x40], &[0x62]),
    Rule::framed(State::ModelInfo, &[0x2E, 0x40], &[0xEC]),
    Rule::framed(State::SerialInfo, &[0x2C, 0x40], &[0xEA]),
    Rule::from_device(State::AuthChallenge, &[0x25, 0x40], Device::Machine),
    Rule::from_device(State::AuthResponse, &[0x25, 0x40], Device::Modem),
    Rule::framed(State::StatusQuery, &[0x0A, 0x40], &[0xF3]),
    Rule::framed(State::StatusResponse, &[0x43, 0x40], &[0x6D, 0x01]),
    Rule::framed(State::DataResponse, &[0x46, 0x40], &[0x6D, 0x02]),
    Rule::framed(State::QueryAck, &[0x0A, 0x40], &[0xF5]),
    Rule::framed(State::ProgramCommand, &[0x0E, 0x40], &[0x60]),
    Rule::framed(State::ResetCommand, &[0x0C, 0x40], &[0x5D, 0x1F]),
    Rule::framed(State::ResetConfirm, &[0x12, 0x40], &[0x0F, 0x5A]),
    Rule::framed(State::HeartbeatAck, &[0x08, 0x40], &[0x4D, 0x61]),
    Rule::framed(State::ControlSignal, &[0x08, 0x40], &[0x51, 0x64]),
    Rule::framed(State::ComplexCommand, &[0x22, 0x40], &[0xF7]),
    Rule::framed(State::TimestampSync, &[0x20, 0x40], &[0x11, 0x10, 0x00]),
];

/// Classify an unstuffed wire image sent by `device`. Falls back to [`State::Unknown`].
pub fn classify(wire: &[u8], device: Device) -> State {
    classify_with(RULES, wire, device)
}

/// Classify a decoded frame by its unstuffed serialization under `codec`.
pub fn classify_frame(codec: &FrameCodec, frame: &Frame, device: Device) -> Result<State, FrameError> {
    let image = codec.serialize(frame)?;
    Ok(classify(&image, device))
}

/// Classify against a caller-supplied rule table
pub fn classify_with(rules: &[Rule], wire: &[u8], device: Device) -> State {
    rules
        .iter()
        .find(|rule| rule.matches(wire, device))
        .map_or(State::Unknown, |rule| rule.state)
}

/// Every state whose rule matches, in priority order. The first entry is what [`classify`] returns.
pub fn matching_states(wire: &[u8], device: Device) -> Vec<State> {
    RULES
        .iter()
        .filter(|rule| rule.matches(wire, device))
        .map(|rule| rule.state)
        .collect()
}

/// True if the message is the headerless power-cycle marker
pub fn is_power_cycle_marker(wire: &[u8]) -> bool {
    wire == POWER_CYCLE_MARKER
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
