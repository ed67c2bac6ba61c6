//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use applink_lib::capture::{Capture, Device, render_line};
#[allow(unused_imports)]
pub use applink_lib::error::FrameError;
#[allow(unused_imports)]
pub use applink_lib::frame::{CodecConfig, Frame, FrameCodec, FrameType, StuffingScope};
#[allow(unused_imports)]
pub use applink_lib::state::State;
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data.replace(' ', "")).expect("Failed to decode hex"))
}

/// Frame with the appliance address first, as captured traffic carries it
#[allow(dead_code)]
pub fn link_frame(frame_type: FrameType, payload: &[u8]) -> Frame {
    Frame::new(0x40, 0x00, frame_type, Bytes::copy_from_slice(payload))
}

/// 28-byte authentication payload starting with `challenge`
#[allow(dead_code)]
pub fn auth_payload(challenge: [u8; 8], fill: u8) -> Vec<u8> {
    let mut payload = challenge.to_vec();
    payload.resize(28, fill);
    payload
}

/// Capture line for `frame` as encoded by the default codec
#[allow(dead_code)]
pub fn line(device: Device, timestamp: u64, frame: &Frame) -> String {
    let wire = FrameCodec::default().encode_frame(frame).expect("Failed to encode frame");
    render_line(device, timestamp, &wire)
}

/// Power-cycle marker line
#[allow(dead_code)]
pub fn marker(device: Device, timestamp: u64) -> String {
    render_line(device, timestamp, &[0x00])
}

/// Session start frame: `ff ff 0a 00 ...`
#[allow(dead_code)]
pub fn session_start() -> Frame {
    Frame::new(0x00, 0x40, FrameType::PowerUpAck, vec![0x00])
}

