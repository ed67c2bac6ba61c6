//! Phase classification against wire images

mod common;

use applink_lib::classifier::{RULES, classify, classify_frame, matching_states};
use common::*;

#[test]
fn test_session_start_literal() {
    let wire = hex_to_bytes("ff ff 0a 00 00 00 00 00 00 00 00 00 00");
    assert_eq!(classify(&wire, Device::Modem), State::SessionStart);
    assert_eq!(classify(&wire, Device::Machine), State::SessionStart);
}

#[test]
fn test_auth_direction_decides_phase() {
    let codec = FrameCodec::default();
    let frame = link_frame(FrameType::Authenticate, &auth_payload([0x10, 0x02, 0, 1, 0xD9, 0x93, 0xE4, 0xC8], 0x5A));
    let image = codec.serialize(&frame).unwrap();
    assert_eq!(&image[..4], &[0xFF, 0xFF, 0x25, 0x40]);

    assert_eq!(classify(&image, Device::Machine), State::AuthChallenge);
    assert_eq!(classify(&image, Device::Modem), State::AuthResponse);
    assert_eq!(classify_frame(&codec, &frame, Device::Machine), Ok(State::AuthChallenge));
}

#[test]
fn test_power_cycle_marker() {
    assert_eq!(classify(&[0x00], Device::Modem), State::PowerReset);
    assert_eq!(classify(&[0x00], Device::Machine), State::PowerReset);
    assert_eq!(classify(&[], Device::Machine), State::Unknown);
}

#[test]
fn test_marker_bytes_disambiguate_shared_lead() {
    // lead ff ff 2e 40 carries both firmware and model info
    let firmware = hex_to_bytes("ff ff 2e 40 00 00 00 00 00 00 62 45 2b");
    let model = hex_to_bytes("ff ff 2e 40 00 00 00 00 00 00 ec 45 2b");
    assert_eq!(classify(&firmware, Device::Machine), State::FirmwareInfo);
    assert_eq!(classify(&model, Device::Machine), State::ModelInfo);

    let status = hex_to_bytes("ff ff 43 40 00 00 00 00 00 00 6d 01 30");
    let data = hex_to_bytes("ff ff 46 40 00 00 00 00 00 00 6d 02 30");
    assert_eq!(classify(&status, Device::Machine), State::StatusResponse);
    assert_eq!(classify(&data, Device::Machine), State::DataResponse);
}

#[test]
fn test_earlier_rule_wins() {
    // handshake init and status query share the 0a 40 lead
    let wire = hex_to_bytes("ff ff 0a 40 00 00 00 00 00 01 4d 01 f3");
    assert_eq!(
        matching_states(&wire, Device::Modem),
        vec![State::HandshakeInit, State::StatusQuery]
    );
    assert_eq!(classify(&wire, Device::Modem), State::HandshakeInit);
}

#[test]
fn test_unmatched_falls_back_to_unknown() {
    let wire = hex_to_bytes("ff ff 0b 40 00 00 00 00 00 00 4d 61 80");
    assert_eq!(classify(&wire, Device::Machine), State::Unknown);
    assert!(matching_states(&wire, Device::Machine).is_empty());
}

#[test]
fn test_classification_is_deterministic() {
    let wire = hex_to_bytes("ff ff 12 40 00 00 00 00 00 00 0f 5a 00");
    let first = classify(&wire, Device::Modem);
    for _ in 0..10 {
        assert_eq!(classify(&wire, Device::Modem), first);
    }
    assert_eq!(first, State::ResetConfirm);
}

#[test]
fn test_every_phase_but_unknown_has_a_rule() {
    for state in State::ALL.iter().filter(|s| **s != State::Unknown) {
        assert!(RULES.iter().any(|r| r.state == *state), "no rule for {}", state);
    }
}
