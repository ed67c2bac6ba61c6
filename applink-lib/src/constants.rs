// Link protocol constants

/// Frame header, two literal 0xFF bytes
pub const FRAME_HEADER: [u8; 2] = [0xFF, 0xFF];

/// Size of the frame header (2 bytes)
pub const HEADER_SIZE: usize = 2;

/// Byte value that must be escaped on the wire
pub const ESCAPED_BYTE: u8 = 0xFF;

/// Stuffing byte inserted after every escaped 0xFF
pub const STUFFING_BYTE: u8 = 0x55;

/// Size of the address identifier: [source, destination, 0, 0, 0, 0, 0]
pub const ADDRESS_ID_SIZE: usize = 7;

/// Bytes covered by `length` besides the payload: address identifier, type, checksum
pub const LENGTH_OVERHEAD: usize = ADDRESS_ID_SIZE + 1 + 1;

/// Size of the optional trailing CRC16
pub const CRC_SIZE: usize = 2;

/// Largest payload that still fits the one-byte length field
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize - LENGTH_OVERHEAD;

/// CRC-16 polynomial, reflected (LSB first)
pub const CRC16_POLY: u16 = 0xA001;

/// CRC-16 initial register value
pub const CRC16_INIT: u16 = 0xFFFF;

/// Address of the WiFi module (modem)
pub const MODULE_ADDRESS: u8 = 0x00;

/// Address of the appliance (machine); captured traffic carries it in the first address slot
pub const APPLIANCE_ADDRESS: u8 = 0x40;

/// Power-cycle marker: a headerless message consisting of a single zero byte
pub const POWER_CYCLE_MARKER: &[u8] = &[0x00];

/// Size of an authentication challenge value
pub const CHALLENGE_SIZE: usize = 8;

/// Both devices must report the power-cycle marker within this many seconds
pub const DEFAULT_PAIRING_WINDOW_SECS: u64 = 5;

/// Silence longer than this between frames starts a new session
pub const DEFAULT_IDLE_GAP_SECS: u64 = 30;

/// Challenge to response latency above this is reported as slow
pub const DEFAULT_SLOW_RESPONSE_SECS: u64 = 30;

/// Live simulation: how long an endpoint waits for an acknowledgment
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 50;

/// Payload size of authentication frames in both directions; gives the `25` length byte
pub const AUTH_PAYLOAD_SIZE: usize = 28;
