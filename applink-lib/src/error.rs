use std::io;
use thiserror::Error;

/// Reasons a wire byte sequence cannot be decoded into a [`Frame`](crate::frame::Frame).
///
/// None of these are fatal to capture processing: the ingest boundary skips
/// the offending line and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Header mismatch: expected ff ff, got {found:02x?}")]
    HeaderMismatch { found: Vec<u8> },

    #[error("Length mismatch: declared {declared}, expected {expected}")]
    LengthMismatch { declared: usize, expected: usize },

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("CRC16 mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Truncated frame: need {needed} bytes, got {available}")]
    TruncatedFrame { needed: usize, available: usize },

    #[error("Invalid escape at offset {offset}: 0xff followed by {found:02x?}")]
    InvalidEscape { offset: usize, found: Option<u8> },

    #[error("Payload too large: {len} bytes")]
    PayloadTooLarge { len: usize },
}

impl FrameError {
    /// Short stable name, used as a key in skip statistics
    pub fn kind(&self) -> &'static str {
        match self {
            FrameError::HeaderMismatch { .. } => "header_mismatch",
            FrameError::LengthMismatch { .. } => "length_mismatch",
            FrameError::ChecksumMismatch { .. } => "checksum_mismatch",
            FrameError::CrcMismatch { .. } => "crc_mismatch",
            FrameError::TruncatedFrame { .. } => "truncated_frame",
            FrameError::InvalidEscape { .. } => "invalid_escape",
            FrameError::PayloadTooLarge { .. } => "payload_too_large",
        }
    }

    /// True for integrity failures on an otherwise well-formed frame
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            FrameError::ChecksumMismatch { .. } | FrameError::CrcMismatch { .. }
        )
    }
}

/// A capture line that does not have the `<device> <timestamp> - <hex bytes>` shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("Empty line")]
    Empty,

    #[error("Missing ' - ' separator")]
    MissingSeparator,

    #[error("Unknown device: {0:?}")]
    UnknownDevice(String),

    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("Invalid hex byte: {0:?}")]
    InvalidHex(String),
}

impl LineError {
    pub fn kind(&self) -> &'static str {
        match self {
            LineError::Empty => "empty",
            LineError::MissingSeparator => "missing_separator",
            LineError::UnknownDevice(_) => "unknown_device",
            LineError::InvalidTimestamp(_) => "invalid_timestamp",
            LineError::InvalidHex(_) => "invalid_hex",
        }
    }
}

/// The primary error type for the `applink-lib` library.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Line {line}: {source}")]
    Line { line: usize, source: LineError },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Simulation error: {0}")]
    Simulation(String),
}
