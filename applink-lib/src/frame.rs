//! Wire frame codec.
//!
//! ```text
//! FF FF <length> <src> <dst> 00 00 00 00 00 <type> <payload...> <checksum> [<crc_lo> <crc_hi>]
//! ```
//!
//! `length` counts the address identifier, type, payload and checksum. Every
//! literal 0xFF inside the stuffed region is followed by an inserted 0x55.

use crate::checksum::{ChecksumPolicy, crc16};
use crate::constants::*;
use crate::error::FrameError;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Command codes observed in captured traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    PowerUp = 0x04,
    Identify = 0x11,
    Authenticate = 0x12,
    Acknowledge = 0x4D,
    ControlSignal = 0x51,
    ResetCommand = 0x5D,
    ProgramCommand = 0x60,
    PowerUpAck = 0x61,
    FirmwareInfo = 0x62,
    StatusReport = 0x6D,
    ControllerReady = 0x70,
    HandshakeAck = 0x73,
    SerialInfo = 0xEA,
    ModelInfo = 0xEC,
    Control = 0xF3,
    NetworkStatus = 0xF5,
    NetworkQuery = 0xF7,

    /// A code outside the catalogue. [`FrameType::normalized`] folds catalogued codes back.
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl FrameType {
    pub fn code(self) -> u8 {
        self.into()
    }

    /// The catalogued variant for `Unknown(code)` when `code` has one.
    pub fn normalized(self) -> Self {
        FrameType::from_primitive(self.code())
    }
}

/// Which part of the frame participates in 0xFF byte-stuffing.
///
/// Captured lines always begin with a bare `ff ff`, so the default leaves the
/// header alone. `WholeFrame` stuffs the header too, as the reference frame
/// builder does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuffingScope {
    #[default]
    AfterHeader,
    WholeFrame,
}

/// A logical frame: addressing, type, payload, and whether a CRC16 trails the checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: u8,
    pub destination: u8,
    pub frame_type: FrameType,
    pub payload: Bytes,
    pub crc: bool,
}

impl Frame {
    pub fn new(source: u8, destination: u8, frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            destination,
            frame_type: frame_type.normalized(),
            payload: payload.into(),
            crc: false,
        }
    }

    /// Same frame, carrying a trailing CRC16
    pub fn with_crc(mut self) -> Self {
        self.crc = true;
        self
    }

    /// Value of the length byte: address identifier + type + payload + checksum
    pub fn length(&self) -> Result<u8, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge { len: self.payload.len() });
        }
        Ok((LENGTH_OVERHEAD + self.payload.len()) as u8)
    }

    pub fn address_id(&self) -> [u8; ADDRESS_ID_SIZE] {
        [self.source, self.destination, 0, 0, 0, 0, 0]
    }

    /// Address identifier, type and payload: the bytes the checksum sums after the length byte
    fn body(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(ADDRESS_ID_SIZE + 1 + self.payload.len());
        body.put_slice(&self.address_id());
        body.put_u8(self.frame_type.code());
        body.put_slice(&self.payload);
        body
    }

    pub fn checksum(&self, policy: ChecksumPolicy) -> Result<u8, FrameError> {
        Ok(policy.compute(self.length()?, &self.body()))
    }

    /// CRC16 over `length ++ address_identifier ++ type ++ payload`
    pub fn crc16(&self) -> Result<u16, FrameError> {
        let mut span = BytesMut::with_capacity(1 + ADDRESS_ID_SIZE + 1 + self.payload.len());
        span.put_u8(self.length()?);
        span.put_slice(&self.body());
        Ok(crc16(&span))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}({:#04x}) {:#04x}->{:#04x} [{}]{}",
            self.frame_type,
            self.frame_type.code(),
            self.source,
            self.destination,
            hex::encode(&self.payload),
            if self.crc { " +crc" } else { "" }
        )
    }
}

/// Insert a stuffing byte after every 0xFF.
pub fn stuff(bytes: &[u8], out: &mut BytesMut) {
    for &b in bytes {
        out.put_u8(b);
        if b == ESCAPED_BYTE {
            out.put_u8(STUFFING_BYTE);
        }
    }
}

/// Remove exactly one stuffing byte after every 0xFF.
///
/// `base` is the wire offset of `bytes[0]`, used for error reporting.
pub fn unstuff(bytes: &[u8], base: usize, out: &mut BytesMut) -> Result<(), FrameError> {
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        out.put_u8(b);
        if b == ESCAPED_BYTE {
            match bytes.get(i + 1) {
                Some(&STUFFING_BYTE) => i += 1,
                found => {
                    return Err(FrameError::InvalidEscape {
                        offset: base + i,
                        found: found.copied(),
                    });
                }
            }
        }
        i += 1;
    }
    Ok(())
}

/// Codec parameters. Policies that the captures leave open are explicit here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub checksum: ChecksumPolicy,
    pub stuffing: StuffingScope,
    /// Frame types that must carry a CRC16
    pub crc_types: Vec<u8>,
    /// Source address used by [`FrameCodec::encode`]
    pub source: u8,
    /// Destination address used by [`FrameCodec::encode`]
    pub destination: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            checksum: ChecksumPolicy::default(),
            stuffing: StuffingScope::default(),
            crc_types: Vec::new(),
            source: MODULE_ADDRESS,
            destination: APPLIANCE_ADDRESS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: CodecConfig,
}

impl FrameCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Build the wire bytes for `frame_type`/`payload` using the configured addresses.
    pub fn encode(&self, frame_type: FrameType, payload: &[u8], use_crc: bool) -> Result<Bytes, FrameError> {
        let mut frame = Frame::new(
            self.config.source,
            self.config.destination,
            frame_type,
            Bytes::copy_from_slice(payload),
        );
        frame.crc = use_crc;
        self.encode_frame(&frame)
    }

    /// Stuffed wire bytes for `frame`
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, FrameError> {
        let image = self.serialize(frame)?;
        let mut wire = BytesMut::with_capacity(image.len() + image.len() / 4);
        match self.config.stuffing {
            StuffingScope::AfterHeader => {
                wire.put_slice(&image[..HEADER_SIZE]);
                stuff(&image[HEADER_SIZE..], &mut wire);
            }
            StuffingScope::WholeFrame => stuff(&image, &mut wire),
        }
        Ok(wire.freeze())
    }

    /// Unstuffed wire image of `frame`: header through checksum/CRC
    pub fn serialize(&self, frame: &Frame) -> Result<Bytes, FrameError> {
        let length = frame.length()?;
        let body = frame.body();

        let mut image = BytesMut::with_capacity(HEADER_SIZE + 1 + body.len() + 1 + CRC_SIZE);
        image.put_slice(&FRAME_HEADER);
        image.put_u8(length);
        image.put_slice(&body);
        let crc = crc16(&image[HEADER_SIZE..]);
        image.put_u8(self.config.checksum.compute(length, &body));
        if frame.crc {
            image.put_u16_le(crc);
        }
        Ok(image.freeze())
    }

    /// Verify header, remove stuffing, and return the unstuffed wire image.
    pub fn unstuff(&self, wire: &[u8]) -> Result<Bytes, FrameError> {
        let mut image = BytesMut::with_capacity(wire.len());
        match self.config.stuffing {
            StuffingScope::AfterHeader => {
                check_header(wire)?;
                image.put_slice(&wire[..HEADER_SIZE]);
                unstuff(&wire[HEADER_SIZE..], HEADER_SIZE, &mut image)?;
            }
            StuffingScope::WholeFrame => {
                unstuff(wire, 0, &mut image)?;
                check_header(&image)?;
            }
        }
        Ok(image.freeze())
    }

    /// Decode wire bytes, validating length, checksum and CRC.
    pub fn decode(&self, wire: &[u8]) -> Result<Frame, FrameError> {
        match self.decode_unverified(wire)? {
            (frame, None) => Ok(frame),
            (_, Some(err)) => Err(err),
        }
    }

    /// Decode a structurally sound frame, reporting (not failing on) checksum or CRC mismatches.
    pub fn decode_unverified(&self, wire: &[u8]) -> Result<(Frame, Option<FrameError>), FrameError> {
        let image = self.unstuff(wire)?;
        self.decode_image(&image)
    }

    /// Parse an already unstuffed wire image. Checksum and CRC mismatches are
    /// returned beside the frame; structural faults are errors.
    pub fn decode_image(&self, image: &[u8]) -> Result<(Frame, Option<FrameError>), FrameError> {
        if image.len() <= HEADER_SIZE {
            return Err(FrameError::TruncatedFrame {
                needed: HEADER_SIZE + 1,
                available: image.len(),
            });
        }
        let length = image[HEADER_SIZE];
        let declared = length as usize;
        if declared < LENGTH_OVERHEAD {
            return Err(FrameError::LengthMismatch {
                declared,
                expected: LENGTH_OVERHEAD,
            });
        }

        // one past the checksum byte
        let end = HEADER_SIZE + 1 + declared;
        if image.len() < end {
            return Err(FrameError::TruncatedFrame {
                needed: end,
                available: image.len(),
            });
        }

        let body = &image[HEADER_SIZE + 1..end - 1];
        let frame_type = FrameType::from_primitive(body[ADDRESS_ID_SIZE]);
        let has_crc = match image.len() - end {
            0 => false,
            CRC_SIZE => true,
            _ => {
                return Err(FrameError::LengthMismatch {
                    declared,
                    expected: image.len() - HEADER_SIZE - 1,
                });
            }
        };
        if !has_crc && self.config.crc_types.contains(&frame_type.code()) {
            return Err(FrameError::TruncatedFrame {
                needed: end + CRC_SIZE,
                available: image.len(),
            });
        }

        if body[2..ADDRESS_ID_SIZE].iter().any(|&b| b != 0) {
            trace!(address = %hex::encode(&body[..ADDRESS_ID_SIZE]), "non-zero reserved address bytes");
        }

        let frame = Frame {
            source: body[0],
            destination: body[1],
            frame_type,
            payload: Bytes::copy_from_slice(&body[ADDRESS_ID_SIZE + 1..]),
            crc: has_crc,
        };

        let expected = self.config.checksum.compute(length, body);
        let actual = image[end - 1];
        if expected != actual {
            return Ok((frame, Some(FrameError::ChecksumMismatch { expected, actual })));
        }

        if has_crc {
            let expected = crc16(&image[HEADER_SIZE..end - 1]);
            let actual = u16::from_le_bytes([image[end], image[end + 1]]);
            if expected != actual {
                return Ok((frame, Some(FrameError::CrcMismatch { expected, actual })));
            }
        }

        Ok((frame, None))
    }
}

fn check_header(bytes: &[u8]) -> Result<(), FrameError> {
    let n = bytes.len().min(HEADER_SIZE);
    if bytes[..n] != FRAME_HEADER[..n] {
        return Err(FrameError::HeaderMismatch {
            found: bytes[..n].to_vec(),
        });
    }
    if n < HEADER_SIZE {
        return Err(FrameError::TruncatedFrame {
            needed: HEADER_SIZE,
            available: n,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_power_up_ack_layout() {
        let codec = FrameCodec::default();
        let wire = codec.encode(FrameType::PowerUpAck, &[0x00], false).unwrap();
        // length = 7 + 1 + 1 + 1
        assert_eq!(
            wire.as_ref(),
            &[0xFF, 0xFF, 0x0A, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x61, 0x00, 0xAB]
        );
    }

    #[test]
    fn test_crc_is_little_endian_after_checksum() {
        let codec = FrameCodec::default();
        let frame = Frame::new(0x00, 0x40, FrameType::Control, vec![0x01]).with_crc();
        let image = codec.serialize(&frame).unwrap();
        let crc = crc16(&image[2..image.len() - 3]);
        assert_eq!(crc, frame.crc16().unwrap());
        assert_eq!(image[image.len() - 2], (crc & 0xFF) as u8);
        assert_eq!(image[image.len() - 1], (crc >> 8) as u8);
    }

    #[test]
    fn test_unstuff_rejects_dangling_ff() {
        let mut out = BytesMut::new();
        let err = unstuff(&[0x01, 0xFF], 2, &mut out).unwrap_err();
        assert_eq!(err, FrameError::InvalidEscape { offset: 3, found: None });
    }

    #[test]
    fn test_unstuff_rejects_wrong_stuffing_byte() {
        let mut out = BytesMut::new();
        let err = unstuff(&[0xFF, 0x54], 0, &mut out).unwrap_err();
        assert_eq!(
            err,
            FrameError::InvalidEscape {
                offset: 0,
                found: Some(0x54)
            }
        );
    }

    #[test]
    fn test_header_mismatch_on_marker() {
        let codec = FrameCodec::default();
        assert_eq!(
            codec.decode(&[0x00]).unwrap_err(),
            FrameError::HeaderMismatch { found: vec![0x00] }
        );
    }

    #[test]
    fn test_payload_too_large() {
        let codec = FrameCodec::default();
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            codec.encode(FrameType::StatusReport, &payload, false),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_type_catch_all() {
        assert_eq!(FrameType::from_primitive(0x12), FrameType::Authenticate);
        assert_eq!(FrameType::from_primitive(0x99), FrameType::Unknown(0x99));
        assert_eq!(FrameType::Unknown(0x99).code(), 0x99);
    }
}
