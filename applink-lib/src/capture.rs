//! Capture log ingest.
//!
//! A capture is a text log with one transmission per line:
//!
//! ```text
//! <device> <unix_timestamp> - <space-separated two-digit hex bytes>
//! ```
//!
//! Lines that do not have this shape are skipped and counted, never fatal.

use crate::error::{LineError, LinkError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::str::FromStr;
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

/// Which side of the link sent a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// The WiFi module controlling the appliance
    Modem,
    /// The appliance
    Machine,
}

impl Device {
    pub fn peer(self) -> Device {
        match self {
            Device::Modem => Device::Machine,
            Device::Machine => Device::Modem,
        }
    }
}

/// One parsed capture line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    /// 1-based line number in the source log
    pub line: usize,
    pub device: Device,
    /// Unix timestamp, seconds
    pub timestamp: u64,
    /// Bytes as transmitted (still stuffed)
    pub bytes: Bytes,
}

impl CaptureRecord {
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::try_from(self.timestamp).ok()?, 0)
    }

    pub fn hex_string(&self) -> String {
        hex::encode(&self.bytes)
    }
}

/// Parse one capture line into (device, timestamp, bytes).
pub fn parse_line(line: &str) -> Result<(Device, u64, Bytes), LineError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(LineError::Empty);
    }
    let (prefix, data) = line.split_once(" - ").ok_or(LineError::MissingSeparator)?;

    let mut fields = prefix.split_whitespace();
    let device_str = fields.next().unwrap_or_default();
    let device = Device::from_str(device_str).map_err(|_| LineError::UnknownDevice(device_str.to_string()))?;
    let ts_str = fields.next().unwrap_or_default();
    let timestamp = ts_str
        .parse::<u64>()
        .map_err(|_| LineError::InvalidTimestamp(ts_str.to_string()))?;
    if let Some(extra) = fields.next() {
        return Err(LineError::InvalidTimestamp(extra.to_string()));
    }

    let mut bytes = Vec::with_capacity(data.len() / 3 + 1);
    for token in data.split_whitespace() {
        if token.len() != 2 {
            return Err(LineError::InvalidHex(token.to_string()));
        }
        let mut byte = [0u8; 1];
        hex::decode_to_slice(token, &mut byte).map_err(|_| LineError::InvalidHex(token.to_string()))?;
        bytes.push(byte[0]);
    }
    if bytes.is_empty() {
        return Err(LineError::InvalidHex(String::new()));
    }

    Ok((device, timestamp, Bytes::from(bytes)))
}

/// Render a transmission in capture line format.
pub fn render_line(device: Device, timestamp: u64, bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{} {} - {}", device, timestamp, hex.join(" "))
}

/// All records of one capture log, plus what was skipped while reading it
#[derive(Debug, Clone, Default)]
pub struct Capture {
    records: Vec<CaptureRecord>,
    skipped: BTreeMap<&'static str, usize>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a whole capture held in memory
    pub fn parse(text: &str) -> Self {
        let mut capture = Self::new();
        for (idx, line) in text.lines().enumerate() {
            capture.push_line(idx + 1, line);
        }
        capture
    }

    /// Read a capture from any buffered reader. Only I/O failures are errors.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, LinkError> {
        let mut capture = Self::new();
        for (idx, line) in reader.lines().enumerate() {
            capture.push_line(idx + 1, &line?);
        }
        Ok(capture)
    }

    /// Parse and add one line; malformed lines are counted by reason
    pub fn push_line(&mut self, line_no: usize, line: &str) {
        match parse_line(line) {
            Ok((device, timestamp, bytes)) => self.records.push(CaptureRecord {
                line: line_no,
                device,
                timestamp,
                bytes,
            }),
            Err(LineError::Empty) => {}
            Err(e) => {
                warn!(line = line_no, "Skipping capture line: {}", e);
                *self.skipped.entry(e.kind()).or_insert(0) += 1;
            }
        }
    }

    pub fn push(&mut self, record: CaptureRecord) {
        self.records.push(record);
    }

    /// Stable sort by timestamp; records sharing a timestamp keep log order
    pub fn into_time_order(mut self) -> Self {
        if !self.records.is_sorted_by_key(|r| r.timestamp) {
            debug!("Capture out of time order, sorting {} records", self.records.len());
            self.records.sort_by_key(|r| r.timestamp);
        }
        self
    }

    pub fn records(&self) -> &[CaptureRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<CaptureRecord> {
        self.records
    }

    /// Malformed line counts keyed by reason
    pub fn skipped(&self) -> &BTreeMap<&'static str, usize> {
        &self.skipped
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records sent by `device`
    pub fn from_device(&self, device: Device) -> impl Iterator<Item = &CaptureRecord> {
        self.records.iter().filter(move |r| r.device == device)
    }
}
