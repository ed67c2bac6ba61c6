//! Analyzer configuration, loaded from JSON.
//!
//! Every field has a default, so a config file only names what it changes:
//!
//! ```json
//! { "codec": { "checksum": "length_counted_twice" }, "validation": "lenient" }
//! ```

use crate::auth::AuthConfig;
use crate::constants::{CHALLENGE_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::LinkError;
use crate::frame::CodecConfig;
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// What happens to frames that are well formed but fail checksum or CRC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    /// Skip and count them
    #[default]
    Strict,
    /// Keep them, flagged as unverified
    Lenient,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub codec: CodecConfig,
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub validation: Validation,
}

impl AnalyzerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, LinkError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| LinkError::Config(format!("Failed to open {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no capture could satisfy
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.auth.challenge_offset + CHALLENGE_SIZE > MAX_PAYLOAD_SIZE {
            return Err(LinkError::Config(format!(
                "challenge_offset {} leaves no room for a challenge in a {}-byte payload",
                self.auth.challenge_offset, MAX_PAYLOAD_SIZE
            )));
        }
        if self.session.idle_gap_secs == Some(0) {
            return Err(LinkError::Config(
                "idle_gap_secs must be positive; use null to disable gap splitting".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumPolicy;
    use crate::frame::StuffingScope;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = AnalyzerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, AnalyzerConfig::default());
        assert_eq!(config.session.pairing_window_secs, 5);
        assert_eq!(config.session.idle_gap_secs, Some(30));
        assert_eq!(config.auth.slow_response_secs, 30);
    }

    #[test]
    fn test_partial_override() {
        let json = r#"{
            "codec": { "checksum": "length_counted_twice", "stuffing": "whole_frame", "crc_types": [18] },
            "session": { "idle_gap_secs": null },
            "validation": "lenient"
        }"#;
        let config = AnalyzerConfig::from_json_str(json).unwrap();
        assert_eq!(config.codec.checksum, ChecksumPolicy::LengthCountedTwice);
        assert_eq!(config.codec.stuffing, StuffingScope::WholeFrame);
        assert_eq!(config.codec.crc_types, vec![0x12]);
        assert_eq!(config.codec.destination, 0x40);
        assert_eq!(config.session.idle_gap_secs, None);
        assert_eq!(config.session.pairing_window_secs, 5);
        assert_eq!(config.validation, Validation::Lenient);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            AnalyzerConfig::from_json_str(r#"{"auth": {"challenge_offset": 240}}"#),
            Err(LinkError::Config(_))
        ));
        assert!(matches!(
            AnalyzerConfig::from_json_str(r#"{"session": {"idle_gap_secs": 0}}"#),
            Err(LinkError::Config(_))
        ));
        assert!(matches!(
            AnalyzerConfig::from_json_str(r#"{"validation": "sloppy"}"#),
            Err(LinkError::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AnalyzerConfig::from_json_file("/nonexistent/applink.json"),
            Err(LinkError::Config(_))
        ));
    }
}
