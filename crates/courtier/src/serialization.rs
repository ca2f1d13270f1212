//! Payload serialization over the three named formats.
//!
//! Binary is the default for wire transport; text and structured markup
//! exist for debugging and interoperability. All helpers go through serde,
//! so any payload with the usual derives works with all three.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error types for payload serialization.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("text serialization failed: {0}")]
    Text(#[from] serde_json::Error),
    #[error("markup serialization failed: {0}")]
    Xml(String),
    #[error("binary serialization failed: {0}")]
    Binary(#[from] bincode::Error),
}

/// The named serialization formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerializationMode {
    /// JSON text.
    Text,
    /// XML markup.
    Xml,
    /// Compact binary; the wire default.
    #[default]
    Binary,
}

impl fmt::Display for SerializationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Xml => "xml",
            Self::Binary => "binary",
        })
    }
}

/// Error for unrecognized mode names in configuration input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown serialization mode {0:?} (expected text, xml or binary)")]
pub struct UnknownMode(pub String);

impl FromStr for SerializationMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "xml" => Ok(Self::Xml),
            "binary" => Ok(Self::Binary),
            other => Err(UnknownMode(other.to_owned())),
        }
    }
}

/// Serializes a payload in the given mode.
pub fn to_bytes<T: Serialize>(
    payload: &T,
    mode: SerializationMode,
) -> Result<Vec<u8>, SerializationError> {
    match mode {
        SerializationMode::Text => Ok(serde_json::to_vec(payload)?),
        SerializationMode::Xml => quick_xml::se::to_string(payload)
            .map(String::into_bytes)
            .map_err(|e| SerializationError::Xml(e.to_string())),
        SerializationMode::Binary => Ok(bincode::serialize(payload)?),
    }
}

/// Deserializes a payload in the given mode.
pub fn from_bytes<T: DeserializeOwned>(
    bytes: &[u8],
    mode: SerializationMode,
) -> Result<T, SerializationError> {
    match mode {
        SerializationMode::Text => Ok(serde_json::from_slice(bytes)?),
        SerializationMode::Xml => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| SerializationError::Xml(e.to_string()))?;
            quick_xml::de::from_str(text).map_err(|e| SerializationError::Xml(e.to_string()))
        }
        SerializationMode::Binary => Ok(bincode::deserialize(bytes)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        value: f64,
        label: String,
    }

    #[test]
    fn every_mode_round_trips() {
        let sample = Sample {
            value: 2.75,
            label: "probe".into(),
        };
        for mode in [
            SerializationMode::Text,
            SerializationMode::Xml,
            SerializationMode::Binary,
        ] {
            let bytes = to_bytes(&sample, mode).unwrap();
            let back: Sample = from_bytes(&bytes, mode).unwrap();
            assert_eq!(back, sample, "mode {mode}");
        }
    }

    #[test]
    fn garbage_fails_to_deserialize() {
        let garbage = [0xde, 0xad, 0xbe, 0xef];
        assert!(from_bytes::<Sample>(&garbage, SerializationMode::Text).is_err());
    }

    #[test]
    fn mode_names_parse() {
        assert_eq!("binary".parse(), Ok(SerializationMode::Binary));
        assert!("yaml".parse::<SerializationMode>().is_err());
    }
}
