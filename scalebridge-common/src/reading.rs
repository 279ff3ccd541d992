//! The JSON envelope published for every reading taken from the device.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Timestamp layout used in published payloads and session displays.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single reading as it appears on the broker topic.
///
/// Serializes to `{"timestamp":"2024-05-01 12:00:00","weight":"12.5 kg"}`.
/// The weight is the raw text framed from the device; no unit parsing is
/// attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Local wall-clock arrival time, formatted with [`TIMESTAMP_FORMAT`].
    pub timestamp: String,

    /// Raw message text.
    pub weight: String,
}

impl Reading {
    /// Build a reading from its arrival time and text.
    pub fn new(at: &DateTime<Local>, weight: impl Into<String>) -> Self {
        Self {
            timestamp: format_timestamp(at),
            weight: weight.into(),
        }
    }

    /// Encode as the UTF-8 JSON payload.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    /// Decode a payload produced by [`Reading::to_payload`].
    pub fn from_payload(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(Error::from)
    }
}

/// Format a timestamp the way payloads and session info display it.
pub fn format_timestamp(at: &DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}
