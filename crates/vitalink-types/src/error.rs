//! Error types for packet parsing in vitalink-types.

use thiserror::Error;

/// Errors that can occur when decoding device data.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in vitalink-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The payload is structurally invalid (inconsistent flags, bad framing, bad date).
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// The payload is shorter than its layout requires.
    #[error("Truncated packet: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Number of bytes the layout requires.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// The brand or model name is not part of the device catalog.
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),
}

impl ParseError {
    /// Create a malformed packet error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

/// Result type alias using vitalink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
