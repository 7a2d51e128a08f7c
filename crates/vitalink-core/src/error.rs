//! Error types for vitalink-core.
//!
//! Errors fall into three scopes, and callers are expected to treat them
//! differently:
//!
//! | Scope | Variants | Effect |
//! |-------|----------|--------|
//! | Packet | [`Error::Malformed`], [`Error::CorruptPacket`] | Packet dropped, counter bumped, stream continues |
//! | Session | [`Error::Timeout`], [`Error::Disconnected`], [`Error::InvalidTransition`], discovery and transport errors | Session torn down, error surfaces once |
//! | Caller | [`Error::PermissionDenied`], [`Error::ScanAlreadyActive`], [`Error::SessionConflict`], [`Error::InvalidConfig`] | Returned immediately, nothing to tear down |
//!
//! End of a glucose transfer is not an error: decoders report it as
//! [`Decoded::EndOfTransfer`](vitalink_types::Decoded::EndOfTransfer).
//!
//! There is no retry layer. A session makes one connection attempt; callers
//! that want another attempt open a new session.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use vitalink_types::ParseError;

use crate::events::DisconnectReason;
use crate::session::{FailureKind, SessionState};
use crate::transport::PeripheralId;

/// Errors that can occur while discovering, connecting to, or reading from
/// health devices.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The platform refused to start a scan (missing Bluetooth permission,
    /// radio off).
    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    /// A scan is already running on this radio adapter somewhere in the process.
    #[error("A scan is already active")]
    ScanAlreadyActive,

    /// Another live session owns the peripheral.
    #[error("Peripheral {peripheral} is already owned by another session")]
    SessionConflict {
        /// The contested peripheral.
        peripheral: PeripheralId,
    },

    /// A session step exceeded its time budget.
    #[error("Session timed out in state {state} after {duration:?}")]
    Timeout {
        /// The state the session was in when the budget ran out.
        state: SessionState,
        /// The budget that was exceeded.
        duration: Duration,
    },

    /// A packet failed structural validation.
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// A packet failed checksum verification.
    #[error("Packet failed checksum verification")]
    CorruptPacket,

    /// The device dropped the connection unexpectedly.
    #[error("Device disconnected: {reason}")]
    Disconnected {
        /// Why the link went down, if known.
        reason: DisconnectReason,
    },

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// A session state change outside the allowed edges.
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// State before the attempted change.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// An operation that needs a streaming session was called in another state.
    #[error("Session is not streaming (state {state})")]
    NotStreaming {
        /// The session's current state.
        state: SessionState,
    },

    /// The named brand or model is not supported.
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// The device does not expose the expected service.
    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    /// The device does not expose a required characteristic.
    #[error("Characteristic not found: {uuid} (searched {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: Uuid,
        /// Number of services the device exposed.
        service_count: usize,
    },

    /// No matching device was found.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No Bluetooth adapter is available.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// Bluetooth Low Energy stack error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(btleplug::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a timeout error for a session state.
    pub fn timeout(state: SessionState, duration: Duration) -> Self {
        Self::Timeout { state, duration }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// True for errors that affect a single packet and leave the stream
    /// running.
    pub fn is_packet_scoped(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::CorruptPacket)
    }

    /// The failure kind a session records when this error ends it.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Disconnected { .. } => FailureKind::Disconnected,
            Self::InvalidTransition { .. } => FailureKind::InvalidTransition,
            Self::ServiceNotFound(_) | Self::CharacteristicNotFound { .. } => {
                FailureKind::Discovery
            }
            _ => FailureKind::Transport,
        }
    }

    /// Reinterpret a scan start failure as a permission problem.
    ///
    /// Platforms report a missing permission, a powered-off radio and a
    /// revoked grant in different ways; to callers they all mean the scan
    /// cannot run.
    pub(crate) fn into_permission_denied(self) -> Self {
        match self {
            Self::PermissionDenied(_) => self,
            other => Self::PermissionDenied(other.to_string()),
        }
    }
}

impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => {
                Error::PermissionDenied("the platform denied Bluetooth access".to_string())
            }
            other => Error::Bluetooth(other),
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::UnsupportedDevice(name) => Error::UnsupportedDevice(name),
            other => Error::Malformed(other.to_string()),
        }
    }
}

/// Result type alias using vitalink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
