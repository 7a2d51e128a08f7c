//! Inbound session events.
//!
//! Transport callbacks (notifications, link loss) arrive on tasks the
//! transport owns. They reach a [`Session`](crate::Session) through one
//! bounded broadcast channel per session. Senders never block: when the
//! session falls behind, the oldest events are overwritten and the receiver
//! learns how many it lost.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use vitalink_types::RawPacket;

/// Default capacity of a session's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 32;

/// Events delivered by a transport handle to its session.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SessionEvent {
    /// A characteristic value notification.
    Notification {
        /// The characteristic that notified.
        characteristic: Uuid,
        /// Value bytes with their receipt time.
        packet: RawPacket,
    },
    /// The link went down.
    Disconnected {
        /// Why, if the platform said.
        reason: DisconnectReason,
    },
}

/// Reason for disconnection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The device closed the link.
    RemoteClosed,
    /// Device went out of range.
    OutOfRange,
    /// BLE error occurred.
    BleError(String),
    /// Unknown reason.
    Unknown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => write!(f, "closed by device"),
            Self::OutOfRange => write!(f, "device out of range"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Sender half handed to a transport on connect.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver half kept by the session.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Create a new event channel with the given capacity.
///
/// The channel rounds `capacity` up to a power of two.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
