//! The radio seam.
//!
//! Sessions and scans talk to BLE only through [`Transport`] and
//! [`TransportHandle`]. [`BtleTransport`](crate::BtleTransport) implements
//! them over btleplug; [`MockTransport`](crate::MockTransport) implements
//! them from a script for tests.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::events::EventSender;

/// Platform identifier of a peripheral.
///
/// This is a MAC address on Linux and Windows and a CoreBluetooth UUID on
/// macOS. It is stable for the lifetime of the adapter, not across hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wrap a platform identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One advertisement as seen by the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Advertising peripheral.
    pub peripheral_id: PeripheralId,
    /// Local name, if advertised.
    pub name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Advertisements of a running scan, in arrival order.
pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// Access to the BLE radio.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifies the radio adapter behind this transport.
    ///
    /// Every central in the process whose transport reports the same key
    /// shares one scan slot and one set of owned peripherals.
    fn adapter_key(&self) -> &str;

    /// Start scanning for peripherals advertising any of `services`.
    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream>;

    /// Stop a running scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a peripheral. Notifications and link loss are delivered
    /// through `events` until the handle disconnects.
    async fn connect(
        &self,
        peripheral: &PeripheralId,
        events: EventSender,
    ) -> Result<Box<dyn TransportHandle>>;

    /// Tear down whatever a [`connect`](Self::connect) call that was
    /// dropped before returning may have left behind.
    async fn cancel_connect(&self, peripheral: &PeripheralId) -> Result<()>;
}

/// A live connection to one peripheral.
///
/// Dropping a handle without calling [`disconnect`](Self::disconnect) must
/// not leak the connection; implementations disconnect on a best-effort basis.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// The connected peripheral.
    fn peripheral_id(&self) -> &PeripheralId;

    /// Discover the primary services.
    async fn discover_services(&mut self) -> Result<Vec<Uuid>>;

    /// Characteristics of a discovered service.
    async fn discover_characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>>;

    /// Enable or disable notifications on a characteristic.
    async fn set_notify(&mut self, characteristic: Uuid, enabled: bool) -> Result<()>;

    /// Read a characteristic value.
    async fn read_value(&mut self, characteristic: Uuid) -> Result<Bytes>;

    /// Write a characteristic value with response.
    async fn write_value(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Close the connection.
    async fn disconnect(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id() {
        let id = PeripheralId::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            "\"AA:BB:CC:DD:EE:FF\""
        );
    }
}
