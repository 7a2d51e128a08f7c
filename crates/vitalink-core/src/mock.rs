//! Scripted transport for testing.
//!
//! [`MockTransport`] stands in for the radio. Tests register
//! [`MockPeripheral`]s, each with the notifications it will send once
//! subscribed, and afterwards inspect every call the session layer made
//! through [`MockTransport::calls`].
//!
//! # Features
//!
//! - **Scripted advertisements**: every added peripheral advertises once per scan
//! - **Failure injection**: deny scans, or stall any connection step forever
//! - **Adapter identity**: each [`MockTransport::new`] is a separate radio
//! - **Call log**: ordering assertions over subscribe, unsubscribe and disconnect
//!
//! # Example
//!
//! ```
//! use vitalink_core::{Central, MockPeripheral, MockTransport, ReadingPipeline};
//! use vitalink_types::DeviceModel;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = MockTransport::new();
//!     transport.add(
//!         MockPeripheral::new(DeviceModel::OmronEvolv.descriptor())
//!             .notify(vec![0x00, 0x78, 0x00, 0x50, 0x00, 0x5D, 0x00])
//!             .disconnect_after_notifications(),
//!     );
//!
//!     let pipeline = ReadingPipeline::new(Central::new(transport));
//!     let readings: Vec<_> = pipeline
//!         .read(DeviceModel::OmronEvolv.descriptor())
//!         .collect()
//!         .await;
//!     assert_eq!(readings.len(), 1);
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use uuid::Uuid;

use vitalink_types::{DeviceDescriptor, RawPacket};

use crate::error::{Error, Result};
use crate::events::{DisconnectReason, EventSender, SessionEvent};
use crate::transport::{
    Advertisement, AdvertisementStream, PeripheralId, Transport, TransportHandle,
};

/// One call made through the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(PeripheralId),
    CancelConnect(PeripheralId),
    DiscoverServices,
    DiscoverCharacteristics(Uuid),
    SetNotify { characteristic: Uuid, enabled: bool },
    ReadValue(Uuid),
    WriteValue { characteristic: Uuid, value: Vec<u8> },
    Disconnect,
}

/// A connection step that can be made to hang.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockStep {
    Connect,
    DiscoverServices,
    DiscoverCharacteristics,
    /// Enabling notifications. Disabling never stalls.
    Subscribe,
    WriteValue,
    Disconnect,
}

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    id: PeripheralId,
    descriptor: &'static DeviceDescriptor,
    name: Option<String>,
    rssi: Option<i16>,
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
    notifications: Vec<Bytes>,
    disconnect_after: bool,
    stall: Option<MockStep>,
    values: HashMap<Uuid, Bytes>,
}

impl MockPeripheral {
    /// A peripheral that exposes the full GATT profile of `descriptor` and
    /// advertises a matching name.
    pub fn new(descriptor: &'static DeviceDescriptor) -> Self {
        let profile = descriptor.profile();
        let code = descriptor
            .identification_codes
            .first()
            .copied()
            .unwrap_or(descriptor.display_name);
        let mut characteristics = vec![profile.measurement];
        characteristics.extend(profile.control.map(|control| control.characteristic));

        Self {
            id: PeripheralId::new(format!("MOCK-{:06X}", rand::random::<u32>() % 0xFFFFFF)),
            descriptor,
            name: Some(format!("{code}{:04}", rand::random::<u16>() % 10_000)),
            rssi: Some(-55),
            services: vec![profile.service],
            characteristics,
            notifications: Vec::new(),
            disconnect_after: false,
            stall: None,
            values: HashMap::new(),
        }
    }

    /// Use a fixed peripheral id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<PeripheralId>) -> Self {
        self.id = id.into();
        self
    }

    /// Advertise `name` (or nothing).
    #[must_use]
    pub fn named(mut self, name: Option<&str>) -> Self {
        self.name = name.map(str::to_string);
        self
    }

    #[must_use]
    pub fn rssi(mut self, rssi: Option<i16>) -> Self {
        self.rssi = rssi;
        self
    }

    /// Replace the exposed services.
    #[must_use]
    pub fn services(mut self, services: Vec<Uuid>) -> Self {
        self.services = services;
        self
    }

    /// Replace the exposed characteristics.
    #[must_use]
    pub fn characteristics(mut self, characteristics: Vec<Uuid>) -> Self {
        self.characteristics = characteristics;
        self
    }

    /// Queue a measurement notification, sent when notifications are enabled.
    #[must_use]
    pub fn notify(mut self, value: impl Into<Bytes>) -> Self {
        self.notifications.push(value.into());
        self
    }

    /// Queue several measurement notifications.
    #[must_use]
    pub fn notify_all<I, B>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.notifications.extend(values.into_iter().map(Into::into));
        self
    }

    /// Drop the link right after the queued notifications.
    #[must_use]
    pub fn disconnect_after_notifications(mut self) -> Self {
        self.disconnect_after = true;
        self
    }

    /// Never complete `step`.
    #[must_use]
    pub fn stall(mut self, step: MockStep) -> Self {
        self.stall = Some(step);
        self
    }

    /// Value returned by reads of `characteristic`.
    #[must_use]
    pub fn value(mut self, characteristic: Uuid, value: impl Into<Bytes>) -> Self {
        self.values.insert(characteristic, value.into());
        self
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    pub fn descriptor(&self) -> &'static DeviceDescriptor {
        self.descriptor
    }

    /// The advertisement this peripheral sends during a scan.
    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            peripheral_id: self.id.clone(),
            name: self.name.clone(),
            services: vec![self.descriptor.service()],
            rssi: self.rssi,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    advertisements: Vec<Advertisement>,
    peripherals: HashMap<PeripheralId, MockPeripheral>,
    connected: HashSet<PeripheralId>,
    deny_scan: bool,
    stall_scan: bool,
    finite_scan: bool,
}

/// A transport driven by a script.
///
/// Clones share the script, the call log and the adapter key, so centrals
/// built over clones contend for the same radio.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    calls: Arc<Mutex<Vec<TransportCall>>>,
    key: Arc<str>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            calls: Arc::default(),
            key: format!("mock:{}", Uuid::new_v4()).into(),
        }
    }

    /// Register a peripheral and script its advertisement.
    pub fn add(&self, peripheral: MockPeripheral) -> PeripheralId {
        let id = peripheral.id.clone();
        let mut state = lock(&self.state);
        state.advertisements.push(peripheral.advertisement());
        state.peripherals.insert(id.clone(), peripheral);
        id
    }

    /// Script an extra advertisement, e.g. a repeat or a non-matching one.
    pub fn advertise(&self, advertisement: Advertisement) {
        lock(&self.state).advertisements.push(advertisement);
    }

    /// Refuse to start scans, as a platform without Bluetooth permission does.
    pub fn deny_scan(&self) {
        lock(&self.state).deny_scan = true;
    }

    /// Never complete a scan start.
    pub fn stall_scan(&self) {
        lock(&self.state).stall_scan = true;
    }

    /// End the advertisement stream after the scripted advertisements instead
    /// of idling.
    pub fn finite_scan(&self) {
        lock(&self.state).finite_scan = true;
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Whether the radio holds a link to `peripheral`.
    pub fn is_connected(&self, peripheral: &PeripheralId) -> bool {
        lock(&self.state).connected.contains(peripheral)
    }

    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn adapter_key(&self) -> &str {
        &self.key
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream> {
        self.record(TransportCall::StartScan(services.to_vec()));
        let (advertisements, finite, stall) = {
            let state = lock(&self.state);
            if state.deny_scan {
                return Err(Error::PermissionDenied("mock scan denied".to_string()));
            }
            (state.advertisements.clone(), state.finite_scan, state.stall_scan)
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let scripted = stream::iter(advertisements);
        if finite {
            Ok(scripted.boxed())
        } else {
            Ok(scripted.chain(stream::pending()).boxed())
        }
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(TransportCall::StopScan);
        Ok(())
    }

    async fn connect(
        &self,
        peripheral: &PeripheralId,
        events: EventSender,
    ) -> Result<Box<dyn TransportHandle>> {
        self.record(TransportCall::Connect(peripheral.clone()));
        let script = lock(&self.state)
            .peripherals
            .get(peripheral)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(peripheral.to_string()))?;
        // The link is up before the call returns, as on a real radio.
        lock(&self.state).connected.insert(peripheral.clone());
        stall_at(&script, MockStep::Connect).await;

        Ok(Box::new(MockHandle {
            transport: self.clone(),
            script,
            events,
        }))
    }

    async fn cancel_connect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.record(TransportCall::CancelConnect(peripheral.clone()));
        lock(&self.state).connected.remove(peripheral);
        Ok(())
    }
}

/// A connection to a [`MockPeripheral`].
struct MockHandle {
    transport: MockTransport,
    script: MockPeripheral,
    events: EventSender,
}

impl MockHandle {
    fn require(&self, characteristic: Uuid) -> Result<()> {
        if self.script.characteristics.contains(&characteristic) {
            Ok(())
        } else {
            Err(Error::CharacteristicNotFound {
                uuid: characteristic,
                service_count: self.script.services.len(),
            })
        }
    }

    fn replay(&self, characteristic: Uuid) {
        for value in &self.script.notifications {
            let _ = self.events.send(SessionEvent::Notification {
                characteristic,
                packet: RawPacket::new(value.clone()),
            });
        }
        if self.script.disconnect_after {
            let _ = self.events.send(SessionEvent::Disconnected {
                reason: DisconnectReason::RemoteClosed,
            });
        }
    }
}

#[async_trait]
impl TransportHandle for MockHandle {
    fn peripheral_id(&self) -> &PeripheralId {
        &self.script.id
    }

    async fn discover_services(&mut self) -> Result<Vec<Uuid>> {
        self.transport.record(TransportCall::DiscoverServices);
        stall_at(&self.script, MockStep::DiscoverServices).await;
        Ok(self.script.services.clone())
    }

    async fn discover_characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>> {
        self.transport
            .record(TransportCall::DiscoverCharacteristics(service));
        stall_at(&self.script, MockStep::DiscoverCharacteristics).await;
        if !self.script.services.contains(&service) {
            return Err(Error::ServiceNotFound(service));
        }
        Ok(self.script.characteristics.clone())
    }

    async fn set_notify(&mut self, characteristic: Uuid, enabled: bool) -> Result<()> {
        self.transport.record(TransportCall::SetNotify {
            characteristic,
            enabled,
        });
        self.require(characteristic)?;
        if enabled {
            stall_at(&self.script, MockStep::Subscribe).await;
            if characteristic == self.script.descriptor.profile().measurement {
                self.replay(characteristic);
            }
        }
        Ok(())
    }

    async fn read_value(&mut self, characteristic: Uuid) -> Result<Bytes> {
        self.transport.record(TransportCall::ReadValue(characteristic));
        self.script
            .values
            .get(&characteristic)
            .cloned()
            .ok_or(Error::CharacteristicNotFound {
                uuid: characteristic,
                service_count: self.script.services.len(),
            })
    }

    async fn write_value(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.transport.record(TransportCall::WriteValue {
            characteristic,
            value: value.to_vec(),
        });
        self.require(characteristic)?;
        stall_at(&self.script, MockStep::WriteValue).await;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.transport.record(TransportCall::Disconnect);
        stall_at(&self.script, MockStep::Disconnect).await;
        lock(&self.transport.state).connected.remove(&self.script.id);
        Ok(())
    }
}

async fn stall_at(script: &MockPeripheral, step: MockStep) {
    if script.stall == Some(step) {
        std::future::pending::<()>().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
