//! btleplug implementation of the transport seam.

use std::collections::HashMap;

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId as PlatformId};
use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vitalink_types::RawPacket;

use crate::error::{Error, Result};
use crate::events::{DisconnectReason, EventSender, SessionEvent};
use crate::transport::{
    Advertisement, AdvertisementStream, PeripheralId, Transport, TransportHandle,
};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

/// Format a platform peripheral id as a string.
///
/// CoreBluetooth ids are UUIDs; BlueZ and WinRT ids are addresses. Either
/// way the `Debug` form wraps the useful part in `PeripheralId(..)`.
pub fn format_peripheral_id(id: &PlatformId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Transport over a system Bluetooth adapter.
#[derive(Debug, Clone)]
pub struct BtleTransport {
    adapter: Adapter,
    key: String,
}

impl BtleTransport {
    /// Use the first system adapter.
    pub async fn new() -> Result<Self> {
        Self::with_adapter(get_adapter().await?).await
    }

    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let key = format!("btle:{}", adapter.adapter_info().await?);
        Ok(Self { adapter, key })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find_peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| format_peripheral_id(&p.id()) == id.as_str())
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))
    }
}

async fn advertisement(adapter: &Adapter, id: &PlatformId) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    Some(Advertisement {
        peripheral_id: PeripheralId::new(format_peripheral_id(id)),
        name: properties.local_name,
        services: properties.services,
        rssi: properties.rssi,
    })
}

#[async_trait]
impl Transport for BtleTransport {
    fn adapter_key(&self) -> &str {
        &self.key
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream> {
        // Subscribe before scanning so no early advertisement is missed.
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;

        let adapter = self.adapter.clone();
        let advertisements = events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    match event {
                        CentralEvent::DeviceDiscovered(id)
                        | CentralEvent::DeviceUpdated(id)
                        | CentralEvent::ServicesAdvertisement { id, .. } => {
                            advertisement(&adapter, &id).await
                        }
                        _ => None,
                    }
                }
            })
            .boxed();
        Ok(advertisements)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(peripheral = %peripheral_id))]
    async fn connect(
        &self,
        peripheral_id: &PeripheralId,
        events: EventSender,
    ) -> Result<Box<dyn TransportHandle>> {
        let peripheral = self.find_peripheral(peripheral_id).await?;
        let mut central_events = self.adapter.events().await?;

        info!("Connecting to device...");
        peripheral.connect().await?;
        info!("Connected!");

        let target = peripheral.id();
        let link_events = events.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event
                    && id == target
                {
                    debug!("Link lost");
                    let _ = link_events.send(SessionEvent::Disconnected {
                        reason: DisconnectReason::Unknown,
                    });
                    break;
                }
            }
        });

        Ok(Box::new(BtleHandle {
            id: peripheral_id.clone(),
            peripheral,
            characteristics: HashMap::new(),
            service_count: 0,
            events,
            tasks: vec![watcher],
            notifying: false,
            disconnected: false,
        }))
    }

    async fn cancel_connect(&self, peripheral_id: &PeripheralId) -> Result<()> {
        let peripheral = self.find_peripheral(peripheral_id).await?;
        // The platform may still complete a connect whose future was dropped.
        info!(peripheral = %peripheral_id, "Cancelling connect");
        peripheral.disconnect().await?;
        Ok(())
    }
}

/// A connected btleplug peripheral.
pub struct BtleHandle {
    id: PeripheralId,
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    service_count: usize,
    events: EventSender,
    /// Link watcher and notification forwarder, aborted on disconnect.
    tasks: Vec<JoinHandle<()>>,
    notifying: bool,
    disconnected: bool,
}

impl BtleHandle {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or(Error::CharacteristicNotFound {
                uuid,
                service_count: self.service_count,
            })
    }

    /// Forward every value notification into the session's channel.
    async fn start_forwarding(&mut self) -> Result<()> {
        if self.notifying {
            return Ok(());
        }
        let mut notifications = self.peripheral.notifications().await?;
        let events = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = SessionEvent::Notification {
                    characteristic: notification.uuid,
                    packet: RawPacket::new(notification.value),
                };
                if events.send(event).is_err() {
                    debug!("Session gone, stopping notification forwarding");
                    break;
                }
            }
        }));
        self.notifying = true;
        Ok(())
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl TransportHandle for BtleHandle {
    fn peripheral_id(&self) -> &PeripheralId {
        &self.id
    }

    async fn discover_services(&mut self) -> Result<Vec<Uuid>> {
        self.peripheral.discover_services().await?;

        let services = self.peripheral.services();
        self.service_count = services.len();
        self.characteristics.clear();
        for service in &services {
            debug!("  Service: {}", service.uuid);
            for characteristic in &service.characteristics {
                self.characteristics
                    .insert(characteristic.uuid, characteristic.clone());
            }
        }
        debug!(
            "Cached {} characteristics for fast lookup",
            self.characteristics.len()
        );
        Ok(services.iter().map(|service| service.uuid).collect())
    }

    async fn discover_characteristics(&mut self, service: Uuid) -> Result<Vec<Uuid>> {
        let characteristics: Vec<Uuid> = self
            .characteristics
            .values()
            .filter(|characteristic| characteristic.service_uuid == service)
            .map(|characteristic| characteristic.uuid)
            .collect();
        if characteristics.is_empty() {
            return Err(Error::ServiceNotFound(service));
        }
        Ok(characteristics)
    }

    async fn set_notify(&mut self, characteristic: Uuid, enabled: bool) -> Result<()> {
        let target = self.characteristic(characteristic)?.clone();
        if enabled {
            self.start_forwarding().await?;
            self.peripheral.subscribe(&target).await?;
        } else {
            self.peripheral.unsubscribe(&target).await?;
        }
        Ok(())
    }

    async fn read_value(&mut self, characteristic: Uuid) -> Result<Bytes> {
        let target = self.characteristic(characteristic)?;
        let value = self.peripheral.read(target).await?;
        Ok(Bytes::from(value))
    }

    async fn write_value(&mut self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .write(target, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.abort_tasks();
        self.disconnected = true;
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BtleHandle {
    fn drop(&mut self) {
        self.abort_tasks();
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        let peripheral = self.peripheral.clone();
        let id = self.id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(peripheral = %id, error = %e, "Best-effort disconnect failed");
                } else {
                    debug!(peripheral = %id, "Best-effort disconnect completed");
                }
            });
        } else {
            warn!(peripheral = %self.id, "No tokio runtime available for disconnect in drop");
        }
    }
}
