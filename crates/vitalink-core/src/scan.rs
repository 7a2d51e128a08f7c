//! Device discovery.
//!
//! A scan looks for one catalog entry. An advertisement matches when it lists
//! the entry's service UUID and its name contains one of the entry's
//! identification codes. Each peripheral is reported at most once per scan.
//!
//! Scans are lazy: the radio starts scanning on the first poll of the
//! [`ScanStream`], and keeps scanning until the stream is stopped or dropped.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use vitalink_types::DeviceDescriptor;

use crate::error::Result;
use crate::guard::ScanSlot;
use crate::transport::{Advertisement, AdvertisementStream, PeripheralId, Transport};

/// A peripheral that matched a catalog entry.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Key for connecting.
    pub peripheral_id: PeripheralId,
    /// The catalog entry it matched.
    pub descriptor: &'static DeviceDescriptor,
    /// Advertised name.
    pub name: Option<String>,
    /// Signal strength when first seen.
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Build a device record without scanning, e.g. from a stored pairing.
    pub fn new(
        peripheral_id: impl Into<PeripheralId>,
        descriptor: &'static DeviceDescriptor,
    ) -> Self {
        Self {
            peripheral_id: peripheral_id.into(),
            descriptor,
            name: None,
            rssi: None,
        }
    }
}

/// Whether an advertisement belongs to a catalog entry.
///
/// Requires both the entry's service UUID and a case-insensitive
/// identification code match on the advertised name. Unnamed advertisements
/// never match.
pub fn matches(descriptor: &DeviceDescriptor, advertisement: &Advertisement) -> bool {
    advertisement.services.contains(&descriptor.service())
        && advertisement
            .name
            .as_deref()
            .is_some_and(|name| descriptor.matches_name(name))
}

enum ScanPhase {
    Pending,
    Active {
        advertisements: AdvertisementStream,
        seen: HashSet<PeripheralId>,
    },
    Finished,
}

/// Stream of devices matching one catalog entry.
///
/// Yields `Ok` for each newly seen matching peripheral. If the radio refuses
/// to scan, yields one [`Error::PermissionDenied`](crate::Error::PermissionDenied)
/// and ends.
pub struct ScanStream {
    inner: BoxStream<'static, Result<DiscoveredDevice>>,
    transport: Arc<dyn Transport>,
    started: Arc<AtomicBool>,
    slot: Option<ScanSlot>,
}

impl ScanStream {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        descriptor: &'static DeviceDescriptor,
        slot: ScanSlot,
    ) -> Self {
        let started = Arc::new(AtomicBool::new(false));
        let inner = {
            let transport = Arc::clone(&transport);
            let started = Arc::clone(&started);
            stream::unfold(ScanPhase::Pending, move |phase| {
                let transport = Arc::clone(&transport);
                let started = Arc::clone(&started);
                async move {
                    let (mut advertisements, mut seen) = match phase {
                        ScanPhase::Pending => {
                            // Set before awaiting: a stream dropped mid-start
                            // must still stop whatever the radio began.
                            started.store(true, Ordering::Release);
                            match transport.start_scan(&[descriptor.service()]).await {
                                Ok(advertisements) => {
                                    info!(device = %descriptor, "Scan started");
                                    (advertisements, HashSet::new())
                                }
                                Err(err) => {
                                    started.store(false, Ordering::Release);
                                    warn!(error = %err, "Failed to start scan");
                                    let err = err.into_permission_denied();
                                    return Some((Err(err), ScanPhase::Finished));
                                }
                            }
                        }
                        ScanPhase::Active {
                            advertisements,
                            seen,
                        } => (advertisements, seen),
                        ScanPhase::Finished => return None,
                    };

                    while let Some(advertisement) = advertisements.next().await {
                        if !matches(descriptor, &advertisement) {
                            trace!(
                                peripheral = %advertisement.peripheral_id,
                                "Ignoring advertisement"
                            );
                            continue;
                        }
                        if !seen.insert(advertisement.peripheral_id.clone()) {
                            continue;
                        }
                        debug!(
                            peripheral = %advertisement.peripheral_id,
                            name = ?advertisement.name,
                            rssi = ?advertisement.rssi,
                            "Discovered device"
                        );
                        let device = DiscoveredDevice {
                            peripheral_id: advertisement.peripheral_id,
                            descriptor,
                            name: advertisement.name,
                            rssi: advertisement.rssi,
                        };
                        return Some((
                            Ok(device),
                            ScanPhase::Active {
                                advertisements,
                                seen,
                            },
                        ));
                    }
                    debug!("Advertisement stream ended");
                    None
                }
            })
            .boxed()
        };

        Self {
            inner,
            transport,
            started,
            slot: Some(slot),
        }
    }

    /// Stop the radio scan and release the central's scan slot.
    ///
    /// Both have happened by the time this returns, even if stopping the
    /// radio fails.
    pub async fn stop(mut self) -> Result<()> {
        let result = if self.started.swap(false, Ordering::AcqRel) {
            self.transport.stop_scan().await
        } else {
            Ok(())
        };
        self.slot.take();
        info!("Scan stopped");
        result
    }
}

impl Stream for ScanStream {
    type Item = Result<DiscoveredDevice>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.slot.take();
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = transport.stop_scan().await {
                    warn!("Failed to stop scan in drop: {}", e);
                }
            });
        } else {
            warn!("No tokio runtime available to stop scan in drop");
        }
    }
}

impl std::fmt::Debug for ScanStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanStream")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("holds_slot", &self.slot.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Central, MockTransport, TransportCall};
    use vitalink_types::{DeviceModel, uuid};

    fn advert(name: Option<&str>, services: Vec<::uuid::Uuid>) -> Advertisement {
        Advertisement {
            peripheral_id: PeripheralId::new("AA"),
            name: name.map(str::to_string),
            services,
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_matches_requires_service_and_name() {
        let omron = DeviceModel::OmronEvolv.descriptor();
        let bp = vec![uuid::BLOOD_PRESSURE_SERVICE];

        assert!(matches(omron, &advert(Some("BLEsmart_00000116"), bp.clone())));
        assert!(matches(omron, &advert(Some("blesmart_0001"), bp.clone())));
        // Right name, wrong service.
        assert!(!matches(
            omron,
            &advert(Some("BLEsmart_0001"), vec![uuid::GLUCOSE_SERVICE])
        ));
        // Right service, unknown name.
        assert!(!matches(omron, &advert(Some("Polar H10"), bp.clone())));
        assert!(!matches(omron, &advert(None, bp)));
    }

    #[test]
    fn test_matches_glucose() {
        let contour = DeviceModel::ContourNextOne.descriptor();
        let advertisement = advert(Some("Contour7830H"), vec![uuid::GLUCOSE_SERVICE]);
        assert!(matches(contour, &advertisement));
        assert!(!matches(DeviceModel::AccuChekGuide.descriptor(), &advertisement));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_while_starting_still_stops_scan() {
        let transport = MockTransport::new();
        transport.stall_scan();
        let central = Central::new(transport.clone());

        let mut scan = central.scan(DeviceModel::OmronEvolv.descriptor()).unwrap();
        let first = tokio::time::timeout(std::time::Duration::from_secs(1), scan.next()).await;
        assert!(first.is_err());
        drop(scan);
        assert!(!central.is_scanning());

        for _ in 0..10 {
            if transport.calls().contains(&TransportCall::StopScan) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::StartScan(vec![uuid::BLOOD_PRESSURE_SERVICE]),
                TransportCall::StopScan,
            ]
        );
    }

    #[test]
    fn test_discovered_device_new() {
        let device = DiscoveredDevice::new("AA:BB", DeviceModel::AndUa651.descriptor());
        assert_eq!(device.peripheral_id.as_str(), "AA:BB");
        assert_eq!(device.descriptor.id, DeviceModel::AndUa651);
        assert!(device.name.is_none());
    }
}
