//! The process-wide entry point.
//!
//! A [`Central`] wraps a transport. The scan slot and the registry of
//! peripherals held by live sessions belong to the radio adapter, not to the
//! central: every central in the process over the same adapter shares them.

use std::sync::Arc;

use tracing::info;

use vitalink_types::DeviceDescriptor;

use crate::btle::BtleTransport;
use crate::error::Result;
use crate::guard::{ScanGate, SessionRegistry};
use crate::scan::{DiscoveredDevice, ScanStream};
use crate::session::{Session, SessionOptions};
use crate::transport::{PeripheralId, Transport};

/// Scans for devices and hands out sessions.
///
/// # Example
///
/// ```no_run
/// use futures::StreamExt;
/// use vitalink_core::{Central, SessionOptions};
/// use vitalink_types::DeviceModel;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let central = Central::btle().await?;
///     let mut scan = central.scan(DeviceModel::OmronEvolv.descriptor())?;
///     if let Some(device) = scan.next().await {
///         let device = device?;
///         scan.stop().await?;
///         let mut session = central.open_session(device, SessionOptions::default()).await?;
///         while let Some(packet) = session.next_packet().await? {
///             println!("{} bytes", packet.len());
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Central {
    transport: Arc<dyn Transport>,
    scans: ScanGate,
    sessions: SessionRegistry,
}

impl std::fmt::Debug for Central {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Central")
            .field("scanning", &self.scans.is_active())
            .finish()
    }
}

impl Central {
    /// Build a central over `transport`.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    /// Build a central over a shared transport.
    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        let adapter = transport.adapter_key();
        Self {
            scans: ScanGate::new(adapter),
            sessions: SessionRegistry::new(adapter),
            transport,
        }
    }

    /// Build a central over the first system Bluetooth adapter.
    pub async fn btle() -> Result<Self> {
        Ok(Self::new(BtleTransport::new().await?))
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Scan for devices matching `descriptor`.
    ///
    /// Nothing touches the radio until the returned stream is first polled.
    ///
    /// # Errors
    ///
    /// [`Error::ScanAlreadyActive`](crate::Error::ScanAlreadyActive) if
    /// another scan stream over the same adapter is still alive anywhere in
    /// the process.
    pub fn scan(&self, descriptor: &'static DeviceDescriptor) -> Result<ScanStream> {
        let slot = self.scans.acquire()?;
        Ok(ScanStream::new(Arc::clone(&self.transport), descriptor, slot))
    }

    pub fn is_scanning(&self) -> bool {
        self.scans.is_active()
    }

    /// Claim `device` and return an `Idle` session for it.
    ///
    /// # Errors
    ///
    /// [`Error::SessionConflict`](crate::Error::SessionConflict) if another
    /// live session in the process owns the peripheral,
    /// [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the options
    /// fail validation.
    pub fn claim_session(
        &self,
        device: DiscoveredDevice,
        options: SessionOptions,
    ) -> Result<Session> {
        options.config.validate()?;
        let claim = self.sessions.claim(device.peripheral_id.clone())?;
        Ok(Session::new(
            Arc::clone(&self.transport),
            device,
            claim,
            options,
        ))
    }

    /// Claim `device` and connect. The session is `Streaming` on success.
    pub async fn open_session(
        &self,
        device: DiscoveredDevice,
        options: SessionOptions,
    ) -> Result<Session> {
        let mut session = self.claim_session(device, options)?;
        session.connect().await?;
        info!(peripheral = %session.device().peripheral_id, "Session open");
        Ok(session)
    }

    /// Whether a live session owns `peripheral`.
    pub fn has_session(&self, peripheral: &PeripheralId) -> bool {
        self.sessions.contains(peripheral)
    }
}
