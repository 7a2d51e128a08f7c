//! The reading pipeline.
//!
//! A [`ReadingPipeline`] turns a catalog entry into a stream of validated
//! readings: discover the first matching device, stop scanning, open a
//! session, and pass every measurement packet through a [`PacketGate`]
//! (checksum first, then the brand's decoder).
//!
//! Glucose transfers end at the meter's terminator frame. Blood-pressure
//! cuffs end the stream by disconnecting after their last measurement.
//! Packet-level failures are counted and logged, never yielded; a failure
//! that ends the session is yielded once as the last item.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vitalink_types::crc16::{self, Crc16Options};
use vitalink_types::decode::{checksum_for, decoder_for};
use vitalink_types::{
    Decoded, DeviceDescriptor, DeviceKind, MeasurementDecoder, RawPacket, Reading,
};

use crate::central::Central;
use crate::error::{Error, Result};
use crate::metrics::{CounterSnapshot, PacketCounters};
use crate::scan::{DiscoveredDevice, ScanStream};
use crate::session::{SessionConfig, SessionOptions, SessionState};

/// Default number of readings buffered ahead of the consumer.
pub const DEFAULT_READING_BUFFER: usize = 16;

/// Checksum verification followed by decoding.
///
/// Packets that fail the checksum never reach the decoder.
pub struct PacketGate {
    checksum: Option<Crc16Options>,
    decoder: Box<dyn MeasurementDecoder>,
    counters: Arc<PacketCounters>,
}

impl std::fmt::Debug for PacketGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketGate")
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

impl PacketGate {
    pub fn new(
        checksum: Option<Crc16Options>,
        decoder: Box<dyn MeasurementDecoder>,
        counters: Arc<PacketCounters>,
    ) -> Self {
        Self {
            checksum,
            decoder,
            counters,
        }
    }

    /// The gate for a catalog entry.
    pub fn for_descriptor(
        descriptor: &'static DeviceDescriptor,
        counters: Arc<PacketCounters>,
    ) -> Self {
        Self::new(checksum_for(descriptor), decoder_for(descriptor), counters)
    }

    /// Verify and decode one packet.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptPacket`] for a checksum failure and
    /// [`Error::Malformed`] for a decoder rejection. Both are packet scoped:
    /// the gate stays usable.
    pub fn process(&mut self, packet: &RawPacket) -> Result<Decoded> {
        if let Some(options) = &self.checksum
            && !crc16::verify(&packet.bytes, options)
        {
            self.counters.record_corrupt();
            warn!(len = packet.len(), "Dropping packet with bad checksum");
            return Err(Error::CorruptPacket);
        }

        let result = self.decoder.decode(packet);
        let abandoned = self.decoder.take_abandoned();
        if abandoned > 0 {
            warn!(abandoned, "Discarding measurements with missing packets");
            for _ in 0..abandoned {
                self.counters.record_malformed();
            }
        }

        match result {
            Ok(decoded) => {
                match &decoded {
                    Decoded::Reading(_) => self.counters.record_decoded(),
                    Decoded::EndOfTransfer => self.counters.record_end_of_transfer(),
                    Decoded::Pending => {}
                }
                Ok(decoded)
            }
            Err(e) => {
                self.counters.record_malformed();
                warn!(len = packet.len(), "Dropping malformed packet: {}", e);
                Err(Error::Malformed(e.to_string()))
            }
        }
    }
}

/// Settings for a [`ReadingPipeline`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Budgets for the session.
    pub session: SessionConfig,
    /// Readings buffered ahead of the consumer.
    pub reading_buffer: usize,
    /// Give up discovery after this long. `None` scans until cancelled.
    pub scan_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            reading_buffer: DEFAULT_READING_BUFFER,
            scan_timeout: None,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session budgets.
    #[must_use]
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Set the reading buffer size.
    #[must_use]
    pub fn reading_buffer(mut self, size: usize) -> Self {
        self.reading_buffer = size;
        self
    }

    /// Set or disable the discovery deadline.
    #[must_use]
    pub fn scan_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if self.reading_buffer == 0 {
            return Err(Error::invalid_config("reading_buffer must be > 0"));
        }
        if self.scan_timeout.is_some_and(|limit| limit.is_zero()) {
            return Err(Error::invalid_config(
                "scan_timeout must be > 0 (use None to disable)",
            ));
        }
        Ok(())
    }
}

/// Turns catalog entries into reading streams.
#[derive(Debug, Clone)]
pub struct ReadingPipeline {
    central: Central,
    config: PipelineConfig,
}

impl ReadingPipeline {
    /// A pipeline with default settings.
    pub fn new(central: Central) -> Self {
        Self {
            central,
            config: PipelineConfig::default(),
        }
    }

    /// A pipeline with custom settings.
    ///
    /// Returns an error if `config` fails validation.
    pub fn with_config(central: Central, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { central, config })
    }

    pub fn central(&self) -> &Central {
        &self.central
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Read from the first device that matches `descriptor`.
    ///
    /// Nothing happens until the stream is first polled.
    pub fn read(&self, descriptor: &'static DeviceDescriptor) -> MeasurementStream {
        self.start(Source::Discover(descriptor))
    }

    /// Read from an already discovered device, skipping the scan.
    pub fn read_device(&self, device: DiscoveredDevice) -> MeasurementStream {
        self.start(Source::Device(device))
    }

    fn start(&self, source: Source) -> MeasurementStream {
        let (tx, receiver) = mpsc::channel(self.config.reading_buffer);
        let (observer, state) = watch::channel(SessionState::Idle);
        let cancel = CancellationToken::new();
        let counters = PacketCounters::shared();
        let worker = Worker {
            central: self.central.clone(),
            config: self.config.clone(),
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
            tx,
            observer: Some(observer),
        };
        MeasurementStream {
            receiver,
            worker: Some(worker.run(source).boxed()),
            task: None,
            cancel,
            counters,
            state,
        }
    }
}

/// Result type for stream items.
pub type MeasurementResult = Result<Reading>;

/// A stream of readings from one device.
///
/// The work runs on a spawned task that starts at the first poll. Dropping
/// the stream cancels it; [`close`](Self::close) cancels it and waits for the
/// session to release the device.
pub struct MeasurementStream {
    receiver: mpsc::Receiver<MeasurementResult>,
    worker: Option<BoxFuture<'static, ()>>,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    counters: Arc<PacketCounters>,
    state: watch::Receiver<SessionState>,
}

impl std::fmt::Debug for MeasurementStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementStream")
            .field("started", &self.worker.is_none())
            .field("state", &*self.state.borrow())
            .field("counters", &self.counters.snapshot())
            .finish()
    }
}

impl MeasurementStream {
    /// Cancel the stream and wait until its session has released the device.
    pub async fn close(mut self) {
        self.cancel.cancel();
        // Never polled: nothing was acquired.
        self.worker.take();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Measurement task failed: {}", e);
        }
    }

    /// Packet counters of this stream's session.
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// The live counters, for sharing with a monitor.
    pub fn shared_counters(&self) -> Arc<PacketCounters> {
        Arc::clone(&self.counters)
    }

    /// Current state of the session behind the stream.
    pub fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch session state changes.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// A token that cancels the stream when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Check if the background task has started and not yet finished.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for MeasurementStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for MeasurementStream {
    type Item = MeasurementResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(worker) = self.worker.take() {
            self.task = Some(tokio::spawn(worker));
        }
        self.receiver.poll_recv(cx)
    }
}

enum Source {
    Discover(&'static DeviceDescriptor),
    Device(DiscoveredDevice),
}

struct Worker {
    central: Central,
    config: PipelineConfig,
    counters: Arc<PacketCounters>,
    cancel: CancellationToken,
    tx: mpsc::Sender<MeasurementResult>,
    observer: Option<watch::Sender<SessionState>>,
}

impl Worker {
    async fn run(mut self, source: Source) {
        match self.drive(source).await {
            Ok(()) => debug!("Measurement stream finished"),
            Err(Error::Cancelled) => debug!("Measurement stream cancelled"),
            Err(err) => {
                warn!(error = %err, "Measurement stream failed");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {}
                    _ = self.tx.send(Err(err)) => {}
                }
            }
        }
    }

    async fn drive(&mut self, source: Source) -> Result<()> {
        let device = match source {
            Source::Discover(descriptor) => self.discover(descriptor).await?,
            Source::Device(device) => device,
        };
        let descriptor = device.descriptor;

        let mut options = SessionOptions::new(self.config.session.clone())
            .counters(Arc::clone(&self.counters))
            .cancel_token(self.cancel.clone());
        if let Some(observer) = self.observer.take() {
            options = options.observer(observer);
        }
        let mut session = self.central.claim_session(device, options)?;
        session.connect().await?;

        let mut gate = PacketGate::for_descriptor(descriptor, Arc::clone(&self.counters));
        let ends_on_disconnect = descriptor.kind() == DeviceKind::BloodPressure;

        while let Some(packet) = session.next_packet().await? {
            let reading = match gate.process(&packet) {
                Ok(Decoded::Reading(reading)) => reading,
                Ok(Decoded::Pending) => continue,
                Ok(Decoded::EndOfTransfer) => {
                    info!(counters = ?self.counters.snapshot(), "Transfer complete");
                    return session.close().await;
                }
                // Counted by the gate.
                Err(_) => continue,
            };
            if ends_on_disconnect {
                session.expect_disconnect();
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    session.cancel().await?;
                    return Err(Error::Cancelled);
                }
                sent = self.tx.send(Ok(reading)) => {
                    if sent.is_err() {
                        debug!("Measurement receiver dropped, closing session");
                        return session.close().await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Scan until the first match, then stop the scan.
    #[tracing::instrument(level = "info", skip_all, fields(device = %descriptor))]
    async fn discover(&self, descriptor: &'static DeviceDescriptor) -> Result<DiscoveredDevice> {
        let mut scan = self.central.scan(descriptor)?;
        let found = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            next = next_within(&mut scan, self.config.scan_timeout) => {
                next.unwrap_or_else(|| Err(Error::DeviceNotFound(descriptor.to_string())))
            }
        };
        if let Err(e) = scan.stop().await {
            warn!("Failed to stop scan: {}", e);
        }
        let device = found?;
        info!(peripheral = %device.peripheral_id, name = ?device.name, "Found device");
        Ok(device)
    }
}

async fn next_within(
    scan: &mut ScanStream,
    limit: Option<Duration>,
) -> Option<Result<DiscoveredDevice>> {
    match limit {
        Some(limit) => timeout(limit, scan.next()).await.ok().flatten(),
        None => scan.next().await,
    }
}
