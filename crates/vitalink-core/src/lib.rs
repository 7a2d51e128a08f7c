//! BLE protocol layer for blood-pressure monitors and glucose meters.
//!
//! This crate finds supported health devices over Bluetooth Low Energy,
//! runs one connection session per device and turns the notifications it
//! receives into decoded readings.
//!
//! # Features
//!
//! - **Discovery**: [`Central::scan`] filters advertisements against the
//!   device catalog and yields each peripheral once
//! - **Sessions**: [`Session`] walks an explicit state machine from connect
//!   to close, with a time budget on every step
//! - **Pipeline**: [`ReadingPipeline`] scans, connects and decodes into a
//!   stream of readings, dropping CRC-corrupt frames
//! - **Testing**: [`MockTransport`] scripts peripherals without a radio
//!
//! # Layering
//!
//! Decoding lives in [`vitalink_types`] and never touches Bluetooth. This
//! crate talks to the radio only through the [`Transport`] trait;
//! [`BtleTransport`] implements it over `btleplug`.
//!
//! # Quick Start
//!
//! ```no_run
//! use futures::StreamExt;
//! use vitalink_core::{Central, ReadingPipeline};
//! use vitalink_types::DeviceModel;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = ReadingPipeline::new(Central::btle().await?);
//!     let mut readings = pipeline.read(DeviceModel::ContourNextOne.descriptor());
//!
//!     while let Some(reading) = readings.next().await {
//!         println!("{:?}", reading?);
//!     }
//!     println!("{:?}", readings.counters());
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod central;
pub mod config;
pub mod error;
pub mod events;
mod guard;
pub mod metrics;
pub mod mock;
pub mod pipeline;
pub mod scan;
pub mod session;
pub mod transport;

pub use vitalink_types;
pub use vitalink_types::uuid as uuids;

pub use btle::{BtleTransport, get_adapter};
pub use central::Central;
pub use config::{Config, ConfigError, ValidationError};
pub use error::{Error, Result};
pub use events::{DisconnectReason, EventReceiver, EventSender, SessionEvent};
pub use metrics::{CounterSnapshot, PacketCounters};
pub use mock::{MockPeripheral, MockStep, MockTransport, TransportCall};
pub use pipeline::{
    MeasurementResult, MeasurementStream, PacketGate, PipelineConfig, ReadingPipeline,
};
pub use scan::{DiscoveredDevice, ScanStream};
pub use session::{
    FailureKind, Session, SessionConfig, SessionOptions, SessionState, SessionStateMachine,
};
pub use transport::{Advertisement, PeripheralId, Transport, TransportHandle};
