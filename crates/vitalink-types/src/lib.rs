//! Platform-agnostic types and decoders for BLE health devices.
//!
//! This crate holds everything about supported blood-pressure monitors and
//! glucose meters that does not touch a radio: the device catalog, the
//! IEEE 11073 SFLOAT codec, CRC-16 packet checksums, and the measurement
//! decoders. The BLE session layer lives in `vitalink-core`.
//!
//! # Features
//!
//! - Static device catalog with brand-tagged GATT profiles
//! - SFLOAT encode/decode with special-value handling
//! - CRC-16/CCITT with configurable preset and skipped bytes
//! - Blood-pressure and segmented glucose decoders
//!
//! # Example
//!
//! ```
//! use vitalink_types::decode::{Decoded, MeasurementDecoder, decoder_for};
//! use vitalink_types::{DeviceModel, RawPacket};
//!
//! let descriptor = DeviceModel::OmronEvolv.descriptor();
//! let mut decoder = decoder_for(descriptor);
//!
//! // 120/80 mmHg, mean 93
//! let packet = RawPacket::new(vec![0x00, 0x78, 0x00, 0x50, 0x00, 0x5D, 0x00]);
//! match decoder.decode(&packet).unwrap() {
//!     Decoded::Reading(reading) => println!("{:?}", reading.measurement),
//!     _ => unreachable!(),
//! }
//! ```

pub mod catalog;
pub mod crc16;
pub mod decode;
pub mod error;
pub mod measurement;
pub mod sfloat;
pub mod uuid;

pub use catalog::{
    BloodPressureBrand, Brand, DeviceDescriptor, DeviceKind, DeviceModel, GattProfile,
    GlucoseBrand,
};
pub use crc16::Crc16Options;
pub use decode::{Decoded, MeasurementDecoder};
pub use error::{ParseError, ParseResult};
pub use measurement::{
    BloodPressureMeasurement, GlucoseMeasurement, GlucoseUnit, Measurement, PacketDigest,
    PressureUnit, RawPacket, Reading,
};
pub use sfloat::SFloat;
pub use uuid as uuids;
