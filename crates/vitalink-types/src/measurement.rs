//! Decoded measurements and the raw packets they come from.

use core::fmt;

use bytes::Bytes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::catalog::DeviceModel;

/// Conversion factor between kPa and mmHg.
pub const MMHG_PER_KPA: f64 = 7.500_615_75;

/// Conversion factor between mmol/L and mg/dL for glucose.
pub const MG_DL_PER_MMOL_L: f64 = 18.015_6;

/// Bytes of one characteristic notification, stamped on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Payload exactly as delivered by the transport.
    pub bytes: Bytes,
    /// When the transport delivered the packet.
    pub received_at: OffsetDateTime,
}

impl RawPacket {
    /// Create a packet stamped with the current time.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self::received_at(bytes, OffsetDateTime::now_utc())
    }

    /// Create a packet with an explicit receipt time.
    pub fn received_at(bytes: impl Into<Bytes>, received_at: OffsetDateTime) -> Self {
        Self {
            bytes: bytes.into(),
            received_at,
        }
    }

    /// Number of payload bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// SHA-256 over the raw bytes of every packet behind a measurement.
///
/// Lets the upload side prove which transmission produced a value without
/// retaining the packets themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketDigest([u8; 32]);

impl PacketDigest {
    /// Digest of a single packet.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = DigestBuilder::default();
        hasher.update(bytes);
        hasher.finish()
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PacketDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl Serialize for PacketDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for PacketDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&text, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// Incremental digest over the packets of a multi-packet transfer.
#[derive(Debug, Clone, Default)]
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    /// Feed one packet.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finish, resetting the builder for the next measurement.
    pub fn finish(&mut self) -> PacketDigest {
        PacketDigest(std::mem::take(&mut self.hasher).finalize().into())
    }
}

/// Unit of a pressure value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PressureUnit {
    /// Millimetres of mercury.
    MmHg,
    /// Kilopascal.
    KPa,
}

impl fmt::Display for PressureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureUnit::MmHg => write!(f, "mmHg"),
            PressureUnit::KPa => write!(f, "kPa"),
        }
    }
}

/// Unit of a glucose concentration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GlucoseUnit {
    /// Milligrams per decilitre (canonical).
    MgPerDl,
    /// Millimoles per litre.
    MmolPerL,
}

impl fmt::Display for GlucoseUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlucoseUnit::MgPerDl => write!(f, "mg/dL"),
            GlucoseUnit::MmolPerL => write!(f, "mmol/L"),
        }
    }
}

/// Measurement status bits reported by a blood-pressure cuff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeasurementStatus(pub u16);

impl MeasurementStatus {
    /// Body movement detected during measurement.
    pub fn body_movement(self) -> bool {
        self.0 & 0x0001 != 0
    }

    /// Cuff too loose.
    pub fn cuff_too_loose(self) -> bool {
        self.0 & 0x0002 != 0
    }

    /// Irregular pulse detected.
    pub fn irregular_pulse(self) -> bool {
        self.0 & 0x0004 != 0
    }

    /// Pulse rate outside the device's range (2-bit field).
    pub fn pulse_rate_range(self) -> u8 {
        ((self.0 >> 3) & 0x03) as u8
    }

    /// Improper measurement position.
    pub fn improper_position(self) -> bool {
        self.0 & 0x0020 != 0
    }
}

/// One blood-pressure reading.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BloodPressureMeasurement {
    /// Model that produced the reading.
    pub source: DeviceModel,
    /// Systolic pressure.
    pub systolic: f64,
    /// Diastolic pressure.
    pub diastolic: f64,
    /// Mean arterial pressure, when the device computed one.
    pub mean: Option<f64>,
    /// Pulse rate in beats per minute.
    pub pulse: Option<f64>,
    /// Unit of the pressure fields.
    pub unit: PressureUnit,
    /// Device user slot.
    pub user_id: Option<u8>,
    /// Measurement status bits.
    pub status: Option<MeasurementStatus>,
    /// Device timestamp, or the receipt time when the device sent none.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
}

impl BloodPressureMeasurement {
    /// Systolic and diastolic converted to mmHg.
    pub fn in_mmhg(&self) -> (f64, f64) {
        match self.unit {
            PressureUnit::MmHg => (self.systolic, self.diastolic),
            PressureUnit::KPa => (self.systolic * MMHG_PER_KPA, self.diastolic * MMHG_PER_KPA),
        }
    }
}

/// One glucose reading.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlucoseMeasurement {
    /// Model that produced the reading.
    pub source: DeviceModel,
    /// Device record sequence number.
    pub sequence: u16,
    /// Concentration in [`Self::unit`].
    pub concentration: f64,
    /// Unit of the concentration.
    pub unit: GlucoseUnit,
    /// Device timestamp.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
}

impl GlucoseMeasurement {
    /// Concentration in mmol/L.
    pub fn in_mmol_per_l(&self) -> f64 {
        match self.unit {
            GlucoseUnit::MgPerDl => self.concentration / MG_DL_PER_MMOL_L,
            GlucoseUnit::MmolPerL => self.concentration,
        }
    }
}

/// A decoded measurement, tagged with its source model.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum Measurement {
    /// Blood-pressure reading.
    BloodPressure(BloodPressureMeasurement),
    /// Glucose reading.
    Glucose(GlucoseMeasurement),
}

impl Measurement {
    /// Model that produced the measurement.
    pub fn source(&self) -> DeviceModel {
        match self {
            Measurement::BloodPressure(m) => m.source,
            Measurement::Glucose(m) => m.source,
        }
    }

    /// When the measurement was taken.
    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            Measurement::BloodPressure(m) => m.timestamp,
            Measurement::Glucose(m) => m.timestamp,
        }
    }
}

/// A measurement together with the digest of its raw packets.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Decoded measurement.
    pub measurement: Measurement,
    /// Audit digest of the originating packet(s).
    pub digest: PacketDigest,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_digest_of_known_input() {
        let digest = PacketDigest::of(b"abc");
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_builder_matches_concatenation() {
        let mut builder = DigestBuilder::default();
        builder.update(&[1, 2]);
        builder.update(&[3]);
        assert_eq!(builder.finish(), PacketDigest::of(&[1, 2, 3]));
        // finish() resets the builder
        assert_eq!(builder.finish(), PacketDigest::of(&[]));
    }

    #[test]
    fn test_measurement_status_bits() {
        let status = MeasurementStatus(0b0010_0101);
        assert!(status.body_movement());
        assert!(!status.cuff_too_loose());
        assert!(status.irregular_pulse());
        assert!(status.improper_position());
        assert_eq!(MeasurementStatus(0b0001_1000).pulse_rate_range(), 3);
    }

    #[test]
    fn test_kpa_conversion() {
        let m = BloodPressureMeasurement {
            source: DeviceModel::OmronEvolv,
            systolic: 16.0,
            diastolic: 10.7,
            mean: None,
            pulse: None,
            unit: PressureUnit::KPa,
            user_id: None,
            status: None,
            timestamp: datetime!(2024-03-01 08:30 UTC),
        };
        let (sys, dia) = m.in_mmhg();
        assert!((sys - 120.0).abs() < 0.1);
        assert!((dia - 80.3).abs() < 0.1);
    }

    #[test]
    fn test_glucose_mmol_conversion() {
        let m = GlucoseMeasurement {
            source: DeviceModel::ContourNextOne,
            sequence: 1,
            concentration: 90.078,
            unit: GlucoseUnit::MgPerDl,
            timestamp: datetime!(2024-03-01 08:30 UTC),
        };
        assert!((m.in_mmol_per_l() - 5.0).abs() < 0.001);
        assert_eq!(Measurement::Glucose(m).source(), DeviceModel::ContourNextOne);
    }

    #[test]
    fn test_reading_serializes_digest_as_hex() {
        let reading = Reading {
            measurement: Measurement::Glucose(GlucoseMeasurement {
                source: DeviceModel::AccuChekGuide,
                sequence: 7,
                concentration: 104.0,
                unit: GlucoseUnit::MgPerDl,
                timestamp: datetime!(2024-03-01 08:30 UTC),
            }),
            digest: PacketDigest::of(b"abc"),
        };
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["measurement"]["type"], "glucose");
        assert_eq!(json["measurement"]["source"], "accu-chek-guide");
        assert!(json["digest"].as_str().unwrap().starts_with("ba7816bf"));

        let back: Reading = serde_json::from_value(json).unwrap();
        assert_eq!(back, reading);
    }
}
