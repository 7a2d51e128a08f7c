//! Blood Pressure Measurement characteristic (0x2A35).
//!
//! Layout:
//!
//! | Field | Size | Present when |
//! |-------|------|--------------|
//! | Flags | 1 | always |
//! | Systolic | 2 (SFLOAT) | always |
//! | Diastolic | 2 (SFLOAT) | always |
//! | Mean arterial pressure | 2 (SFLOAT) | always |
//! | Timestamp | 7 | flags bit 1 |
//! | Pulse rate | 2 (SFLOAT) | flags bit 2 |
//! | User id | 1 | flags bit 3 |
//! | Measurement status | 2 | flags bit 4 |
//!
//! Flags bit 0 selects kPa instead of mmHg.

use bytes::Buf;

use crate::catalog::DeviceModel;
use crate::error::{ParseError, ParseResult};
use crate::measurement::{
    BloodPressureMeasurement, Measurement, MeasurementStatus, PacketDigest, PressureUnit,
    RawPacket, Reading,
};
use crate::sfloat::SFloat;

use super::datetime::{DATE_TIME_LEN, read_date_time};
use super::{Decoded, MeasurementDecoder};

const FLAG_UNIT_KPA: u8 = 0x01;
const FLAG_TIMESTAMP: u8 = 0x02;
const FLAG_PULSE_RATE: u8 = 0x04;
const FLAG_USER_ID: u8 = 0x08;
const FLAG_STATUS: u8 = 0x10;
const FLAG_RESERVED: u8 = 0xE0;

/// Flags byte plus the three mandatory pressure fields.
pub const MIN_BLOOD_PRESSURE_BYTES: usize = 7;

/// Payload length the flags byte declares.
fn declared_len(flags: u8) -> usize {
    let mut len = MIN_BLOOD_PRESSURE_BYTES;
    if flags & FLAG_TIMESTAMP != 0 {
        len += DATE_TIME_LEN;
    }
    if flags & FLAG_PULSE_RATE != 0 {
        len += 2;
    }
    if flags & FLAG_USER_ID != 0 {
        len += 1;
    }
    if flags & FLAG_STATUS != 0 {
        len += 2;
    }
    len
}

/// Decoder for the SIG blood-pressure measurement layout.
///
/// Every packet carries one complete measurement, so the decoder is
/// stateless apart from the model it tags readings with.
#[derive(Debug, Clone)]
pub struct BloodPressureDecoder {
    source: DeviceModel,
}

impl BloodPressureDecoder {
    /// Create a decoder tagging readings with `source`.
    pub fn new(source: DeviceModel) -> Self {
        Self { source }
    }

    /// Parse one measurement payload.
    ///
    /// # Errors
    ///
    /// [`ParseError::Truncated`] when the payload is shorter than the mandatory
    /// fields, [`ParseError::Malformed`] when the flags disagree with the
    /// payload length, reserved flag bits are set, or the timestamp is invalid.
    pub fn parse(&self, packet: &RawPacket) -> ParseResult<BloodPressureMeasurement> {
        let data = &packet.bytes[..];
        if data.len() < MIN_BLOOD_PRESSURE_BYTES {
            return Err(ParseError::Truncated {
                expected: MIN_BLOOD_PRESSURE_BYTES,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let flags = buf.get_u8();
        if flags & FLAG_RESERVED != 0 {
            return Err(ParseError::malformed(format!(
                "reserved flag bits set: 0x{flags:02X}"
            )));
        }
        let expected = declared_len(flags);
        if data.len() != expected {
            return Err(ParseError::malformed(format!(
                "flags 0x{flags:02X} declare {expected} bytes, payload has {}",
                data.len()
            )));
        }

        let unit = if flags & FLAG_UNIT_KPA != 0 {
            PressureUnit::KPa
        } else {
            PressureUnit::MmHg
        };
        let systolic = read_sfloat(&mut buf).to_f64();
        let diastolic = read_sfloat(&mut buf).to_f64();
        let mean = read_sfloat(&mut buf);
        // NaN is how the profile says "not computed"; other sentinels are kept.
        let mean = (!mean.is_not_available()).then(|| mean.to_f64());

        let timestamp = if flags & FLAG_TIMESTAMP != 0 {
            read_date_time(&mut buf)?
        } else {
            None
        };
        let pulse = (flags & FLAG_PULSE_RATE != 0).then(|| read_sfloat(&mut buf).to_f64());
        let user_id = (flags & FLAG_USER_ID != 0).then(|| buf.get_u8());
        let status = (flags & FLAG_STATUS != 0).then(|| MeasurementStatus(buf.get_u16_le()));

        Ok(BloodPressureMeasurement {
            source: self.source,
            systolic,
            diastolic,
            mean,
            pulse,
            unit,
            user_id,
            status,
            timestamp: timestamp.unwrap_or(packet.received_at),
        })
    }
}

fn read_sfloat(buf: &mut &[u8]) -> SFloat {
    SFloat(buf.get_u16_le())
}

impl MeasurementDecoder for BloodPressureDecoder {
    fn decode(&mut self, packet: &RawPacket) -> ParseResult<Decoded> {
        let measurement = self.parse(packet)?;
        Ok(Decoded::Reading(Reading {
            measurement: Measurement::BloodPressure(measurement),
            digest: PacketDigest::of(&packet.bytes),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::datetime::encode_date_time;
    use crate::sfloat::encode;
    use time::macros::datetime;

    fn sf(value: f64) -> [u8; 2] {
        encode(value).to_le_bytes()
    }

    fn packet(bytes: Vec<u8>) -> RawPacket {
        RawPacket::received_at(bytes, datetime!(2024-05-01 12:00 UTC))
    }

    fn payload(flags: u8, extra: &[u8]) -> Vec<u8> {
        let mut bytes = vec![flags];
        bytes.extend_from_slice(&sf(120.0));
        bytes.extend_from_slice(&sf(80.0));
        bytes.extend_from_slice(&sf(93.3));
        bytes.extend_from_slice(extra);
        bytes
    }

    #[test]
    fn test_minimal_mmhg_measurement() {
        let decoder = BloodPressureDecoder::new(DeviceModel::OmronEvolv);
        let m = decoder.parse(&packet(payload(0x00, &[]))).unwrap();
        assert_eq!(m.systolic, 120.0);
        assert_eq!(m.diastolic, 80.0);
        assert_eq!(m.mean, Some(93.3));
        assert_eq!(m.unit, PressureUnit::MmHg);
        assert_eq!(m.pulse, None);
        assert_eq!(m.user_id, None);
        assert_eq!(m.status, None);
        // No device clock: receipt time is used.
        assert_eq!(m.timestamp, datetime!(2024-05-01 12:00 UTC));
        assert_eq!(m.source, DeviceModel::OmronEvolv);
    }

    #[test]
    fn test_all_optional_fields() {
        let mut extra = encode_date_time(Some(datetime!(2024-04-30 21:15:00 UTC))).to_vec();
        extra.extend_from_slice(&sf(72.0));
        extra.push(2);
        extra.extend_from_slice(&0x0004u16.to_le_bytes());

        let decoder = BloodPressureDecoder::new(DeviceModel::AndUa651);
        let m = decoder.parse(&packet(payload(0x1F, &extra))).unwrap();
        assert_eq!(m.unit, PressureUnit::KPa);
        assert_eq!(m.timestamp, datetime!(2024-04-30 21:15:00 UTC));
        assert_eq!(m.pulse, Some(72.0));
        assert_eq!(m.user_id, Some(2));
        assert!(m.status.unwrap().irregular_pulse());
    }

    #[test]
    fn test_flags_longer_than_payload_is_malformed() {
        let decoder = BloodPressureDecoder::new(DeviceModel::OmronEvolv);
        // Declares pulse rate but carries none.
        let result = decoder.parse(&packet(payload(FLAG_PULSE_RATE, &[])));
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let decoder = BloodPressureDecoder::new(DeviceModel::OmronEvolv);
        let result = decoder.parse(&packet(payload(0x00, &[0x00, 0x00])));
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_reserved_flags_are_malformed() {
        let decoder = BloodPressureDecoder::new(DeviceModel::OmronEvolv);
        let result = decoder.parse(&packet(payload(0x80, &[])));
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_short_payload_is_truncated() {
        let decoder = BloodPressureDecoder::new(DeviceModel::OmronEvolv);
        let result = decoder.parse(&packet(vec![0x00, 0x78, 0x00]));
        assert_eq!(
            result,
            Err(ParseError::Truncated {
                expected: 7,
                actual: 3
            })
        );
    }

    #[test]
    fn test_special_values_are_preserved() {
        let mut bytes = vec![0x04];
        bytes.extend_from_slice(&0x07FEu16.to_le_bytes());
        bytes.extend_from_slice(&0x0802u16.to_le_bytes());
        bytes.extend_from_slice(&0x07FFu16.to_le_bytes());
        bytes.extend_from_slice(&0x0800u16.to_le_bytes());

        let decoder = BloodPressureDecoder::new(DeviceModel::BeurerBm54);
        let m = decoder.parse(&packet(bytes)).unwrap();
        assert_eq!(m.systolic, f64::INFINITY);
        assert_eq!(m.diastolic, f64::NEG_INFINITY);
        assert_eq!(m.mean, None);
        assert!(m.pulse.unwrap().is_nan());
    }

    #[test]
    fn test_decode_yields_reading_with_digest() {
        let mut decoder = BloodPressureDecoder::new(DeviceModel::OmronM7);
        let bytes = payload(0x00, &[]);
        let decoded = decoder.decode(&packet(bytes.clone())).unwrap();
        match decoded {
            Decoded::Reading(reading) => {
                assert_eq!(reading.digest, PacketDigest::of(&bytes));
                assert_eq!(reading.measurement.source(), DeviceModel::OmronM7);
            }
            other => panic!("expected a reading, got {other:?}"),
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn parse_never_panics(data: Vec<u8>) {
            let decoder = BloodPressureDecoder::new(DeviceModel::OmronEvolv);
            let _ = decoder.parse(&RawPacket::new(data));
        }

        #[test]
        fn parse_accepts_only_declared_length(flags in 0u8..0x20, len in 0usize..32) {
            let decoder = BloodPressureDecoder::new(DeviceModel::OmronEvolv);
            // Zeroed timestamp bytes decode as "unknown", never as an error.
            let mut data = vec![0u8; len];
            if let Some(first) = data.first_mut() {
                *first = flags;
            }
            let result = decoder.parse(&RawPacket::new(data));
            prop_assert_eq!(result.is_ok(), len == declared_len(flags));
        }
    }
}
