//! Measurement decoders.
//!
//! A decoder consumes the raw packets of one measurement characteristic and
//! produces [`Reading`]s. Decoders are synchronous and keep whatever state a
//! multi-packet protocol needs between calls. They never see packets that
//! failed checksum verification: callers verify first with the options from
//! [`checksum_for`].

mod blood_pressure;
mod datetime;
mod glucose;

pub use blood_pressure::BloodPressureDecoder;
pub use glucose::{
    FRAME_OVERHEAD, GlucoseDecoder, GlucoseFrame, GlucoseRecord, RECORD_LEN, terminator_frame,
};

use crate::catalog::{Brand, DeviceDescriptor};
use crate::crc16::Crc16Options;
use crate::error::ParseResult;
use crate::measurement::{RawPacket, Reading};

/// Outcome of feeding one packet to a decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete measurement.
    Reading(Reading),
    /// The packet was accepted but the measurement needs more packets.
    Pending,
    /// The device signalled that the transfer is complete.
    EndOfTransfer,
}

/// A protocol-specific packet decoder.
pub trait MeasurementDecoder: Send {
    /// Decode one packet.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`](crate::ParseError) scoped to this packet. The
    /// decoder stays usable for the packets that follow.
    fn decode(&mut self, packet: &RawPacket) -> ParseResult<Decoded>;

    /// Discard any partially assembled measurement.
    fn reset(&mut self) {}

    /// Number of partially assembled measurements given up since the last
    /// call, because the packets completing them never arrived.
    ///
    /// The packets of an abandoned measurement were each accepted, so no
    /// error was returned for them. Callers that count losses read this
    /// after every [`decode`](Self::decode).
    fn take_abandoned(&mut self) -> u64 {
        0
    }
}

impl<D: MeasurementDecoder + ?Sized> MeasurementDecoder for Box<D> {
    fn decode(&mut self, packet: &RawPacket) -> ParseResult<Decoded> {
        (**self).decode(packet)
    }

    fn reset(&mut self) {
        (**self).reset();
    }

    fn take_abandoned(&mut self) -> u64 {
        (**self).take_abandoned()
    }
}

/// Build the decoder for a catalog entry.
pub fn decoder_for(descriptor: &'static DeviceDescriptor) -> Box<dyn MeasurementDecoder> {
    match descriptor.brand {
        Brand::BloodPressure(_) => Box::new(BloodPressureDecoder::new(descriptor.id)),
        Brand::Glucose(brand) => Box::new(GlucoseDecoder::new(descriptor.id, brand)),
    }
}

/// Checksum the packets of a catalog entry must pass before decoding.
pub fn checksum_for(descriptor: &DeviceDescriptor) -> Option<Crc16Options> {
    descriptor.brand.checksum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DeviceModel, descriptor};

    #[test]
    fn test_decoder_for_every_catalog_entry() {
        for entry in crate::catalog::all() {
            let mut decoder = decoder_for(entry);
            // Garbage is rejected rather than panicking.
            assert!(decoder.decode(&RawPacket::new(vec![0xFF])).is_err());
        }
    }

    #[test]
    fn test_checksum_for_glucose_only() {
        assert!(checksum_for(descriptor(DeviceModel::OmronEvolv)).is_none());
        assert!(checksum_for(descriptor(DeviceModel::ContourNextOne)).is_some());
    }
}
