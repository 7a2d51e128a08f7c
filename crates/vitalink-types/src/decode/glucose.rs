//! Segmented, checksum-framed glucose record transfer.
//!
//! After the transfer request is written, the meter sends every stored record
//! as one or more frames on the measurement characteristic:
//!
//! ```text
//! +--------+-------+-------+-----+-----------------+--------+--------+
//! | header | index | count | len | payload (len)   | crc lo | crc hi |
//! +--------+-------+-------+-----+-----------------+--------+--------+
//! ```
//!
//! `index` runs from 0 to `count - 1` within one record. A frame with
//! `count == 0` ends the transfer. The checksum covers everything between the
//! header byte and the checksum itself.
//!
//! A reassembled record is 11 bytes:
//!
//! | Field | Size |
//! |-------|------|
//! | Sequence number | 2 (u16 LE) |
//! | Date time | 7 |
//! | Concentration | 2 (SFLOAT, brand unit) |

use bytes::Buf;
use time::OffsetDateTime;

use crate::catalog::{DeviceModel, GlucoseBrand, GlucoseFraming};
use crate::crc16::{self, CHECKSUM_LEN};
use crate::error::{ParseError, ParseResult};
use crate::measurement::{
    DigestBuilder, GlucoseMeasurement, GlucoseUnit, Measurement, RawPacket, Reading,
};
use crate::sfloat::SFloat;

use super::datetime::{DATE_TIME_LEN, encode_date_time, read_date_time};
use super::{Decoded, MeasurementDecoder};

/// Header, index, count and length bytes.
const PREFIX_LEN: usize = 4;

/// Bytes a frame carries besides its payload.
pub const FRAME_OVERHEAD: usize = PREFIX_LEN + CHECKSUM_LEN;

/// Length of a reassembled glucose record.
pub const RECORD_LEN: usize = 2 + DATE_TIME_LEN + 2;

/// One frame of a segmented transfer, borrowed from the packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlucoseFrame<'a> {
    /// Brand header byte.
    pub header: u8,
    /// Position of this segment within its record.
    pub index: u8,
    /// Number of segments in the record; zero marks the end of the transfer.
    pub count: u8,
    /// Segment payload.
    pub payload: &'a [u8],
}

impl<'a> GlucoseFrame<'a> {
    /// Split a frame into its fields. The checksum is not verified here.
    ///
    /// # Errors
    ///
    /// [`ParseError::Truncated`] for frames shorter than the fixed overhead,
    /// [`ParseError::Malformed`] when the length byte disagrees with the frame.
    pub fn parse(bytes: &'a [u8]) -> ParseResult<Self> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(ParseError::Truncated {
                expected: FRAME_OVERHEAD,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let header = buf.get_u8();
        let index = buf.get_u8();
        let count = buf.get_u8();
        let len = usize::from(buf.get_u8());
        let available = bytes.len() - FRAME_OVERHEAD;
        if len != available {
            return Err(ParseError::malformed(format!(
                "frame declares {len} payload bytes, carries {available}"
            )));
        }

        Ok(Self {
            header,
            index,
            count,
            payload: &buf[..len],
        })
    }

    /// Whether this frame ends the transfer.
    pub fn is_terminator(&self) -> bool {
        self.count == 0
    }

    /// Serialize and seal the frame with the brand's checksum.
    ///
    /// # Errors
    ///
    /// [`ParseError::Malformed`] when the payload does not fit the length byte.
    pub fn encode(&self, framing: &GlucoseFraming) -> ParseResult<Vec<u8>> {
        let len = u8::try_from(self.payload.len()).map_err(|_| {
            ParseError::malformed(format!("payload of {} bytes", self.payload.len()))
        })?;
        let mut bytes = Vec::with_capacity(self.payload.len() + PREFIX_LEN);
        bytes.extend_from_slice(&[self.header, self.index, self.count, len]);
        bytes.extend_from_slice(self.payload);
        Ok(crc16::seal(&bytes, &framing.checksum))
    }
}

/// A glucose record before unit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlucoseRecord {
    /// Device sequence number.
    pub sequence: u16,
    /// Device timestamp, `None` when the meter clock was unset.
    pub timestamp: Option<OffsetDateTime>,
    /// Concentration in the brand's native unit.
    pub concentration: SFloat,
}

impl GlucoseRecord {
    /// Parse a reassembled record.
    ///
    /// # Errors
    ///
    /// [`ParseError::Malformed`] unless the record is exactly [`RECORD_LEN`]
    /// bytes with a valid date.
    pub fn parse(bytes: &[u8]) -> ParseResult<Self> {
        if bytes.len() != RECORD_LEN {
            return Err(ParseError::malformed(format!(
                "glucose record of {} bytes, expected {RECORD_LEN}",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let sequence = buf.get_u16_le();
        let timestamp = read_date_time(&mut buf)?;
        let concentration = SFloat(buf.get_u16_le());
        Ok(Self {
            sequence,
            timestamp,
            concentration,
        })
    }

    /// Record bytes as the meter sends them.
    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[..2].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[2..2 + DATE_TIME_LEN].copy_from_slice(&encode_date_time(self.timestamp));
        bytes[2 + DATE_TIME_LEN..].copy_from_slice(&self.concentration.0.to_le_bytes());
        bytes
    }

    /// Split into sealed frames of at most `segment_len` payload bytes each.
    ///
    /// # Errors
    ///
    /// [`ParseError::Malformed`] when `segment_len` is zero.
    pub fn to_frames(
        &self,
        framing: &GlucoseFraming,
        segment_len: usize,
    ) -> ParseResult<Vec<Vec<u8>>> {
        if segment_len == 0 {
            return Err(ParseError::malformed("segment length must be positive"));
        }
        let bytes = self.to_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(segment_len).collect();
        let count = u8::try_from(chunks.len())
            .map_err(|_| ParseError::malformed("too many segments"))?;
        chunks
            .iter()
            .enumerate()
            .map(|(index, payload)| {
                GlucoseFrame {
                    header: framing.header,
                    index: index as u8,
                    count,
                    payload,
                }
                .encode(framing)
            })
            .collect()
    }
}

/// The sealed frame that ends a transfer.
pub fn terminator_frame(framing: &GlucoseFraming) -> Vec<u8> {
    let bytes = [framing.header, 0, 0, 0];
    crc16::seal(&bytes, &framing.checksum)
}

/// Reassembles glucose records from checksum-verified frames.
#[derive(Debug, Clone)]
pub struct GlucoseDecoder {
    source: DeviceModel,
    framing: GlucoseFraming,
    next_index: u8,
    count: u8,
    buffer: Vec<u8>,
    digest: DigestBuilder,
    abandoned: u64,
}

impl GlucoseDecoder {
    /// Create a decoder for `brand`, tagging readings with `source`.
    pub fn new(source: DeviceModel, brand: GlucoseBrand) -> Self {
        Self {
            source,
            framing: brand.framing(),
            next_index: 0,
            count: 0,
            buffer: Vec::with_capacity(RECORD_LEN),
            digest: DigestBuilder::default(),
            abandoned: 0,
        }
    }

    /// Framing parameters this decoder expects.
    pub fn framing(&self) -> &GlucoseFraming {
        &self.framing
    }

    /// Whether a record is partially assembled.
    pub fn in_progress(&self) -> bool {
        self.next_index > 0
    }

    /// Discard the partial record and report why.
    fn reject(&mut self, message: String) -> ParseError {
        self.clear();
        ParseError::Malformed(message)
    }

    /// Give up on the partial record whose remaining segments never came.
    fn abandon(&mut self) {
        if self.in_progress() {
            self.abandoned += 1;
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.next_index = 0;
        self.count = 0;
        self.buffer.clear();
        self.digest.finish();
    }

    fn complete(&mut self, packet: &RawPacket) -> ParseResult<Decoded> {
        let record = GlucoseRecord::parse(&self.buffer);
        let digest = self.digest.finish();
        self.next_index = 0;
        self.count = 0;
        self.buffer.clear();
        let record = record?;

        Ok(Decoded::Reading(Reading {
            measurement: Measurement::Glucose(GlucoseMeasurement {
                source: self.source,
                sequence: record.sequence,
                concentration: record.concentration.to_f64() * self.framing.scale_to_mg_dl,
                unit: GlucoseUnit::MgPerDl,
                timestamp: record.timestamp.unwrap_or(packet.received_at),
            }),
            digest,
        }))
    }
}

impl MeasurementDecoder for GlucoseDecoder {
    fn decode(&mut self, packet: &RawPacket) -> ParseResult<Decoded> {
        let frame = match GlucoseFrame::parse(&packet.bytes) {
            Ok(frame) => frame,
            Err(err) => {
                self.clear();
                return Err(err);
            }
        };

        if frame.header != self.framing.header {
            return Err(self.reject(format!(
                "header 0x{:02X}, expected 0x{:02X}",
                frame.header, self.framing.header
            )));
        }

        if frame.is_terminator() {
            self.abandon();
            return Ok(Decoded::EndOfTransfer);
        }
        if frame.index == 0 {
            // A new record starts; whatever was in flight lost its tail.
            self.abandon();
        }

        if frame.index != self.next_index {
            return Err(self.reject(format!(
                "segment {} out of order, expected {}",
                frame.index, self.next_index
            )));
        }
        if self.in_progress() && frame.count != self.count {
            return Err(self.reject(format!(
                "segment count changed from {} to {}",
                self.count, frame.count
            )));
        }
        if frame.index >= frame.count {
            return Err(self.reject(format!(
                "segment {} of {}",
                frame.index, frame.count
            )));
        }

        self.count = frame.count;
        self.buffer.extend_from_slice(frame.payload);
        self.digest.update(&packet.bytes);
        self.next_index += 1;

        if self.next_index == self.count {
            self.complete(packet)
        } else {
            Ok(Decoded::Pending)
        }
    }

    fn reset(&mut self) {
        self.clear();
    }

    fn take_abandoned(&mut self) -> u64 {
        std::mem::take(&mut self.abandoned)
    }
}
