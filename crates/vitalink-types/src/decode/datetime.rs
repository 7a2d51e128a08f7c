//! Bluetooth SIG Date Time field (7 bytes).

use bytes::Buf;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::error::{ParseError, ParseResult};

/// Encoded length of a Date Time field.
pub(crate) const DATE_TIME_LEN: usize = 7;

/// Read a Date Time field: year (u16 LE), month, day, hours, minutes, seconds.
///
/// Year, month and day all zero means the device does not know the time;
/// that yields `None`. Device clocks carry no zone, so the value is taken as UTC.
pub(crate) fn read_date_time(buf: &mut &[u8]) -> ParseResult<Option<OffsetDateTime>> {
    if buf.remaining() < DATE_TIME_LEN {
        return Err(ParseError::Truncated {
            expected: DATE_TIME_LEN,
            actual: buf.remaining(),
        });
    }

    let year = buf.get_u16_le();
    let month = buf.get_u8();
    let day = buf.get_u8();
    let hour = buf.get_u8();
    let minute = buf.get_u8();
    let second = buf.get_u8();

    if year == 0 && month == 0 && day == 0 {
        return Ok(None);
    }

    let month = Month::try_from(month)
        .map_err(|_| ParseError::malformed(format!("invalid month {month}")))?;
    let date = Date::from_calendar_date(i32::from(year), month, day)
        .map_err(|e| ParseError::malformed(format!("invalid date: {e}")))?;
    let time = Time::from_hms(hour, minute, second)
        .map_err(|e| ParseError::malformed(format!("invalid time: {e}")))?;

    Ok(Some(PrimitiveDateTime::new(date, time).assume_utc()))
}

/// Encode a Date Time field. `None` encodes as the all-zero "unknown" value.
pub(crate) fn encode_date_time(value: Option<OffsetDateTime>) -> [u8; DATE_TIME_LEN] {
    let Some(value) = value else {
        return [0; DATE_TIME_LEN];
    };
    let year = (value.year() as u16).to_le_bytes();
    [
        year[0],
        year[1],
        u8::from(value.month()),
        value.day(),
        value.hour(),
        value.minute(),
        value.second(),
    ]
}
