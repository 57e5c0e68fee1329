use super::super::error::Error;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use std::io::Cursor;

// CP56Time2a
// |         Milliseconds(D7--D0)        | Milliseconds = 0-59999
// |         Milliseconds(D15--D8)       |
// | IV(D7)   SB(D6)    Minutes(D5--D0)  | Minutes = 0-59, IV = invalid, SB = substituted
// | SU(D7)   RES2(D6-D5)  Hours(D4--D0) | Hours = 0-23, SU = summer time
// | DayOfWeek(D7--D5) DayOfMonth(D4--D0)| DayOfMonth = 1-31  DayOfWeek = 1-7
// | RES3(D7--D4)        Months(D3--D0)  | Months = 1-12
// | RES4(D7)            Year(D6--D0)    | Year = 0-99, offset 2000

pub const CP56TIME2A_SIZE: usize = 7;

/// 2000-01-01T00:00:00.000Z
const CP56TIME2A_MIN_MS: i64 = 946_684_800_000;
/// 2099-12-31T23:59:59.999Z
const CP56TIME2A_MAX_MS: i64 = 4_102_444_799_999;

/// A CP56Time2a time tag, held as milliseconds since the Unix epoch plus its flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cp56Time2a {
    pub timestamp_ms: i64,
    pub invalid: bool,
    pub substituted: bool,
    pub summer_time: bool,
}

impl Cp56Time2a {
    pub fn from_millis(timestamp_ms: i64) -> Self {
        Cp56Time2a {
            timestamp_ms,
            ..Default::default()
        }
    }

    pub fn now() -> Self {
        Self::from_millis(Utc::now().timestamp_millis())
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default()
    }

    /// Times outside 2000..=2099 are clamped to the nearest bound and flagged invalid.
    pub fn encode(&self, buf: &mut BytesMut) {
        let clamped = self
            .timestamp_ms
            .clamp(CP56TIME2A_MIN_MS, CP56TIME2A_MAX_MS);
        let invalid = self.invalid || clamped != self.timestamp_ms;
        let time = DateTime::from_timestamp_millis(clamped).unwrap_or_default();

        let msec = (time.nanosecond() / 1_000_000) as u16 % 1000 + time.second() as u16 * 1000;
        let minute = time.minute() as u8
            | if self.substituted { 0x40 } else { 0 }
            | if invalid { 0x80 } else { 0 };
        let hour = time.hour() as u8 | if self.summer_time { 0x80 } else { 0 };
        let weekday = time.weekday().number_from_monday() as u8;
        let day = time.day() as u8;
        let month = time.month() as u8;
        let year = (time.year() - 2000) as u8;

        buf.put_u16_le(msec);
        buf.put_u8(minute);
        buf.put_u8(hour);
        buf.put_u8(weekday << 5 | day);
        buf.put_u8(month);
        buf.put_u8(year);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CP56TIME2A_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    // decode info object byte to CP56Time2a
    pub fn decode(rdr: &mut Cursor<&Bytes>) -> Result<Self, Error> {
        let mut octets = [0u8; CP56TIME2A_SIZE];
        std::io::Read::read_exact(rdr, &mut octets).map_err(|_| Error::ErrTruncated)?;
        let mut rdr = Cursor::new(&octets[..]);

        let millisecond = rdr.read_u16::<LittleEndian>()?;
        let msec = (millisecond % 1000) as u32;
        let sec = (millisecond / 1000) as u32;
        let min = rdr.read_u8()?;
        let invalid = min & 0x80 != 0;
        let substituted = min & 0x40 != 0;
        let min = (min & 0x3f) as u32;
        let hour = rdr.read_u8()?;
        let summer_time = hour & 0x80 != 0;
        let hour = (hour & 0x1f) as u32;
        let day = (rdr.read_u8()? & 0x1f) as u32;
        let month = (rdr.read_u8()? & 0x0f) as u32;
        let year = 2000 + (rdr.read_u8()? & 0x7f) as i32;

        let timestamp_ms = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_milli_opt(hour, min, sec, msec))
            .map(|naive| naive.and_utc().timestamp_millis())
            .ok_or(Error::ErrInvalidTime)?;

        Ok(Cp56Time2a {
            timestamp_ms,
            invalid,
            substituted,
            summer_time,
        })
    }
}
