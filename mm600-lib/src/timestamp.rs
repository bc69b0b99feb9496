//! Pump timestamps: a 32-bit RTC counter plus a signed offset from the
//! 2000-01-01 epoch, and their conversion to calendar time.

use crate::error::PumpError;
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::fmt;
use zerocopy::byteorder::big_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const DEVICE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Largest RTC value, used as the open upper bound of history requests.
pub const MAX_RTC: u32 = 0xFFFF_FFFF;

/// On-the-wire layout of a pump timestamp.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct NgpTimestampRaw {
    pub rtc: U32,
    pub offset: I32,
}

/// Pump time: seconds on the relative clock plus a signed offset, both
/// counted from local midnight, 1 January 2000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NgpTimestamp {
    pub rtc: u32,
    pub offset: i32,
}

fn pump_base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

impl NgpTimestamp {
    pub const SIZE: usize = 8;

    pub fn new(rtc: u32, offset: i32) -> Self {
        Self { rtc, offset }
    }

    /// Decode the first eight bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PumpError> {
        let (raw, _) = NgpTimestampRaw::read_from_prefix(bytes).map_err(|_| {
            PumpError::InvalidMessage(format!("timestamp needs {} bytes, got {}", Self::SIZE, bytes.len()))
        })?;
        Ok(raw.into())
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let raw = NgpTimestampRaw {
            rtc: U32::new(self.rtc),
            offset: I32::new(self.offset),
        };
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Device-local calendar time of this timestamp.
    pub fn to_date(&self) -> NaiveDateTime {
        pump_base_time() + TimeDelta::seconds(self.rtc as i64 + self.offset as i64)
    }

    /// RTC value this clock would show at `date`, keeping the current offset.
    pub fn rtc_from_date(&self, date: NaiveDateTime) -> i64 {
        (date - pump_base_time()).num_seconds() - self.offset as i64
    }

    /// Solve for the offset that maps `rtc` onto `date`.
    pub fn from_date_and_rtc(date: NaiveDateTime, rtc: u32) -> Self {
        let offset = (date - pump_base_time()).num_seconds() - rtc as i64;
        Self {
            rtc,
            offset: offset as i32,
        }
    }

    /// Same offset, RTC moved by `seconds`.
    pub fn shifted(&self, seconds: i64) -> Self {
        Self {
            rtc: (self.rtc as i64 + seconds) as u32,
            offset: self.offset,
        }
    }
}

impl From<NgpTimestampRaw> for NgpTimestamp {
    fn from(raw: NgpTimestampRaw) -> Self {
        Self {
            rtc: raw.rtc.get(),
            offset: raw.offset.get(),
        }
    }
}

impl fmt::Display for NgpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_device_time(self.to_date()))
    }
}

pub fn format_device_time(date: NaiveDateTime) -> String {
    date.format(DEVICE_TIME_FORMAT).to_string()
}

pub fn parse_device_time(text: &str) -> Result<NaiveDateTime, PumpError> {
    NaiveDateTime::parse_from_str(text, DEVICE_TIME_FORMAT)
        .map_err(|e| PumpError::InvalidMessage(format!("bad device time {:?}: {}", text, e)))
}
