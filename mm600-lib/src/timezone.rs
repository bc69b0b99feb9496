//! Device-local time to UTC, bootstrapped from the pump's time-change log.
//!
//! With no time changes every record gets the configured offset. Otherwise
//! each time change closes an offset interval: walking from the newest change
//! back, the difference between the old and new clock is rounded to 30
//! minutes and moved into the timezone offset (the remainder is clock drift),
//! or, when it is too large to be a timezone move, into the conversion offset.

use crate::config::FixedTimezone;
use crate::error::PumpError;
use crate::records::{DeviceEvent, Record, RecordBody};
use crate::timestamp::parse_device_time;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::Serialize;
use strum_macros::Display;
use tracing::debug;

/// Farthest timezones are UTC+14 and UTC-12.
const MAX_OFFSET_DIFFERENCE_MINUTES: i64 = 840 + 720;
const MAX_TIMEZONE_OFFSET: i32 = 840;
const MIN_TIMEZONE_OFFSET: i32 = -720;
const MINUTES_IN_DAY: i32 = 1440;
const ROUND_TO_MINUTES: i64 = 30;

pub const UNCERTAIN_TIMESTAMP: &str = "uncertain-timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TimeProcessing {
    AcrossTheBoardTimezone,
    UtcBootstrapping,
}

/// The UTC fields of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcInfo {
    pub time: DateTime<Utc>,
    pub timezone_offset: i32,
    pub clock_drift_offset: i64,
    pub conversion_offset: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Offsets {
    timezone: i32,
    clock_drift: i64,
    conversion: i64,
}

impl Offsets {
    fn to_utc(self, local: NaiveDateTime) -> DateTime<Utc> {
        (local - TimeDelta::minutes(self.timezone as i64) - TimeDelta::milliseconds(self.conversion)).and_utc()
    }

    fn info(self, local: NaiveDateTime) -> UtcInfo {
        UtcInfo {
            time: self.to_utc(local),
            timezone_offset: self.timezone,
            clock_drift_offset: self.clock_drift,
            conversion_offset: self.conversion,
        }
    }

    /// Fold one clock change (old clock minus new clock) into the offsets
    /// valid before it.
    fn adjust(&mut self, from: NaiveDateTime, to: NaiveDateTime) {
        let raw = from - to;
        let minutes = raw.num_minutes();
        let rounded = ((minutes as f64 / ROUND_TO_MINUTES as f64) + 0.5).floor() as i64 * ROUND_TO_MINUTES;
        let raw_ms = raw.num_seconds() * 1000;
        if rounded.abs() <= MAX_OFFSET_DIFFERENCE_MINUTES {
            self.timezone += rounded as i32;
            self.clock_drift += raw_ms - rounded * 60_000;
        } else {
            self.conversion += raw_ms;
        }
        while self.timezone > MAX_TIMEZONE_OFFSET {
            self.timezone -= MINUTES_IN_DAY;
            self.conversion += MINUTES_IN_DAY as i64 * 60_000;
        }
        while self.timezone < MIN_TIMEZONE_OFFSET {
            self.timezone += MINUTES_IN_DAY;
            self.conversion -= MINUTES_IN_DAY as i64 * 60_000;
        }
    }
}

/// Offsets valid for records with `start_index < index <= end_index`, or,
/// without an index, for UTC times between `start` and `end`.
#[derive(Debug, Clone)]
struct OffsetInterval {
    start: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    start_index: Option<u32>,
    end_index: Option<u32>,
    offsets: Offsets,
}

impl OffsetInterval {
    fn contains_index(&self, index: u32) -> bool {
        match (self.start_index, self.end_index) {
            (Some(start), Some(end)) => index > start && index <= end,
            (Some(start), None) => index > start,
            (None, Some(end)) => index <= end,
            (None, None) => false,
        }
    }

    fn contains_time(&self, utc: DateTime<Utc>) -> bool {
        match self.start {
            // later than the newest interval's end covers clocks set into the future
            Some(start) => utc >= start,
            None => utc <= self.end,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimezoneOffsetUtil {
    timezone: FixedTimezone,
    kind: TimeProcessing,
    intervals: Vec<OffsetInterval>,
    records: Vec<Record>,
}

impl TimezoneOffsetUtil {
    /// Build the offset intervals from time-change records. `most_recent` is
    /// the device time of the newest history event.
    pub fn new(timezone: &FixedTimezone, most_recent: NaiveDateTime, changes: Vec<Record>) -> Result<Self, PumpError> {
        debug!(
            "Bootstrapping UTC: timezone {} ({} min), most recent {}, {} time changes",
            timezone.name,
            timezone.offset_minutes,
            most_recent,
            changes.len()
        );
        let current = Offsets {
            timezone: timezone.offset_minutes,
            ..Offsets::default()
        };
        let mut util = Self {
            timezone: timezone.clone(),
            kind: TimeProcessing::AcrossTheBoardTimezone,
            intervals: Vec::new(),
            records: Vec::new(),
        };
        if changes.is_empty() {
            return Ok(util);
        }
        util.kind = TimeProcessing::UtcBootstrapping;

        let mut sorted = changes;
        sorted.sort_by_key(|c| c.index);
        sorted.reverse();

        let mut offsets = current;
        let mut end = current.to_utc(most_recent);
        let mut end_index: Option<u32> = None;
        for mut change in sorted {
            let (from, to) = match &change.body {
                RecordBody::DeviceEvent(DeviceEvent::TimeChange { change }) => {
                    (parse_device_time(&change.from)?, parse_device_time(&change.to)?)
                }
                other => {
                    return Err(PumpError::Record(format!(
                        "Wrong record passed as time change: {}",
                        other.type_name()
                    )));
                }
            };
            let info = offsets.info(change.device_time);
            change.time = Some(info.time);
            change.timezone_offset = info.timezone_offset;
            change.clock_drift_offset = info.clock_drift_offset;
            change.conversion_offset = info.conversion_offset;

            util.intervals.push(OffsetInterval {
                start: Some(info.time),
                end,
                start_index: change.index,
                end_index,
                offsets,
            });
            offsets.adjust(from, to);
            end = info.time;
            end_index = change.index;
            util.records.push(change.done()?);
        }
        util.intervals.push(OffsetInterval {
            start: None,
            end,
            start_index: None,
            end_index,
            offsets,
        });
        debug!("Computed offset intervals: {:?}", util.intervals);
        Ok(util)
    }

    pub fn kind(&self) -> TimeProcessing {
        self.kind
    }

    pub fn timezone(&self) -> &FixedTimezone {
        &self.timezone
    }

    /// The time-change records with their UTC fields, newest first.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn take_records(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.records)
    }

    /// UTC fields for a device-local time, by index when known.
    pub fn lookup(&self, local: NaiveDateTime, index: Option<u32>) -> Option<UtcInfo> {
        if self.intervals.is_empty() {
            let offsets = Offsets {
                timezone: self.timezone.offset_minutes,
                ..Offsets::default()
            };
            return Some(offsets.info(local));
        }
        self.intervals.iter().find_map(|interval| {
            let info = interval.offsets.info(local);
            let hit = match index {
                Some(index) => interval.contains_index(index),
                None => interval.contains_time(info.time),
            };
            hit.then_some(info)
        })
    }

    pub fn fill_in_utc_info(&self, record: &mut Record) {
        match self.lookup(record.device_time, record.index) {
            Some(info) => {
                record.time = Some(info.time);
                record.timezone_offset = info.timezone_offset;
                record.clock_drift_offset = info.clock_drift_offset;
                record.conversion_offset = info.conversion_offset;
                if record.index.is_none() {
                    record.annotate_code(UNCERTAIN_TIMESTAMP);
                }
            }
            None => debug!("Could not look up UTC info for {:?}", record),
        }
    }
}
