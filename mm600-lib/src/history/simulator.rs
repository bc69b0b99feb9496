//! Time-ordered post-processing of parsed records.
//!
//! Records are fed in UTC order. Basals get their durations from the next
//! basal, temp basals are split and restored around scheduled segments, and
//! once everything is in, suspends are cut into the basals they interrupt.

use crate::error::PumpError;
use crate::records::{
    Basal, Bolus, BolusSubType, DeliveryType, Record, RecordBody, SettingsSnapshot, SmbgSubType, Suppressed, round_to,
};
use crate::timestamp::NgpTimestamp;
use crate::timezone::TimezoneOffsetUtil;
use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};
use std::collections::HashSet;
use tracing::{debug, trace};

const DAY_MS: i64 = 86_400_000;
const FIVE_DAYS_MS: i64 = 5 * DAY_MS;
const AUTO_BASAL_INTERVAL_MS: i64 = 300_000;
/// Micro-boluses are never further apart than this.
const AUTO_BASAL_MAX_GAP_MS: i64 = 360_000;
const DUPLICATE_SMBG_WINDOW_MS: i64 = 15 * 60_000;
/// Pumps start in 2012 or earlier until the clock is set.
const LAST_UNSET_CLOCK_YEAR: i32 = 2012;

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds()
}

fn earlier(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a < b)
}

fn is_delivery(record: &Record, delivery_type: DeliveryType) -> bool {
    record.basal().is_some_and(|b| b.delivery_type == delivery_type)
}

fn duration_of(record: &Record) -> i64 {
    record.basal().and_then(|b| b.duration).unwrap_or(0)
}

fn set_duration(record: &mut Record, duration: i64) {
    if let Some(basal) = record.basal_mut() {
        basal.duration = Some(duration);
    }
}

fn check_duration(record: &Record) -> Result<(), PumpError> {
    if duration_of(record) < 0 {
        return Err(PumpError::Record(format!(
            "negative basal duration at {}",
            record.device_time
        )));
    }
    Ok(())
}

fn is_valid(record: &Record) -> bool {
    let zero_normal = |bolus: &Bolus| {
        bolus.normal == Some(0.0) && bolus.expected_normal.is_none_or(|e| e == 0.0)
    };
    match &record.body {
        RecordBody::Bolus(bolus) if bolus.sub_type == BolusSubType::Normal && zero_normal(bolus) => return false,
        RecordBody::Wizard(wizard) => {
            let empty_bolus = wizard
                .bolus
                .as_ref()
                .and_then(|b| b.bolus())
                .is_some_and(|b| zero_normal(b));
            if empty_bolus && wizard.carb_input == 0.0 {
                return false;
            }
        }
        _ => {}
    }
    if record.utc().year() <= LAST_UNSET_CLOCK_YEAR {
        debug!("Dropping record from {}: {:?}", record.utc().year(), record);
        return false;
    }
    true
}

/// Give the last basal a duration from the active schedule.
fn fabricate_from_schedule(record: &mut Record, settings: &SettingsSnapshot) {
    let local = record.utc() + TimeDelta::minutes(record.timezone_offset as i64);
    let millis_in_day = local.num_seconds_from_midnight() as i64 * 1000 + local.timestamp_subsec_millis() as i64;
    let rate = record.basal().and_then(|b| b.rate);
    let schedule = settings
        .active_schedule
        .as_ref()
        .and_then(|name| settings.basal_schedules.get(name))
        .filter(|s| !s.is_empty());
    let Some(schedule) = schedule else {
        set_duration(record, 0);
        record.annotate_code("basal/unknown-duration");
        return;
    };
    match schedule.iter().rposition(|entry| entry.start <= millis_in_day) {
        Some(i) if rate.is_some_and(|r| schedule[i].rate == round_to(r, 3)) => {
            let next_start = schedule.get(i + 1).map(|e| e.start).unwrap_or(DAY_MS);
            set_duration(record, next_start - millis_in_day);
            record.annotate_code("final-basal/fabricated-from-schedule");
        }
        _ => {
            set_duration(record, 0);
            record.annotate_code("medtronic600/basal/off-schedule-rate");
            record.annotate_code("basal/unknown-duration");
        }
    }
}

pub struct Simulator<'a> {
    tz: &'a TimezoneOffsetUtil,
    records: Vec<Record>,
    current_basal: Option<Record>,
    current_smbg: Option<Record>,
    settings: Option<SettingsSnapshot>,
    last_time: Option<DateTime<Utc>>,
}

impl<'a> Simulator<'a> {
    pub fn new(tz: &'a TimezoneOffsetUtil) -> Self {
        Self {
            tz,
            records: Vec::new(),
            current_basal: None,
            current_smbg: None,
            settings: None,
            last_time: None,
        }
    }

    pub fn add_datum(&mut self, record: Record) -> Result<(), PumpError> {
        match &record.body {
            RecordBody::Basal(_) => self.basal(record),
            RecordBody::Smbg(_) => self.smbg(record),
            RecordBody::PumpSettings(settings) => {
                let settings = settings.clone();
                self.simple(record)?;
                self.settings = Some(settings);
                Ok(())
            }
            _ => self.simple(record),
        }
    }

    fn ensure_timestamp(&mut self, record: &Record) -> Result<(), PumpError> {
        let time = record.utc();
        if let Some(last) = self.last_time {
            if last > time {
                return Err(PumpError::Record(format!(
                    "records out of order: {} after {}",
                    time, last
                )));
            }
        }
        self.last_time = Some(time);
        Ok(())
    }

    fn simple(&mut self, record: Record) -> Result<(), PumpError> {
        self.ensure_timestamp(&record)?;
        self.records.push(record);
        Ok(())
    }

    /// A record at `device_time` on the RTC of `index`, with UTC filled in.
    fn restamped(&self, body: RecordBody, template: &Record, device_time: chrono::NaiveDateTime) -> Record {
        let rtc = template.index.unwrap_or_default();
        let mut record = Record::at(body, NgpTimestamp::from_date_and_rtc(device_time, rtc));
        record.index = template.index;
        record.device_id = template.device_id.clone();
        self.tz.fill_in_utc_info(&mut record);
        record
    }

    fn basal(&mut self, mut event: Record) -> Result<(), PumpError> {
        self.ensure_timestamp(&event)?;
        if is_delivery(&event, DeliveryType::Suspend) {
            // suspends are cut into the other basals once all are in
            self.records.push(event.done()?);
            return Ok(());
        }
        let Some(mut current) = self.current_basal.take() else {
            self.current_basal = Some(event);
            return Ok(());
        };
        let event_time = event.utc();

        if is_delivery(&current, DeliveryType::Automated) {
            let gap = millis_between(current.utc(), event_time);
            let rate = current.basal().and_then(|b| b.rate);
            if gap > AUTO_BASAL_MAX_GAP_MS && rate != Some(0.0) {
                set_duration(&mut current, AUTO_BASAL_INTERVAL_MS);
                let stamp = current
                    .ngp_timestamp()
                    .ok_or_else(|| PumpError::Record(format!("automated basal without index: {:?}", current)))?;
                self.records.push(current.clone().done()?);

                let mut filler = Basal::automated(0.0);
                filler.duration = Some(gap - AUTO_BASAL_INTERVAL_MS);
                let mut inserted = Record::at(RecordBody::Basal(filler), stamp.shifted(AUTO_BASAL_INTERVAL_MS / 1000));
                inserted.device_id = current.device_id.clone();
                self.tz.fill_in_utc_info(&mut inserted);
                debug!("Filling auto-basal gap of {} ms at {}", gap, inserted.device_time);
                current = inserted;
            }
        }

        if current.basal().is_some_and(|b| b.duration.is_none()) {
            let duration = millis_between(current.utc(), event_time);
            if duration < 0 {
                return Err(PumpError::Record(format!(
                    "basal at {} ends before it starts",
                    current.device_time
                )));
            }
            set_duration(&mut current, duration);
        }

        if is_delivery(&current, DeliveryType::Temp) {
            let suppressed = current.basal().and_then(|b| b.suppressed.clone());
            let same_as_suppressed =
                |event: &Record| matches!((&suppressed, event.basal()), (Some(s), Some(b)) if s.matches(b));

            if is_delivery(&event, DeliveryType::Scheduled) && earlier(Some(event_time), current.basal_end()) {
                if same_as_suppressed(&event) {
                    trace!("Ignoring segment start for the suppressed basal at {}", event.device_time);
                    self.current_basal = Some(current);
                    return Ok(());
                }
                // the schedule changed under the temp basal: continue it over the new segment
                let split = millis_between(current.utc(), event_time);
                let mut continued = current.clone();
                let remaining = duration_of(&current) - split;
                set_duration(&mut current, split);

                let (rate, schedule_name) = event
                    .basal()
                    .map(|b| (b.rate.unwrap_or_default(), b.schedule_name.clone()))
                    .unwrap_or_default();
                if let Some(basal) = continued.basal_mut() {
                    basal.duration = Some(remaining);
                    basal.suppressed = Some(Suppressed::scheduled(rate, schedule_name));
                    if let Some(percent) = basal.percent {
                        basal.rate = Some(rate * percent);
                    }
                }
                continued.time = event.time;
                continued.device_time = event.device_time;
                continued.timezone_offset = event.timezone_offset;
                continued.clock_drift_offset = event.clock_drift_offset;
                continued.conversion_offset = event.conversion_offset;
                continued.index = event.index;
                event = continued;
            }

            let current_end = current.basal_end();
            if let Some(end) = current_end.filter(|end| *end < event_time) {
                let new_device_time = current.device_time + TimeDelta::milliseconds(duration_of(&current));
                if same_as_suppressed(&event) {
                    let mut moved = self.restamped(event.body.clone(), &current, new_device_time);
                    moved.annotations = std::mem::take(&mut event.annotations);
                    moved.payload = event.payload.take();
                    event = moved;
                } else if let Some(s) = suppressed.as_ref() {
                    // the suppressed basal resumes until the next event
                    let template = current.clone();
                    self.records.push(current.done()?);
                    let mut basal = Basal::scheduled(s.rate.unwrap_or_default(), s.schedule_name.clone());
                    basal.duration = Some(millis_between(end, event_time));
                    current = self.restamped(RecordBody::Basal(basal), &template, new_device_time);
                }
            } else if earlier(Some(event_time), current_end) {
                let duration = millis_between(current.utc(), event_time);
                set_duration(&mut current, duration);
            }
        }

        self.records.push(current.done()?);
        self.current_basal = Some(event);
        Ok(())
    }

    fn smbg(&mut self, event: Record) -> Result<(), PumpError> {
        if let (Some(current), Some(reading)) = (self.current_smbg.as_ref(), event.smbg()) {
            if let Some(previous) = current.smbg().filter(|p| p.value == reading.value) {
                if *current == event {
                    debug!("Dropping exact duplicate fingerstick at {}", event.device_time);
                    return Ok(());
                }
                let gap = millis_between(current.utc(), event.utc());
                if gap < DUPLICATE_SMBG_WINDOW_MS
                    && reading.sub_type == SmbgSubType::Manual
                    && previous.sub_type == SmbgSubType::Linked
                {
                    debug!("Dropping manual copy of linked fingerstick at {}", event.device_time);
                    return Ok(());
                }
            }
        }
        self.simple(event.clone())?;
        self.current_smbg = Some(event);
        Ok(())
    }

    /// Close out the basal still running at download time.
    pub fn final_basal(&mut self) -> Result<(), PumpError> {
        let Some(mut current) = self.current_basal.take() else {
            return Ok(());
        };
        let has_duration = current.basal().is_some_and(|b| b.duration.is_some());
        match &self.settings {
            Some(settings) if is_delivery(&current, DeliveryType::Scheduled) => {
                if let Some(basal) = current.basal_mut() {
                    basal.schedule_name = settings.active_schedule.clone();
                }
                if !has_duration {
                    fabricate_from_schedule(&mut current, settings);
                }
            }
            _ => {
                if !has_duration {
                    set_duration(&mut current, 0);
                    current.annotate_code("basal/unknown-duration");
                }
            }
        }
        self.records.push(current.done()?);
        Ok(())
    }

    fn set_suppressed(&mut self, suspend: usize, basal: usize) {
        let suppressed = self.records[basal].basal().map(Basal::as_suppressed);
        if let Some(b) = self.records[suspend].basal_mut() {
            b.suppressed = suppressed;
        }
    }

    fn end(&self, index: usize) -> Option<DateTime<Utc>> {
        self.records[index].basal_end()
    }

    /// Cut every suspend into the basal it interrupts, restoring that basal
    /// after the suspend when it would have run on.
    fn apply_suspended_basals(&mut self) -> Result<(), PumpError> {
        let mut order: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.basal().is_some())
            .map(|(i, _)| i)
            .collect();
        order.sort_by_key(|i| self.records[*i].utc());

        let mut removed = HashSet::new();
        let mut active_suspend: Option<usize> = None;
        let mut active_basal: Option<usize> = None;

        for index in order {
            if is_delivery(&self.records[index], DeliveryType::Suspend) {
                if let Some(suspend) = active_suspend {
                    let end = self.end(index);
                    if end.is_some() && !earlier(self.end(suspend), end) {
                        // a second suspend before any resume
                        removed.insert(index);
                        continue;
                    }
                }
                active_suspend = Some(index);
                if active_basal.is_some_and(|b| self.records[b].utc() > self.records[index].utc()) {
                    active_basal = None;
                }
                let Some(basal) = active_basal else {
                    continue;
                };
                self.set_suppressed(index, basal);

                let mut restored = None;
                let suspend_end = self.end(index);
                let basal_end = self.end(basal);
                if let (true, Some(start), Some(stop)) = (earlier(suspend_end, basal_end), suspend_end, basal_end) {
                    let mut record = self.records[basal].clone();
                    record.time = Some(start);
                    record.device_time =
                        self.records[index].device_time + TimeDelta::milliseconds(duration_of(&self.records[index]));
                    set_duration(&mut record, millis_between(start, stop));
                    check_duration(&record)?;
                    self.records.push(record);
                    restored = Some(self.records.len() - 1);
                }

                let cut = millis_between(self.records[basal].utc(), self.records[index].utc());
                set_duration(&mut self.records[basal], cut);
                check_duration(&self.records[basal])?;
                if restored.is_some() {
                    active_basal = restored;
                }
                continue;
            }

            if let (Some(suspend), None) = (active_suspend, active_basal) {
                // a suspend that started before the first basal
                let end = self.end(suspend);
                let (time, device_time) = (self.records[index].utc(), self.records[index].device_time);
                let record = &mut self.records[suspend];
                record.time = Some(time);
                record.device_time = device_time;
                let duration = end.map(|e| millis_between(time, e)).unwrap_or(0);
                set_duration(record, duration);
                self.set_suppressed(suspend, index);
                if duration <= 0 {
                    removed.insert(suspend);
                    active_suspend = None;
                }
            }
            active_basal = Some(index);

            let basal_time = self.records[index].utc();
            if active_suspend.is_some_and(|s| self.end(s).is_some_and(|end| basal_time >= end)) {
                active_suspend = None;
            }
            let Some(mut suspend) = active_suspend else {
                continue;
            };

            if self.records[suspend].utc() < basal_time {
                let mut record = self.records[suspend].clone();
                let end = self.end(suspend);
                record.time = Some(basal_time);
                record.device_time = self.records[index].device_time;
                let remaining = end.map(|e| millis_between(basal_time, e)).unwrap_or(0);
                set_duration(&mut record, remaining);
                check_duration(&record)?;
                self.records.push(record);
                let split = self.records.len() - 1;

                let shortened = duration_of(&self.records[suspend]) - remaining;
                set_duration(&mut self.records[suspend], shortened);
                suspend = split;
                active_suspend = Some(split);
                self.set_suppressed(split, index);
                check_duration(&self.records[split])?;
            }

            let suspend_end = self.end(suspend);
            if earlier(suspend_end, self.end(index)) {
                let suspend_duration = duration_of(&self.records[suspend]);
                let record = &mut self.records[index];
                record.time = suspend_end;
                record.device_time += TimeDelta::milliseconds(suspend_duration);
                let remaining = duration_of(record) - suspend_duration;
                if remaining < 0 {
                    return Err(PumpError::Record(format!(
                        "basal at {} shorter than the suspend inside it",
                        record.device_time
                    )));
                }
                set_duration(record, remaining);
            } else {
                removed.insert(index);
            }
        }

        if !removed.is_empty() {
            debug!("Dropping {} basals covered by suspends", removed.len());
            let records = std::mem::take(&mut self.records);
            self.records = records
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !removed.contains(i))
                .map(|(_, r)| r)
                .collect();
        }
        Ok(())
    }

    /// Finish simulation and return the records in UTC order.
    pub fn get_events(mut self) -> Result<Vec<Record>, PumpError> {
        self.apply_suspended_basals()?;
        let mut records: Vec<Record> = self.records.into_iter().filter(is_valid).collect();
        records.sort_by_key(|r| r.utc());
        for record in records.iter_mut() {
            let capped = record
                .basal_mut()
                .filter(|b| b.duration.is_some_and(|d| d > FIVE_DAYS_MS))
                .map(|b| b.duration = Some(FIVE_DAYS_MS))
                .is_some();
            if capped {
                record.annotate_code("medtronic/basal/flat-rate");
            }
        }
        Ok(records)
    }
}
