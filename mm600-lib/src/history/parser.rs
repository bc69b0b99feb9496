//! Correlation of decoded history events into clinical records.
//!
//! Every `build_*` pass scans the events for the kinds it handles and appends
//! records to `out`. Passes only share two pieces of state: wizard estimates
//! claimed by a bolus, and the time of a temp basal whose start was not in
//! the downloaded history.

use super::event::{
    BOLUS_PROGRAMMED_DELIVERED_GAP, BolusSource, BgUnits, CL_TRANSITION_INTO_ACTIVE, EventType, EventView,
    HistoryEvent, ScheduleChange, ScheduleKind, ScheduleValue, bg_context, resume_reason, suspend_reason,
};
use crate::config::FixedTimezone;
use crate::error::PumpError;
use crate::records::{
    AUTO_MODE_SCHEDULE, AmountEntry, Annotation, Basal, BasalScheduleEntry, Bolus, Cbg, DEVICE_MANUFACTURERS,
    DeviceEvent, MG_DL, MMOL_TO_MG_DL, PrimeTarget, PumpSettings, ReasonAgent, Recommended, Record, RecordBody,
    SettingsSnapshot, Smbg, SmbgSubType, Suppressed, SuspendReason, TargetEntry, TargetRange, TimeChange, Wizard,
    round_to,
};
use crate::timestamp::{NgpTimestamp, format_device_time};
use crate::timezone::{TimeProcessing, TimezoneOffsetUtil};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Sensor values from here up are status codes, not glucose.
const CGM_MAX_VALID: u16 = 769;
const CGM_HIGH: u16 = 776;
const CGM_LOW: u16 = 777;

/// Longest a bolus can take to deliver.
const BOLUS_MAX_SECONDS: i64 = 8 * 3600;
/// Closed-loop BG context readings follow their first reading within this window.
const BG_CONTEXT_WINDOW_SECONDS: i64 = 900;
/// Micro-boluses are delivered every five minutes.
const MICRO_BOLUSES_PER_HOUR: f64 = 12.0;

const OLD_SETTINGS_TYPES: [EventType; 4] = [
    EventType::OldBolusWizardBgTargets,
    EventType::OldBolusWizardInsulinSensitivity,
    EventType::OldBolusWizardInsulinToCarbRatios,
    EventType::OldBasalPattern,
];

const NEW_SETTINGS_TYPES: [EventType; 9] = [
    EventType::NewBolusWizardBgTargets,
    EventType::NewBolusWizardInsulinSensitivity,
    EventType::NewBolusWizardInsulinToCarbRatios,
    EventType::NewBasalPattern,
    EventType::BasalPatternSelected,
    EventType::MaxBasalRateChange,
    EventType::MaxBolusChange,
    EventType::DualBolusOptionChange,
    EventType::BolusWizardSettingsChange,
];

fn to_mg_dl(units: BgUnits, value: f64) -> f64 {
    match units {
        BgUnits::MgDl => value,
        BgUnits::MmolL => round_to(value * MMOL_TO_MG_DL, 2),
    }
}

fn seconds_between(from: NgpTimestamp, to: NgpTimestamp) -> i64 {
    to.rtc as i64 - from.rtc as i64
}

fn time_change_record(event: &HistoryEvent, device_id: &str) -> Option<Record> {
    let EventView::TimeChange(raw) = event.view() else {
        return None;
    };
    let new_timestamp = raw.new_timestamp();
    let change = TimeChange {
        from: format_device_time(event.timestamp().to_date()),
        to: format_device_time(new_timestamp.to_date()),
        agent: "manual".to_string(),
    };
    let mut record = Record::at(RecordBody::DeviceEvent(DeviceEvent::TimeChange { change }), new_timestamp);
    record.device_id = Some(device_id.to_string());
    Some(record)
}

/// Apply the values carried by a schedule change to `snapshot`.
fn apply_schedule(snapshot: &mut SettingsSnapshot, schedule: &ScheduleChange<'_>) {
    let entries = schedule.entries();
    match schedule.kind {
        ScheduleKind::BgTargets => {
            let units = schedule.bg_units();
            snapshot.bg_target = entries
                .iter()
                .filter_map(|e| match e.value {
                    ScheduleValue::Target { low, high } => Some(TargetEntry {
                        start: e.start_ms,
                        low: to_mg_dl(units, low),
                        high: to_mg_dl(units, high),
                    }),
                    _ => None,
                })
                .collect();
        }
        ScheduleKind::InsulinSensitivity => {
            let units = schedule.bg_units();
            snapshot.insulin_sensitivity = entries
                .iter()
                .filter_map(|e| match e.value {
                    ScheduleValue::Amount(amount) => Some(AmountEntry {
                        start: e.start_ms,
                        amount: to_mg_dl(units, amount),
                    }),
                    _ => None,
                })
                .collect();
        }
        ScheduleKind::CarbRatios => {
            snapshot.units.carb = schedule.carb_units().label().to_string();
            snapshot.carb_ratio = entries
                .iter()
                .filter_map(|e| match e.value {
                    ScheduleValue::Amount(amount) => Some(AmountEntry {
                        start: e.start_ms,
                        amount,
                    }),
                    _ => None,
                })
                .collect();
        }
        ScheduleKind::BasalPattern => {
            let Some(name) = schedule.pattern_name() else {
                warn!("Basal pattern change for unknown pattern {}", schedule.pattern_number());
                return;
            };
            let rates = entries
                .iter()
                .filter_map(|e| match e.value {
                    ScheduleValue::Rate(rate) => Some(BasalScheduleEntry { start: e.start_ms, rate }),
                    _ => None,
                })
                .collect();
            snapshot.basal_schedules.insert(name.to_string(), rates);
        }
    }
}

pub struct HistoryParser {
    settings: PumpSettings,
    events: Vec<HistoryEvent>,
    device_id: String,
    tz: TimezoneOffsetUtil,
    first_basal_time: Option<NgpTimestamp>,
    consumed_wizards: HashSet<usize>,
}

impl HistoryParser {
    /// Set up a parser over `events`, in history order, and bootstrap the
    /// UTC offsets from the time changes among them.
    pub fn new(settings: PumpSettings, events: Vec<HistoryEvent>, timezone: &FixedTimezone) -> Result<Self, PumpError> {
        let device_id = settings.device_id();
        let changes: Vec<Record> = events
            .iter()
            .filter(|e| e.event_type() == EventType::UserTimeDateChange)
            .filter_map(|e| time_change_record(e, &device_id))
            .collect();
        let most_recent = events
            .last()
            .map(|e| e.timestamp().to_date())
            .unwrap_or_else(|| settings.current_device_time());
        let tz = TimezoneOffsetUtil::new(timezone, most_recent, changes)?;
        debug!(
            "Parsing {} history events for {} ({})",
            events.len(),
            device_id,
            tz.kind()
        );
        Ok(Self {
            settings,
            events,
            device_id,
            tz,
            first_basal_time: None,
            consumed_wizards: HashSet::new(),
        })
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn timezone_util(&self) -> &TimezoneOffsetUtil {
        &self.tz
    }

    pub fn time_processing(&self) -> TimeProcessing {
        self.tz.kind()
    }

    /// Run every pass in upload order.
    pub fn build_records(&mut self) -> Result<Vec<Record>, PumpError> {
        let mut out = Vec::new();
        self.build_time_change_records(&mut out)?
            .build_settings_records(&mut out)?
            .build_basal_records(&mut out)?
            .build_temp_basal_records(&mut out)?
            .build_suspend_resume_records(&mut out)?
            .build_normal_bolus_records(&mut out)?
            .build_square_bolus_records(&mut out)?
            .build_dual_bolus_records(&mut out)?
            .build_wizard_without_bolus_records(&mut out)?
            .build_alarm_records(&mut out)?
            .build_calibration_records(&mut out)?
            .build_rewind_records(&mut out)?
            .build_prime_records(&mut out)?
            .build_cgm_records(&mut out)?
            .build_bg_records(&mut out)?;
        Ok(out)
    }

    fn record_at(&self, body: RecordBody, timestamp: NgpTimestamp) -> Record {
        let mut record = Record::at(body, timestamp);
        record.device_id = Some(self.device_id.clone());
        self.tz.fill_in_utc_info(&mut record);
        record
    }

    fn indices_of(&self, types: &[EventType]) -> Vec<usize> {
        self.events
            .iter()
            .enumerate()
            .filter(|(_, e)| types.contains(&e.event_type()))
            .map(|(i, _)| i)
            .collect()
    }

    fn last_at_or_before(&self, index: usize, matches: impl Fn(&HistoryEvent) -> bool) -> Option<usize> {
        let end = (index + 1).min(self.events.len());
        self.events[..end].iter().rposition(matches)
    }

    fn first_from(&self, index: usize, matches: impl Fn(&HistoryEvent) -> bool) -> Option<usize> {
        self.events
            .get(index..)?
            .iter()
            .position(matches)
            .map(|offset| index + offset)
    }

    /// Context readings sharing the value of the first reading at `index`,
    /// up to the next first reading.
    fn matching_closed_loop_readings(&self, index: usize, bg_value: u16) -> Vec<usize> {
        let until = self.events[index].timestamp().rtc as i64 + BG_CONTEXT_WINDOW_SECONDS;
        let mut matching = Vec::new();
        for (i, event) in self.events.iter().enumerate().skip(index + 1) {
            if event.timestamp().rtc as i64 >= until {
                break;
            }
            if let EventView::ClosedLoopBgReading(reading) = event.view() {
                if reading.is_first_reading() {
                    break;
                }
                if reading.bg_value.get() == bg_value {
                    matching.push(i);
                }
            }
        }
        matching
    }

    fn smbg_for_calibration(&self, index: usize, bg_value: u16) -> Option<NgpTimestamp> {
        self.last_at_or_before(index, |e| match e.view() {
            EventView::BgReading(bg) => bg.bg_value() == bg_value,
            EventView::ClosedLoopBgReading(bg) => bg.is_first_reading() && bg.bg_value.get() == bg_value,
            _ => false,
        })
        .map(|i| self.events[i].timestamp())
    }

    fn suppressed_basal(&self, index: usize) -> Option<Suppressed> {
        let found = self.last_at_or_before(index, |e| e.event_type() == EventType::BasalSegmentStart)?;
        match self.events[found].view() {
            EventView::BasalSegmentStart(segment) => Some(Suppressed::scheduled(
                segment.rate(),
                segment.pattern_name().map(str::to_string),
            )),
            _ => None,
        }
    }

    /// Timestamp of the programmed event that opened the bolus delivered at `index`.
    fn bolus_begin_timestamp(&self, index: usize) -> Option<NgpTimestamp> {
        let delivered = &self.events[index];
        let number = delivered.bolus()?.bolus_number;
        let programmed = EventType::from(u8::from(delivered.event_type()).wrapping_sub(BOLUS_PROGRAMMED_DELIVERED_GAP));
        let earliest = delivered.timestamp().rtc as i64 - BOLUS_MAX_SECONDS;
        self.last_at_or_before(index, |e| {
            e.event_type() == programmed
                && e.bolus().is_some_and(|b| b.bolus_number == number)
                && e.timestamp().rtc as i64 > earliest
        })
        .map(|i| self.events[i].timestamp())
    }

    fn auto_mode_start_gap_ms(&self, index: usize) -> i64 {
        let start = self.events[index].timestamp();
        self.first_from(index, |e| match e.view() {
            EventView::NormalBolusDelivered(b) => b.bolus.source() == BolusSource::ClosedLoopMicroBolus,
            EventView::BasalSegmentStart(_) => true,
            _ => false,
        })
        .map(|i| seconds_between(start, self.events[i].timestamp()) * 1000)
        .unwrap_or(0)
    }

    fn matching_dual_square_part(&self, index: usize, bolus_number: u8) -> Option<usize> {
        self.first_from(index, |e| match e.view() {
            EventView::DualBolusPartDelivered(part) => part.is_square_part() && part.bolus.bolus_number == bolus_number,
            _ => false,
        })
    }

    /// Claim the unclaimed wizard estimate offering `amount`, preferring the
    /// nearest one before `index`.
    fn claim_wizard(&mut self, index: usize, amount: f64) -> Option<usize> {
        let fits = |i: &usize| {
            !self.consumed_wizards.contains(i)
                && self.events[*i]
                    .wizard_estimate()
                    .is_some_and(|w| w.final_estimate() == amount)
        };
        let found = (0..=index.min(self.events.len().saturating_sub(1)))
            .rev()
            .find(fits)
            .or_else(|| (index + 1..self.events.len()).find(fits));
        if let Some(i) = found {
            self.consumed_wizards.insert(i);
        }
        found
    }

    /// Each temp basal completion with the nearest earlier programmed start
    /// not already taken by an earlier completion.
    fn temp_basal_pairs(&self) -> Vec<(usize, Option<usize>)> {
        let mut consumed_starts = HashSet::new();
        self.indices_of(&[EventType::TempBasalComplete])
            .into_iter()
            .map(|index| {
                let start = (0..index)
                    .rev()
                    .find(|i| {
                        self.events[*i].event_type() == EventType::TempBasalProgrammed && !consumed_starts.contains(i)
                    });
                if let Some(i) = start {
                    consumed_starts.insert(i);
                }
                (index, start)
            })
            .collect()
    }

    /// Time of the last temp basal completion with no programmed start in the
    /// history; scheduled basals before it are superseded by data already uploaded.
    fn orphaned_temp_basal_time(&self) -> Option<NgpTimestamp> {
        self.temp_basal_pairs()
            .into_iter()
            .filter(|(_, start)| start.is_none())
            .last()
            .map(|(i, _)| self.events[i].timestamp())
    }

    fn wizard_record(&self, index: usize, bolus: Record) -> Result<Record, PumpError> {
        let event = &self.events[index];
        let w = event
            .wizard_estimate()
            .ok_or_else(|| PumpError::Record(format!("event {:?} is not a wizard estimate", event)))?;
        let mut bolus = bolus;
        bolus.index = None;
        let wizard = Wizard {
            recommended: Recommended {
                carb: w.food_estimate(),
                correction: w.correction_estimate(),
                net: w.wizard_estimate(),
            },
            bolus: Some(Box::new(bolus)),
            carb_input: w.carb_input(),
            insulin_on_board: w.iob(),
            insulin_carb_ratio: w.carb_ratio(),
            insulin_sensitivity: w.isf(),
            bg_target: w.bg_target().map(|(low, high)| TargetRange { low, high }),
            bg_input: Some(w.bg_input()).filter(|bg| *bg > 0.0),
            units: w.bg_units().label().to_string(),
            carb_units: w.carb_units().label().to_string(),
        };
        let mut record = self.record_at(RecordBody::Wizard(wizard), event.timestamp());
        if w.is_meal_wizard() {
            record.annotate_code("wizard/target-automated");
        }
        record.done()
    }

    /// The wizard record wrapping `bolus`, or the bolus itself when no
    /// estimate offered `amount`.
    fn with_wizard(&mut self, index: usize, is_wizard: bool, amount: f64, bolus: Record) -> Result<Record, PumpError> {
        if !is_wizard {
            return Ok(bolus);
        }
        match self.claim_wizard(index, amount) {
            Some(wizard) => self.wizard_record(wizard, bolus),
            None => {
                debug!("No wizard estimate for bolus of {} U at {}", amount, bolus.device_time);
                Ok(bolus)
            }
        }
    }

    pub fn build_time_change_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        out.extend(self.tz.take_records());
        Ok(self)
    }

    /// One snapshot per settings change, walking back from the live settings,
    /// then the live snapshot itself.
    pub fn build_settings_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        if self.events.last().is_some_and(|e| e.is_closed_loop_active()) {
            self.settings
                .basal_schedules
                .insert(AUTO_MODE_SCHEDULE.to_string(), Vec::new());
            self.settings.active_schedule = Some(AUTO_MODE_SCHEDULE.to_string());
        }
        let current = self.settings.snapshot(DEVICE_MANUFACTURERS);
        let mut snapshot = current.clone();

        for index in self.indices_of(&[&OLD_SETTINGS_TYPES[..], &NEW_SETTINGS_TYPES[..]].concat()).into_iter().rev() {
            let event = &self.events[index];
            let view = event.view();
            let is_new = match view {
                EventView::Schedule(schedule) => {
                    apply_schedule(&mut snapshot, &schedule);
                    schedule.is_new
                }
                EventView::BasalPatternSelected(change) => {
                    snapshot.active_schedule = change.new_pattern_name().map(str::to_string);
                    true
                }
                EventView::MaxBasalRateChange(change) => {
                    snapshot.basal.rate_maximum.value = Some(change.new_value());
                    true
                }
                EventView::MaxBolusChange(change) => {
                    snapshot.bolus.amount_maximum.value = Some(change.new_value());
                    true
                }
                EventView::DualBolusOptionChange(change) => {
                    snapshot.bolus.extended.enabled = Some(change.new_option != 0);
                    true
                }
                EventView::BolusWizardSettingsChange(change) => {
                    snapshot.bolus.calculator.insulin.duration =
                        Some(change.new_duration_of_insulin_action.get() as i64);
                    snapshot.bolus.calculator.enabled = Some(change.new_enabled());
                    true
                }
                _ => {
                    warn!("Skipping malformed settings change {:?}", event);
                    continue;
                }
            };
            if is_new {
                let record = self.record_at(RecordBody::PumpSettings(snapshot.clone()), event.timestamp());
                out.push(record.done()?);
            }
            match view {
                EventView::BasalPatternSelected(change) => {
                    snapshot.active_schedule = change.old_pattern_name().map(str::to_string);
                }
                EventView::MaxBasalRateChange(change) => snapshot.basal.rate_maximum.value = Some(change.old_value()),
                EventView::MaxBolusChange(change) => snapshot.bolus.amount_maximum.value = Some(change.old_value()),
                EventView::DualBolusOptionChange(change) => {
                    snapshot.bolus.extended.enabled = Some(change.old_option != 0);
                }
                EventView::BolusWizardSettingsChange(change) => {
                    snapshot.bolus.calculator.insulin.duration =
                        Some(change.old_duration_of_insulin_action.get() as i64);
                    snapshot.bolus.calculator.enabled = Some(change.old_enabled());
                }
                _ => {}
            }
        }

        let now = self.settings.current_ngp_timestamp;
        out.push(self.record_at(RecordBody::PumpSettings(current), now).done()?);
        Ok(self)
    }

    /// Scheduled segments, auto-mode starts and micro-boluses.
    pub fn build_basal_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        if self.first_basal_time.is_none() {
            self.first_basal_time = self.orphaned_temp_basal_time();
        }
        let cutoff = self.first_basal_time.map(|t| t.to_date());
        let types = [
            EventType::BasalSegmentStart,
            EventType::ClosedLoopTransition,
            EventType::NormalBolusDelivered,
        ];
        for index in self.indices_of(&types) {
            let event = &self.events[index];
            let timestamp = event.timestamp();
            let record = match event.view() {
                EventView::BasalSegmentStart(segment) => {
                    if cutoff.is_some_and(|c| c > timestamp.to_date()) {
                        debug!("Dropping basal segment at {} before the first temp basal", timestamp);
                        continue;
                    }
                    let basal = Basal::scheduled(segment.rate(), segment.pattern_name().map(str::to_string));
                    self.record_at(RecordBody::Basal(basal), timestamp)
                }
                EventView::ClosedLoopTransition(transition) => {
                    if transition.transition_value != CL_TRANSITION_INTO_ACTIVE {
                        continue;
                    }
                    let mut basal = Basal::automated(0.0);
                    basal.duration = Some(self.auto_mode_start_gap_ms(index));
                    self.record_at(RecordBody::Basal(basal), timestamp)
                }
                EventView::NormalBolusDelivered(bolus) if bolus.bolus.source() == BolusSource::ClosedLoopMicroBolus => {
                    let delivered = bolus.delivered_amount();
                    let basal = Basal::automated(round_to(delivered * MICRO_BOLUSES_PER_HOUR, 3));
                    self.record_at(RecordBody::Basal(basal), timestamp)
                        .with_payload(json!({ "microbolusAmount": delivered }))
                }
                _ => continue,
            };
            out.push(record);
        }
        Ok(self)
    }

    pub fn build_temp_basal_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for (index, start_index) in self.temp_basal_pairs() {
            let EventView::TempBasalComplete(complete) = self.events[index].view() else {
                continue;
            };
            let Some(start_index) = start_index else {
                self.first_basal_time = Some(self.events[index].timestamp());
                continue;
            };
            let EventView::TempBasalProgrammed(start) = self.events[start_index].view() else {
                continue;
            };
            let Some(suppressed) = self.suppressed_basal(start_index) else {
                debug!("No scheduled basal before temp basal at {}", self.events[start_index].timestamp());
                continue;
            };
            let suppressed_rate = suppressed.rate.unwrap_or_default();
            let start_ts = self.events[start_index].timestamp();
            let mut basal = Basal::temp(complete.rate(), suppressed);
            basal.duration = Some(complete.duration_ms());
            basal.expected_duration = Some(start.expected_duration_ms());
            if complete.canceled() {
                basal.duration = Some(seconds_between(start_ts, self.events[index].timestamp()) * 1000);
            }
            if complete.is_percentage() {
                let fraction = complete.percentage_of_rate() as f64 / 100.0;
                basal.percent = Some(fraction);
                basal.rate = Some(suppressed_rate * fraction);
            }
            out.push(self.record_at(RecordBody::Basal(basal), start_ts));
        }

        // a temp basal still running at download time
        let last = self
            .indices_of(&[EventType::TempBasalProgrammed, EventType::TempBasalComplete])
            .last()
            .copied();
        if let Some(index) = last {
            if let EventView::TempBasalProgrammed(programmed) = self.events[index].view() {
                if let Some(suppressed) = self.suppressed_basal(index) {
                    let suppressed_rate = suppressed.rate.unwrap_or_default();
                    let mut basal = Basal::temp(programmed.rate(), suppressed);
                    basal.duration = Some(programmed.expected_duration_ms());
                    basal.expected_duration = Some(programmed.expected_duration_ms());
                    if programmed.is_percentage() {
                        let fraction = programmed.percentage_of_rate as f64 / 100.0;
                        basal.percent = Some(fraction);
                        basal.rate = Some(suppressed_rate * fraction);
                    }
                    let mut record = self.record_at(RecordBody::Basal(basal), self.events[index].timestamp());
                    record.annotate_code("basal/unknown-duration");
                    out.push(record);
                }
            }
        }
        Ok(self)
    }

    pub fn build_suspend_resume_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::InsulinDeliveryStopped]) {
            let event = &self.events[index];
            let EventView::InsulinDeliveryStopped(stop) = event.view() else {
                continue;
            };
            let resume = self
                .first_from(index, |e| e.event_type() == EventType::InsulinDeliveryRestarted)
                .map(|i| &self.events[i]);
            let resume_code = resume.and_then(|r| match r.view() {
                EventView::InsulinDeliveryRestarted(raw) => Some(raw.reason),
                _ => None,
            });

            let suspended = match stop.reason {
                suspend_reason::USER_SUSPEND | suspend_reason::SET_CHANGE_SUSPEND => ReasonAgent::Manual,
                _ => ReasonAgent::Automatic,
            };
            let resumed = match resume_code {
                Some(resume_reason::USER_SELECTS_RESUME | resume_reason::USER_CLEARS_ALARM) => ReasonAgent::Manual,
                _ => ReasonAgent::Automatic,
            };
            let resumed_cause = match (resume, resume_code) {
                (None, _) => Some("not_resumed"),
                (Some(_), reason) => reason.and_then(resume_reason::name),
            };
            let payload = json!({
                "suspended": { "cause": suspend_reason::name(stop.reason) },
                "resumed": { "cause": resumed_cause },
            });

            let duration = resume
                .map(|r| seconds_between(event.timestamp(), r.timestamp()) * 1000)
                .unwrap_or(0);
            if duration < 0 {
                return Err(PumpError::Record(format!(
                    "Suspend at {} has negative duration {}",
                    event.timestamp(),
                    duration
                )));
            }

            let status = DeviceEvent::Status {
                status: "suspended".to_string(),
                reason: SuspendReason { suspended, resumed },
                duration,
            };
            let mut record = self
                .record_at(RecordBody::DeviceEvent(status), event.timestamp())
                .with_payload(payload);
            if resume.is_none() {
                record.annotate_code("status/incomplete-tuple");
            }
            out.push(record.done()?);
            out.push(self.record_at(RecordBody::Basal(Basal::suspend(duration)), event.timestamp()));
        }
        Ok(self)
    }

    pub fn build_normal_bolus_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::NormalBolusDelivered]) {
            let event = self.events[index].clone();
            let EventView::NormalBolusDelivered(raw) = event.view() else {
                continue;
            };
            if raw.bolus.source() == BolusSource::ClosedLoopMicroBolus {
                continue;
            }
            let Some(begin) = self.bolus_begin_timestamp(index) else {
                debug!("No programmed event for normal bolus {}", raw.bolus.bolus_number);
                continue;
            };
            let (programmed, delivered) = (raw.programmed_amount(), raw.delivered_amount());
            let mut bolus = Bolus::normal(delivered);
            if programmed != delivered {
                bolus.expected_normal = Some(programmed);
            }
            let record = self.record_at(RecordBody::Bolus(bolus), begin).done()?;
            let record = self.with_wizard(index, raw.bolus.is_wizard_bolus(), programmed, record)?;
            out.push(record);
        }
        Ok(self)
    }

    pub fn build_square_bolus_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::SquareBolusDelivered]) {
            let event = self.events[index].clone();
            let EventView::SquareBolusDelivered(raw) = event.view() else {
                continue;
            };
            let Some(begin) = self.bolus_begin_timestamp(index) else {
                debug!("No programmed event for square bolus {}", raw.bolus.bolus_number);
                continue;
            };
            let mut bolus = Bolus::square(raw.delivered_amount(), raw.delivered_duration_ms());
            if raw.programmed_amount() != raw.delivered_amount()
                || raw.programmed_duration_ms() != raw.delivered_duration_ms()
            {
                bolus.expected_extended = Some(raw.programmed_amount());
                bolus.expected_duration = Some(raw.programmed_duration_ms());
            }
            let record = self.record_at(RecordBody::Bolus(bolus), begin).done()?;
            let record = self.with_wizard(index, raw.bolus.is_wizard_bolus(), raw.programmed_amount(), record)?;
            out.push(record);
        }
        Ok(self)
    }

    /// Dual boluses are built from their normal part once the square part
    /// has finished.
    pub fn build_dual_bolus_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::DualBolusPartDelivered]) {
            let event = self.events[index].clone();
            let EventView::DualBolusPartDelivered(normal) = event.view() else {
                continue;
            };
            if !normal.is_normal_part() {
                continue;
            }
            let Some(begin) = self.bolus_begin_timestamp(index) else {
                debug!("No programmed event for dual bolus {}", normal.bolus.bolus_number);
                continue;
            };
            let Some(square_index) = self.matching_dual_square_part(index, normal.bolus.bolus_number) else {
                debug!("Dual bolus {} still in progress", normal.bolus.bolus_number);
                continue;
            };
            let square_event = self.events[square_index].clone();
            let EventView::DualBolusPartDelivered(square) = square_event.view() else {
                continue;
            };

            let mut bolus = Bolus::dual(
                normal.delivered_amount(),
                square.delivered_amount(),
                square.delivered_duration_ms(),
            );
            if normal.normal_programmed_amount() != normal.delivered_amount() {
                bolus.expected_normal = Some(normal.normal_programmed_amount());
            }
            if square.square_programmed_amount() != square.delivered_amount()
                || square.programmed_duration_ms() != square.delivered_duration_ms()
            {
                bolus.expected_extended = Some(square.square_programmed_amount());
                bolus.expected_duration = Some(square.programmed_duration_ms());
            }
            let record = self.record_at(RecordBody::Bolus(bolus), begin).done()?;
            let amount = round_to(normal.normal_programmed_amount() + normal.square_programmed_amount(), 3);
            let record = self.with_wizard(index, normal.bolus.is_wizard_bolus(), amount, record)?;
            out.push(record);
        }
        Ok(self)
    }

    /// Wizard estimates of zero that no bolus claimed get a zero bolus.
    pub fn build_wizard_without_bolus_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::BolusWizardEstimate, EventType::MealWizardEstimate]) {
            if self.consumed_wizards.contains(&index) {
                continue;
            }
            let event = &self.events[index];
            if event.wizard_estimate().is_none_or(|w| w.final_estimate() != 0.0) {
                continue;
            }
            let mut bolus = Bolus::normal(0.0);
            bolus.expected_normal = Some(0.0);
            let zero = self.record_at(RecordBody::Bolus(bolus), event.timestamp()).done()?;
            out.push(self.wizard_record(index, zero)?);
        }
        Ok(self)
    }

    pub fn build_alarm_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::LowReservoir]) {
            let event = &self.events[index];
            let EventView::LowReservoir(raw) = event.view() else {
                continue;
            };
            let units = raw.units_remaining();
            let alarm_type = if units == 0.0 { "no_insulin" } else { "low_insulin" };
            let record = self
                .record_at(
                    RecordBody::DeviceEvent(DeviceEvent::Alarm {
                        alarm_type: alarm_type.to_string(),
                    }),
                    event.timestamp(),
                )
                .with_payload(json!({
                    "amount": units,
                    "timeRemaining": raw.milliseconds_remaining(),
                }));
            out.push(record.done()?);
        }
        Ok(self)
    }

    /// Calibrations are placed at the fingerstick they used.
    pub fn build_calibration_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::CalibrationComplete]) {
            let EventView::CalibrationComplete(raw) = self.events[index].view() else {
                continue;
            };
            let bg_value = raw.bg_value.get();
            let Some(smbg_time) = self.smbg_for_calibration(index, bg_value) else {
                debug!("No fingerstick of {} for calibration", bg_value);
                continue;
            };
            let calibration = DeviceEvent::Calibration {
                value: bg_value as f64,
                units: MG_DL.to_string(),
            };
            out.push(self.record_at(RecordBody::DeviceEvent(calibration), smbg_time).done()?);
        }
        Ok(self)
    }

    pub fn build_rewind_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::Rewind]) {
            let record = self.record_at(
                RecordBody::DeviceEvent(DeviceEvent::ReservoirChange),
                self.events[index].timestamp(),
            );
            out.push(record.done()?);
        }
        Ok(self)
    }

    pub fn build_prime_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::CannulaFillDelivered]) {
            let event = &self.events[index];
            let EventView::CannulaFill(fill) = event.view() else {
                continue;
            };
            if fill.amount() == 0.0 {
                continue;
            }
            let prime = DeviceEvent::Prime {
                prime_target: if fill.is_tubing() { PrimeTarget::Tubing } else { PrimeTarget::Cannula },
                volume: fill.amount(),
            };
            out.push(self.record_at(RecordBody::DeviceEvent(prime), event.timestamp()).done()?);
        }
        Ok(self)
    }

    pub fn build_cgm_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::SensorGlucoseReadingsExtended]) {
            let EventView::SensorGlucoseReadings(readings) = self.events[index].view() else {
                continue;
            };
            for reading in readings.readings() {
                let (value, annotation) = match reading.sg {
                    CGM_HIGH => (401, Some(Annotation::out_of_range("high", 400.0))),
                    CGM_LOW => (39, Some(Annotation::out_of_range("low", 40.0))),
                    sg => (sg, None),
                };
                if reading.sg >= CGM_MAX_VALID && annotation.is_none() {
                    continue;
                }
                let cbg = Cbg {
                    value: value as f64,
                    units: MG_DL.to_string(),
                };
                let mut record = self
                    .record_at(RecordBody::Cbg(cbg), reading.timestamp)
                    .with_payload(json!({ "interstitialSignal": reading.isig }));
                if let Some(annotation) = annotation {
                    record.annotate(annotation);
                }
                out.push(record.done()?);
            }
        }
        Ok(self)
    }

    pub fn build_bg_records(&mut self, out: &mut Vec<Record>) -> Result<&mut Self, PumpError> {
        for index in self.indices_of(&[EventType::BgReading]) {
            let event = &self.events[index];
            let EventView::BgReading(bg) = event.view() else {
                continue;
            };
            let smbg = Smbg {
                sub_type: if bg.is_linked() { SmbgSubType::Linked } else { SmbgSubType::Manual },
                value: bg.bg_value() as f64,
                units: MG_DL.to_string(),
            };
            let mut record = self.record_at(RecordBody::Smbg(smbg), event.timestamp());
            if bg.is_linked() {
                record = record.with_payload(json!({ "meterSerial": bg.meter_serial() }));
            }
            out.push(record.done()?);
        }

        for index in self.indices_of(&[EventType::ClosedLoopBgReading]) {
            let event = &self.events[index];
            let EventView::ClosedLoopBgReading(bg) = event.view() else {
                continue;
            };
            if !bg.is_first_reading() {
                continue;
            }
            let smbg = Smbg {
                sub_type: if bg.is_linked() { SmbgSubType::Linked } else { SmbgSubType::Manual },
                value: bg.bg_value.get() as f64,
                units: MG_DL.to_string(),
            };
            let mut record = self.record_at(RecordBody::Smbg(smbg), event.timestamp());
            let mut contexts = Map::new();
            let mut matched = self.matching_closed_loop_readings(index, bg.bg_value.get());
            matched.push(index);
            for i in matched {
                let EventView::ClosedLoopBgReading(reading) = self.events[i].view() else {
                    continue;
                };
                let context = reading.context();
                let name = bg_context::name(context).unwrap_or("unknown");
                if !matches!(
                    context,
                    bg_context::BG_SI_PASS_RESULT_RECD_FRM_GST | bg_context::BG_SI_FAIL_RESULT_RECD_FRM_GST
                ) {
                    record.annotate_code(&format!("medtronic600/smbg/{}", name));
                }
                contexts.insert(
                    name.to_string(),
                    Value::String(format_device_time(self.events[i].timestamp().to_date())),
                );
            }
            let record = record.with_payload(json!({ "bgContexts": contexts }));
            out.push(record.done()?);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{DeliveryType, SettingsSnapshot};

    const BASE: NgpTimestamp = NgpTimestamp {
        rtc: 0x9000_0000,
        offset: -1_784_767_104,
    };

    fn at(minutes: i64) -> NgpTimestamp {
        BASE.shifted(minutes * 60)
    }

    fn event(event_type: EventType, minutes: i64, body: &[u8]) -> HistoryEvent {
        HistoryEvent::build(event_type, 0, at(minutes), body)
    }

    fn u32b(units: f64) -> [u8; 4] {
        ((units * 10000.0).round() as u32).to_be_bytes()
    }

    fn segment(minutes: i64, pattern: u8, rate: f64) -> HistoryEvent {
        let mut body = vec![pattern, 0];
        body.extend_from_slice(&u32b(rate));
        event(EventType::BasalSegmentStart, minutes, &body)
    }

    fn bolus_programmed(minutes: i64, source: u8, number: u8) -> HistoryEvent {
        event(EventType::NormalBolusProgrammed, minutes, &[source, number, 0])
    }

    fn bolus_delivered(minutes: i64, source: u8, number: u8, programmed: f64, delivered: f64) -> HistoryEvent {
        let mut body = vec![source, number, 0];
        body.extend_from_slice(&u32b(programmed));
        body.extend_from_slice(&u32b(delivered));
        body.extend_from_slice(&u32b(0.0));
        event(EventType::NormalBolusDelivered, minutes, &body)
    }

    fn wizard(minutes: i64, carbs: u16, estimate: f64) -> HistoryEvent {
        let mut body = vec![0, 0];
        body.extend_from_slice(&120u16.to_be_bytes());
        body.extend_from_slice(&carbs.to_be_bytes());
        body.extend_from_slice(&50u16.to_be_bytes());
        body.extend_from_slice(&100u32.to_be_bytes());
        body.extend_from_slice(&100u16.to_be_bytes());
        body.extend_from_slice(&120u16.to_be_bytes());
        body.extend_from_slice(&u32b(0.4));
        body.extend_from_slice(&u32b(estimate - 0.4));
        body.extend_from_slice(&u32b(0.0));
        body.extend_from_slice(&u32b(0.0));
        body.extend_from_slice(&u32b(estimate));
        body.extend_from_slice(&[1, 0]);
        body.extend_from_slice(&u32b(estimate));
        event(EventType::BolusWizardEstimate, minutes, &body)
    }

    fn settings() -> PumpSettings {
        let mut settings = PumpSettings::new(at(600));
        settings.pump_serial = "NG1234567H".to_string();
        settings.pump_model = "1780".to_string();
        settings.max_bolus_amount = Some(10.0);
        settings
    }

    fn parse(events: Vec<HistoryEvent>) -> Vec<Record> {
        let mut parser = HistoryParser::new(settings(), events, &FixedTimezone::default()).unwrap();
        parser.build_records().unwrap()
    }

    fn of_type<'a>(records: &'a [Record], type_name: &str) -> Vec<&'a Record> {
        records.iter().filter(|r| r.body.type_name() == type_name).collect()
    }

    #[test]
    fn records_carry_time_fields_and_device_id() {
        let records = parse(vec![event(EventType::Rewind, 10, &[])]);
        let rewind = records
            .iter()
            .find(|r| r.device_event() == Some(&DeviceEvent::ReservoirChange))
            .unwrap();
        assert_eq!(rewind.device_id.as_deref(), Some("1780:NG1234567H"));
        assert_eq!(format_device_time(rewind.device_time), "2020-01-01T00:10:00");
        assert_eq!(rewind.time, Some(rewind.device_time.and_utc()));
        assert_eq!(rewind.index, Some(at(10).rtc));
    }

    #[test]
    fn wizard_bolus_is_wrapped_and_claimed_once() {
        let records = parse(vec![
            wizard(0, 30, 2.5),
            bolus_programmed(1, 1, 7),
            bolus_delivered(2, 1, 7, 2.5, 2.5),
            bolus_programmed(5, 1, 8),
            bolus_delivered(6, 1, 8, 2.5, 2.0),
        ]);
        let wizards = of_type(&records, "wizard");
        assert_eq!(wizards.len(), 1);
        let w = wizards[0].wizard().unwrap();
        assert_eq!(w.carb_input, 30.0);
        assert_eq!(w.recommended.net, 2.5);
        assert_eq!(w.bg_target, Some(TargetRange { low: 100.0, high: 120.0 }));
        let nested = w.bolus.as_ref().unwrap();
        assert_eq!(nested.index, None);
        assert_eq!(nested.bolus().unwrap().normal, Some(2.5));
        assert_eq!(format_device_time(nested.device_time), "2020-01-01T00:01:00");

        // the second bolus found no free estimate
        let boluses = of_type(&records, "bolus");
        assert_eq!(boluses.len(), 1);
        assert_eq!(boluses[0].bolus().unwrap().expected_normal, Some(2.5));
    }

    #[test]
    fn bolus_without_programmed_event_is_skipped() {
        let records = parse(vec![bolus_delivered(2, 0, 3, 1.0, 1.0)]);
        assert!(of_type(&records, "bolus").is_empty());
    }

    #[test]
    fn bolus_programmed_over_eight_hours_earlier_is_not_paired() {
        let records = parse(vec![bolus_programmed(0, 0, 3), bolus_delivered(481, 0, 3, 1.0, 1.0)]);
        assert!(of_type(&records, "bolus").is_empty());

        let records = parse(vec![bolus_programmed(0, 0, 3), bolus_delivered(479, 0, 3, 1.0, 1.0)]);
        let boluses = of_type(&records, "bolus");
        assert_eq!(boluses.len(), 1);
        assert_eq!(boluses[0].index, Some(at(0).rtc));
    }

    #[test]
    fn zero_wizard_gets_zero_bolus() {
        let records = parse(vec![wizard(0, 0, 0.0)]);
        let w = of_type(&records, "wizard")[0].wizard().unwrap();
        let bolus = w.bolus.as_ref().unwrap().bolus().unwrap();
        assert_eq!(bolus.normal, Some(0.0));
        assert_eq!(bolus.expected_normal, Some(0.0));
    }

    #[test]
    fn micro_bolus_becomes_automated_basal() {
        let records = parse(vec![
            event(EventType::ClosedLoopTransition, 0, &[1, 0]),
            bolus_delivered(10, 5, 1, 0.025, 0.025),
        ]);
        let basals = of_type(&records, "basal");
        assert_eq!(basals.len(), 2);
        let start = basals[0].basal().unwrap();
        assert_eq!(start.delivery_type, DeliveryType::Automated);
        assert_eq!(start.rate, Some(0.0));
        assert_eq!(start.duration, Some(600_000));
        let micro = basals[1].basal().unwrap();
        assert_eq!(micro.rate, Some(0.3));
        assert_eq!(micro.schedule_name.as_deref(), Some("Auto-Basal"));
        assert_eq!(basals[1].payload, Some(json!({ "microbolusAmount": 0.025 })));
        assert!(of_type(&records, "bolus").is_empty());
    }

    #[test]
    fn percentage_temp_basal_uses_suppressed_rate() {
        let mut programmed = vec![0, 1];
        programmed.extend_from_slice(&u32b(0.0));
        programmed.extend_from_slice(&[50, 0, 60]);
        let mut complete = vec![0, 1];
        complete.extend_from_slice(&u32b(0.0));
        complete.extend_from_slice(&[50, 0, 60, 1]);
        let records = parse(vec![
            segment(0, 1, 0.8),
            event(EventType::TempBasalProgrammed, 10, &programmed),
            event(EventType::TempBasalComplete, 40, &complete),
        ]);
        let temp = records
            .iter()
            .filter_map(|r| r.basal().map(|b| (r, b)))
            .find(|(_, b)| b.delivery_type == DeliveryType::Temp)
            .unwrap();
        assert_eq!(temp.1.percent, Some(0.5));
        assert_eq!(temp.1.rate, Some(0.4));
        // canceled: duration from the programmed event
        assert_eq!(temp.1.duration, Some(30 * 60_000));
        assert_eq!(temp.1.expected_duration, Some(60 * 60_000));
        assert_eq!(temp.0.index, Some(at(10).rtc));
    }

    #[test]
    fn programmed_temp_basal_pairs_with_one_completion() {
        let mut complete = vec![0, 0];
        complete.extend_from_slice(&u32b(1.5));
        complete.extend_from_slice(&[0, 0, 30, 0]);
        let mut programmed = vec![0, 0];
        programmed.extend_from_slice(&u32b(1.5));
        programmed.extend_from_slice(&[0, 0, 30]);
        let events = vec![
            segment(0, 1, 0.8),
            event(EventType::TempBasalProgrammed, 10, &programmed),
            event(EventType::TempBasalComplete, 40, &complete),
            event(EventType::TempBasalComplete, 100, &complete),
            segment(120, 1, 0.8),
        ];
        let mut parser = HistoryParser::new(settings(), events, &FixedTimezone::default()).unwrap();
        let mut out = Vec::new();
        parser.build_temp_basal_records(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].index, Some(at(10).rtc));
        assert_eq!(parser.orphaned_temp_basal_time(), Some(at(100)));
    }

    #[test]
    fn running_temp_basal_is_synthesized() {
        let mut programmed = vec![0, 0];
        programmed.extend_from_slice(&u32b(1.5));
        programmed.extend_from_slice(&[0, 0, 30]);
        let records = parse(vec![
            segment(0, 1, 0.8),
            event(EventType::TempBasalProgrammed, 10, &programmed),
        ]);
        let temp = records
            .iter()
            .find(|r| r.basal().is_some_and(|b| b.delivery_type == DeliveryType::Temp))
            .unwrap();
        assert!(temp.has_annotation("basal/unknown-duration"));
        assert_eq!(temp.basal().unwrap().duration, Some(30 * 60_000));
    }

    #[test]
    fn suspend_without_resume_is_incomplete() {
        let records = parse(vec![
            event(EventType::InsulinDeliveryStopped, 0, &[suspend_reason::USER_SUSPEND]),
            event(EventType::InsulinDeliveryStopped, 100, &[suspend_reason::ALARM_SUSPEND]),
            event(EventType::InsulinDeliveryRestarted, 130, &[resume_reason::LGM_AUTO_RESUME_PSG_SG]),
        ]);
        let statuses: Vec<_> = records
            .iter()
            .filter(|r| matches!(r.device_event(), Some(DeviceEvent::Status { .. })))
            .collect();
        assert_eq!(statuses.len(), 2);
        // the first stop is matched with the only restart
        let Some(DeviceEvent::Status { reason, duration, .. }) = statuses[0].device_event() else {
            unreachable!()
        };
        assert_eq!(*duration, 130 * 60_000);
        assert_eq!(reason.suspended, ReasonAgent::Manual);
        assert_eq!(reason.resumed, ReasonAgent::Automatic);
        let suspends = records
            .iter()
            .filter(|r| r.basal().is_some_and(|b| b.delivery_type == DeliveryType::Suspend))
            .count();
        assert_eq!(suspends, 2);
    }

    #[test]
    fn cgm_out_of_range_values_are_annotated() {
        let mut body = vec![5, 3, 0, 0];
        for sg in [776u16, 150, 800] {
            body.extend_from_slice(&[(sg >> 8) as u8, sg as u8, 0x03, 0xE8, 0, 0, 0, 0, 0]);
        }
        let records = parse(vec![event(EventType::SensorGlucoseReadingsExtended, 10, &body)]);
        let cbgs = of_type(&records, "cbg");
        assert_eq!(cbgs.len(), 2);
        assert!(matches!(&cbgs[0].body, RecordBody::Cbg(c) if c.value == 401.0));
        assert_eq!(cbgs[0].annotations, vec![Annotation::out_of_range("high", 400.0)]);
        assert_eq!(cbgs[0].payload, Some(json!({ "interstitialSignal": 10.0 })));
        assert_eq!(cbgs[1].index, Some(at(5).rtc));
    }

    #[test]
    fn settings_walk_back_through_changes() {
        let mut change = Vec::new();
        change.extend_from_slice(&50_000i32.to_be_bytes());
        change.extend_from_slice(&100_000i32.to_be_bytes());
        let records = parse(vec![event(EventType::MaxBolusChange, 30, &change)]);
        let snapshots: Vec<&SettingsSnapshot> = records.iter().filter_map(|r| r.settings()).collect();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].bolus.amount_maximum.value, Some(10.0));
        assert_eq!(snapshots[1].bolus.amount_maximum.value, Some(10.0));
        let current = records.iter().rfind(|r| r.settings().is_some()).unwrap();
        assert_eq!(current.index, Some(at(600).rtc));
    }

    #[test]
    fn closed_loop_bg_collects_contexts() {
        // linked meter, value 123: received, then accepted 2 minutes later
        let reading = |minutes, context: u8| {
            let mut body = vec![0x00, 0x7B];
            body.extend_from_slice(&[0; 9]);
            body.push((context << 3) | 2);
            event(EventType::ClosedLoopBgReading, minutes, &body)
        };
        let records = parse(vec![reading(0, 0), reading(2, 1), reading(3, 4)]);
        let smbgs = of_type(&records, "smbg");
        assert_eq!(smbgs.len(), 1);
        assert_eq!(smbgs[0].smbg().unwrap().sub_type, SmbgSubType::Linked);
        assert!(smbgs[0].has_annotation("medtronic600/smbg/bg-reading-received"));
        assert!(smbgs[0].has_annotation("medtronic600/smbg/user-accepted-remote-bg"));
        assert!(!smbgs[0].has_annotation("medtronic600/smbg/bg-si-pass-result-recd-frm-gst"));
        let contexts = &smbgs[0].payload.as_ref().unwrap()["bgContexts"];
        assert_eq!(contexts["user-accepted-remote-bg"], "2020-01-01T00:02:00");
        assert_eq!(contexts.as_object().unwrap().len(), 3);
    }

    #[test]
    fn time_change_records_come_first() {
        let records = parse(vec![
            event(EventType::Rewind, 0, &[]),
            event(EventType::UserTimeDateChange, 5, &at(65).to_bytes()),
        ]);
        let Some(DeviceEvent::TimeChange { change }) = records[0].device_event() else {
            panic!("expected a time change first, got {:?}", records[0]);
        };
        assert_eq!(change.from, "2020-01-01T00:05:00");
        assert_eq!(change.to, "2020-01-01T01:05:00");
    }
}
