//! Clinical records produced from pump history.
//!
//! Every record carries the common time fields; the kind-specific part lives
//! in [`RecordBody`], serialized flat next to them with a `type` tag.

use crate::error::PumpError;
use crate::timestamp::{DEVICE_TIME_FORMAT, NgpTimestamp};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

pub const MG_DL: &str = "mg/dL";
pub const MMOL_L: &str = "mmol/L";
pub const MMOL_TO_MG_DL: f64 = 18.01559;

pub const AUTO_BASAL_SCHEDULE: &str = "Auto-Basal";
pub const AUTO_MODE_SCHEDULE: &str = "Auto Mode";

pub const DEVICE_MANUFACTURERS: &[&str] = &["Medtronic"];

fn serialize_device_time<S: Serializer>(date: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&date.format(DEVICE_TIME_FORMAT).to_string())
}

fn serialize_utc<S: Serializer>(time: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
    match time {
        Some(t) => s.serialize_str(&t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        None => s.serialize_none(),
    }
}

/// Round to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Annotation {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            value: None,
            threshold: None,
        }
    }

    pub fn out_of_range(value: &str, threshold: f64) -> Self {
        Self {
            code: "bg/out-of-range".to_string(),
            value: Some(value.to_string()),
            threshold: Some(threshold),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryType {
    Scheduled,
    Temp,
    Suspend,
    Automated,
}

/// The basal a temp or suspend basal replaces, possibly itself suppressing another.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "basal", rename_all = "camelCase")]
pub struct Suppressed {
    pub delivery_type: DeliveryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<Box<Suppressed>>,
}

impl Suppressed {
    pub fn scheduled(rate: f64, schedule_name: Option<String>) -> Self {
        Self {
            delivery_type: DeliveryType::Scheduled,
            rate: Some(rate),
            schedule_name,
            percent: None,
            suppressed: None,
        }
    }

    /// Same delivery type, rate and schedule as `basal`.
    pub fn matches(&self, basal: &Basal) -> bool {
        self.delivery_type == basal.delivery_type
            && self.rate == basal.rate
            && self.schedule_name == basal.schedule_name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Basal {
    pub delivery_type: DeliveryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<Suppressed>,
}

impl Basal {
    fn new(delivery_type: DeliveryType) -> Self {
        Self {
            delivery_type,
            rate: None,
            duration: None,
            expected_duration: None,
            schedule_name: None,
            percent: None,
            suppressed: None,
        }
    }

    pub fn scheduled(rate: f64, schedule_name: Option<String>) -> Self {
        Self {
            rate: Some(rate),
            schedule_name,
            ..Self::new(DeliveryType::Scheduled)
        }
    }

    pub fn automated(rate: f64) -> Self {
        Self {
            rate: Some(rate),
            schedule_name: Some(AUTO_BASAL_SCHEDULE.to_string()),
            ..Self::new(DeliveryType::Automated)
        }
    }

    pub fn temp(rate: f64, suppressed: Suppressed) -> Self {
        Self {
            rate: Some(rate),
            suppressed: Some(suppressed),
            ..Self::new(DeliveryType::Temp)
        }
    }

    pub fn suspend(duration: i64) -> Self {
        Self {
            duration: Some(duration),
            ..Self::new(DeliveryType::Suspend)
        }
    }

    /// Snapshot of this basal for the `suppressed` field of another.
    pub fn as_suppressed(&self) -> Suppressed {
        Suppressed {
            delivery_type: self.delivery_type,
            rate: self.rate,
            schedule_name: self.schedule_name.clone(),
            percent: self.percent.filter(|p| *p != 0.0),
            suppressed: self.suppressed.clone().map(Box::new),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BolusSubType {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "square")]
    Square,
    #[serde(rename = "dual/square")]
    Dual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bolus {
    pub sub_type: BolusSubType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_normal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_extended: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
}

impl Bolus {
    fn new(sub_type: BolusSubType) -> Self {
        Self {
            sub_type,
            normal: None,
            expected_normal: None,
            extended: None,
            expected_extended: None,
            duration: None,
            expected_duration: None,
        }
    }

    pub fn normal(normal: f64) -> Self {
        Self {
            normal: Some(normal),
            ..Self::new(BolusSubType::Normal)
        }
    }

    pub fn square(extended: f64, duration: i64) -> Self {
        Self {
            extended: Some(extended),
            duration: Some(duration),
            ..Self::new(BolusSubType::Square)
        }
    }

    pub fn dual(normal: f64, extended: f64, duration: i64) -> Self {
        Self {
            normal: Some(normal),
            extended: Some(extended),
            duration: Some(duration),
            ..Self::new(BolusSubType::Dual)
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        let needs_normal = matches!(self.sub_type, BolusSubType::Normal | BolusSubType::Dual);
        let needs_extended = matches!(self.sub_type, BolusSubType::Square | BolusSubType::Dual);
        if needs_normal && self.normal.is_none() {
            return Err("bolus without normal amount");
        }
        if needs_extended && (self.extended.is_none() || self.duration.is_none()) {
            return Err("extended bolus without amount or duration");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommended {
    pub carb: f64,
    pub correction: f64,
    pub net: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRange {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Wizard {
    pub recommended: Recommended,
    /// The bolus this estimate led to, without its bookkeeping fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bolus: Option<Box<Record>>,
    pub carb_input: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insulin_on_board: Option<f64>,
    pub insulin_carb_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insulin_sensitivity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bg_target: Option<TargetRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bg_input: Option<f64>,
    pub units: String,
    pub carb_units: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SmbgSubType {
    Linked,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Smbg {
    pub sub_type: SmbgSubType,
    pub value: f64,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cbg {
    pub value: f64,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeChange {
    pub from: String,
    pub to: String,
    pub agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasonAgent {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspendReason {
    pub suspended: ReasonAgent,
    pub resumed: ReasonAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimeTarget {
    Tubing,
    Cannula,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subType", rename_all = "camelCase")]
pub enum DeviceEvent {
    #[serde(rename_all = "camelCase")]
    TimeChange { change: TimeChange },
    #[serde(rename_all = "camelCase")]
    Alarm { alarm_type: String },
    Calibration { value: f64, units: String },
    Status {
        status: String,
        reason: SuspendReason,
        duration: i64,
    },
    ReservoirChange,
    #[serde(rename_all = "camelCase")]
    Prime { prime_target: PrimeTarget, volume: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasalScheduleEntry {
    pub start: i64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountEntry {
    pub start: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub start: i64,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsUnits {
    pub bg: String,
    pub carb: String,
}

impl Default for SettingsUnits {
    fn default() -> Self {
        Self {
            bg: MG_DL.to_string(),
            carb: "grams".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueWithUnits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsulinAction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calculator {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    pub insulin: InsulinAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enabled {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BolusSettings {
    pub calculator: Calculator,
    pub extended: Enabled,
    pub amount_maximum: ValueWithUnits,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasalSettings {
    pub rate_maximum: ValueWithUnits,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplaySettings {
    pub blood_glucose: BgDisplay,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BgDisplay {
    pub units: String,
}

/// One pumpSettings snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSnapshot {
    pub units: SettingsUnits,
    pub carb_ratio: Vec<AmountEntry>,
    pub insulin_sensitivity: Vec<AmountEntry>,
    pub bg_target: Vec<TargetEntry>,
    pub bolus: BolusSettings,
    pub basal: BasalSettings,
    pub display: DisplaySettings,
    pub manufacturers: Vec<String>,
    pub model: String,
    pub serial_number: String,
    pub basal_schedules: BTreeMap<String, Vec<BasalScheduleEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_schedule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecordBody {
    Basal(Basal),
    Bolus(Bolus),
    Wizard(Wizard),
    Smbg(Smbg),
    Cbg(Cbg),
    PumpSettings(SettingsSnapshot),
    DeviceEvent(DeviceEvent),
}

impl RecordBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            RecordBody::Basal(_) => "basal",
            RecordBody::Bolus(_) => "bolus",
            RecordBody::Wizard(_) => "wizard",
            RecordBody::Smbg(_) => "smbg",
            RecordBody::Cbg(_) => "cbg",
            RecordBody::PumpSettings(_) => "pumpSettings",
            RecordBody::DeviceEvent(_) => "deviceEvent",
        }
    }
}

/// A clinical record with its time fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(flatten)]
    pub body: RecordBody,
    #[serde(serialize_with = "serialize_device_time")]
    pub device_time: NaiveDateTime,
    #[serde(serialize_with = "serialize_utc", skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    pub timezone_offset: i32,
    pub clock_drift_offset: i64,
    pub conversion_offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// RTC of the event the record came from.
    #[serde(skip)]
    pub index: Option<u32>,
}

impl Record {
    /// A record stamped with the device-local time of `timestamp`; UTC fields
    /// are filled in later by the timezone bookkeeping.
    pub fn at(body: RecordBody, timestamp: NgpTimestamp) -> Self {
        Self {
            body,
            device_time: timestamp.to_date(),
            time: None,
            timezone_offset: 0,
            clock_drift_offset: 0,
            conversion_offset: 0,
            device_id: None,
            annotations: Vec::new(),
            payload: None,
            index: Some(timestamp.rtc),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn annotate(&mut self, annotation: Annotation) {
        if !self.annotations.contains(&annotation) {
            self.annotations.push(annotation);
        }
    }

    pub fn annotate_code(&mut self, code: &str) {
        self.annotate(Annotation::new(code));
    }

    pub fn has_annotation(&self, code: &str) -> bool {
        self.annotations.iter().any(|a| a.code == code)
    }

    /// UTC instant, falling back to device time when it has not been filled in.
    pub fn utc(&self) -> DateTime<Utc> {
        self.time.unwrap_or_else(|| self.device_time.and_utc())
    }

    /// Move the record by `ms` on both clocks.
    pub fn shift(&mut self, ms: i64) {
        let delta = TimeDelta::milliseconds(ms);
        self.device_time += delta;
        self.time = self.time.map(|t| t + delta);
    }

    /// The NGP timestamp this record was stamped from, recovered from device
    /// time and index.
    pub fn ngp_timestamp(&self) -> Option<NgpTimestamp> {
        self.index
            .map(|rtc| NgpTimestamp::from_date_and_rtc(self.device_time, rtc))
    }

    pub fn basal(&self) -> Option<&Basal> {
        match &self.body {
            RecordBody::Basal(b) => Some(b),
            _ => None,
        }
    }

    pub fn basal_mut(&mut self) -> Option<&mut Basal> {
        match &mut self.body {
            RecordBody::Basal(b) => Some(b),
            _ => None,
        }
    }

    pub fn bolus(&self) -> Option<&Bolus> {
        match &self.body {
            RecordBody::Bolus(b) => Some(b),
            _ => None,
        }
    }

    pub fn smbg(&self) -> Option<&Smbg> {
        match &self.body {
            RecordBody::Smbg(s) => Some(s),
            _ => None,
        }
    }

    pub fn wizard(&self) -> Option<&Wizard> {
        match &self.body {
            RecordBody::Wizard(w) => Some(w),
            _ => None,
        }
    }

    pub fn settings(&self) -> Option<&SettingsSnapshot> {
        match &self.body {
            RecordBody::PumpSettings(s) => Some(s),
            _ => None,
        }
    }

    pub fn device_event(&self) -> Option<&DeviceEvent> {
        match &self.body {
            RecordBody::DeviceEvent(e) => Some(e),
            _ => None,
        }
    }

    /// End of a basal with a known duration.
    pub fn basal_end(&self) -> Option<DateTime<Utc>> {
        let duration = self.basal()?.duration?;
        Some(self.utc() + TimeDelta::milliseconds(duration))
    }

    /// Check that every field the record kind requires is present.
    pub fn done(self) -> Result<Self, PumpError> {
        let missing = |what: &str| {
            Err(PumpError::Record(format!(
                "{} at {}: {}",
                self.body.type_name(),
                self.device_time.format(DEVICE_TIME_FORMAT),
                what
            )))
        };
        if self.time.is_none() && !matches!(self.body, RecordBody::DeviceEvent(DeviceEvent::TimeChange { .. })) {
            return missing("time not set");
        }
        match &self.body {
            RecordBody::Basal(b) => {
                match b.duration {
                    None => return missing("basal without duration"),
                    Some(d) if d < 0 => return missing("negative basal duration"),
                    _ => {}
                }
                if b.delivery_type != DeliveryType::Suspend && b.rate.is_none() {
                    return missing("basal without rate");
                }
                if b.delivery_type == DeliveryType::Temp && b.suppressed.is_none() {
                    return missing("temp basal without suppressed basal");
                }
            }
            RecordBody::Bolus(b) => {
                if let Err(what) = b.validate() {
                    return missing(what);
                }
            }
            RecordBody::DeviceEvent(DeviceEvent::Status { duration, .. }) if *duration < 0 => {
                return missing("negative suspend duration");
            }
            _ => {}
        }
        Ok(self)
    }
}

/// Live settings read from the pump at download time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpSettings {
    #[serde(default)]
    pub units: SettingsUnits,
    pub current_ngp_timestamp: NgpTimestamp,
    #[serde(default)]
    pub active_schedule: Option<String>,
    #[serde(default)]
    pub bg_target: Vec<TargetEntry>,
    #[serde(default)]
    pub carb_ratio: Vec<AmountEntry>,
    #[serde(default)]
    pub insulin_sensitivity: Vec<AmountEntry>,
    #[serde(default)]
    pub basal_schedules: BTreeMap<String, Vec<BasalScheduleEntry>>,
    #[serde(default)]
    pub pump_serial: String,
    #[serde(default)]
    pub pump_model: String,
    #[serde(default)]
    pub is_bolus_wizard_enabled: Option<bool>,
    #[serde(default)]
    pub duration_of_insulin_action: Option<i64>,
    #[serde(default)]
    pub is_extended_bolus_enabled: Option<bool>,
    #[serde(default)]
    pub max_bolus_amount: Option<f64>,
    #[serde(default)]
    pub max_basal_amount: Option<f64>,
    #[serde(default)]
    pub display_bg_units: Option<String>,
}

impl PumpSettings {
    pub fn new(current_ngp_timestamp: NgpTimestamp) -> Self {
        Self {
            units: SettingsUnits::default(),
            current_ngp_timestamp,
            active_schedule: None,
            bg_target: Vec::new(),
            carb_ratio: Vec::new(),
            insulin_sensitivity: Vec::new(),
            basal_schedules: BTreeMap::new(),
            pump_serial: String::new(),
            pump_model: String::new(),
            is_bolus_wizard_enabled: None,
            duration_of_insulin_action: None,
            is_extended_bolus_enabled: None,
            max_bolus_amount: None,
            max_basal_amount: None,
            display_bg_units: None,
        }
    }

    pub fn device_id(&self) -> String {
        format!("{}:{}", self.pump_model, self.pump_serial)
    }

    pub fn current_device_time(&self) -> NaiveDateTime {
        self.current_ngp_timestamp.to_date()
    }

    /// The snapshot describing these settings as they are now.
    pub fn snapshot(&self, manufacturers: &[&str]) -> SettingsSnapshot {
        SettingsSnapshot {
            units: self.units.clone(),
            carb_ratio: self.carb_ratio.clone(),
            insulin_sensitivity: self.insulin_sensitivity.clone(),
            bg_target: self.bg_target.clone(),
            bolus: BolusSettings {
                calculator: Calculator {
                    enabled: self.is_bolus_wizard_enabled,
                    insulin: InsulinAction {
                        duration: self.duration_of_insulin_action,
                        units: "minutes".to_string(),
                    },
                },
                extended: Enabled {
                    enabled: self.is_extended_bolus_enabled,
                },
                amount_maximum: ValueWithUnits {
                    value: self.max_bolus_amount,
                    units: "Units".to_string(),
                },
            },
            basal: BasalSettings {
                rate_maximum: ValueWithUnits {
                    value: self.max_basal_amount,
                    units: "Units/hour".to_string(),
                },
            },
            display: DisplaySettings {
                blood_glucose: BgDisplay {
                    units: match self.display_bg_units.as_deref() {
                        Some(MMOL_L) => MMOL_L.to_string(),
                        _ => MG_DL.to_string(),
                    },
                },
            },
            manufacturers: manufacturers.iter().map(|m| m.to_string()).collect(),
            model: self.pump_model.clone(),
            serial_number: self.pump_serial.clone(),
            basal_schedules: self.basal_schedules.clone(),
            active_schedule: self.active_schedule.clone(),
        }
    }
}
