//! Typed views over raw history events.
//!
//! Every event starts with an 11-byte header (type, source byte, size,
//! timestamp). Fixed-layout events are read through zerocopy structs that
//! borrow the event buffer; events with repeating parts (sensor readings,
//! schedules) get slice-backed views.

use crate::constants::basal_pattern_name;
use crate::timestamp::{NgpTimestamp, NgpTimestampRaw};
use bytes::Bytes;
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use std::fmt;
use strum_macros::Display;
use zerocopy::byteorder::big_endian::{I16, I32, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const EVENT_HEADER_SIZE: usize = 11;

/// Distance between a *_BOLUS_PROGRAMMED tag and its *_BOLUS_DELIVERED tag.
pub const BOLUS_PROGRAMMED_DELIVERED_GAP: u8 = 199;

const MIN_TO_MS: i64 = 60_000;
const HALF_HOUR_MS: i64 = 30 * MIN_TO_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive, Display)]
#[repr(u8)]
pub enum EventType {
    TimeReset = 0x02,
    UserTimeDateChange = 0x03,
    SourceIdConfiguration = 0x04,
    NetworkDeviceConnection = 0x05,
    AirplaneMode = 0x06,
    StartOfDayMarker = 0x07,
    EndOfDayMarker = 0x08,
    PlgmControllerState = 0x0B,
    ClosedLoopStatusData = 0x0C,
    ClosedLoopPeriodicData = 0x0D,
    ClosedLoopDailyData = 0x0E,
    NormalBolusProgrammed = 0x15,
    SquareBolusProgrammed = 0x16,
    DualBolusProgrammed = 0x17,
    CannulaFillDelivered = 0x1A,
    TempBasalProgrammed = 0x1B,
    BasalPatternSelected = 0x1C,
    BasalSegmentStart = 0x1D,
    InsulinDeliveryStopped = 0x1E,
    InsulinDeliveryRestarted = 0x1F,
    SelfTestRequested = 0x20,
    SelfTestResults = 0x21,
    TempBasalComplete = 0x22,
    BolusSuspended = 0x24,
    SuspendedBolusResumed = 0x25,
    SuspendedBolusCanceled = 0x26,
    BolusCanceled = 0x27,
    AlarmNotification = 0x28,
    AlarmCleared = 0x2A,
    LowReservoir = 0x2B,
    BatteryInserted = 0x2C,
    FoodEventMarker = 0x2E,
    ExerciseEventMarker = 0x2F,
    InjectionEventMarker = 0x30,
    OtherEventMarker = 0x31,
    BgReading = 0x32,
    CodeUpdate = 0x33,
    MissedMealBolusReminderExpired = 0x34,
    Rewind = 0x36,
    BatteryRemoved = 0x37,
    CalibrationComplete = 0x38,
    ActiveInsulinCleared = 0x39,
    DailyTotals = 0x3C,
    BolusWizardEstimate = 0x3D,
    MealWizardEstimate = 0x3E,
    ClosedLoopDailyTotals = 0x3F,
    UserSettingsSave = 0x50,
    UserSettingsResetToDefaults = 0x51,
    OldBasalPattern = 0x52,
    NewBasalPattern = 0x53,
    OldPresetTempBasal = 0x54,
    NewPresetTempBasal = 0x55,
    OldPresetBolus = 0x56,
    NewPresetBolus = 0x57,
    MaxBasalRateChange = 0x58,
    MaxBolusChange = 0x59,
    PersonalReminderChange = 0x5A,
    MissedMealBolusReminderChange = 0x5B,
    BolusIncrementChange = 0x5C,
    BolusWizardSettingsChange = 0x5D,
    OldBolusWizardInsulinSensitivity = 0x5E,
    NewBolusWizardInsulinSensitivity = 0x5F,
    OldBolusWizardInsulinToCarbRatios = 0x60,
    NewBolusWizardInsulinToCarbRatios = 0x61,
    OldBolusWizardBgTargets = 0x62,
    NewBolusWizardBgTargets = 0x63,
    DualBolusOptionChange = 0x64,
    SquareBolusOptionChange = 0x65,
    EasyBolusOptionChange = 0x66,
    BgReminderOptionChange = 0x68,
    BgReminderTime = 0x69,
    AudioVibrateModeChange = 0x6A,
    TimeFormatChange = 0x6B,
    LowReservoirWarningChange = 0x6C,
    LanguageChange = 0x6D,
    StartupWizardStartEnd = 0x6E,
    RemoteBolusOptionChange = 0x6F,
    AutoSuspendChange = 0x72,
    BolusDeliveryRateChange = 0x73,
    DisplayOptionChange = 0x77,
    SetChangeReminderChange = 0x78,
    BlockModeChange = 0x79,
    BolusWizardSettingsSummary = 0x7B,
    ClosedLoopBgReading = 0x82,
    ClosedLoopOptionChange = 0x86,
    ClosedLoopSettingsChanged = 0x87,
    ClosedLoopTempTargetStarted = 0x88,
    ClosedLoopTempTargetEnded = 0x89,
    ClosedLoopAlarmAutoCleared = 0x8A,
    SensorSettingsChange = 0xC8,
    OldSensorWarningLevels = 0xC9,
    NewSensorWarningLevels = 0xCA,
    GeneralSensorSettingsChange = 0xCB,
    SensorGlucoseReadings = 0xCC,
    SensorGlucoseGap = 0xCD,
    GlucoseSensorChange = 0xCE,
    SensorCalibrationRejected = 0xCF,
    SensorAlertSilenceStarted = 0xD0,
    SensorAlertSilenceEnded = 0xD1,
    OldLowSensorWarningLevels = 0xD2,
    NewLowSensorWarningLevels = 0xD3,
    OldHighSensorWarningLevels = 0xD4,
    NewHighSensorWarningLevels = 0xD5,
    SensorGlucoseReadingsExtended = 0xD6,
    NormalBolusDelivered = 0xDC,
    SquareBolusDelivered = 0xDD,
    DualBolusPartDelivered = 0xDE,
    ClosedLoopTransition = 0xDF,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Byte 1 of every event.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSource {
    pub source: B7,
    pub closed_loop_active: bool,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EventHeaderRaw {
    pub event_type: u8,
    pub source: u8,
    pub size: u8,
    pub timestamp: NgpTimestampRaw,
}

/// Glucose units as the pump encodes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum BgUnits {
    #[num_enum(default)]
    MgDl = 0,
    MmolL = 1,
}

impl BgUnits {
    pub fn label(self) -> &'static str {
        match self {
            BgUnits::MgDl => "mg/dL",
            BgUnits::MmolL => "mmol/L",
        }
    }

    /// mg/dL values are stored as-is, mmol/L values in tenths.
    fn scale(self, raw: f64) -> f64 {
        match self {
            BgUnits::MgDl => raw,
            BgUnits::MmolL => raw / 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum CarbUnits {
    #[num_enum(default)]
    Grams = 0,
    Exchanges = 1,
}

impl CarbUnits {
    pub fn label(self) -> &'static str {
        match self {
            CarbUnits::Grams => "grams",
            CarbUnits::Exchanges => "exchanges",
        }
    }

    fn scale_input(self, raw: f64) -> f64 {
        match self {
            CarbUnits::Grams => raw,
            CarbUnits::Exchanges => raw / 10.0,
        }
    }

    fn scale_ratio(self, raw: f64) -> f64 {
        match self {
            CarbUnits::Grams => raw / 10.0,
            CarbUnits::Exchanges => raw / 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum BolusSource {
    Manual = 0,
    BolusWizard = 1,
    EasyBolus = 2,
    PresetBolus = 4,
    ClosedLoopMicroBolus = 5,
    ClosedLoopBgCorrection = 6,
    ClosedLoopFoodBolus = 7,
    ClosedLoopBgCorrectionAndFoodBolus = 8,
    #[num_enum(catch_all)]
    Other(u8),
}

impl BolusSource {
    pub fn is_wizard(self) -> bool {
        matches!(
            self,
            BolusSource::BolusWizard
                | BolusSource::ClosedLoopBgCorrection
                | BolusSource::ClosedLoopFoodBolus
                | BolusSource::ClosedLoopBgCorrectionAndFoodBolus
        )
    }
}

pub mod suspend_reason {
    pub const ALARM_SUSPEND: u8 = 1;
    pub const USER_SUSPEND: u8 = 2;
    pub const AUTO_SUSPEND: u8 = 3;
    pub const LOWSG_SUSPEND: u8 = 4;
    pub const SET_CHANGE_SUSPEND: u8 = 5;
    pub const PLGM_PREDICTED_LOW_SG: u8 = 10;

    pub fn name(reason: u8) -> Option<&'static str> {
        Some(match reason {
            ALARM_SUSPEND => "Alarm suspend",
            USER_SUSPEND => "User suspend",
            AUTO_SUSPEND => "Auto suspend",
            LOWSG_SUSPEND => "Low glucose suspend",
            SET_CHANGE_SUSPEND => "Set change suspend",
            PLGM_PREDICTED_LOW_SG => "Predicted low glucose suspend",
            _ => return None,
        })
    }
}

pub mod resume_reason {
    pub const USER_SELECTS_RESUME: u8 = 1;
    pub const USER_CLEARS_ALARM: u8 = 2;
    pub const LGM_MANUAL_RESUME: u8 = 3;
    pub const LGM_AUTO_RESUME_MAX_SUSP: u8 = 4;
    pub const LGM_AUTO_RESUME_PSG_SG: u8 = 5;
    pub const LGM_MANUAL_RESUME_VIA_DISABLE: u8 = 6;

    pub fn name(reason: u8) -> Option<&'static str> {
        Some(match reason {
            USER_SELECTS_RESUME => "User resumed",
            USER_CLEARS_ALARM => "User cleared alarm",
            LGM_MANUAL_RESUME => "Low glucose manual resume",
            LGM_AUTO_RESUME_MAX_SUSP => "Low glucose auto resume - max suspend period",
            LGM_AUTO_RESUME_PSG_SG => "Low glucose auto resume - preset glucose reached",
            LGM_MANUAL_RESUME_VIA_DISABLE => "Low glucose manual resume via disable",
            _ => return None,
        })
    }
}

/// Context of a closed-loop BG reading.
pub mod bg_context {
    pub const BG_READING_RECEIVED: u8 = 0;
    pub const BG_SI_PASS_RESULT_RECD_FRM_GST: u8 = 4;
    pub const BG_SI_FAIL_RESULT_RECD_FRM_GST: u8 = 5;
    pub const ENTERED_IN_BG_ENTRY: u8 = 8;

    const NAMES: [&str; 13] = [
        "bg-reading-received",
        "user-accepted-remote-bg",
        "user-rejected-remote-bg",
        "remote-bg-acceptance-screen-timeout",
        "bg-si-pass-result-recd-frm-gst",
        "bg-si-fail-result-recd-frm-gst",
        "bg-sent-for-calib",
        "user-rejected-sensor-calib",
        "entered-in-bg-entry",
        "entered-in-meal-wizard",
        "entered-in-bolus-wizard",
        "entered-in-sensor-calib",
        "entered-as-bg-marker",
    ];

    /// Kebab-case name used in annotations.
    pub fn name(context: u8) -> Option<&'static str> {
        NAMES.get(context as usize).copied()
    }
}

pub const TEMP_BASAL_PRESET_NAMES: [&str; 9] = [
    "Manual",
    "Temp 1",
    "Temp 2",
    "Temp 3",
    "Temp 4",
    "High Activity",
    "Moderate Activity",
    "Low Activity",
    "Sick",
];

pub const TEMP_BASAL_TYPE_PERCENTAGE: u8 = 1;
pub const CANNULA_FILL_TYPE_TUBING: u8 = 0;
pub const DUAL_BOLUS_PART_NORMAL: u8 = 1;
pub const DUAL_BOLUS_PART_SQUARE: u8 = 2;
pub const CL_TRANSITION_INTO_ACTIVE: u8 = 1;
pub const RESERVOIR_WARNING_INSULIN: u8 = 0;

fn units(raw: u32) -> f64 {
    raw as f64 / 10000.0
}

fn signed_units(raw: i32) -> f64 {
    raw as f64 / 10000.0
}

fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be_i16(data: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([data[at], data[at + 1]])
}

fn be_i32(data: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Sign-extend the low `bits` bits of `value`.
fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TimeChangeRaw {
    pub header: EventHeaderRaw,
    pub new_timestamp: NgpTimestampRaw,
}

impl TimeChangeRaw {
    pub fn new_timestamp(&self) -> NgpTimestamp {
        self.new_timestamp.into()
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AlarmNotificationRaw {
    pub header: EventHeaderRaw,
    pub fault_number: U16,
    reserved: [u8; 4],
    pub notification_mode: u8,
    pub flags: u8,
    pub alarm_data: [u8; 9],
}

impl AlarmNotificationRaw {
    pub fn has_extra_data(&self) -> bool {
        self.flags & 2 != 0
    }

    pub fn alarm_history(&self) -> bool {
        self.flags & 4 != 0
    }

    pub fn alarm_data_hex(&self) -> String {
        hex::encode(self.alarm_data)
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct LowReservoirRaw {
    pub header: EventHeaderRaw,
    pub warning_type: u8,
    pub hours_remaining: u8,
    pub minutes_remaining: u8,
    pub units_remaining: U32,
}

impl LowReservoirRaw {
    pub fn units_remaining(&self) -> f64 {
        units(self.units_remaining.get())
    }

    pub fn milliseconds_remaining(&self) -> i64 {
        (self.hours_remaining as i64 * 60 + self.minutes_remaining as i64) * MIN_TO_MS
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CalibrationCompleteRaw {
    pub header: EventHeaderRaw,
    pub cal_factor: U16,
    /// Always mg/dL.
    pub bg_value: U16,
}

impl CalibrationCompleteRaw {
    pub fn cal_factor(&self) -> f64 {
        self.cal_factor.get() as f64 / 100.0
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ClosedLoopBgReadingRaw {
    pub header: EventHeaderRaw,
    /// Always mg/dL.
    pub bg_value: U16,
    reserved: [u8; 9],
    pub flags: u8,
}

impl ClosedLoopBgReadingRaw {
    /// Units the pump displays; the stored value is mg/dL regardless.
    pub fn bg_units(&self) -> BgUnits {
        if self.flags & 1 != 0 { BgUnits::MmolL } else { BgUnits::MgDl }
    }

    /// Received from a linked meter rather than typed in.
    pub fn received_from_rf(&self) -> bool {
        self.flags & 2 != 0
    }

    pub fn context(&self) -> u8 {
        (self.flags & 0xF8) >> 3
    }

    pub fn is_linked(&self) -> bool {
        self.received_from_rf()
    }

    /// The reading that opens a group of context events for the same value.
    pub fn is_first_reading(&self) -> bool {
        if self.received_from_rf() {
            self.context() == bg_context::BG_READING_RECEIVED
        } else {
            self.context() >= bg_context::ENTERED_IN_BG_ENTRY
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ClosedLoopTransitionRaw {
    pub header: EventHeaderRaw,
    pub transition_value: u8,
    pub transition_reason: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BasalSegmentStartRaw {
    pub header: EventHeaderRaw,
    pub pattern_number: u8,
    pub segment_number: u8,
    pub rate: U32,
}

impl BasalSegmentStartRaw {
    pub fn rate(&self) -> f64 {
        units(self.rate.get())
    }

    pub fn pattern_name(&self) -> Option<&'static str> {
        basal_pattern_name(self.pattern_number)
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TempBasalProgrammedRaw {
    pub header: EventHeaderRaw,
    pub preset: u8,
    pub temp_type: u8,
    pub rate: U32,
    pub percentage_of_rate: u8,
    pub duration_minutes: U16,
}

impl TempBasalProgrammedRaw {
    pub fn rate(&self) -> f64 {
        units(self.rate.get())
    }

    pub fn expected_duration_ms(&self) -> i64 {
        self.duration_minutes.get() as i64 * MIN_TO_MS
    }

    pub fn is_percentage(&self) -> bool {
        self.temp_type == TEMP_BASAL_TYPE_PERCENTAGE
    }

    pub fn preset_name(&self) -> Option<&'static str> {
        TEMP_BASAL_PRESET_NAMES.get(self.preset as usize).copied()
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TempBasalCompleteRaw {
    pub header: EventHeaderRaw,
    pub preset: u8,
    pub temp_type: u8,
    pub rate: U32,
    pub percentage_of_rate: u8,
    pub short_duration_minutes: U16,
    pub flags: u8,
}

/// TEMP_BASAL_COMPLETE; events of 23 bytes or more carry the actual
/// duration after the flags byte.
#[derive(Debug, Clone, Copy)]
pub struct TempBasalComplete<'a> {
    pub raw: &'a TempBasalCompleteRaw,
    long_duration_minutes: Option<u16>,
}

impl TempBasalComplete<'_> {
    pub fn rate(&self) -> f64 {
        units(self.raw.rate.get())
    }

    pub fn percentage_of_rate(&self) -> u8 {
        self.raw.percentage_of_rate
    }

    pub fn duration_ms(&self) -> i64 {
        let minutes = self
            .long_duration_minutes
            .unwrap_or_else(|| self.raw.short_duration_minutes.get());
        minutes as i64 * MIN_TO_MS
    }

    pub fn canceled(&self) -> bool {
        self.raw.flags & 1 == 1
    }

    pub fn is_percentage(&self) -> bool {
        self.raw.temp_type == TEMP_BASAL_TYPE_PERCENTAGE
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CannulaFillRaw {
    pub header: EventHeaderRaw,
    pub fill_type: u8,
    pub amount: U32,
    pub reservoir_remaining: U32,
}

impl CannulaFillRaw {
    pub fn amount(&self) -> f64 {
        units(self.amount.get())
    }

    pub fn reservoir_remaining(&self) -> f64 {
        units(self.reservoir_remaining.get())
    }

    pub fn is_tubing(&self) -> bool {
        self.fill_type == CANNULA_FILL_TYPE_TUBING
    }
}

/// Fields shared by every programmed and delivered bolus event.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BolusRaw {
    pub header: EventHeaderRaw,
    pub bolus_source: u8,
    pub bolus_number: u8,
    pub preset_bolus_number: u8,
}

impl BolusRaw {
    pub fn source(&self) -> BolusSource {
        BolusSource::from(self.bolus_source)
    }

    pub fn is_wizard_bolus(&self) -> bool {
        self.source().is_wizard()
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct NormalBolusDeliveredRaw {
    pub bolus: BolusRaw,
    pub programmed_amount: U32,
    pub delivered_amount: U32,
    pub iob: U32,
}

impl NormalBolusDeliveredRaw {
    pub fn programmed_amount(&self) -> f64 {
        units(self.programmed_amount.get())
    }

    pub fn delivered_amount(&self) -> f64 {
        units(self.delivered_amount.get())
    }

    pub fn iob(&self) -> f64 {
        units(self.iob.get())
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SquareBolusDeliveredRaw {
    pub bolus: BolusRaw,
    pub programmed_amount: U32,
    pub delivered_amount: U32,
    pub programmed_duration_minutes: U16,
    pub delivered_duration_minutes: U16,
}

impl SquareBolusDeliveredRaw {
    pub fn programmed_amount(&self) -> f64 {
        units(self.programmed_amount.get())
    }

    pub fn delivered_amount(&self) -> f64 {
        units(self.delivered_amount.get())
    }

    pub fn programmed_duration_ms(&self) -> i64 {
        self.programmed_duration_minutes.get() as i64 * MIN_TO_MS
    }

    pub fn delivered_duration_ms(&self) -> i64 {
        self.delivered_duration_minutes.get() as i64 * MIN_TO_MS
    }
}

/// One half of a dual-wave bolus; `bolus_part` says which.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DualBolusPartDeliveredRaw {
    pub bolus: BolusRaw,
    pub normal_programmed_amount: U32,
    pub square_programmed_amount: U32,
    pub delivered_amount: U32,
    pub bolus_part: u8,
    pub programmed_duration_minutes: U16,
    pub delivered_duration_minutes: U16,
    pub iob: U32,
}

impl DualBolusPartDeliveredRaw {
    pub fn normal_programmed_amount(&self) -> f64 {
        units(self.normal_programmed_amount.get())
    }

    pub fn square_programmed_amount(&self) -> f64 {
        units(self.square_programmed_amount.get())
    }

    pub fn delivered_amount(&self) -> f64 {
        units(self.delivered_amount.get())
    }

    pub fn programmed_duration_ms(&self) -> i64 {
        self.programmed_duration_minutes.get() as i64 * MIN_TO_MS
    }

    pub fn delivered_duration_ms(&self) -> i64 {
        self.delivered_duration_minutes.get() as i64 * MIN_TO_MS
    }

    pub fn is_normal_part(&self) -> bool {
        self.bolus_part == DUAL_BOLUS_PART_NORMAL
    }

    pub fn is_square_part(&self) -> bool {
        self.bolus_part == DUAL_BOLUS_PART_SQUARE
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BolusWizardEstimateRaw {
    pub header: EventHeaderRaw,
    pub bg_units: u8,
    pub carb_units: u8,
    pub bg_input: U16,
    pub carb_input: U16,
    pub isf: U16,
    pub carb_ratio: U32,
    pub low_bg_target: U16,
    pub high_bg_target: U16,
    pub correction_estimate: U32,
    pub food_estimate: U32,
    pub iob: U32,
    pub iob_adjustment: U32,
    pub wizard_estimate: U32,
    pub bolus_step_size: u8,
    pub flags: u8,
    pub final_estimate: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MealWizardEstimateRaw {
    pub header: EventHeaderRaw,
    pub unit_flags: u8,
    pub bg_input: U16,
    pub carb_input: U16,
    pub correction_estimate: U32,
    pub food_estimate: U32,
    pub wizard_estimate: U32,
    pub carb_ratio: U32,
}

/// The common face of bolus wizard and meal wizard estimates.
#[derive(Debug, Clone, Copy)]
pub enum WizardEstimate<'a> {
    Bolus(&'a BolusWizardEstimateRaw),
    Meal(&'a MealWizardEstimateRaw),
}

impl WizardEstimate<'_> {
    pub fn bg_units(&self) -> BgUnits {
        match self {
            WizardEstimate::Bolus(w) => BgUnits::from(w.bg_units),
            WizardEstimate::Meal(w) => BgUnits::from(w.unit_flags & 1),
        }
    }

    pub fn carb_units(&self) -> CarbUnits {
        match self {
            WizardEstimate::Bolus(w) => CarbUnits::from(w.carb_units),
            WizardEstimate::Meal(w) => CarbUnits::from((w.unit_flags & 2) >> 1),
        }
    }

    pub fn bg_input(&self) -> f64 {
        let raw = match self {
            WizardEstimate::Bolus(w) => w.bg_input.get(),
            WizardEstimate::Meal(w) => w.bg_input.get(),
        };
        self.bg_units().scale(raw as f64)
    }

    pub fn carb_input(&self) -> f64 {
        let raw = match self {
            WizardEstimate::Bolus(w) => w.carb_input.get(),
            WizardEstimate::Meal(w) => w.carb_input.get(),
        };
        self.carb_units().scale_input(raw as f64)
    }

    pub fn carb_ratio(&self) -> f64 {
        let raw = match self {
            WizardEstimate::Bolus(w) => w.carb_ratio.get(),
            WizardEstimate::Meal(w) => w.carb_ratio.get(),
        };
        self.carb_units().scale_ratio(raw as f64)
    }

    /// Only the bolus wizard records a sensitivity and targets.
    pub fn isf(&self) -> Option<f64> {
        match self {
            WizardEstimate::Bolus(w) => Some(self.bg_units().scale(w.isf.get() as f64)),
            WizardEstimate::Meal(_) => None,
        }
    }

    pub fn bg_target(&self) -> Option<(f64, f64)> {
        match self {
            WizardEstimate::Bolus(w) => Some((
                self.bg_units().scale(w.low_bg_target.get() as f64),
                self.bg_units().scale(w.high_bg_target.get() as f64),
            )),
            WizardEstimate::Meal(_) => None,
        }
    }

    pub fn correction_estimate(&self) -> f64 {
        match self {
            WizardEstimate::Bolus(w) => units(w.correction_estimate.get()),
            WizardEstimate::Meal(w) => units(w.correction_estimate.get()),
        }
    }

    pub fn food_estimate(&self) -> f64 {
        match self {
            WizardEstimate::Bolus(w) => units(w.food_estimate.get()),
            WizardEstimate::Meal(w) => units(w.food_estimate.get()),
        }
    }

    pub fn wizard_estimate(&self) -> f64 {
        match self {
            WizardEstimate::Bolus(w) => units(w.wizard_estimate.get()),
            WizardEstimate::Meal(w) => units(w.wizard_estimate.get()),
        }
    }

    /// The amount offered for delivery. The meal wizard does not let the
    /// user change it.
    pub fn final_estimate(&self) -> f64 {
        match self {
            WizardEstimate::Bolus(w) => units(w.final_estimate.get()),
            WizardEstimate::Meal(_) => self.wizard_estimate(),
        }
    }

    pub fn iob(&self) -> Option<f64> {
        match self {
            WizardEstimate::Bolus(w) => Some(units(w.iob.get())),
            WizardEstimate::Meal(_) => None,
        }
    }

    pub fn estimate_modified_by_user(&self) -> bool {
        match self {
            WizardEstimate::Bolus(w) => w.flags & 1 == 1,
            WizardEstimate::Meal(_) => false,
        }
    }

    pub fn is_meal_wizard(&self) -> bool {
        matches!(self, WizardEstimate::Meal(_))
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ReasonRaw {
    pub header: EventHeaderRaw,
    pub reason: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BasalPatternSelectedRaw {
    pub header: EventHeaderRaw,
    pub old_pattern_number: u8,
    pub new_pattern_number: u8,
}

impl BasalPatternSelectedRaw {
    pub fn old_pattern_name(&self) -> Option<&'static str> {
        basal_pattern_name(self.old_pattern_number)
    }

    pub fn new_pattern_name(&self) -> Option<&'static str> {
        basal_pattern_name(self.new_pattern_number)
    }
}

/// MAX_BASAL_RATE_CHANGE and MAX_BOLUS_CHANGE.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MaxChangeRaw {
    pub header: EventHeaderRaw,
    pub old_value: I32,
    pub new_value: I32,
}

impl MaxChangeRaw {
    pub fn old_value(&self) -> f64 {
        signed_units(self.old_value.get())
    }

    pub fn new_value(&self) -> f64 {
        signed_units(self.new_value.get())
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct OptionChangeRaw {
    pub header: EventHeaderRaw,
    pub old_option: u8,
    pub new_option: u8,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BolusWizardSettingsChangeRaw {
    pub header: EventHeaderRaw,
    pub old_enabled: u8,
    pub old_carb_units: u8,
    pub old_duration_of_insulin_action: I16,
    pub new_enabled: u8,
    pub new_carb_units: u8,
    pub new_duration_of_insulin_action: I16,
}

impl BolusWizardSettingsChangeRaw {
    pub fn old_enabled(&self) -> bool {
        self.old_enabled == 1
    }

    pub fn new_enabled(&self) -> bool {
        self.new_enabled == 1
    }

    pub fn old_carb_units(&self) -> CarbUnits {
        CarbUnits::from(self.old_carb_units)
    }

    pub fn new_carb_units(&self) -> CarbUnits {
        CarbUnits::from(self.new_carb_units)
    }
}

/// One reading out of SENSOR_GLUCOSE_READINGS_EXTENDED.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub timestamp: NgpTimestamp,
    pub sg: u16,
    pub predicted_sg: u16,
    pub isig: f64,
    pub vctr: f64,
    pub rate_of_change: f64,
    pub backfilled: bool,
    pub settings_changed: bool,
    pub noisy: bool,
    pub discard: bool,
    pub sensor_error: bool,
}

const SENSOR_READING_SIZE: usize = 9;
const SENSOR_READINGS_OFFSET: usize = 15;

#[derive(Debug, Clone, Copy)]
pub struct SensorGlucoseReadings<'a> {
    data: &'a [u8],
    timestamp: NgpTimestamp,
}

impl<'a> SensorGlucoseReadings<'a> {
    pub fn minutes_between_readings(&self) -> u8 {
        self.data[0x0B]
    }

    pub fn number_of_readings(&self) -> u8 {
        self.data[0x0C]
    }

    pub fn predicted_sg(&self) -> u16 {
        be_u16(self.data, 0x0D)
    }

    /// Readings newest first; reading `i` is `i` intervals before the event time.
    pub fn readings(&self) -> impl Iterator<Item = SensorReading> + 'a {
        let data = self.data;
        let timestamp = self.timestamp;
        let interval = self.minutes_between_readings() as i64 * 60;
        let predicted_sg = self.predicted_sg();
        (0..self.number_of_readings() as usize)
            .map(move |i| (i, SENSOR_READINGS_OFFSET + i * SENSOR_READING_SIZE))
            .take_while(move |(_, pos)| pos + SENSOR_READING_SIZE <= data.len())
            .map(move |(i, pos)| {
                let sg = ((data[pos] as u16 & 3) << 8) | data[pos + 1] as u16;
                let raw_vctr = (((data[pos] as u32 >> 2) & 3) << 8) | data[pos + 4] as u32;
                let sensor_status = data[pos + 7];
                let reading_status = data[pos + 8];
                SensorReading {
                    timestamp: timestamp.shifted(-(i as i64) * interval),
                    sg,
                    predicted_sg,
                    isig: be_i16(data, pos + 2) as f64 / 100.0,
                    vctr: sign_extend(raw_vctr, 10) as f64 / 100.0,
                    rate_of_change: be_i16(data, pos + 5) as f64 / 100.0,
                    backfilled: reading_status & 1 == 1,
                    settings_changed: reading_status & 2 == 2,
                    noisy: sensor_status == 1,
                    discard: sensor_status == 2,
                    sensor_error: sensor_status == 3,
                }
            })
    }
}

/// BG_READING: a fixed prefix followed by the meter serial, stored reversed
/// and space padded.
#[derive(Debug, Clone, Copy)]
pub struct BgReading<'a> {
    data: &'a [u8],
}

impl BgReading<'_> {
    /// Units the pump displays; the stored value is mg/dL regardless.
    pub fn bg_units(&self) -> BgUnits {
        if self.data[0x0B] & 1 != 0 { BgUnits::MgDl } else { BgUnits::MmolL }
    }

    pub fn is_calibration(&self) -> bool {
        self.data[0x0B] & 2 == 2
    }

    pub fn bg_value(&self) -> u16 {
        be_u16(self.data, 0x0C)
    }

    pub fn bg_source(&self) -> u8 {
        self.data[0x0E]
    }

    pub fn meter_serial(&self) -> String {
        let text: String = self.data[0x0F..]
            .iter()
            .rev()
            .filter(|b| **b != b' ' && **b != 0)
            .map(|b| *b as char)
            .collect();
        text.trim().to_string()
    }

    pub fn is_linked(&self) -> bool {
        !self.meter_serial().is_empty()
    }
}

/// Value of one entry in a settings schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleValue {
    Rate(f64),
    Amount(f64),
    Target { low: f64, high: f64 },
}

/// One entry of a settings schedule; `start_ms` is milliseconds from midnight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleEntry {
    pub start_ms: i64,
    pub value: ScheduleValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    BasalPattern,
    CarbRatios,
    InsulinSensitivity,
    BgTargets,
}

impl ScheduleKind {
    fn entry_size(self) -> usize {
        match self {
            ScheduleKind::BasalPattern | ScheduleKind::CarbRatios | ScheduleKind::BgTargets => 5,
            ScheduleKind::InsulinSensitivity => 3,
        }
    }
}

/// Count byte at 0x0C, packed entries from 0x0D. Byte 0x0B holds the
/// pattern number for basal patterns and the units otherwise.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleChange<'a> {
    pub kind: ScheduleKind,
    pub is_new: bool,
    data: &'a [u8],
}

impl ScheduleChange<'_> {
    pub fn pattern_number(&self) -> u8 {
        self.data[0x0B]
    }

    pub fn pattern_name(&self) -> Option<&'static str> {
        basal_pattern_name(self.pattern_number())
    }

    pub fn bg_units(&self) -> BgUnits {
        BgUnits::from(self.data[0x0B])
    }

    pub fn carb_units(&self) -> CarbUnits {
        CarbUnits::from(self.data[0x0B])
    }

    pub fn number_of_segments(&self) -> u8 {
        self.data[0x0C]
    }

    pub fn entries(&self) -> Vec<ScheduleEntry> {
        let size = self.kind.entry_size();
        let count = self.number_of_segments() as usize;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let pos = 13 + i * size;
            if pos + size > self.data.len() {
                break;
            }
            let d = self.data;
            let entry = match self.kind {
                ScheduleKind::BasalPattern => ScheduleEntry {
                    start_ms: d[pos + 4] as i64 * HALF_HOUR_MS,
                    value: ScheduleValue::Rate(signed_units(be_i32(d, pos))),
                },
                ScheduleKind::CarbRatios => ScheduleEntry {
                    start_ms: d[pos] as i64 * HALF_HOUR_MS,
                    value: ScheduleValue::Amount(self.carb_units().scale_ratio(be_i32(d, pos + 1) as f64)),
                },
                ScheduleKind::InsulinSensitivity => ScheduleEntry {
                    start_ms: d[pos] as i64 * HALF_HOUR_MS,
                    value: ScheduleValue::Amount(self.bg_units().scale(be_i16(d, pos + 1) as f64)),
                },
                ScheduleKind::BgTargets => ScheduleEntry {
                    start_ms: d[pos] as i64 * HALF_HOUR_MS,
                    value: ScheduleValue::Target {
                        high: self.bg_units().scale(be_i16(d, pos + 1) as f64),
                        low: self.bg_units().scale(be_i16(d, pos + 3) as f64),
                    },
                },
            };
            out.push(entry);
        }
        out
    }
}

/// The typed face of an event. `Other` covers every tag without
/// dedicated accessors, and events too short for their layout.
#[derive(Debug, Clone, Copy)]
pub enum EventView<'a> {
    TimeChange(&'a TimeChangeRaw),
    AlarmNotification(&'a AlarmNotificationRaw),
    LowReservoir(&'a LowReservoirRaw),
    SensorGlucoseReadings(SensorGlucoseReadings<'a>),
    CalibrationComplete(&'a CalibrationCompleteRaw),
    BgReading(BgReading<'a>),
    ClosedLoopBgReading(&'a ClosedLoopBgReadingRaw),
    ClosedLoopTransition(&'a ClosedLoopTransitionRaw),
    BasalSegmentStart(&'a BasalSegmentStartRaw),
    TempBasalProgrammed(&'a TempBasalProgrammedRaw),
    TempBasalComplete(TempBasalComplete<'a>),
    Rewind,
    CannulaFill(&'a CannulaFillRaw),
    BolusProgrammed(&'a BolusRaw),
    NormalBolusDelivered(&'a NormalBolusDeliveredRaw),
    SquareBolusDelivered(&'a SquareBolusDeliveredRaw),
    DualBolusPartDelivered(&'a DualBolusPartDeliveredRaw),
    WizardEstimate(WizardEstimate<'a>),
    InsulinDeliveryStopped(&'a ReasonRaw),
    InsulinDeliveryRestarted(&'a ReasonRaw),
    Schedule(ScheduleChange<'a>),
    BasalPatternSelected(&'a BasalPatternSelectedRaw),
    MaxBasalRateChange(&'a MaxChangeRaw),
    MaxBolusChange(&'a MaxChangeRaw),
    DualBolusOptionChange(&'a OptionChangeRaw),
    SquareBolusOptionChange(&'a OptionChangeRaw),
    BolusWizardSettingsChange(&'a BolusWizardSettingsChangeRaw),
    Other,
}

/// One raw history event.
#[derive(Clone, PartialEq, Eq)]
pub struct HistoryEvent {
    data: Bytes,
}

impl HistoryEvent {
    /// Wrap one event's bytes; `None` if the header is incomplete.
    pub fn new(data: Bytes) -> Option<Self> {
        (data.len() >= EVENT_HEADER_SIZE).then_some(Self { data })
    }

    /// Assemble an event from its header fields and body.
    pub fn build(event_type: EventType, source: u8, timestamp: NgpTimestamp, body: &[u8]) -> Self {
        let mut data = Vec::with_capacity(EVENT_HEADER_SIZE + body.len());
        data.extend_from_slice(&[u8::from(event_type), source, (EVENT_HEADER_SIZE + body.len()) as u8]);
        data.extend_from_slice(&timestamp.to_bytes());
        data.extend_from_slice(body);
        Self { data: Bytes::from(data) }
    }

    pub fn event_type(&self) -> EventType {
        EventType::from(self.data[0])
    }

    pub fn source(&self) -> EventSource {
        EventSource::from_bytes([self.data[1]])
    }

    pub fn is_closed_loop_active(&self) -> bool {
        self.source().closed_loop_active()
    }

    pub fn size(&self) -> u8 {
        self.data[2]
    }

    pub fn timestamp(&self) -> NgpTimestamp {
        let d = &self.data;
        NgpTimestamp::new(u32::from_be_bytes([d[3], d[4], d[5], d[6]]), be_i32(d, 7))
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    fn fixed<T: FromBytes + KnownLayout + Immutable>(&self) -> Option<&T> {
        T::ref_from_prefix(&self.data[..]).ok().map(|(raw, _)| raw)
    }

    fn schedule(&self, kind: ScheduleKind, is_new: bool) -> Option<EventView<'_>> {
        (self.data.len() >= 13).then_some(EventView::Schedule(ScheduleChange {
            kind,
            is_new,
            data: &self.data,
        }))
    }

    /// Dispatch on the event tag.
    pub fn view(&self) -> EventView<'_> {
        use EventType as T;
        use EventView as V;
        let view = match self.event_type() {
            T::TimeReset | T::UserTimeDateChange => self.fixed().map(V::TimeChange),
            T::AlarmNotification => self.fixed().map(V::AlarmNotification),
            T::LowReservoir => self.fixed().map(V::LowReservoir),
            T::SensorGlucoseReadingsExtended => (self.data.len() >= SENSOR_READINGS_OFFSET).then(|| {
                V::SensorGlucoseReadings(SensorGlucoseReadings {
                    data: &self.data,
                    timestamp: self.timestamp(),
                })
            }),
            T::CalibrationComplete => self.fixed().map(V::CalibrationComplete),
            T::BgReading => (self.data.len() >= 0x0F).then_some(V::BgReading(BgReading { data: &self.data })),
            T::ClosedLoopBgReading => self.fixed().map(V::ClosedLoopBgReading),
            T::ClosedLoopTransition => self.fixed().map(V::ClosedLoopTransition),
            T::BasalSegmentStart => self.fixed().map(V::BasalSegmentStart),
            T::TempBasalProgrammed => self.fixed().map(V::TempBasalProgrammed),
            T::TempBasalComplete => self.fixed().map(|raw| {
                let long_duration_minutes =
                    (self.size() >= 23 && self.data.len() >= 0x17).then(|| be_u16(&self.data, 0x15));
                V::TempBasalComplete(TempBasalComplete {
                    raw,
                    long_duration_minutes,
                })
            }),
            T::Rewind => Some(V::Rewind),
            T::CannulaFillDelivered => self.fixed().map(V::CannulaFill),
            T::NormalBolusProgrammed | T::SquareBolusProgrammed | T::DualBolusProgrammed => {
                self.fixed().map(V::BolusProgrammed)
            }
            T::NormalBolusDelivered => self.fixed().map(V::NormalBolusDelivered),
            T::SquareBolusDelivered => self.fixed().map(V::SquareBolusDelivered),
            T::DualBolusPartDelivered => self.fixed().map(V::DualBolusPartDelivered),
            T::BolusWizardEstimate => self.fixed().map(|w| V::WizardEstimate(WizardEstimate::Bolus(w))),
            T::MealWizardEstimate => self.fixed().map(|w| V::WizardEstimate(WizardEstimate::Meal(w))),
            T::InsulinDeliveryStopped => self.fixed().map(V::InsulinDeliveryStopped),
            T::InsulinDeliveryRestarted => self.fixed().map(V::InsulinDeliveryRestarted),
            T::OldBasalPattern => self.schedule(ScheduleKind::BasalPattern, false),
            T::NewBasalPattern => self.schedule(ScheduleKind::BasalPattern, true),
            T::OldBolusWizardInsulinToCarbRatios => self.schedule(ScheduleKind::CarbRatios, false),
            T::NewBolusWizardInsulinToCarbRatios => self.schedule(ScheduleKind::CarbRatios, true),
            T::OldBolusWizardInsulinSensitivity => self.schedule(ScheduleKind::InsulinSensitivity, false),
            T::NewBolusWizardInsulinSensitivity => self.schedule(ScheduleKind::InsulinSensitivity, true),
            T::OldBolusWizardBgTargets => self.schedule(ScheduleKind::BgTargets, false),
            T::NewBolusWizardBgTargets => self.schedule(ScheduleKind::BgTargets, true),
            T::BasalPatternSelected => self.fixed().map(V::BasalPatternSelected),
            T::MaxBasalRateChange => self.fixed().map(V::MaxBasalRateChange),
            T::MaxBolusChange => self.fixed().map(V::MaxBolusChange),
            T::DualBolusOptionChange => self.fixed().map(V::DualBolusOptionChange),
            T::SquareBolusOptionChange => self.fixed().map(V::SquareBolusOptionChange),
            T::BolusWizardSettingsChange => self.fixed().map(V::BolusWizardSettingsChange),
            _ => None,
        };
        view.unwrap_or(V::Other)
    }

    /// Bolus number and source of any programmed or delivered bolus event.
    pub fn bolus(&self) -> Option<&BolusRaw> {
        match self.event_type() {
            EventType::NormalBolusProgrammed
            | EventType::SquareBolusProgrammed
            | EventType::DualBolusProgrammed
            | EventType::NormalBolusDelivered
            | EventType::SquareBolusDelivered
            | EventType::DualBolusPartDelivered => self.fixed(),
            _ => None,
        }
    }

    pub fn wizard_estimate(&self) -> Option<WizardEstimate<'_>> {
        match self.view() {
            EventView::WizardEstimate(w) => Some(w),
            _ => None,
        }
    }
}

impl fmt::Debug for HistoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryEvent")
            .field("type", &self.event_type())
            .field("timestamp", &self.timestamp())
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

/// Split a page into events using each event's size byte.
///
/// A size byte that would run past the page, or one too small to hold a
/// header, ends the page.
pub fn events_in_page(page: &Bytes) -> impl Iterator<Item = HistoryEvent> + '_ {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        let size = *page.get(pos + 2)? as usize;
        if size < EVENT_HEADER_SIZE || pos + size > page.len() {
            return None;
        }
        let event = HistoryEvent::new(page.slice(pos..pos + size));
        pos += size;
        event
    })
}
