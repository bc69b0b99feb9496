//! The session record that accompanies an upload.

use crate::config::DriverConfig;
use crate::records::{DEVICE_MANUFACTURERS, PumpSettings};
use crate::timezone::TimeProcessing;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEVICE_TAG_INSULIN_PUMP: &str = "insulin-pump";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub device_tags: Vec<String>,
    pub device_manufacturers: Vec<String>,
    pub device_model: String,
    pub device_serial_number: String,
    pub device_id: String,
    pub start: DateTime<Utc>,
    pub time_processing: TimeProcessing,
    pub tz_name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_data_end: Option<DateTime<Utc>>,
}

impl SessionMetadata {
    pub fn new(
        settings: &PumpSettings,
        start: DateTime<Utc>,
        time_processing: TimeProcessing,
        config: &DriverConfig,
    ) -> Self {
        Self {
            device_tags: vec![DEVICE_TAG_INSULIN_PUMP.to_string()],
            device_manufacturers: DEVICE_MANUFACTURERS.iter().map(|m| m.to_string()).collect(),
            device_model: settings.pump_model.clone(),
            device_serial_number: settings.pump_serial.clone(),
            device_id: settings.device_id(),
            start,
            time_processing,
            tz_name: config.timezone.name.clone(),
            version: config.driver_version.clone(),
            delta_data_end: None,
        }
    }

    /// Mark the upload as covering data up to `end` only.
    pub fn with_delta_end(mut self, end: DateTime<Utc>) -> Self {
        self.delta_data_end = Some(end);
        self
    }
}
