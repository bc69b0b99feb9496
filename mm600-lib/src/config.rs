use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A timezone with a constant UTC offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedTimezone {
    pub name: String,
    /// Minutes east of UTC.
    pub offset_minutes: i32,
}

impl Default for FixedTimezone {
    fn default() -> Self {
        Self {
            name: "UTC".to_string(),
            offset_minutes: 0,
        }
    }
}

impl FixedTimezone {
    pub fn new(name: impl Into<String>, offset_minutes: i32) -> Self {
        Self {
            name: name.into(),
            offset_minutes,
        }
    }
}

/// Timing and retry knobs for a download session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub timezone: FixedTimezone,
    pub read_timeout_ms: u64,
    pub send_delay_ms: u64,
    pub ngp_read_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub first_message_timeout_ms: u64,
    /// Pause before reading the bridge's answer to leaving remote mode.
    pub comms_reset_delay_ms: u64,
    /// How long to wait for each pump message while pairing.
    pub pairing_timeout_ms: u64,
    pub max_retries: u32,
    pub history_days: u32,
    /// Serial printed on the pump, used to pair a bridge that is not yet
    /// linked to it.
    pub pump_serial: Option<String>,
    pub driver_version: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timezone: FixedTimezone::default(),
            read_timeout_ms: 4000,
            send_delay_ms: 500,
            ngp_read_timeout_ms: 256,
            join_timeout_ms: 10000,
            first_message_timeout_ms: 10000,
            comms_reset_delay_ms: 4000,
            pairing_timeout_ms: 60000,
            max_retries: 5,
            history_days: 90,
            pump_serial: None,
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl DriverConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn ngp_read_timeout(&self) -> Duration {
        Duration::from_millis(self.ngp_read_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn first_message_timeout(&self) -> Duration {
        Duration::from_millis(self.first_message_timeout_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    pub fn comms_reset_delay(&self) -> Duration {
        Duration::from_millis(self.comms_reset_delay_ms)
    }

    /// All pacing delays zeroed, for scripted channels.
    pub fn without_delays(mut self) -> Self {
        self.send_delay_ms = 0;
        self.comms_reset_delay_ms = 0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: DriverConfig =
            serde_json::from_str(r#"{"max_retries": 9, "timezone": {"name": "Europe/Berlin"}}"#).unwrap();
        assert_eq!(cfg.max_retries, 9);
        assert_eq!(cfg.timezone.name, "Europe/Berlin");
        assert_eq!(cfg.timezone.offset_minutes, 0);
        assert_eq!(cfg.read_timeout(), Duration::from_secs(4));
        assert_eq!(cfg.history_days, 90);
        assert_eq!(cfg.pump_serial, None);
    }
}
