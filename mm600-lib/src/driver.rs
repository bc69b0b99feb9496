//! One complete download: bridge setup, pump settings and both history types.

use crate::channel::ByteChannel;
use crate::commands::HistoryDownload;
use crate::config::DriverConfig;
use crate::constants::{HighSpeedMode, HistoryDataType, pump_state};
use crate::error::PumpError;
use crate::link::{NOT_ASSOCIATED_MESSAGE, PumpLink};
use crate::records::PumpSettings;
use crate::session::PumpSession;
use crate::timestamp::MAX_RTC;
use crate::transport::Bridge;
use bytes::Bytes;
use chrono::TimeDelta;
use tracing::{debug, info, warn};

pub const PROGRESS_CONNECTED: f64 = 10.0;
pub const PROGRESS_JOINED: f64 = 15.0;
pub const PROGRESS_SETTINGS: f64 = 20.0;
pub const PROGRESS_BASAL_PATTERNS: f64 = 30.0;
pub const PROGRESS_HISTORY_END: f64 = 90.0;

pub const PUMP_NOT_ACTIVE_MESSAGE: &str = "Pump not active, prime a reservoir first";

/// Everything read from the pump in one session.
#[derive(Debug, Clone)]
pub struct PumpData {
    pub settings: PumpSettings,
    pub pages: Vec<Bytes>,
    pub cbg_pages: Vec<Bytes>,
    /// The bridge's `dddd-ddddddd` identifier.
    pub model_and_serial: String,
}

/// What needs undoing once the download ends, however it ends.
#[derive(Debug, Default)]
struct Teardown {
    remote_mode: bool,
    connection_open: bool,
    high_speed: bool,
}

pub struct Driver<C: ByteChannel> {
    link: PumpLink<C>,
    config: DriverConfig,
}

impl<C: ByteChannel> Driver<C> {
    pub fn new(channel: C, config: DriverConfig) -> Self {
        let bridge = Bridge::new(channel, &config);
        let link = PumpLink::new(bridge, PumpSession::new(""), &config);
        Self { link, config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn link(&self) -> &PumpLink<C> {
        &self.link
    }

    pub fn into_channel(self) -> C {
        self.link.into_bridge().into_channel()
    }

    /// Run the full download, reporting progress as a percentage.
    ///
    /// The bridge is returned to its idle state afterwards even when the
    /// download fails; errors during that cleanup are logged and dropped.
    pub async fn fetch<F: FnMut(f64)>(&mut self, mut progress: F) -> Result<PumpData, PumpError> {
        let mut teardown = Teardown::default();
        let result = self.download(&mut teardown, &mut progress).await;
        if let Err(e) = &result {
            warn!("Download failed: {}", e);
        }
        self.cleanup(teardown).await;
        progress(100.0);
        result
    }

    async fn download<F: FnMut(f64)>(&mut self, teardown: &mut Teardown, progress: &mut F) -> Result<PumpData, PumpError> {
        self.link.bridge_mut().connect().await?;
        let bridge_info = self.link.bridge_mut().device_info().await?;
        *self.link.session_mut() = PumpSession::new(&bridge_info.model_and_serial);

        // enter, exit, enter: leaves the bridge in a known state
        teardown.remote_mode = true;
        self.link.bridge_mut().enter_remote_command_mode().await?;
        self.link.bridge_mut().exit_remote_command_mode().await?;
        self.link.bridge_mut().enter_remote_command_mode().await?;
        self.link.bridge_mut().set_passthrough_mode(true).await?;

        self.link.open_connection().await?;
        teardown.connection_open = true;
        progress(PROGRESS_CONNECTED);

        let info = self.link.read_info().await?;
        if info.is_associated() {
            self.link.request_link_key().await?;
            self.link.negotiate_radio_channel().await?;
        } else {
            let Some(serial) = self.config.pump_serial.clone() else {
                return Err(PumpError::InvalidState(NOT_ASSOCIATED_MESSAGE.to_string()));
            };
            info!("Bridge has no linked pump, pairing with {}", serial);
            self.link.pair(&serial).await?;
        }
        progress(PROGRESS_JOINED);

        self.link.set_high_speed_mode(HighSpeedMode::Enable).await?;
        teardown.high_speed = true;

        let pump_time = self
            .link
            .read_pump_time(self.config.first_message_timeout())
            .await
            .inspect_err(|e| {
                if matches!(e, PumpError::Decryption { .. }) {
                    warn!("First pump message did not decrypt, the link key is wrong");
                }
            })?;
        let mut settings = PumpSettings::new(pump_time);
        info!("Pump time {}", pump_time);

        let status = self.link.read_pump_status().await?;
        if !status.has(pump_state::ACTIVE) {
            return Err(PumpError::InvalidState(PUMP_NOT_ACTIVE_MESSAGE.to_string()));
        }
        settings.active_schedule = status.active_schedule().map(str::to_string);

        settings.bg_target = self.link.read_bg_targets().await?;
        settings.carb_ratio = self.link.read_carb_ratios().await?;
        settings.insulin_sensitivity = self.link.read_sensitivity_factors().await?;
        let characteristics = self.link.read_device_characteristics().await?;
        settings.pump_serial = characteristics.serial.trim_end_matches('\0').to_string();
        settings.pump_model = self.link.read_device_string().await?.value;
        info!("Pump {} serial {}", settings.pump_model, settings.pump_serial);
        progress(PROGRESS_SETTINGS);

        settings.basal_schedules = self.link.read_basal_patterns().await?;
        progress(PROGRESS_BASAL_PATTERNS);

        let from_rtc = history_start_rtc(&settings, self.config.history_days);
        let share = (PROGRESS_HISTORY_END - PROGRESS_BASAL_PATTERNS) / 2.0;
        let pump = self
            .read_history(HistoryDataType::PumpData, from_rtc, PROGRESS_BASAL_PATTERNS, share, progress)
            .await?;
        let sensor = self
            .read_history(HistoryDataType::SensorData, from_rtc, PROGRESS_BASAL_PATTERNS + share, share, progress)
            .await?;

        Ok(PumpData {
            settings,
            pages: pump.pages,
            cbg_pages: sensor.pages,
            model_and_serial: self.link.session().model_and_serial.clone(),
        })
    }

    async fn read_history<F: FnMut(f64)>(
        &mut self,
        data_type: HistoryDataType,
        from_rtc: u32,
        progress_start: f64,
        progress_share: f64,
        progress: &mut F,
    ) -> Result<HistoryDownload, PumpError> {
        let info = self.link.read_history_info(data_type, from_rtc, MAX_RTC).await?;
        info!("Reading {} from {} to {} ({} bytes)", data_type, info.start, info.end, info.size);
        let expected = info.size;
        self.link
            .read_history(data_type, from_rtc, MAX_RTC, expected, self.config.max_retries, |fetched| {
                let fraction = if expected == 0 {
                    1.0
                } else {
                    (fetched as f64 / expected as f64).min(1.0)
                };
                progress(progress_start + progress_share * fraction);
            })
            .await
    }

    async fn cleanup(&mut self, teardown: Teardown) {
        if teardown.high_speed {
            if let Err(e) = self.link.set_high_speed_mode(HighSpeedMode::Disable).await {
                debug!("Leaving high speed mode failed: {}", e);
            }
        }
        if teardown.connection_open {
            if let Err(e) = self.link.close_connection().await {
                debug!("Closing connection failed: {}", e);
            }
        }
        if teardown.remote_mode {
            if let Err(e) = self.link.bridge_mut().exit_remote_command_mode().await {
                debug!("Leaving remote command mode failed: {}", e);
            }
        }
        if let Err(e) = self.link.bridge_mut().disconnect().await {
            debug!("Disconnect failed: {}", e);
        }
    }
}

/// RTC of the oldest history requested: `history_days` before the pump's
/// own clock.
pub fn history_start_rtc(settings: &PumpSettings, history_days: u32) -> u32 {
    let now = settings.current_ngp_timestamp;
    let from = now.to_date() - TimeDelta::days(history_days as i64);
    now.rtc_from_date(from).clamp(0, MAX_RTC as i64) as u32
}
