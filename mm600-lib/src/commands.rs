//! ComD command catalog: request parameters, response decoders and the
//! multipacket history download.

use crate::channel::ByteChannel;
use crate::constants::{ComDCommand, HistoryDataType, basal_pattern_name};
use crate::error::PumpError;
use crate::history::blocks::{HistorySegment, split_blocks};
use crate::link::PumpLink;
use crate::multipacket::MultipacketSession;
use crate::ngp::ComDResponse;
use crate::records::{AmountEntry, BasalScheduleEntry, TargetEntry};
use crate::session::Mac;
use crate::timestamp::NgpTimestamp;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const HALF_HOUR_MS: i64 = 30 * 60 * 1000;
const BASAL_PATTERN_COUNT: u8 = 8;
/// Fixed second byte of history request parameters.
const HISTORY_REQUEST_MODE: u8 = 0x04;

fn expect_command(response: &ComDResponse, expected: ComDCommand) -> Result<(), PumpError> {
    if response.command() != expected {
        return Err(PumpError::InvalidMessage(format!(
            "Expected {} response, got {}",
            expected,
            response.command()
        )));
    }
    Ok(())
}

/// Pump clock, answer to TIME_REQUEST.
pub fn pump_time(response: &ComDResponse) -> Result<NgpTimestamp, PumpError> {
    if response.u8_at(0x03)? == 0 {
        return Err(PumpError::InvalidState("Device clock not set".to_string()));
    }
    NgpTimestamp::from_bytes(response.slice(0x04, 0x0C)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStatus {
    pub state: u8,
    /// 1-based basal pattern number.
    pub active_basal_pattern: u8,
}

impl PumpStatus {
    pub fn parse(response: &ComDResponse) -> Result<Self, PumpError> {
        Ok(Self {
            state: response.u8_at(0x03)?,
            active_basal_pattern: response.u8_at(0x1A)?,
        })
    }

    pub fn has(&self, flag: u8) -> bool {
        self.state & flag != 0
    }

    pub fn active_schedule(&self) -> Option<&'static str> {
        basal_pattern_name(self.active_basal_pattern)
    }
}

fn start_of(response: &ComDResponse, at: usize) -> Result<i64, PumpError> {
    Ok(response.u8_at(at)? as i64 * HALF_HOUR_MS)
}

/// Bolus wizard BG targets, in mg/dL.
pub fn bg_targets(response: &ComDResponse) -> Result<Vec<TargetEntry>, PumpError> {
    let count = response.u8_at(0x05)? as usize;
    (0..count)
        .map(|i| {
            let item = 0x06 + i * 9;
            Ok(TargetEntry {
                start: start_of(response, item + 8)?,
                high: response.u16_at(item)? as f64,
                low: response.u16_at(item + 4)? as f64,
            })
        })
        .collect()
}

pub fn carb_ratios(response: &ComDResponse) -> Result<Vec<AmountEntry>, PumpError> {
    let count = response.u8_at(0x05)? as usize;
    (0..count)
        .map(|i| {
            let item = 0x06 + i * 9;
            Ok(AmountEntry {
                start: start_of(response, item + 8)?,
                amount: response.u32_at(item)? as f64 / 10.0,
            })
        })
        .collect()
}

/// Insulin sensitivity factors, in mg/dL.
pub fn sensitivity_factors(response: &ComDResponse) -> Result<Vec<AmountEntry>, PumpError> {
    let count = response.u8_at(0x05)? as usize;
    (0..count)
        .map(|i| {
            let item = 0x06 + i * 5;
            Ok(AmountEntry {
                start: start_of(response, item + 4)?,
                amount: response.u16_at(item)? as f64,
            })
        })
        .collect()
}

pub fn basal_pattern(response: &ComDResponse) -> Result<Vec<BasalScheduleEntry>, PumpError> {
    let count = response.u8_at(0x04)? as usize;
    (0..count)
        .map(|i| {
            let item = 0x05 + i * 5;
            Ok(BasalScheduleEntry {
                start: start_of(response, item + 4)?,
                rate: response.u32_at(item)? as f64 / 10000.0,
            })
        })
        .collect()
}

fn version(major: u8, minor: u8, alpha: u8) -> String {
    format!("{}.{}{}", major, minor, alpha as char)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCharacteristics {
    pub serial: String,
    pub mac: Mac,
    pub comd_version: String,
    pub teld_version: String,
    pub model: String,
    pub firmware_version: String,
    pub motor_app_version: String,
    pub bg_units: u8,
}

impl DeviceCharacteristics {
    pub fn parse(response: &ComDResponse) -> Result<Self, PumpError> {
        if response.len() < 13 {
            return Err(PumpError::InvalidMessage(
                "Received invalid DeviceCharacteristicsResponse message".to_string(),
            ));
        }
        let b = |at| response.u8_at(at);
        let teld_major = b(0x18)? >> 3;
        let teld_minor = (b(0x19)? >> 5) | ((b(0x18)? & 0x07) << 3);
        Ok(Self {
            serial: String::from_utf8_lossy(response.slice(0x03, 0x0D)?).into_owned(),
            mac: Mac::from_be_slice(response.slice(0x0D, 0x15)?).unwrap_or_default(),
            comd_version: version(b(0x15)?, b(0x16)?, b'A'.wrapping_add(b(0x17)?)),
            teld_version: version(teld_major, teld_minor, b'@'.wrapping_add(b(0x19)?)),
            model: format!("{}.{}", response.u16_at(0x1A)?, response.u16_at(0x1C)?),
            firmware_version: version(b(0x29)?, b(0x2A)?, b(0x2B)?),
            motor_app_version: version(b(0x2C)?, b(0x2D)?, b(0x2E)?),
            bg_units: b(0x35)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceString {
    pub mac: Mac,
    pub string_type: u16,
    pub language: u8,
    pub value: String,
}

impl DeviceString {
    pub fn parse(response: &ComDResponse) -> Result<Self, PumpError> {
        if response.len() < 96 {
            return Err(PumpError::InvalidMessage("Received invalid DeviceStringResponse message".to_string()));
        }
        let units: Vec<u16> = response
            .slice(0x0E, 0x5E)?
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        let value = String::from_utf16_lossy(&units).replace('\0', "");
        Ok(Self {
            mac: Mac::from_be_slice(response.slice(0x03, 0x0B)?).unwrap_or_default(),
            string_type: response.u16_at(0x0B)?,
            language: response.u8_at(0x0D)?,
            value,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryInfo {
    pub size: u32,
    pub start: NgpTimestamp,
    pub end: NgpTimestamp,
}

impl HistoryInfo {
    pub fn parse(response: &ComDResponse) -> Result<Self, PumpError> {
        Ok(Self {
            size: response.u32_at(0x04)?,
            start: NgpTimestamp::from_bytes(response.slice(0x08, 0x10)?)?,
            end: NgpTimestamp::from_bytes(response.slice(0x10, 0x18)?)?,
        })
    }
}

pub fn device_characteristics_params(pump_mac: Mac) -> [u8; 9] {
    let mut params = [0u8; 9];
    params[0] = 0x02;
    params[1..].copy_from_slice(&pump_mac.to_be_bytes());
    params
}

pub fn device_string_params() -> [u8; 12] {
    let mut params = [0u8; 12];
    params[0x00] = 0x01;
    // model string
    params[0x0A] = 0x04;
    params
}

/// Parameters shared by READ_HISTORY_INFO and READ_HISTORY.
pub fn history_params(data_type: HistoryDataType, from_rtc: u32, to_rtc: u32) -> [u8; 12] {
    let mut params = [0u8; 12];
    params[0] = data_type.into();
    params[1] = HISTORY_REQUEST_MODE;
    params[2..6].copy_from_slice(&from_rtc.to_be_bytes());
    params[6..10].copy_from_slice(&to_rtc.to_be_bytes());
    params
}

/// The pages of one history data type.
#[derive(Debug, Clone, Default)]
pub struct HistoryDownload {
    pub pages: Vec<Bytes>,
    pub bytes_fetched: u64,
}

impl<C: ByteChannel> PumpLink<C> {
    async fn checked_request(
        &mut self,
        command: ComDCommand,
        params: &[u8],
        expected: ComDCommand,
        timeout: Duration,
    ) -> Result<ComDResponse, PumpError> {
        let response = self.comd_request(command, params, timeout).await?;
        expect_command(&response, expected)?;
        Ok(response)
    }

    /// Read the pump clock. The first encrypted exchange of a session uses a
    /// longer timeout, so the caller passes it in.
    pub async fn read_pump_time(&mut self, timeout: Duration) -> Result<NgpTimestamp, PumpError> {
        let response = self
            .checked_request(ComDCommand::TimeRequest, &[], ComDCommand::TimeResponse, timeout)
            .await?;
        pump_time(&response)
    }

    pub async fn read_pump_status(&mut self) -> Result<PumpStatus, PumpError> {
        let timeout = self.ngp_timeout();
        let response = self
            .checked_request(
                ComDCommand::ReadPumpStatusRequest,
                &[],
                ComDCommand::ReadPumpStatusResponse,
                timeout,
            )
            .await?;
        PumpStatus::parse(&response)
    }

    pub async fn read_bg_targets(&mut self) -> Result<Vec<TargetEntry>, PumpError> {
        let timeout = self.ngp_timeout();
        let response = self
            .checked_request(ComDCommand::ReadBgTargetsRequest, &[], ComDCommand::ReadBgTargetsResponse, timeout)
            .await?;
        bg_targets(&response)
    }

    pub async fn read_carb_ratios(&mut self) -> Result<Vec<AmountEntry>, PumpError> {
        let timeout = self.ngp_timeout();
        let response = self
            .checked_request(
                ComDCommand::ReadCarbRatiosRequest,
                &[],
                ComDCommand::ReadCarbRatiosResponse,
                timeout,
            )
            .await?;
        carb_ratios(&response)
    }

    pub async fn read_sensitivity_factors(&mut self) -> Result<Vec<AmountEntry>, PumpError> {
        let timeout = self.ngp_timeout();
        let response = self
            .checked_request(
                ComDCommand::ReadSensitivityFactorsRequest,
                &[],
                ComDCommand::ReadSensitivityFactorsResponse,
                timeout,
            )
            .await?;
        sensitivity_factors(&response)
    }

    pub async fn read_device_characteristics(&mut self) -> Result<DeviceCharacteristics, PumpError> {
        let timeout = self.ngp_timeout();
        let params = device_characteristics_params(self.session().pump_mac);
        let response = self
            .checked_request(
                ComDCommand::DeviceCharacteristicsRequest,
                &params,
                ComDCommand::DeviceCharacteristicsResponse,
                timeout,
            )
            .await?;
        DeviceCharacteristics::parse(&response)
    }

    pub async fn read_device_string(&mut self) -> Result<DeviceString, PumpError> {
        let timeout = self.ngp_timeout();
        let response = self
            .checked_request(
                ComDCommand::DeviceStringRequest,
                &device_string_params(),
                ComDCommand::DeviceStringResponse,
                timeout,
            )
            .await?;
        DeviceString::parse(&response)
    }

    /// All eight basal patterns, empty ones left out.
    pub async fn read_basal_patterns(&mut self) -> Result<BTreeMap<String, Vec<BasalScheduleEntry>>, PumpError> {
        let timeout = self.ngp_timeout();
        let mut schedules = BTreeMap::new();
        for number in 1..=BASAL_PATTERN_COUNT {
            let response = self
                .checked_request(
                    ComDCommand::ReadBasalPatternRequest,
                    &[number],
                    ComDCommand::ReadBasalPatternResponse,
                    timeout,
                )
                .await?;
            let schedule = basal_pattern(&response)?;
            if let (false, Some(name)) = (schedule.is_empty(), basal_pattern_name(number)) {
                schedules.insert(name.to_string(), schedule);
            }
        }
        Ok(schedules)
    }

    pub async fn read_history_info(
        &mut self,
        data_type: HistoryDataType,
        from_rtc: u32,
        to_rtc: u32,
    ) -> Result<HistoryInfo, PumpError> {
        let timeout = self.ngp_timeout();
        let response = self
            .checked_request(
                ComDCommand::ReadHistoryInfoRequest,
                &history_params(data_type, from_rtc, to_rtc),
                ComDCommand::ReadHistoryInfoResponse,
                timeout,
            )
            .await?;
        HistoryInfo::parse(&response)
    }

    async fn ack_multipacket(&mut self, command: ComDCommand) -> Result<(), PumpError> {
        self.comd_send(ComDCommand::AckMultipacketCommand, &u16::from(command).to_be_bytes())
            .await
    }

    /// Download one history data type.
    ///
    /// `progress` is called with the running byte count after each completed
    /// segment. Timeouts and malformed messages count toward `max_retries`; a
    /// timeout with packets outstanding re-requests the first missing run.
    pub async fn read_history<F: FnMut(u64)>(
        &mut self,
        data_type: HistoryDataType,
        from_rtc: u32,
        to_rtc: u32,
        expected_size: u32,
        max_retries: u32,
        mut progress: F,
    ) -> Result<HistoryDownload, PumpError> {
        let timeout = self.ngp_timeout();
        self.comd_send(ComDCommand::ReadHistoryRequest, &history_params(data_type, from_rtc, to_rtc))
            .await?;

        let mut download = HistoryDownload::default();
        let mut multipacket: Option<MultipacketSession> = None;
        let mut retries = 0;
        loop {
            let message = match self.comd_receive(timeout).await {
                Ok(message) => message,
                Err(e) if is_transient(&e) => {
                    let timed_out = e.is_timeout();
                    count_retry(&mut retries, max_retries, e.to_string(), || e)?;
                    let first_missing = multipacket
                        .as_ref()
                        .filter(|mp| timed_out && !mp.payload_complete())
                        .and_then(|mp| mp.missing_segments().first().copied());
                    if let Some(run) = first_missing {
                        debug!("Re-requesting {} packets from {}", run.count, run.start);
                        let mut params = [0u8; 4];
                        params[..2].copy_from_slice(&run.start.to_be_bytes());
                        params[2..].copy_from_slice(&run.count.to_be_bytes());
                        self.comd_send(ComDCommand::MultipacketResendPackets, &params).await?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            match message.command() {
                // stray high speed mode answers show up mid-transfer
                ComDCommand::HighSpeedMode => {}
                ComDCommand::InitiateMultipacketTransfer => {
                    let session = MultipacketSession::from_initiate(&message)?;
                    debug!(
                        "Multipacket transfer of {} bytes in {} packets",
                        session.segment_size, session.packets_to_fetch
                    );
                    multipacket = Some(session);
                    self.ack_multipacket(ComDCommand::InitiateMultipacketTransfer).await?;
                }
                ComDCommand::MultipacketSegmentTransmission => {
                    let session = multipacket
                        .as_mut()
                        .ok_or_else(|| PumpError::InvalidMessage("Multipacket segment before initiate".to_string()))?;
                    let packet_number = message.u16_at(0x03)?;
                    let data = Bytes::copy_from_slice(message.slice(0x05, message.len().saturating_sub(2))?);
                    if let Err(e) = session.add_segment(packet_number, data) {
                        count_retry(&mut retries, max_retries, e.to_string(), || e)?;
                        continue;
                    }
                    if !session.payload_complete() {
                        continue;
                    }

                    let segment = HistorySegment::parse(session.payload()?)?;
                    multipacket = None;
                    if segment.data_type != data_type {
                        return Err(PumpError::InvalidMessage(format!(
                            "Unexpected history type in response: {}",
                            segment.data_type
                        )));
                    }
                    let blocks = segment.block_data()?;
                    split_blocks(&blocks, &mut download.pages)?;
                    download.bytes_fetched += blocks.len() as u64;
                    progress(download.bytes_fetched);
                    self.ack_multipacket(ComDCommand::MultipacketSegmentTransmission).await?;
                }
                ComDCommand::EndHistoryTransmission => break,
                ComDCommand::UnmergedHistoryResponse => {
                    return Err(PumpError::InvalidMessage("unmerged history not supported".to_string()));
                }
                other => {
                    return Err(PumpError::InvalidMessage(format!("Unexpected message response: {}", other)));
                }
            }
        }

        if download.bytes_fetched < expected_size as u64 {
            return Err(PumpError::InvalidMessage(format!(
                "Got less data than expected: {} of {} bytes",
                download.bytes_fetched, expected_size
            )));
        }
        // the pump follows END_HISTORY with a high speed mode message
        if let Err(e) = self.comd_receive(timeout).await {
            debug!("No message after end of history: {}", e);
        }
        info!("Read {} {} pages ({} bytes)", download.pages.len(), data_type, download.bytes_fetched);
        Ok(download)
    }
}

/// Failures of a single history message that a later message can make good.
fn is_transient(e: &PumpError) -> bool {
    e.is_retryable() || matches!(e, PumpError::Decryption { .. } | PumpError::Checksum { .. })
}

fn count_retry(
    retries: &mut u32,
    max_retries: u32,
    reason: String,
    cause: impl FnOnce() -> PumpError,
) -> Result<(), PumpError> {
    *retries += 1;
    if *retries > max_retries {
        return Err(PumpError::Retry {
            attempts: *retries,
            source: Box::new(cause()),
        });
    }
    warn!("History read failed ({}), retry {}/{}", reason, retries, max_retries);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::LinkKey;
    use crate::ngp::{NgpResponse, build_comd, encode_comd_response};

    const KEY: LinkKey = *b"0123456789abcdef";

    fn comd(command: ComDCommand, body: &[u8]) -> ComDResponse {
        let clear = build_comd(1, command, body);
        let raw = encode_comd_response(1, &KEY, &KEY, &clear);
        let ngp = NgpResponse::parse(Bytes::from(raw)).unwrap();
        ComDResponse::parse(&ngp, &KEY, &KEY).unwrap()
    }

    /// Body bytes start at offset 3 of the decrypted message.
    fn at(offset: usize, len: usize) -> Vec<u8> {
        vec![0u8; offset.saturating_sub(3) + len]
    }

    #[test]
    fn unset_clock_is_invalid_state() {
        let response = comd(ComDCommand::TimeResponse, &[0; 9]);
        assert!(matches!(pump_time(&response), Err(PumpError::InvalidState(_))));

        let mut body = vec![1];
        body.extend_from_slice(&NgpTimestamp::new(2184052182, -1665551906).to_bytes());
        let response = comd(ComDCommand::TimeResponse, &body);
        assert_eq!(pump_time(&response).unwrap().rtc, 2184052182);
    }

    #[test]
    fn status_names_active_pattern() {
        let mut body = at(0x1A, 1);
        body[0] = 16;
        body[0x1A - 3] = 6;
        let status = PumpStatus::parse(&comd(ComDCommand::ReadPumpStatusResponse, &body)).unwrap();
        assert!(status.has(crate::constants::pump_state::ACTIVE));
        assert_eq!(status.active_schedule(), Some("Workday"));
    }

    #[test]
    fn bwz_tables_decode() {
        // checksum, count, then one 9-byte target: high, mmol high, low, mmol low, start
        let mut body = vec![0, 0, 1];
        body.extend_from_slice(&[0, 120, 0, 67, 0, 100, 0, 56, 2]);
        let targets = bg_targets(&comd(ComDCommand::ReadBgTargetsResponse, &body)).unwrap();
        assert_eq!(targets, vec![TargetEntry { start: HALF_HOUR_MS * 2, high: 120.0, low: 100.0 }]);

        let mut body = vec![0, 0, 1];
        body.extend_from_slice(&[0, 0, 0, 150, 0, 0, 0, 0, 1]);
        let ratios = carb_ratios(&comd(ComDCommand::ReadCarbRatiosResponse, &body)).unwrap();
        assert_eq!(ratios[0].amount, 15.0);
        assert_eq!(ratios[0].start, HALF_HOUR_MS);

        let mut body = vec![0, 0, 1];
        body.extend_from_slice(&[0, 50, 0, 28, 0]);
        let factors = sensitivity_factors(&comd(ComDCommand::ReadSensitivityFactorsResponse, &body)).unwrap();
        assert_eq!(factors, vec![AmountEntry { start: 0, amount: 50.0 }]);
    }

    #[test]
    fn basal_pattern_decodes_rates() {
        let mut body = vec![1, 2];
        body.extend_from_slice(&[0, 0, 0x27, 0x10, 0]);
        body.extend_from_slice(&[0, 0, 0x13, 0x88, 12]);
        let schedule = basal_pattern(&comd(ComDCommand::ReadBasalPatternResponse, &body)).unwrap();
        assert_eq!(schedule[0], BasalScheduleEntry { start: 0, rate: 1.0 });
        assert_eq!(schedule[1], BasalScheduleEntry { start: 12 * HALF_HOUR_MS, rate: 0.5 });
    }

    #[test]
    fn device_string_strips_nuls() {
        let mut body = at(0x5E, 0);
        for (i, unit) in "MiniMed 640G".encode_utf16().enumerate() {
            body[0x0E - 3 + i * 2..0x0E - 3 + i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
        }
        body[0x0C - 3] = 4;
        let string = DeviceString::parse(&comd(ComDCommand::DeviceStringResponse, &body)).unwrap();
        assert_eq!(string.value, "MiniMed 640G");
        assert_eq!(string.string_type, 4);
    }

    #[test]
    fn short_device_string_is_rejected() {
        let response = comd(ComDCommand::DeviceStringResponse, &[0; 20]);
        assert!(matches!(DeviceString::parse(&response), Err(PumpError::InvalidMessage(_))));
    }

    #[test]
    fn characteristics_decode() {
        let mut body = at(0x36, 0);
        body[..10].copy_from_slice(b"NG1234567H");
        body[0x0D - 3..0x15 - 3].copy_from_slice(&[0x00, 0x23, 0xF7, 0x45, 0x66, 0x67, 0x62, 0x43]);
        body[0x1A - 3..0x1C - 3].copy_from_slice(&1780u16.to_be_bytes());
        body[0x1C - 3..0x1E - 3].copy_from_slice(&1u16.to_be_bytes());
        body[0x29 - 3..0x2C - 3].copy_from_slice(&[3, 6, b'A']);
        let characteristics =
            DeviceCharacteristics::parse(&comd(ComDCommand::DeviceCharacteristicsResponse, &body)).unwrap();
        assert_eq!(characteristics.serial, "NG1234567H");
        assert_eq!(characteristics.mac, Mac(0x0023F745_66676243));
        assert_eq!(characteristics.model, "1780.1");
        assert_eq!(characteristics.firmware_version, "3.6A");
    }

    #[test]
    fn history_params_layout() {
        let params = history_params(HistoryDataType::SensorData, 0x1234_5678, u32::MAX);
        assert_eq!(params, [3, 4, 0x12, 0x34, 0x56, 0x78, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0]);
    }
}
