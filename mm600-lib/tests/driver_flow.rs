//! A whole download session against a scripted bridge and pump
mod common;
use common::*;

use mm600_lib::driver::{Driver, PUMP_NOT_ACTIVE_MESSAGE};
use mm600_lib::link::NOT_ASSOCIATED_MESSAGE;
use mm600_lib::process_history;

const PACKET_SIZE: usize = 120;
const PUMP_NOW: i64 = 24 * 60;
const PUMP_SERIAL: &str = "NG1234567H";

/// Bridge info, remote command mode and passthrough, up to the open
/// connection.
fn bridge_setup(script: &mut ScriptedBridge) {
    script
        .message(b"\x04\x021|Bayer6210|1.0\r6213-1033937\r\x03")
        .message(&[0x05])
        // enter, exit, enter remote command mode
        .message(&[0x04])
        .message(&[0x06])
        .message(&[0x05])
        .message(&[0x04])
        .message(&[0x06])
        // W|, Q|, 1|
        .message(&[0x06])
        .message(&[0x06])
        .message(&[0x06])
        .envelope(EnvelopeCommand::OpenConnection, &[]);
}

fn read_info(script: &mut ScriptedBridge, pump_mac: Mac) {
    let mut payload = vec![0u8; 0x13];
    payload[..8].copy_from_slice(&LINK_MAC.to_be_bytes());
    payload[8..16].copy_from_slice(&pump_mac.to_be_bytes());
    script.envelope(EnvelopeCommand::ReadInfo, &payload);
}

/// The pump answers JOIN_NETWORK on the first radio channel.
fn join(script: &mut ScriptedBridge) {
    let mut joined = vec![0u8; 42];
    joined[16] = 0x82;
    joined[33] = 0x42;
    joined[41] = RADIO_CHANNEL;
    script.ack().ngp(&joined);
}

/// High speed mode on, then the pump clock.
fn pump_time(script: &mut ScriptedBridge) {
    script.ack();
    let mut time = vec![0x01];
    time.extend_from_slice(&at(PUMP_NOW).to_bytes());
    script.answer(ComDCommand::TimeResponse, &time);
}

/// Link key, network join on the first radio channel, high speed mode and
/// the pump clock.
fn link_setup(script: &mut ScriptedBridge) {
    let packed = cipher::pack_link_key(&KEY, BRIDGE_ID.as_bytes(), 55).expect("Failed to pack link key");
    script.envelope(EnvelopeCommand::RequestLinkKey, &packed);
    join(script);
    pump_time(script);
}

/// The pump's side of pairing. Every message we answer is followed by the
/// bridge's ack of our reply.
fn pairing_handshake(script: &mut ScriptedBridge) {
    let mut request = vec![0x02];
    request.extend_from_slice(&LINK_MAC.to_be_bytes());
    script
        .clear_comd(1, HandshakeCommand::DeviceCharacteristicsRequest, &request)
        .ack();

    let pump_mac = pump_mac_from_serial(PUMP_SERIAL).expect("Invalid pump serial");
    let mut characteristics = vec![0u8; 0x36 - 3];
    characteristics[..10].copy_from_slice(PUMP_SERIAL.as_bytes());
    characteristics[10..18].copy_from_slice(&pump_mac.to_be_bytes());
    script
        .clear_comd(2, HandshakeCommand::DeviceCharacteristicsResponse, &characteristics)
        .clear_comd(3, HandshakeCommand::CompatibilityAck, &[0]);

    let packed = cipher::pack_link_key(&KEY, BRIDGE_ID.as_bytes(), 55).expect("Failed to pack link key");
    script
        .clear_comd(4, HandshakeCommand::LinkKey, &packed)
        .ack()
        .clear_comd(5, HandshakeCommand::TimeSync, &at(PUMP_NOW).to_bytes())
        .ack()
        .clear_comd(6, HandshakeCommand::DeviceStringRequest, &[0x01])
        .ack()
        .clear_comd(7, HandshakeCommand::EndOfInit, &[]);
}

fn pairing_config() -> DriverConfig {
    let mut config = DriverConfig::default().without_delays();
    config.pump_serial = Some(PUMP_SERIAL.to_string());
    config
}

fn status(script: &mut ScriptedBridge, flags: u8) {
    let mut params = vec![0u8; 0x18];
    params[0] = flags;
    params[0x17] = 2;
    script.answer(ComDCommand::ReadPumpStatusResponse, &params);
}

fn utf16_be(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect()
}

fn settings_replies(script: &mut ScriptedBridge) {
    // one BG target: 5.5 - 6.0 mmol/L stored as mg/dL
    let mut targets = vec![0, 0, 1];
    targets.extend_from_slice(&108u16.to_be_bytes());
    targets.extend_from_slice(&[0, 0]);
    targets.extend_from_slice(&99u16.to_be_bytes());
    targets.extend_from_slice(&[0, 0, 0]);
    script.answer(ComDCommand::ReadBgTargetsResponse, &targets);

    let mut ratios = vec![0, 0, 1];
    ratios.extend_from_slice(&100u32.to_be_bytes());
    ratios.extend_from_slice(&[0, 0, 0, 0, 0]);
    script.answer(ComDCommand::ReadCarbRatiosResponse, &ratios);

    script.answer(ComDCommand::ReadSensitivityFactorsResponse, &[0, 0, 0]);

    let mut characteristics = vec![0u8; 0x36 - 3];
    characteristics[..10].copy_from_slice(b"NG1234567H");
    script.answer(ComDCommand::DeviceCharacteristicsResponse, &characteristics);

    let mut device_string = vec![0u8; 93];
    let model = utf16_be("MiniMed 640G");
    device_string[0x0B..0x0B + model.len()].copy_from_slice(&model);
    script.answer(ComDCommand::DeviceStringResponse, &device_string);

    for number in 1..=8u8 {
        let mut pattern = vec![number, 0];
        if number == 2 {
            pattern[1] = 2;
            pattern.extend_from_slice(&units_be(0.525));
            pattern.push(0);
            pattern.extend_from_slice(&units_be(0.8));
            pattern.push(24);
        }
        script.answer(ComDCommand::ReadBasalPatternResponse, &pattern);
    }
}

fn history(script: &mut ScriptedBridge, data_type: HistoryDataType, pages: &[&[u8]]) {
    let segment = history_segment(data_type, pages);
    let mut info = vec![0u8];
    info.extend_from_slice(&((pages.len() * 2048) as u32).to_be_bytes());
    info.extend_from_slice(&at(0).to_bytes());
    info.extend_from_slice(&at(PUMP_NOW).to_bytes());
    script
        .answer(ComDCommand::ReadHistoryInfoResponse, &info)
        .multipacket(&segment, PACKET_SIZE, &[])
        .end_of_history();
}

fn cleanup(script: &mut ScriptedBridge) {
    // high speed mode off, close connection, leave remote command mode
    script
        .ack()
        .envelope(EnvelopeCommand::CloseConnection, &[])
        .message(&[0x05]);
}

fn pump_events() -> Bytes {
    page_of(&[
        event(EventType::Rewind, 60, &[]),
        event(EventType::Rewind, 6 * 60, &[]),
    ])
}

#[tokio::test]
async fn test_full_download() {
    init_tracing();
    let pump_page = pump_events();
    let mut script = ScriptedBridge::new();
    bridge_setup(&mut script);
    read_info(&mut script, PUMP_MAC);
    link_setup(&mut script);
    status(&mut script, 16);
    settings_replies(&mut script);
    history(&mut script, HistoryDataType::PumpData, &[&pump_page[..]]);
    history(&mut script, HistoryDataType::SensorData, &[&b"sensor"[..]]);
    cleanup(&mut script);

    let config = DriverConfig::default().without_delays();
    let mut driver = Driver::new(script.into_channel(), config.clone());
    let mut reported = Vec::new();
    let data = driver.fetch(|p| reported.push(p)).await.expect("download failed");

    assert_eq!(reported, vec![10.0, 15.0, 20.0, 30.0, 60.0, 90.0, 100.0]);
    assert_eq!(data.model_and_serial, BRIDGE_ID);
    assert_eq!(data.pages, vec![pump_page]);
    assert_eq!(data.cbg_pages, vec![Bytes::from_static(b"sensor")]);

    let settings = &data.settings;
    assert_eq!(settings.current_ngp_timestamp, at(PUMP_NOW));
    assert_eq!(settings.pump_serial, "NG1234567H");
    assert_eq!(settings.pump_model, "MiniMed 640G");
    assert_eq!(settings.active_schedule.as_deref(), Some("Pattern 2"));
    assert_eq!(settings.bg_target.len(), 1);
    assert_eq!(settings.bg_target[0].low, 99.0);
    assert_eq!(settings.bg_target[0].high, 108.0);
    assert_eq!(settings.carb_ratio[0].amount, 10.0);
    assert!(settings.insulin_sensitivity.is_empty());
    let schedules: Vec<&String> = settings.basal_schedules.keys().collect();
    assert_eq!(schedules, vec!["Pattern 2"]);
    let pattern = &settings.basal_schedules["Pattern 2"];
    assert_eq!(pattern[0].rate, 0.525);
    assert_eq!(pattern[1].start, 12 * 60 * 60 * 1000);

    let channel = driver.into_channel();
    assert!(!channel.is_connected());
    assert_eq!(channel.pending(), 0);

    let decoded = process_history(data.settings, &data.pages, &data.cbg_pages, &config).expect("decode failed");
    let rewinds = decoded
        .records
        .iter()
        .filter(|r| r.device_event() == Some(&DeviceEvent::ReservoirChange))
        .count();
    assert_eq!(rewinds, 2);
}

#[tokio::test]
async fn test_unlinked_pump_is_reported() {
    let mut script = ScriptedBridge::new();
    bridge_setup(&mut script);
    read_info(&mut script, Mac(0));

    let mut driver = Driver::new(script.into_channel(), DriverConfig::default().without_delays());
    let mut reported = Vec::new();
    let err = driver.fetch(|p| reported.push(p)).await.unwrap_err();
    assert!(matches!(err, PumpError::InvalidState(ref m) if m == NOT_ASSOCIATED_MESSAGE));
    assert_eq!(reported, vec![10.0, 100.0]);
    assert!(!driver.into_channel().is_connected());
}

#[tokio::test]
async fn test_unlinked_pump_is_paired_by_serial() {
    init_tracing();
    let mut script = ScriptedBridge::new();
    bridge_setup(&mut script);
    read_info(&mut script, Mac(0));
    join(&mut script);
    pairing_handshake(&mut script);
    pump_time(&mut script);
    status(&mut script, 0);
    cleanup(&mut script);

    let mut driver = Driver::new(script.into_channel(), pairing_config());
    let mut reported = Vec::new();
    let err = driver.fetch(|p| reported.push(p)).await.unwrap_err();
    // the pump time decrypted with the key handed over while pairing
    assert!(matches!(err, PumpError::InvalidState(ref m) if m == PUMP_NOT_ACTIVE_MESSAGE));
    assert_eq!(reported, vec![10.0, 15.0, 100.0]);

    let session = driver.link().session();
    assert_eq!(session.key(), Some(&KEY));
    assert_eq!(session.pump_mac, pump_mac_from_serial(PUMP_SERIAL).unwrap());
    assert_eq!(session.radio_channel, RADIO_CHANNEL);
    assert_eq!(driver.into_channel().pending(), 0);
}

#[tokio::test]
async fn test_silent_pump_fails_pairing() {
    let mut script = ScriptedBridge::new();
    bridge_setup(&mut script);
    read_info(&mut script, Mac(0));
    join(&mut script);
    let mut request = vec![0x02];
    request.extend_from_slice(&LINK_MAC.to_be_bytes());
    script
        .clear_comd(1, HandshakeCommand::DeviceCharacteristicsRequest, &request)
        .ack()
        .silence()
        .envelope(EnvelopeCommand::CloseConnection, &[])
        .message(&[0x05]);

    let mut driver = Driver::new(script.into_channel(), pairing_config());
    let err = driver.fetch(|_| {}).await.unwrap_err();
    assert!(matches!(err, PumpError::Pairing(_)));
    assert!(!err.is_retryable());
    assert_eq!(driver.link().session().key(), None);
    assert_eq!(driver.into_channel().pending(), 0);
}

#[tokio::test]
async fn test_inactive_pump_stops_download() {
    let mut script = ScriptedBridge::new();
    bridge_setup(&mut script);
    read_info(&mut script, PUMP_MAC);
    link_setup(&mut script);
    status(&mut script, 0);
    cleanup(&mut script);

    let mut driver = Driver::new(script.into_channel(), DriverConfig::default().without_delays());
    let mut reported = Vec::new();
    let err = driver.fetch(|p| reported.push(p)).await.unwrap_err();
    assert!(matches!(err, PumpError::InvalidState(ref m) if m == PUMP_NOT_ACTIVE_MESSAGE));
    assert_eq!(reported, vec![10.0, 15.0, 100.0]);

    let channel = driver.into_channel();
    assert_eq!(channel.pending(), 0);
}

#[tokio::test]
async fn test_wrong_link_key_fails_first_exchange() {
    let mut script = ScriptedBridge::new();
    bridge_setup(&mut script);
    read_info(&mut script, PUMP_MAC);
    // the bridge hands out a key packed for another serial
    let packed = cipher::pack_link_key(&KEY, b"6213-0000000", 55).expect("Failed to pack link key");
    script.envelope(EnvelopeCommand::RequestLinkKey, &packed);
    join(&mut script);
    pump_time(&mut script);

    let mut driver = Driver::new(script.into_channel(), DriverConfig::default().without_delays());
    assert!(driver.fetch(|_| {}).await.is_err());
}
