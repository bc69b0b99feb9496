//! Multipacket history downloads against a scripted bridge
mod common;
use common::*;

use mm600_lib::timestamp::MAX_RTC;

const PACKET_SIZE: usize = 150;

fn pump_segment() -> Vec<u8> {
    history_segment(HistoryDataType::PumpData, &[&b"first page of events"[..], &b"second page"[..]])
}

#[tokio::test]
async fn test_pages_arrive_through_multipacket_transfer() {
    init_tracing();
    let segment = pump_segment();
    let mut script = ScriptedBridge::new();
    script.multipacket(&segment, PACKET_SIZE, &[]).end_of_history();

    let mut link = linked_link(script.into_channel());
    let mut reported = Vec::new();
    let download = link
        .read_history(HistoryDataType::PumpData, 0, MAX_RTC, 4096, 3, |n| reported.push(n))
        .await
        .expect("history download failed");

    assert_eq!(
        download.pages,
        vec![
            Bytes::from_static(b"first page of events"),
            Bytes::from_static(b"second page")
        ]
    );
    assert_eq!(download.bytes_fetched, 4096);
    assert_eq!(reported, vec![4096]);

    let channel = link.into_bridge().into_channel();
    assert_eq!(channel.pending(), 0);
}

#[tokio::test]
async fn test_missing_packet_is_re_requested_after_timeout() {
    let segment = pump_segment();
    let mut script = ScriptedBridge::new();
    script
        .multipacket(&segment, PACKET_SIZE, &[3])
        .silence()
        // ack of the resend request, then the missing packet
        .ack()
        .packet(3, &segment[3 * PACKET_SIZE..4 * PACKET_SIZE])
        .end_of_history();

    let mut link = linked_link(script.into_channel());
    let download = link
        .read_history(HistoryDataType::PumpData, 0, MAX_RTC, 4096, 1, |_| {})
        .await
        .expect("history download failed");
    assert_eq!(download.pages.len(), 2);
}

#[tokio::test]
async fn test_retry_ceiling_wraps_last_cause() {
    let segment = pump_segment();
    let mut script = ScriptedBridge::new();
    script.multipacket(&segment, PACKET_SIZE, &[3]).silence();

    let mut link = linked_link(script.into_channel());
    let err = link
        .read_history(HistoryDataType::PumpData, 0, MAX_RTC, 4096, 0, |_| {})
        .await
        .unwrap_err();
    match err {
        PumpError::Retry { attempts, source } => {
            assert_eq!(attempts, 1);
            assert!(source.is_timeout());
        }
        other => panic!("Unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_short_history_is_rejected() {
    let segment = pump_segment();
    let mut script = ScriptedBridge::new();
    script.multipacket(&segment, PACKET_SIZE, &[]).end_of_history();

    let mut link = linked_link(script.into_channel());
    let err = link
        .read_history(HistoryDataType::PumpData, 0, MAX_RTC, 8192, 3, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::InvalidMessage(ref m) if m.starts_with("Got less data than expected")));
}

#[tokio::test]
async fn test_segment_of_other_data_type_is_fatal() {
    let segment = history_segment(HistoryDataType::SensorData, &[&b"sensor page"[..]]);
    let mut script = ScriptedBridge::new();
    script.multipacket(&segment, PACKET_SIZE, &[]);

    let mut link = linked_link(script.into_channel());
    let err = link
        .read_history(HistoryDataType::PumpData, 0, MAX_RTC, 0, 3, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::InvalidMessage(ref m) if m.contains("sensor data")));
}

#[tokio::test]
async fn test_unmerged_history_is_not_supported() {
    let mut script = ScriptedBridge::new();
    script.ack().comd(ComDCommand::UnmergedHistoryResponse, &[0; 4]);

    let mut link = linked_link(script.into_channel());
    let err = link
        .read_history(HistoryDataType::PumpData, 0, MAX_RTC, 0, 3, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::InvalidMessage(ref m) if m == "unmerged history not supported"));
}

#[tokio::test]
async fn test_corrupt_block_aborts_download() {
    let mut segment = pump_segment();
    // first payload byte of the second block
    segment[12 + 2048] ^= 0xFF;
    let mut script = ScriptedBridge::new();
    script.multipacket(&segment, PACKET_SIZE, &[]);

    let mut link = linked_link(script.into_channel());
    let err = link
        .read_history(HistoryDataType::PumpData, 0, MAX_RTC, 4096, 3, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::BlockChecksum { block: 1, .. }));
}
