use crate::config::FixedTimezone;
use crate::history::event::{BgUnits, BolusSource, suspend_reason};
use crate::history::{EventType, EventView, HistoryEvent, HistoryParser, decode_events};
use crate::records::{DeliveryType, DeviceEvent, ReasonAgent, Record, Suppressed, TargetRange};
use crate::timestamp::format_device_time;
use bytes::Bytes;

// Captured from a 640G set to mmol/L
const BOLUS_PROGRAMMED: &str = "150016822dff2e9e029f8e01aa0000014dfc000032c8";
const BOLUS_DELIVERED: &str = "dc001a822dff189e029f8e01aa0000014dfc00014dfc000032c8";
const WIZARD_ESTIMATE: &str =
    "3d0035822dfdd69e029f8e01000000003c002300000046003200370000000000014dfc000032c80000000000014dfc000000014dfc";
const ORPHANED_BOLUS_DELIVERED: &str = "dc001a822dff2e9e029f8e01aa0000014dfc00014dfc000032c8";

const DELIVERY_STOPPED: &str = "1e000c81ee52f6a092886601";
const DELIVERY_RESTARTED: &str = "1f000c81ee56b5a092886602";

const BASAL_SEGMENT_START: &str = "1d001181963895a101dbab020200001482";
const TEMP_BASAL_PROGRAMMED: &str = "1b00148196614ca101dbab000100000000c800f0";

fn event(hex_data: &str) -> HistoryEvent {
    let bytes_data = hex::decode(hex_data).expect("Failed to decode hex");
    HistoryEvent::new(Bytes::from(bytes_data)).expect("Event shorter than its header")
}

fn page(hex_events: &[&str]) -> Bytes {
    Bytes::from(hex::decode(hex_events.concat()).expect("Failed to decode hex"))
}

/// Parse `events` as downloaded an hour after the last of them, in GMT.
fn parse(events: Vec<HistoryEvent>) -> Vec<Record> {
    let now = events.last().map(|e| e.timestamp().shifted(3600)).expect("no events");
    let mut settings = crate::records::PumpSettings::new(now);
    settings.pump_model = "1511".to_string();
    settings.pump_serial = "NG1234567H".to_string();
    let mut parser = HistoryParser::new(settings, events, &FixedTimezone::default()).expect("Failed to set up parser");
    parser.build_records().expect("Failed to build records")
}

#[test]
fn test_parse_bolus_programmed() {
    let e = event(BOLUS_PROGRAMMED);
    assert_eq!(e.event_type(), EventType::NormalBolusProgrammed);
    assert_eq!(e.size() as usize, e.as_bytes().len());
    assert_eq!(e.timestamp().rtc, 2184052526);
    assert_eq!(format_device_time(e.timestamp().to_date()), "2017-02-10T15:54:36");

    let bolus = e.bolus().expect("Not a bolus event");
    assert_eq!(bolus.bolus_number, 0xAA);
    assert_eq!(bolus.source(), BolusSource::BolusWizard);
    assert!(bolus.is_wizard_bolus());
}

#[test]
fn test_parse_bolus_delivered() {
    let e = event(BOLUS_DELIVERED);
    assert_eq!(e.event_type(), EventType::NormalBolusDelivered);
    let EventView::NormalBolusDelivered(delivered) = e.view() else {
        panic!("Unexpected view {:?}", e.view());
    };
    assert_eq!(delivered.programmed_amount(), 8.55);
    assert_eq!(delivered.delivered_amount(), 8.55);
    assert_eq!(delivered.iob(), 1.3);
}

#[test]
fn test_parse_wizard_estimate() {
    let e = event(WIZARD_ESTIMATE);
    assert_eq!(e.event_type(), EventType::BolusWizardEstimate);
    assert_eq!(e.timestamp().rtc, 2184052182);
    assert_eq!(format_device_time(e.timestamp().to_date()), "2017-02-10T15:48:52");

    let w = e.wizard_estimate().expect("Not a wizard estimate");
    assert_eq!(w.bg_units(), BgUnits::MmolL);
    assert_eq!(w.bg_input(), 0.0);
    assert_eq!(w.carb_input(), 60.0);
    assert_eq!(w.carb_ratio(), 7.0);
    assert_eq!(w.isf(), Some(3.5));
    assert_eq!(w.bg_target(), Some((5.0, 5.5)));
    assert_eq!(w.food_estimate(), 8.55);
    assert_eq!(w.final_estimate(), 8.55);
    assert_eq!(w.iob(), Some(1.3));
    assert!(!w.estimate_modified_by_user());
}

#[test]
fn test_decode_page_of_captured_events() {
    let events = decode_events(&[page(&[BOLUS_PROGRAMMED, WIZARD_ESTIMATE, BOLUS_DELIVERED])]);
    let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        types,
        vec![
            EventType::NormalBolusProgrammed,
            EventType::BolusWizardEstimate,
            EventType::NormalBolusDelivered
        ]
    );
}

#[test]
fn test_wizard_bolus_starts_at_programmed_time() {
    let records = parse(vec![
        event(BOLUS_PROGRAMMED),
        event(WIZARD_ESTIMATE),
        event(BOLUS_DELIVERED),
    ]);
    let wizards: Vec<&Record> = records.iter().filter(|r| r.wizard().is_some()).collect();
    assert_eq!(wizards.len(), 1);
    assert!(records.iter().all(|r| r.bolus().is_none()));

    let record = wizards[0];
    assert_eq!(format_device_time(record.device_time), "2017-02-10T15:48:52");
    assert_eq!(record.timezone_offset, 0);
    assert_eq!(record.device_id.as_deref(), Some("1511:NG1234567H"));

    let wizard = record.wizard().unwrap();
    assert_eq!(wizard.carb_input, 60.0);
    assert_eq!(wizard.insulin_carb_ratio, 7.0);
    assert_eq!(wizard.insulin_on_board, Some(1.3));
    assert_eq!(wizard.insulin_sensitivity, Some(3.5));
    assert_eq!(wizard.bg_target, Some(TargetRange { low: 5.0, high: 5.5 }));
    assert_eq!(wizard.bg_input, None);
    assert_eq!(wizard.recommended.carb, 8.55);
    assert_eq!(wizard.recommended.correction, 0.0);
    assert_eq!(wizard.recommended.net, 8.55);
    assert_eq!(wizard.units, "mmol/L");
    assert_eq!(wizard.carb_units, "grams");

    let bolus = wizard.bolus.as_ref().expect("wizard without bolus");
    assert_eq!(format_device_time(bolus.device_time), "2017-02-10T15:54:36");
    assert_eq!(bolus.bolus().unwrap().normal, Some(8.55));
    assert_eq!(bolus.bolus().unwrap().expected_normal, None);
}

#[test]
fn test_delivered_bolus_without_programmed_event_is_dropped() {
    let records = parse(vec![event(WIZARD_ESTIMATE), event(ORPHANED_BOLUS_DELIVERED)]);
    assert!(records.iter().all(|r| r.bolus().is_none() && r.wizard().is_none()));
    // only the current settings snapshot remains
    assert_eq!(records.len(), 1);
    assert!(records[0].settings().is_some());
}

#[test]
fn test_suspend_resume_captured() {
    let stop = event(DELIVERY_STOPPED);
    let EventView::InsulinDeliveryStopped(reason) = stop.view() else {
        panic!("Unexpected view {:?}", stop.view());
    };
    assert_eq!(reason.reason, suspend_reason::ALARM_SUSPEND);

    let records = parse(vec![stop, event(DELIVERY_RESTARTED)]);
    let status = records
        .iter()
        .find(|r| matches!(r.device_event(), Some(DeviceEvent::Status { .. })))
        .expect("no suspend status");
    assert_eq!(format_device_time(status.device_time), "2018-05-05T21:15:08");
    let Some(DeviceEvent::Status { status: name, reason, duration }) = status.device_event() else {
        unreachable!()
    };
    assert_eq!(name, "suspended");
    assert_eq!(*duration, 959_000);
    assert_eq!(reason.suspended, ReasonAgent::Automatic);
    assert_eq!(reason.resumed, ReasonAgent::Manual);

    let payload = status.payload.as_ref().unwrap();
    assert_eq!(payload["suspended"]["cause"], "Alarm suspend");
    assert_eq!(payload["resumed"]["cause"], "User cleared alarm");

    let suspend = records
        .iter()
        .find_map(|r| r.basal().filter(|b| b.delivery_type == DeliveryType::Suspend))
        .expect("no suspend basal");
    assert_eq!(suspend.duration, Some(959_000));
}

#[test]
fn test_running_percentage_temp_basal() {
    let records = parse(vec![event(BASAL_SEGMENT_START), event(TEMP_BASAL_PROGRAMMED)]);

    let scheduled = records
        .iter()
        .find(|r| r.basal().is_some_and(|b| b.delivery_type == DeliveryType::Scheduled))
        .expect("no scheduled basal");
    assert_eq!(format_device_time(scheduled.device_time), "2018-05-23T12:00:00");
    assert_eq!(scheduled.basal().unwrap().rate, Some(0.525));
    assert_eq!(scheduled.basal().unwrap().schedule_name.as_deref(), Some("Pattern 2"));

    let temp = records
        .iter()
        .find(|r| r.basal().is_some_and(|b| b.delivery_type == DeliveryType::Temp))
        .expect("no temp basal");
    assert_eq!(format_device_time(temp.device_time), "2018-05-23T14:53:43");
    assert!(temp.has_annotation("basal/unknown-duration"));
    let basal = temp.basal().unwrap();
    assert_eq!(basal.rate, Some(1.05));
    assert_eq!(basal.percent, Some(2.0));
    assert_eq!(basal.duration, Some(14_400_000));
    assert_eq!(basal.expected_duration, Some(14_400_000));
    assert_eq!(
        basal.suppressed,
        Some(Suppressed::scheduled(0.525, Some("Pattern 2".to_string())))
    );
}
