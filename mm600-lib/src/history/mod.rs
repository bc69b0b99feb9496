//! History decoding: from downloaded pages to a sorted clinical record list.

pub mod blocks;
pub mod event;
pub mod lzo;
pub mod parser;
pub mod simulator;

pub use blocks::{HistorySegment, split_blocks};
pub use event::{EventType, EventView, HistoryEvent, events_in_page};
pub use parser::HistoryParser;
pub use simulator::Simulator;

use crate::config::DriverConfig;
use crate::error::PumpError;
use crate::records::{PumpSettings, Record};
use crate::timezone::TimeProcessing;
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Walk the events of each page back to back by their size byte.
///
/// A TIME_RESET makes the pump log a USER_TIME_DATE_CHANGE right after it;
/// that one is dropped.
pub fn decode_events(pages: &[Bytes]) -> Vec<HistoryEvent> {
    let mut events = Vec::new();
    let mut skip_time_change = false;
    for (number, page) in pages.iter().enumerate() {
        let mut consumed = 0;
        for event in events_in_page(page) {
            consumed += event.as_bytes().len();
            match event.event_type() {
                EventType::TimeReset => {
                    debug!("TIME_RESET at {}, ignoring the next user time change", event.timestamp());
                    skip_time_change = true;
                }
                EventType::UserTimeDateChange if skip_time_change => {
                    skip_time_change = false;
                    continue;
                }
                _ => {}
            }
            events.push(event);
        }
        if consumed < page.len() {
            warn!("Page {}: unreadable event at offset {}, skipping rest of page", number, consumed);
        }
    }
    events
}

/// The decoded history of one download.
#[derive(Debug, Clone)]
pub struct DecodedHistory {
    pub records: Vec<Record>,
    pub time_processing: TimeProcessing,
}

/// Correlate pump and sensor pages into records and run them through the
/// simulator.
pub fn process_history(
    settings: PumpSettings,
    pages: &[Bytes],
    cbg_pages: &[Bytes],
    config: &DriverConfig,
) -> Result<DecodedHistory, PumpError> {
    let all_pages: Vec<Bytes> = pages.iter().chain(cbg_pages).cloned().collect();
    let events = decode_events(&all_pages);
    info!("Decoded {} history events from {} pages", events.len(), all_pages.len());

    let mut parser = HistoryParser::new(settings, events, &config.timezone)?;
    let mut records = parser.build_records()?;
    records.sort_by_key(|r| r.utc());

    let mut simulator = Simulator::new(parser.timezone_util());
    for record in records {
        simulator.add_datum(record)?;
    }
    simulator.final_basal()?;
    let records = simulator.get_events()?;
    info!("Produced {} records", records.len());

    Ok(DecodedHistory {
        records,
        time_processing: parser.time_processing(),
    })
}
