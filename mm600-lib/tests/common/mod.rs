//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;
#[allow(unused_imports)]
pub use mm600_lib::cipher::{self, LinkKey};
#[allow(unused_imports)]
pub use mm600_lib::constants::{ComDCommand, EnvelopeCommand, HistoryDataType};
#[allow(unused_imports)]
pub use mm600_lib::error::PumpError;
#[allow(unused_imports)]
pub use mm600_lib::history::{EventType, HistoryEvent};
#[allow(unused_imports)]
pub use mm600_lib::pairing::{HandshakeCommand, pump_mac_from_serial};
#[allow(unused_imports)]
pub use mm600_lib::records::{DeliveryType, DeviceEvent, PumpSettings, Record};
#[allow(unused_imports)]
pub use mm600_lib::session::{Mac, PumpSession};
#[allow(unused_imports)]
pub use mm600_lib::timestamp::{NgpTimestamp, format_device_time};
#[allow(unused_imports)]
pub use mm600_lib::{ByteChannel, DriverConfig, FixedTimezone, MemoryChannel};

use mm600_lib::history::blocks::{HistorySegment, seal_block};
use mm600_lib::link::PumpLink;
use mm600_lib::transport::{Bridge, encode_reports};
use mm600_lib::{envelope, ngp};

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

#[allow(dead_code)]
pub const KEY: LinkKey = *b"0123456789abcdef";
#[allow(dead_code)]
pub const BRIDGE_ID: &str = "6213-1033937";
#[allow(dead_code)]
pub const RADIO_CHANNEL: u8 = 0x14;
#[allow(dead_code)]
pub const LINK_MAC: Mac = Mac(0x0023F700_00112233);
#[allow(dead_code)]
pub const PUMP_MAC: Mac = Mac(0x0023F745_66676243);

/// 2020-01-01T00:00:00 on the pump clock.
#[allow(dead_code)]
pub const BASE: NgpTimestamp = NgpTimestamp {
    rtc: 0x9000_0000,
    offset: -1_784_767_104,
};

#[allow(dead_code)]
pub fn at(minutes: i64) -> NgpTimestamp {
    BASE.shifted(minutes * 60)
}

/// An event on the pump clock `minutes` after [`BASE`].
#[allow(dead_code)]
pub fn event(event_type: EventType, minutes: i64, body: &[u8]) -> HistoryEvent {
    HistoryEvent::build(event_type, 0, at(minutes), body)
}

/// Insulin amounts are stored in ten-thousandths of a unit.
#[allow(dead_code)]
pub fn units_be(units: f64) -> [u8; 4] {
    ((units * 10000.0).round() as u32).to_be_bytes()
}

/// Events laid back to back as the pump writes them into a page.
#[allow(dead_code)]
pub fn page_of(events: &[HistoryEvent]) -> Bytes {
    let mut out = Vec::new();
    for e in events {
        out.extend_from_slice(e.as_bytes());
    }
    Bytes::from(out)
}

/// Settings for a 640G read `minutes` after [`BASE`].
#[allow(dead_code)]
pub fn settings_at(minutes: i64) -> PumpSettings {
    let mut settings = PumpSettings::new(at(minutes));
    settings.pump_model = "MiniMed 640G".to_string();
    settings.pump_serial = "NG1234567H".to_string();
    settings
}

/// Settings read an hour after the last of `events`.
#[allow(dead_code)]
pub fn settings_after(events: &[HistoryEvent]) -> PumpSettings {
    let last = events.last().map(|e| e.timestamp()).unwrap_or(BASE);
    let mut settings = PumpSettings::new(last.shifted(3600));
    settings.pump_model = "MiniMed 640G".to_string();
    settings.pump_serial = "NG1234567H".to_string();
    settings
}

/// A session as left behind by a successful link setup.
#[allow(dead_code)]
pub fn linked_session() -> PumpSession {
    let mut session = PumpSession::new(BRIDGE_ID);
    session.set_key(KEY);
    session.radio_channel = RADIO_CHANNEL;
    session.link_mac = LINK_MAC;
    session.pump_mac = PUMP_MAC;
    session
}

#[allow(dead_code)]
pub fn linked_link(channel: MemoryChannel) -> PumpLink<MemoryChannel> {
    let config = DriverConfig::default().without_delays();
    PumpLink::new(Bridge::new(channel, &config), linked_session(), &config)
}

/// Seal pages into blocks and wrap them in an uncompressed history segment.
#[allow(dead_code)]
pub fn history_segment(data_type: HistoryDataType, pages: &[&[u8]]) -> Vec<u8> {
    let blocks: Vec<u8> = pages
        .iter()
        .flat_map(|p| seal_block(p).expect("page too large"))
        .collect();
    HistorySegment::encode(data_type, &blocks, false)
}

/// Scripted bridge: queues, in order, everything the bridge and pump send
/// back during an exchange.
#[allow(dead_code)]
pub struct ScriptedBridge {
    channel: MemoryChannel,
    iv: LinkKey,
    sequence: u32,
    comd_sequence: u8,
}

#[allow(dead_code)]
impl ScriptedBridge {
    pub fn new() -> Self {
        Self {
            channel: MemoryChannel::new(),
            iv: cipher::derive_iv(&KEY, RADIO_CHANNEL),
            sequence: 0,
            comd_sequence: 0,
        }
    }

    /// One logical message, split into HID reports.
    pub fn message(&mut self, message: &[u8]) -> &mut Self {
        for report in encode_reports(message) {
            self.channel.push_incoming(report.to_vec());
        }
        self
    }

    /// Nothing arrives before the read times out.
    pub fn silence(&mut self) -> &mut Self {
        self.channel.push_incoming(Bytes::new());
        self
    }

    pub fn envelope(&mut self, command: EnvelopeCommand, payload: &[u8]) -> &mut Self {
        self.sequence += 1;
        let message = envelope::build(command, self.sequence, payload);
        self.message(&message)
    }

    /// SEND_MESSAGE_RESPONSE for the NGP frame just sent.
    pub fn ack(&mut self) -> &mut Self {
        self.envelope(EnvelopeCommand::SendMessageResponse, &[])
    }

    /// A RECEIVE_MESSAGE whose NGP body is `body`.
    pub fn ngp(&mut self, body: &[u8]) -> &mut Self {
        self.sequence += 1;
        let message = ngp::receive_message(self.sequence, body);
        self.message(&message)
    }

    /// An encrypted ComD message from the pump.
    pub fn comd(&mut self, command: ComDCommand, params: &[u8]) -> &mut Self {
        self.sequence += 1;
        self.comd_sequence = self.comd_sequence.wrapping_add(1);
        let clear = ngp::build_comd(self.comd_sequence, command, params);
        let message = ngp::encode_comd_response(self.sequence, &KEY, &self.iv, &clear);
        self.message(&message)
    }

    /// A ComD message the pump sends unencrypted, as while pairing.
    pub fn clear_comd(&mut self, sequence: u8, command: HandshakeCommand, params: &[u8]) -> &mut Self {
        self.sequence += 1;
        let clear = ngp::build_comd(sequence, ComDCommand::from(u16::from(command)), params);
        let message = ngp::encode_clear_comd_response(self.sequence, &clear);
        self.message(&message)
    }

    /// Ack of a ComD request followed by its answer.
    pub fn answer(&mut self, command: ComDCommand, params: &[u8]) -> &mut Self {
        self.ack().comd(command, params)
    }

    /// A whole multipacket history transfer of `segment`, in packets of
    /// `packet_size` bytes, skipping the packets in `dropped`.
    ///
    /// Covers the pump's side from READ_HISTORY up to the last packet: the
    /// caller scripts what follows.
    pub fn multipacket(&mut self, segment: &[u8], packet_size: usize, dropped: &[u16]) -> &mut Self {
        let packets: Vec<&[u8]> = segment.chunks(packet_size).collect();
        let last = packets.last().map(|p| p.len()).unwrap_or(0);
        let mut initiate = Vec::new();
        initiate.extend_from_slice(&(segment.len() as u32).to_be_bytes());
        initiate.extend_from_slice(&(packet_size as u16).to_be_bytes());
        initiate.extend_from_slice(&(last as u16).to_be_bytes());
        initiate.extend_from_slice(&(packets.len() as u16).to_be_bytes());

        // READ_HISTORY ack, initiate, ack of our initiate ack
        self.ack().comd(ComDCommand::InitiateMultipacketTransfer, &initiate).ack();
        for (number, packet) in packets.iter().enumerate() {
            if !dropped.contains(&(number as u16)) {
                self.packet(number as u16, packet);
            }
        }
        self
    }

    pub fn packet(&mut self, number: u16, data: &[u8]) -> &mut Self {
        let mut params = number.to_be_bytes().to_vec();
        params.extend_from_slice(data);
        self.comd(ComDCommand::MultipacketSegmentTransmission, &params)
    }

    /// Ack of the completed segment, END_HISTORY and the trailing high speed
    /// mode message.
    pub fn end_of_history(&mut self) -> &mut Self {
        self.ack()
            .comd(ComDCommand::EndHistoryTransmission, &[])
            .comd(ComDCommand::HighSpeedMode, &[0])
    }

    pub fn pending(&self) -> usize {
        self.channel.pending()
    }

    pub fn into_channel(self) -> MemoryChannel {
        self.channel
    }
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
