//! Command and control codes shared by the protocol layers.

use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;

// Contour Next Link 2.4 USB identification
pub const VID: u16 = 0x1A79;
pub const PID: u16 = 0x6210;
pub const ENDPOINT_OUT: u8 = 0x01;
pub const ENDPOINT_IN: u8 = 0x81;

pub const USB_BLOCK_SIZE: usize = 64;
pub const USB_HEADER: &[u8; 3] = b"ABC";
pub const USB_HEADER_SIZE: usize = 4;
pub const USB_PAYLOAD_SIZE: usize = USB_BLOCK_SIZE - USB_HEADER_SIZE;

/// Radio channels tried, in order, when joining the pump's network.
pub const RADIO_CHANNELS: [u8; 5] = [0x14, 0x11, 0x0E, 0x17, 0x1A];

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, Display)]
#[repr(u8)]
pub enum Ascii {
    Stx = 0x02,
    Etx = 0x03,
    Eot = 0x04,
    Enq = 0x05,
    Ack = 0x06,
    Lf = 0x0A,
    Cr = 0x0D,
    Nak = 0x15,
    Etb = 0x17,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Command byte of the 33-byte Minimed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, Display)]
#[repr(u8)]
pub enum EnvelopeCommand {
    OpenConnection = 0x10,
    CloseConnection = 0x11,
    SendMessage = 0x12,
    ReadInfo = 0x14,
    RequestLinkKey = 0x16,
    SendLinkKey = 0x17,
    ReceiveMessage = 0x80,
    SendMessageResponse = 0x81,
    RequestLinkKeyResponse = 0x86,
    #[num_enum(catch_all)]
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, Display)]
#[repr(u8)]
pub enum NgpCommand {
    Initialize = 0x01,
    ScanNetwork = 0x02,
    JoinNetwork = 0x03,
    LeaveNetwork = 0x04,
    TransmitPacket = 0x05,
    /// Shared by READ_DATA, READ_STATUS and READ_NETWORK_STATUS.
    ReadStatus = 0x06,
    SetSecurityMode = 0x0C,
    ReadStatistics = 0x0D,
    SetRfMode = 0x0E,
    ClearStatus = 0x10,
    SetLinkKey = 0x14,
    CommandResponse = 0x55,
    #[num_enum(catch_all)]
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive, Display)]
#[repr(u16)]
pub enum ComDCommand {
    HighSpeedMode = 0x0412,
    TimeRequest = 0x0403,
    TimeResponse = 0x0407,
    ReadPumpStatusRequest = 0x0112,
    ReadPumpStatusResponse = 0x013C,
    ReadBasalPatternRequest = 0x0116,
    ReadBasalPatternResponse = 0x0123,
    ReadCarbRatiosRequest = 0x012B,
    ReadCarbRatiosResponse = 0x012C,
    ReadSensitivityFactorsRequest = 0x012E,
    ReadSensitivityFactorsResponse = 0x012F,
    ReadBgTargetsRequest = 0x0131,
    ReadBgTargetsResponse = 0x0132,
    DeviceStringRequest = 0x013A,
    DeviceStringResponse = 0x013B,
    DeviceCharacteristicsRequest = 0x0200,
    DeviceCharacteristicsResponse = 0x0201,
    ReadHistoryRequest = 0x0304,
    ReadHistoryResponse = 0x0305,
    EndHistoryTransmission = 0x030A,
    ReadHistoryInfoRequest = 0x030C,
    ReadHistoryInfoResponse = 0x030D,
    UnmergedHistoryResponse = 0x030E,
    InitiateMultipacketTransfer = 0xFF00,
    MultipacketSegmentTransmission = 0xFF01,
    MultipacketResendPackets = 0xFF02,
    AckMultipacketCommand = 0x00FE,
    Nak = 0x00FF,
    #[num_enum(catch_all)]
    Unknown(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum HighSpeedMode {
    Enable = 0,
    Disable = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, Display)]
#[repr(u8)]
pub enum HistoryDataType {
    #[strum(to_string = "pump data")]
    PumpData = 2,
    #[strum(to_string = "sensor data")]
    SensorData = 3,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Pump state bitfield of the status response.
pub mod pump_state {
    pub const SUSPENDED: u8 = 1;
    pub const BOLUSING: u8 = 2;
    /// Cleared after a rewind until a new reservoir is primed.
    pub const ACTIVE: u8 = 16;
    pub const TEMP_BASAL_ACTIVE: u8 = 32;
    pub const CGM_ACTIVE: u8 = 64;
}

pub const BASAL_PATTERN_NAMES: [&str; 8] = [
    "Pattern 1",
    "Pattern 2",
    "Pattern 3",
    "Pattern 4",
    "Pattern 5",
    "Workday",
    "Day Off",
    "Sick Day",
];

/// Name of a 1-based basal pattern number.
pub fn basal_pattern_name(number: u8) -> Option<&'static str> {
    (number as usize)
        .checked_sub(1)
        .and_then(|i| BASAL_PATTERN_NAMES.get(i).copied())
}
