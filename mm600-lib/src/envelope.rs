//! The 33-byte Minimed envelope wrapping everything sent to or through the bridge.

use crate::checksum::{sum8, verify_sum8};
use crate::constants::EnvelopeCommand;
use crate::error::PumpError;
use crate::session::Mac;
use bytes::Bytes;
use zerocopy::byteorder::big_endian::U16 as U16BE;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const ENVELOPE_SIZE: usize = 33;
pub const MINIMED_MAGIC: u16 = 0x5103;
const PUMP_SERIAL_PLACEHOLDER: &[u8; 6] = b"000000";
const CHECKSUM_OFFSET: usize = 32;
const PACKED_LINK_KEY_SIZE: usize = 55;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EnvelopeHeader {
    pub magic: U16BE,
    pub serial: [u8; 6],
    reserved_a: [u8; 10],
    pub command: u8,
    pub sequence: U32LE,
    reserved_b: [u8; 5],
    pub payload_len: U16LE,
    reserved_c: [u8; 2],
    pub checksum: u8,
}

impl EnvelopeHeader {
    fn new(command: EnvelopeCommand, sequence: u32, payload_len: usize) -> Self {
        Self {
            magic: U16BE::new(MINIMED_MAGIC),
            serial: *PUMP_SERIAL_PLACEHOLDER,
            reserved_a: [0; 10],
            command: command.into(),
            sequence: U32LE::new(sequence),
            reserved_b: [0; 5],
            payload_len: U16LE::new(payload_len as u16),
            reserved_c: [0; 2],
            checksum: 0,
        }
    }
}

/// Serialize an envelope around `payload`.
pub fn build(command: EnvelopeCommand, sequence: u32, payload: &[u8]) -> Vec<u8> {
    let header = EnvelopeHeader::new(command, sequence, payload.len());
    let mut out = Vec::with_capacity(ENVELOPE_SIZE + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out[CHECKSUM_OFFSET] = sum8(&out);
    out
}

/// Total length announced by an envelope header, if `bytes` starts with one.
pub fn declared_length(bytes: &[u8]) -> Option<usize> {
    let (header, _) = EnvelopeHeader::ref_from_prefix(bytes).ok()?;
    (header.magic.get() == MINIMED_MAGIC).then(|| ENVELOPE_SIZE + header.payload_len.get() as usize)
}

/// A received envelope with verified magic, length and checksum.
#[derive(Debug, Clone)]
pub struct MinimedResponse {
    bytes: Bytes,
    header: EnvelopeHeader,
}

impl MinimedResponse {
    pub fn parse(bytes: Bytes) -> Result<Self, PumpError> {
        let (header, _) = EnvelopeHeader::read_from_prefix(&bytes[..]).map_err(|_| {
            PumpError::InvalidMessage(format!("Minimed envelope too short: {} bytes", bytes.len()))
        })?;
        if header.magic.get() != MINIMED_MAGIC {
            return Err(PumpError::InvalidMessage("Unexpected MiniMed packet header".to_string()));
        }

        let total = ENVELOPE_SIZE + header.payload_len.get() as usize;
        if bytes.len() < total {
            return Err(PumpError::InvalidMessage(format!(
                "Minimed envelope declares {} bytes, got {}",
                total,
                bytes.len()
            )));
        }
        let mut covered = bytes[..total].to_vec();
        covered[CHECKSUM_OFFSET] = 0;
        verify_sum8(&covered, header.checksum)?;

        Ok(Self { bytes, header })
    }

    pub fn command(&self) -> EnvelopeCommand {
        EnvelopeCommand::from(self.header.command)
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence.get()
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// Payload bytes following the header.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[ENVELOPE_SIZE..ENVELOPE_SIZE + self.header.payload_len.get() as usize]
    }

    /// The whole received buffer, header included.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }
}

/// The bridge's answer to READ_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadInfo {
    pub link_mac: Mac,
    pub pump_mac: Mac,
    pub link_counter: u16,
    pub encryption_mode: u8,
}

impl ReadInfo {
    pub fn parse(response: &MinimedResponse) -> Result<Self, PumpError> {
        let payload = response.payload();
        if payload.len() < 0x13 {
            return Err(PumpError::InvalidMessage(format!(
                "READ_INFO payload too short: {} bytes",
                payload.len()
            )));
        }
        let mac = |at: usize| {
            Mac::from_be_slice(&payload[at..])
                .ok_or_else(|| PumpError::InvalidMessage("truncated MAC".to_string()))
        };
        Ok(Self {
            link_mac: mac(0x00)?,
            pump_mac: mac(0x08)?,
            link_counter: u16::from_le_bytes([payload[0x10], payload[0x11]]),
            encryption_mode: payload[0x12] & 1,
        })
    }

    pub fn is_associated(&self) -> bool {
        !self.pump_mac.is_zero()
    }
}

/// The obfuscated link key carried by REQUEST_LINK_KEY_RESPONSE.
pub fn packed_link_key(response: &MinimedResponse) -> Result<&[u8], PumpError> {
    response
        .payload()
        .get(..PACKED_LINK_KEY_SIZE)
        .ok_or_else(|| PumpError::InvalidMessage("link key response too short".to_string()))
}
