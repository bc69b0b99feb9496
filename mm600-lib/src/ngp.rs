//! NGP command frames and the encrypted ComD layer they carry.

use crate::checksum::{crc16, verify_crc16};
use crate::cipher::{self, LinkKey};
use crate::constants::{ComDCommand, EnvelopeCommand, NgpCommand};
use crate::envelope::{self, ENVELOPE_SIZE, MinimedResponse};
use crate::error::PumpError;
use crate::session::PumpSession;
use bytes::Bytes;

pub const NGP_HEADER_SIZE: usize = 2;
pub const CRC_SIZE: usize = 2;
pub const TRANSMIT_HEADER_SIZE: usize = 11;
pub const COMD_OVERHEAD: usize = 5;
pub const JOIN_PAYLOAD_SIZE: usize = 26;

const NGP_SIZE_OFFSET: usize = 0x22;
const COMD_LENGTH_OFFSET: usize = 0x38;
const COMD_DATA_OFFSET: usize = 0x39;
const HIGH_SPEED_SEQUENCE: u8 = 0x80;
const MODE_ENCRYPTED: u8 = 0x01;
const MODE_NORMAL_PRIORITY: u8 = 0x10;

/// `[command, 2 + len, payload.., CRC16 LE]`
pub fn build_frame(command: NgpCommand, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(NGP_HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.push(command.into());
    frame.push((NGP_HEADER_SIZE + payload.len()) as u8);
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// An NGP COMMAND_RESPONSE inside a RECEIVE_MESSAGE envelope.
#[derive(Debug, Clone)]
pub struct NgpResponse {
    envelope: MinimedResponse,
}

impl NgpResponse {
    pub fn parse(bytes: Bytes) -> Result<Self, PumpError> {
        let envelope = MinimedResponse::parse(bytes)?;
        let raw = envelope.as_bytes();
        if raw.get(ENVELOPE_SIZE) != Some(&u8::from(NgpCommand::CommandResponse)) {
            return Err(PumpError::InvalidMessage("Unexpected NGP packet header".to_string()));
        }
        let size = raw.get(NGP_SIZE_OFFSET).copied().unwrap_or(0) as usize;
        let frame = raw
            .get(ENVELOPE_SIZE..ENVELOPE_SIZE + size + CRC_SIZE)
            .ok_or_else(|| PumpError::InvalidMessage(format!("NGP frame of {} bytes is truncated", size)))?;
        let (body, crc) = frame.split_at(size);
        let expected = u16::from_le_bytes([crc[0], crc[1]]);
        verify_crc16(body, expected)?;
        Ok(Self { envelope })
    }

    pub fn size(&self) -> usize {
        self.bytes()[NGP_SIZE_OFFSET] as usize
    }

    /// Whole received buffer; NGP offsets are absolute within it.
    pub fn bytes(&self) -> &Bytes {
        self.envelope.as_bytes()
    }

    pub fn envelope(&self) -> &MinimedResponse {
        &self.envelope
    }

    /// Radio channel reported by a JOIN_NETWORK answer, zero if not joined.
    pub fn joined_channel(&self) -> u8 {
        let raw = self.bytes();
        if raw.len() > 0x4C && raw[0x33] == 0x82 && raw[0x44] == 0x42 {
            return raw[0x4C];
        }
        0
    }
}

/// JOIN_NETWORK payload. The NGP sequence on the wire stays 1 for this
/// message while the session counter still advances.
pub fn join_payload(session: &mut PumpSession) -> [u8; JOIN_PAYLOAD_SIZE] {
    session.ngp_sequence.next_value();
    let mut payload = [0u8; JOIN_PAYLOAD_SIZE];
    payload[0x00] = 1;
    payload[0x01] = session.radio_channel;
    payload[0x05] = 0x07;
    payload[0x06] = 0x07;
    payload[0x09] = 0x02;
    payload[0x0A..0x12].copy_from_slice(&session.link_mac.packed());
    payload[0x12..0x1A].copy_from_slice(&session.pump_mac.packed());
    payload
}

/// Plain ComD message: `[seq, command u16 BE, params.., CRC16 BE]`.
pub fn build_comd(sequence: u8, command: ComDCommand, params: &[u8]) -> Vec<u8> {
    let mut comd = Vec::with_capacity(COMD_OVERHEAD + params.len());
    comd.push(sequence);
    comd.extend_from_slice(&u16::from(command).to_be_bytes());
    comd.extend_from_slice(params);
    let crc = crc16(&comd);
    comd.extend_from_slice(&crc.to_be_bytes());
    comd
}

fn session_cipher(session: &PumpSession) -> Result<(LinkKey, LinkKey), PumpError> {
    match (session.key(), session.iv()) {
        (Some(key), Some(iv)) => Ok((*key, iv)),
        _ => Err(PumpError::InvalidState("No link key for this session".to_string())),
    }
}

/// TRANSMIT_PACKET payload carrying an encrypted ComD command.
pub fn transmit_payload(session: &mut PumpSession, command: ComDCommand, params: &[u8]) -> Result<Vec<u8>, PumpError> {
    let (key, iv) = session_cipher(session)?;

    let ngp_sequence = session.ngp_sequence.next_value() as u8;
    let (mode, comd_sequence) = if command == ComDCommand::HighSpeedMode {
        (MODE_ENCRYPTED, HIGH_SPEED_SEQUENCE)
    } else {
        (
            MODE_ENCRYPTED | MODE_NORMAL_PRIORITY,
            session.comd_sequence.next_value() as u8,
        )
    };

    let comd = build_comd(comd_sequence, command, params);
    let mut payload = Vec::with_capacity(TRANSMIT_HEADER_SIZE + comd.len());
    payload.extend_from_slice(&session.pump_mac.packed());
    payload.push(ngp_sequence);
    payload.push(mode);
    payload.push(comd.len() as u8);
    payload.extend_from_slice(&cipher::encrypt(&key, &iv, &comd));
    Ok(payload)
}

/// Unencrypted ComD message for the pump, as sent during pairing.
pub fn clear_transmit_payload(session: &mut PumpSession, comd: &[u8]) -> Vec<u8> {
    let ngp_sequence = session.ngp_sequence.next_value() as u8;
    let mut payload = Vec::with_capacity(TRANSMIT_HEADER_SIZE + comd.len());
    payload.extend_from_slice(&session.pump_mac.packed());
    payload.push(ngp_sequence);
    payload.push(MODE_NORMAL_PRIORITY);
    payload.push(comd.len() as u8);
    payload.extend_from_slice(comd);
    payload
}

/// The ComD bytes carried by `ngp`, still sealed if the link is encrypted.
fn comd_region(ngp: &NgpResponse) -> Result<&[u8], PumpError> {
    let raw = ngp.bytes();
    if ENVELOPE_SIZE + ngp.size() + CRC_SIZE < COMD_DATA_OFFSET {
        return Err(PumpError::InvalidMessage("Received invalid ComD message".to_string()));
    }
    let length = raw[COMD_LENGTH_OFFSET] as usize;
    let region = raw
        .get(COMD_DATA_OFFSET..COMD_DATA_OFFSET + length)
        .ok_or_else(|| PumpError::InvalidMessage("Received invalid ComD message".to_string()))?;
    if length < COMD_OVERHEAD {
        return Err(PumpError::InvalidMessage(format!("ComD message of {} bytes", length)));
    }
    Ok(region)
}

/// ComD bytes of a message the pump sent in the clear. The CRC is left for
/// [`ComDResponse::from_clear`] to check.
pub fn clear_comd(ngp: &NgpResponse) -> Result<Bytes, PumpError> {
    comd_region(ngp).map(Bytes::copy_from_slice)
}

/// A decrypted and CRC-checked ComD response.
#[derive(Debug, Clone)]
pub struct ComDResponse {
    clear: Bytes,
}

impl ComDResponse {
    pub fn parse(ngp: &NgpResponse, key: &LinkKey, iv: &LinkKey) -> Result<Self, PumpError> {
        let clear = cipher::decrypt(key, iv, comd_region(ngp)?);
        let (body, crc) = clear.split_at(clear.len() - CRC_SIZE);
        let expected = u16::from_be_bytes([crc[0], crc[1]]);
        let computed = crc16(body);
        if expected != computed {
            return Err(PumpError::Decryption { expected, computed });
        }
        Ok(Self {
            clear: Bytes::from(clear),
        })
    }

    pub fn for_session(ngp: &NgpResponse, session: &PumpSession) -> Result<Self, PumpError> {
        let (key, iv) = session_cipher(session)?;
        Self::parse(ngp, &key, &iv)
    }

    /// A ComD message that travelled unencrypted, as during pairing.
    pub fn from_clear(clear: Bytes) -> Result<Self, PumpError> {
        if clear.len() < COMD_OVERHEAD {
            return Err(PumpError::InvalidMessage(format!("ComD message of {} bytes", clear.len())));
        }
        let (body, crc) = clear.split_at(clear.len() - CRC_SIZE);
        verify_crc16(body, u16::from_be_bytes([crc[0], crc[1]]))?;
        Ok(Self { clear })
    }

    pub fn sequence(&self) -> u8 {
        self.clear[0]
    }

    pub fn command(&self) -> ComDCommand {
        ComDCommand::from(u16::from_be_bytes([self.clear[1], self.clear[2]]))
    }

    /// Decrypted bytes, sequence byte at 0 and CRC included.
    pub fn data(&self) -> &[u8] {
        &self.clear
    }

    pub fn len(&self) -> usize {
        self.clear.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clear.is_empty()
    }

    pub fn u8_at(&self, at: usize) -> Result<u8, PumpError> {
        self.clear.get(at).copied().ok_or_else(|| self.short(at, 1))
    }

    pub fn u16_at(&self, at: usize) -> Result<u16, PumpError> {
        Ok(u16::from_be_bytes(self.array_at(at)?))
    }

    pub fn u32_at(&self, at: usize) -> Result<u32, PumpError> {
        Ok(u32::from_be_bytes(self.array_at(at)?))
    }

    pub fn slice(&self, from: usize, to: usize) -> Result<&[u8], PumpError> {
        self.clear.get(from..to).ok_or_else(|| self.short(from, to.saturating_sub(from)))
    }

    fn array_at<const N: usize>(&self, at: usize) -> Result<[u8; N], PumpError> {
        Ok(self.slice(at, at + N)?.try_into()?)
    }

    fn short(&self, at: usize, width: usize) -> PumpError {
        PumpError::InvalidMessage(format!(
            "{} response of {} bytes has no field at {:#x}..{:#x}",
            self.command(),
            self.clear.len(),
            at,
            at + width
        ))
    }
}

/// Build a complete RECEIVE_MESSAGE envelope carrying `comd` encrypted with
/// `key`/`iv`, as the bridge would relay it from the pump.
pub fn encode_comd_response(envelope_sequence: u32, key: &LinkKey, iv: &LinkKey, comd: &[u8]) -> Vec<u8> {
    encode_clear_comd_response(envelope_sequence, &cipher::encrypt(key, iv, comd))
}

/// Same as [`encode_comd_response`] for a ComD message sent unencrypted.
pub fn encode_clear_comd_response(envelope_sequence: u32, comd: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; COMD_DATA_OFFSET - ENVELOPE_SIZE - NGP_HEADER_SIZE];
    body[COMD_LENGTH_OFFSET - ENVELOPE_SIZE - NGP_HEADER_SIZE] = comd.len() as u8;
    body.extend_from_slice(comd);
    receive_message(envelope_sequence, &body)
}

/// Build a RECEIVE_MESSAGE envelope whose NGP frame body is `body`.
pub fn receive_message(envelope_sequence: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![u8::from(NgpCommand::CommandResponse), (NGP_HEADER_SIZE + body.len()) as u8];
    frame.extend_from_slice(body);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    envelope::build(EnvelopeCommand::ReceiveMessage, envelope_sequence, &frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: LinkKey = *b"0123456789abcdef";

    fn session() -> PumpSession {
        let mut session = PumpSession::new("6213-1033937");
        session.set_key(KEY);
        session.radio_channel = 0x14;
        session.pump_mac = crate::session::Mac(0x0023F745_66676243);
        session
    }

    #[test]
    fn frame_layout() {
        let frame = build_frame(NgpCommand::TransmitPacket, &[1, 2, 3]);
        assert_eq!(&frame[..5], &[0x05, 0x05, 1, 2, 3]);
        let crc = crc16(&frame[..5]);
        assert_eq!(&frame[5..], &crc.to_le_bytes());
    }

    #[test]
    fn high_speed_mode_uses_fixed_sequence() {
        let mut session = session();
        let payload = transmit_payload(&mut session, ComDCommand::HighSpeedMode, &[0]).unwrap();
        assert_eq!(&payload[..8], &session.pump_mac.packed());
        assert_eq!(payload[8], 1);
        assert_eq!(payload[9], 0x01);
        assert_eq!(payload[10], 6);
        let clear = cipher::decrypt(&KEY, &session.iv().unwrap(), &payload[11..]);
        assert_eq!(clear[0], 0x80);
        assert_eq!(session.comd_sequence.current(), 0);

        let payload = transmit_payload(&mut session, ComDCommand::TimeRequest, &[]).unwrap();
        assert_eq!(payload[8], 2);
        assert_eq!(payload[9], 0x11);
        let clear = cipher::decrypt(&KEY, &session.iv().unwrap(), &payload[11..]);
        assert_eq!(&clear[..3], &[1, 0x04, 0x03]);
    }

    #[test]
    fn transmit_without_key_is_invalid_state() {
        let mut session = PumpSession::new("6213-1033937");
        assert!(matches!(
            transmit_payload(&mut session, ComDCommand::TimeRequest, &[]),
            Err(PumpError::InvalidState(_))
        ));
    }

    #[test]
    fn comd_response_round_trip() {
        let session = session();
        let iv = session.iv().unwrap();
        let comd = build_comd(5, ComDCommand::TimeResponse, &[1, 0x82, 0x2d, 0xfd, 0xd6, 0x9e, 0x02, 0x9f, 0x8e]);
        let raw = encode_comd_response(9, &KEY, &iv, &comd);
        let ngp = NgpResponse::parse(Bytes::from(raw)).unwrap();
        let response = ComDResponse::for_session(&ngp, &session).unwrap();
        assert_eq!(response.sequence(), 5);
        assert_eq!(response.command(), ComDCommand::TimeResponse);
        assert_eq!(response.u32_at(4).unwrap(), 0x822dfdd6);
        assert!(response.u32_at(12).is_err());
    }

    #[test]
    fn clear_comd_skips_decryption() {
        let comd = build_comd(3, ComDCommand::from(0x0207), &[]);
        let ngp = NgpResponse::parse(Bytes::from(encode_clear_comd_response(4, &comd))).unwrap();
        let clear = clear_comd(&ngp).unwrap();
        assert_eq!(&clear[..], &comd[..]);
        assert_eq!(ComDResponse::from_clear(clear).unwrap().sequence(), 3);

        let mut session = session();
        let payload = clear_transmit_payload(&mut session, &comd);
        assert_eq!(&payload[..8], &session.pump_mac.packed());
        assert_eq!(payload[8], 1);
        assert_eq!(payload[9], MODE_NORMAL_PRIORITY);
        assert_eq!(&payload[TRANSMIT_HEADER_SIZE..], &comd[..]);
    }

    #[test]
    fn wrong_key_is_decryption_error() {
        let session = session();
        let comd = build_comd(5, ComDCommand::TimeResponse, &[0; 9]);
        let raw = encode_comd_response(9, b"fedcba9876543210", &session.iv().unwrap(), &comd);
        let ngp = NgpResponse::parse(Bytes::from(raw)).unwrap();
        assert!(matches!(
            ComDResponse::for_session(&ngp, &session),
            Err(PumpError::Decryption { .. })
        ));
    }

    #[test]
    fn short_ngp_frame_is_invalid_comd() {
        let raw = receive_message(1, &[0u8; 4]);
        let ngp = NgpResponse::parse(Bytes::from(raw)).unwrap();
        assert!(matches!(
            ComDResponse::for_session(&ngp, &session()),
            Err(PumpError::InvalidMessage(_))
        ));
    }

    #[test]
    fn ngp_crc_is_checked() {
        let mut raw = receive_message(1, &[0u8; 30]);
        raw[40] ^= 0x10;
        // keep the envelope checksum valid so only the NGP CRC fails
        raw[32] = raw[32].wrapping_add(0x10);
        assert!(matches!(
            NgpResponse::parse(Bytes::from(raw)),
            Err(PumpError::Checksum { .. })
        ));
    }

    #[test]
    fn join_payload_pins_sequence() {
        let mut session = session();
        session.link_mac = crate::session::Mac(0x0102030405060708);
        let payload = join_payload(&mut session);
        assert_eq!(payload[0], 1);
        assert_eq!(payload[1], 0x14);
        assert_eq!(&payload[0x0A..0x12], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(session.ngp_sequence.current(), 1);
        let payload = join_payload(&mut session);
        assert_eq!(payload[0], 1);
        assert_eq!(session.ngp_sequence.current(), 2);
    }
}
