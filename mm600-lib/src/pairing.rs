//! Ad hoc pairing of a bridge with a pump it was never linked to.
//!
//! The pump drives the handshake and sends its messages in whatever order it
//! likes. [`PairingSession`] reacts to each one, returning the reply to send
//! (if any), and finishes once the pump signals the end of initialization.

use crate::cipher::{self, LinkKey};
use crate::commands::{DeviceCharacteristics, DeviceString};
use crate::constants::ComDCommand;
use crate::error::PumpError;
use crate::ngp::{ComDResponse, build_comd};
use crate::session::{COMD_SEQUENCE_MODULUS, Mac, PumpSession, SequenceCounter};
use crate::timestamp::NgpTimestamp;
use bytes::Bytes;
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;
use tracing::{debug, info};

/// Medtronic's IEEE OUI, the top 24 bits of every pump MAC.
pub const MEDTRONIC_OUI: u64 = 0x0023F7;

const BRIDGE_NAME: &str = "Contour Next Link 2.4";
const CHARACTERISTICS_LENGTH: usize = 0x36 - 3;
const DEVICE_STRING_LENGTH: usize = 0x5E - 3;
const MODEL_STRING_TYPE: u16 = 4;
const SERIAL_LENGTH: usize = 10;

/// Derive the pump's radio MAC from the serial printed on its back.
///
/// A serial such as `NG1234567H` holds three letters and a number. The letters
/// form a base-26 value and the number is kept to 24 bits:
/// `OUI << 40 | letters << 24 | number & 0xFFFFFF`.
pub fn pump_mac_from_serial(serial: &str) -> Result<Mac, PumpError> {
    let serial = serial.trim().to_ascii_uppercase();
    let letters: Vec<u8> = serial.bytes().filter(u8::is_ascii_alphabetic).collect();
    let digits: String = serial.chars().filter(char::is_ascii_digit).collect();
    if letters.len() != 3 || digits.is_empty() {
        return Err(PumpError::InvalidMessage(format!(
            "Pump serial {:?} should hold three letters and a number",
            serial
        )));
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| PumpError::InvalidMessage(format!("Pump serial {:?} has an oversized number", serial)))?;
    let triplet = letters.iter().fold(0u64, |acc, c| acc * 26 + (c - b'A') as u64);
    Ok(Mac(MEDTRONIC_OUI << 40 | triplet << 24 | (number & 0xFF_FFFF)))
}

/// ComD codes exchanged during pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, Display)]
#[repr(u16)]
pub enum HandshakeCommand {
    DeviceStringRequest = 0x013A,
    DeviceStringResponse = 0x013B,
    DeviceCharacteristicsRequest = 0x0200,
    DeviceCharacteristicsResponse = 0x0201,
    CompatibilityAck = 0x0202,
    LinkKey = 0x0203,
    LinkKeyAck = 0x0204,
    TimeSync = 0x0205,
    TimeSyncAck = 0x0206,
    EndOfInit = 0x0207,
    #[num_enum(catch_all)]
    Unknown(u16),
}

/// What the caller should do after handing a message to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingStep {
    /// Send this plain ComD message to the pump.
    Reply(Vec<u8>),
    /// Nothing to send, wait for the next message.
    Wait,
    /// The pump ended initialization; the link key is known.
    Finished,
}

/// State of one ad hoc pairing handshake.
#[derive(Debug)]
pub struct PairingSession {
    model_and_serial: String,
    bridge_serial: String,
    link_mac: Mac,
    pump_mac: Mac,
    last_sequence: Option<u8>,
    outgoing: SequenceCounter,
    link_key: Option<LinkKey>,
    pump: Option<DeviceCharacteristics>,
    pump_model: Option<String>,
    pump_time: Option<NgpTimestamp>,
    compatible: bool,
    finished: bool,
}

impl PairingSession {
    pub fn new(session: &PumpSession, pump_serial: &str) -> Result<Self, PumpError> {
        let pump_mac = pump_mac_from_serial(pump_serial)?;
        info!("Pairing with pump {} (MAC {})", pump_serial, pump_mac);
        Ok(Self {
            model_and_serial: session.model_and_serial.clone(),
            bridge_serial: session.bcnl_serial.clone(),
            link_mac: session.link_mac,
            pump_mac,
            last_sequence: None,
            outgoing: SequenceCounter::new(COMD_SEQUENCE_MODULUS),
            link_key: None,
            pump: None,
            pump_model: None,
            pump_time: None,
            compatible: false,
            finished: false,
        })
    }

    pub fn pump_mac(&self) -> Mac {
        self.pump_mac
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_compatible(&self) -> bool {
        self.compatible
    }

    pub fn link_key(&self) -> Option<&LinkKey> {
        self.link_key.as_ref()
    }

    pub fn pump_characteristics(&self) -> Option<&DeviceCharacteristics> {
        self.pump.as_ref()
    }

    pub fn pump_model(&self) -> Option<&str> {
        self.pump_model.as_deref()
    }

    pub fn pump_time(&self) -> Option<NgpTimestamp> {
        self.pump_time
    }

    /// React to one plain ComD message from the pump.
    pub fn handle(&mut self, message: Bytes) -> Result<PairingStep, PumpError> {
        let message = ComDResponse::from_clear(message)?;
        if self.finished {
            return Err(PumpError::Pairing("message received after end of initialization".to_string()));
        }

        let sequence = message.sequence();
        if let Some(last) = self.last_sequence.filter(|last| sequence <= *last) {
            return Err(PumpError::Pairing(format!(
                "handshake sequence {} does not follow {}",
                sequence, last
            )));
        }
        self.last_sequence = Some(sequence);

        let command = HandshakeCommand::from(u16::from(message.command()));
        debug!("Pairing message {} (seq {})", command, sequence);
        match command {
            HandshakeCommand::DeviceCharacteristicsRequest => {
                let requested = Mac::from_be_slice(message.slice(0x04, 0x0C)?).unwrap_or_default();
                if requested != self.link_mac {
                    return Err(PumpError::Pairing(format!(
                        "pump asked for {}, this bridge is {}",
                        requested, self.link_mac
                    )));
                }
                let params = self.characteristics();
                Ok(self.reply(HandshakeCommand::DeviceCharacteristicsResponse, &params))
            }
            HandshakeCommand::DeviceCharacteristicsResponse => {
                let pump = DeviceCharacteristics::parse(&message)?;
                if pump.mac != self.pump_mac {
                    return Err(PumpError::Pairing(format!(
                        "pump {} reports MAC {}, expected {}",
                        pump.serial, pump.mac, self.pump_mac
                    )));
                }
                self.pump = Some(pump);
                Ok(PairingStep::Wait)
            }
            HandshakeCommand::CompatibilityAck => {
                self.compatible = true;
                Ok(PairingStep::Wait)
            }
            HandshakeCommand::LinkKey => {
                let packed = message.slice(0x03, message.len() - 2)?;
                self.link_key = Some(cipher::unpack_link_key(packed, self.model_and_serial.as_bytes())?);
                info!("Received link key from pump");
                Ok(self.reply(HandshakeCommand::LinkKeyAck, &[]))
            }
            HandshakeCommand::TimeSync => {
                let time = NgpTimestamp::from_bytes(message.slice(0x03, 0x0B)?)?;
                debug!("Pump time {}", time);
                self.pump_time = Some(time);
                Ok(self.reply(HandshakeCommand::TimeSyncAck, &time.to_bytes()))
            }
            HandshakeCommand::DeviceStringRequest => {
                let params = self.device_string();
                Ok(self.reply(HandshakeCommand::DeviceStringResponse, &params))
            }
            HandshakeCommand::DeviceStringResponse => {
                self.pump_model = Some(DeviceString::parse(&message)?.value);
                Ok(PairingStep::Wait)
            }
            HandshakeCommand::EndOfInit => {
                if self.link_key.is_none() {
                    return Err(PumpError::Pairing("initialization ended without a link key".to_string()));
                }
                self.finished = true;
                info!("Pairing with {} finished", self.pump_mac);
                Ok(PairingStep::Finished)
            }
            HandshakeCommand::LinkKeyAck | HandshakeCommand::TimeSyncAck | HandshakeCommand::Unknown(_) => {
                debug!("Ignoring pairing message {}", command);
                Ok(PairingStep::Wait)
            }
        }
    }

    /// Store the pump MAC and link key in `session` once pairing is done.
    pub fn apply(&self, session: &mut PumpSession) -> Result<(), PumpError> {
        match (self.finished, self.link_key) {
            (true, Some(key)) => {
                session.pump_mac = self.pump_mac;
                session.set_key(key);
                Ok(())
            }
            _ => Err(PumpError::Pairing("pairing has not finished".to_string())),
        }
    }

    fn reply(&mut self, command: HandshakeCommand, params: &[u8]) -> PairingStep {
        let sequence = self.outgoing.next_value() as u8;
        PairingStep::Reply(build_comd(sequence, ComDCommand::from(u16::from(command)), params))
    }

    /// Our side of DEVICE_CHARACTERISTICS, in the layout the pump uses.
    fn characteristics(&self) -> Vec<u8> {
        let mut params = vec![0u8; CHARACTERISTICS_LENGTH];
        let serial = self.bridge_serial.as_bytes();
        let n = serial.len().min(SERIAL_LENGTH);
        params[..n].copy_from_slice(&serial[..n]);
        params[SERIAL_LENGTH..SERIAL_LENGTH + 8].copy_from_slice(&self.link_mac.to_be_bytes());
        params
    }

    fn device_string(&self) -> Vec<u8> {
        let mut params = vec![0u8; DEVICE_STRING_LENGTH];
        params[..8].copy_from_slice(&self.link_mac.to_be_bytes());
        params[8..10].copy_from_slice(&MODEL_STRING_TYPE.to_be_bytes());
        let text: Vec<u8> = BRIDGE_NAME.encode_utf16().flat_map(u16::to_be_bytes).collect();
        params[11..11 + text.len()].copy_from_slice(&text);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUMP_SERIAL: &str = "NG1234567H";
    const KEY: LinkKey = *b"fedcba9876543210";

    fn bridge() -> PumpSession {
        let mut session = PumpSession::new("6213-1234567");
        session.link_mac = Mac(0x0023_F745_EE0F_1B2C);
        session
    }

    fn pump_message(sequence: u8, command: HandshakeCommand, params: &[u8]) -> Bytes {
        Bytes::from(build_comd(sequence, ComDCommand::from(u16::from(command)), params))
    }

    fn characteristics_request(mac: Mac) -> Vec<u8> {
        let mut params = vec![0x02];
        params.extend_from_slice(&mac.to_be_bytes());
        params
    }

    #[test]
    fn pump_mac_packs_oui_letters_and_digits() {
        // N=13, G=6, H=7 -> 13*676 + 6*26 + 7 = 0x22F7; 1234567 = 0x12D687
        assert_eq!(pump_mac_from_serial(PUMP_SERIAL).unwrap(), Mac(0x0023_F722_F712_D687));
        assert_eq!(pump_mac_from_serial(" ng1234567h ").unwrap(), Mac(0x0023_F722_F712_D687));
    }

    #[test]
    fn serial_without_letter_triplet_is_rejected() {
        assert!(pump_mac_from_serial("1234567").is_err());
        assert!(pump_mac_from_serial("NGX").is_err());
    }

    #[test]
    fn handshake_in_pump_order_yields_link_key() {
        let mut session = bridge();
        let mut pairing = PairingSession::new(&session, PUMP_SERIAL).unwrap();

        let step = pairing
            .handle(pump_message(1, HandshakeCommand::DeviceCharacteristicsRequest, &characteristics_request(session.link_mac)))
            .unwrap();
        let reply = match step {
            PairingStep::Reply(reply) => reply,
            other => panic!("expected a reply, got {:?}", other),
        };
        let ours = DeviceCharacteristics::parse(&ComDResponse::from_clear(Bytes::from(reply)).unwrap()).unwrap();
        assert_eq!(ours.mac, session.link_mac);
        assert_eq!(ours.serial, "1234567\0\0\0");

        let mut theirs = vec![0u8; CHARACTERISTICS_LENGTH];
        theirs[..10].copy_from_slice(PUMP_SERIAL.as_bytes());
        theirs[10..18].copy_from_slice(&pairing.pump_mac().to_be_bytes());
        let step = pairing
            .handle(pump_message(2, HandshakeCommand::DeviceCharacteristicsResponse, &theirs))
            .unwrap();
        assert_eq!(step, PairingStep::Wait);
        assert_eq!(pairing.pump_characteristics().unwrap().serial, PUMP_SERIAL);

        pairing.handle(pump_message(3, HandshakeCommand::CompatibilityAck, &[0])).unwrap();
        assert!(pairing.is_compatible());

        let packed = cipher::pack_link_key(&KEY, session.model_and_serial.as_bytes(), 55).unwrap();
        let step = pairing.handle(pump_message(5, HandshakeCommand::LinkKey, &packed)).unwrap();
        assert!(matches!(step, PairingStep::Reply(_)));

        let time = NgpTimestamp::new(2184052182, -1665551906);
        pairing.handle(pump_message(6, HandshakeCommand::TimeSync, &time.to_bytes())).unwrap();
        assert_eq!(pairing.pump_time(), Some(time));

        assert!(matches!(
            pairing.handle(pump_message(7, HandshakeCommand::DeviceStringRequest, &[0x01])).unwrap(),
            PairingStep::Reply(_)
        ));
        assert_eq!(
            pairing.handle(pump_message(8, HandshakeCommand::EndOfInit, &[])).unwrap(),
            PairingStep::Finished
        );

        pairing.apply(&mut session).unwrap();
        assert_eq!(session.key(), Some(&KEY));
        assert_eq!(session.pump_mac, Mac(0x0023_F722_F712_D687));
    }

    #[test]
    fn repeated_sequence_is_fatal() {
        let mut pairing = PairingSession::new(&bridge(), PUMP_SERIAL).unwrap();
        pairing.handle(pump_message(4, HandshakeCommand::CompatibilityAck, &[0])).unwrap();
        let err = pairing
            .handle(pump_message(4, HandshakeCommand::CompatibilityAck, &[0]))
            .unwrap_err();
        assert!(matches!(err, PumpError::Pairing(_)));
        let err = pairing
            .handle(pump_message(2, HandshakeCommand::TimeSync, &[0; 8]))
            .unwrap_err();
        assert!(matches!(err, PumpError::Pairing(_)));
    }

    #[test]
    fn end_without_key_fails() {
        let mut session = bridge();
        let mut pairing = PairingSession::new(&session, PUMP_SERIAL).unwrap();
        let err = pairing.handle(pump_message(1, HandshakeCommand::EndOfInit, &[])).unwrap_err();
        assert!(matches!(err, PumpError::Pairing(_)));
        assert!(pairing.apply(&mut session).is_err());
    }

    #[test]
    fn characteristics_of_another_pump_are_rejected() {
        let mut pairing = PairingSession::new(&bridge(), PUMP_SERIAL).unwrap();
        let mut theirs = vec![0u8; CHARACTERISTICS_LENGTH];
        theirs[10..18].copy_from_slice(&pump_mac_from_serial("NG7654321H").unwrap().to_be_bytes());
        let err = pairing
            .handle(pump_message(1, HandshakeCommand::DeviceCharacteristicsResponse, &theirs))
            .unwrap_err();
        assert!(matches!(err, PumpError::Pairing(_)));
    }
}
