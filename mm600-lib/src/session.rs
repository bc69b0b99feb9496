//! Per-upload session state shared by every protocol layer.

use crate::cipher::{self, LinkKey};
use regex::Regex;
use std::fmt;

pub const ENVELOPE_SEQUENCE_MODULUS: u32 = 255;
pub const NGP_SEQUENCE_MODULUS: u32 = 127;
pub const COMD_SEQUENCE_MODULUS: u32 = 127;

/// A counter that is always incremented before use and skips zero on wrap.
#[derive(Debug)]
pub struct SequenceCounter {
    current: u32,
    modulus: u32,
}

impl SequenceCounter {
    pub fn new(modulus: u32) -> Self {
        Self { current: 0, modulus }
    }

    /// Advance and return the value to put on the wire.
    pub fn next_value(&mut self) -> u32 {
        self.current += 1;
        if self.current >= self.modulus {
            self.current = 1;
        }
        self.current
    }

    /// Force the counter so the next value is `value + 1`.
    pub fn set(&mut self, value: u32) {
        self.current = value % self.modulus;
    }

    pub fn current(&self) -> u32 {
        self.current
    }
}

/// A 64-bit radio MAC address.
///
/// Printed as sixteen hex digits. The wire carries the same value in both byte
/// orders depending on the message, see [`Mac::to_be_bytes`] and
/// [`Mac::packed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mac(pub u64);

impl Mac {
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(arr)))
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Byte-reversed form used inside NGP payloads.
    pub fn packed(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Mutable state of one bridge/pump session.
///
/// Not `Clone`: there is exactly one session per connection and every message
/// built consumes its sequence numbers.
#[derive(Debug)]
pub struct PumpSession {
    pub envelope_sequence: SequenceCounter,
    pub ngp_sequence: SequenceCounter,
    pub comd_sequence: SequenceCounter,
    pub model_and_serial: String,
    pub bcnl_serial: String,
    pub radio_channel: u8,
    pub link_mac: Mac,
    pub pump_mac: Mac,
    key: Option<LinkKey>,
}

impl PumpSession {
    pub fn new(model_and_serial: &str) -> Self {
        let bcnl_serial = Regex::new(r"^\d+-")
            .map(|re| re.replace(model_and_serial, "").into_owned())
            .unwrap_or_else(|_| model_and_serial.to_string());
        Self {
            envelope_sequence: SequenceCounter::new(ENVELOPE_SEQUENCE_MODULUS),
            ngp_sequence: SequenceCounter::new(NGP_SEQUENCE_MODULUS),
            comd_sequence: SequenceCounter::new(COMD_SEQUENCE_MODULUS),
            model_and_serial: model_and_serial.to_string(),
            bcnl_serial,
            radio_channel: 0,
            link_mac: Mac::default(),
            pump_mac: Mac::default(),
            key: None,
        }
    }

    pub fn set_key(&mut self, key: LinkKey) {
        self.key = Some(key);
    }

    pub fn key(&self) -> Option<&LinkKey> {
        self.key.as_ref()
    }

    /// The current IV, which follows the radio channel.
    pub fn iv(&self) -> Option<LinkKey> {
        self.key.as_ref().map(|k| cipher::derive_iv(k, self.radio_channel))
    }

    pub fn is_associated(&self) -> bool {
        !self.pump_mac.is_zero()
    }

    pub fn hmac(&self) -> Vec<u8> {
        cipher::connection_hmac(&self.bcnl_serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_counter_cycles_without_zero() {
        let mut counter = SequenceCounter::new(ENVELOPE_SEQUENCE_MODULUS);
        let values: Vec<u32> = (0..255).map(|_| counter.next_value()).collect();
        assert_eq!(values[0], 1);
        assert_eq!(values[253], 254);
        assert_eq!(values[254], 1);
        assert!(values.iter().all(|v| (1..255).contains(v)));
    }

    #[test]
    fn ngp_and_comd_cycle_at_127() {
        for modulus in [NGP_SEQUENCE_MODULUS, COMD_SEQUENCE_MODULUS] {
            let mut counter = SequenceCounter::new(modulus);
            let values: Vec<u32> = (0..127).map(|_| counter.next_value()).collect();
            assert_eq!(values[125], 126);
            assert_eq!(values[126], 1);
            assert!(!values.contains(&0));
        }
    }

    #[test]
    fn set_pins_the_next_value() {
        let mut counter = SequenceCounter::new(NGP_SEQUENCE_MODULUS);
        counter.set(1);
        assert_eq!(counter.next_value(), 2);
    }

    #[test]
    fn session_strips_model_prefix() {
        let session = PumpSession::new("6213-1033937");
        assert_eq!(session.bcnl_serial, "1033937");
        assert!(!session.is_associated());
        assert!(session.iv().is_none());
    }

    #[test]
    fn iv_follows_radio_channel() {
        let mut session = PumpSession::new("6213-1033937");
        session.set_key(*b"0123456789abcdef");
        session.radio_channel = 0x1A;
        assert_eq!(session.iv().unwrap()[0], 0x1A);
        session.radio_channel = 0x0E;
        assert_eq!(session.iv().unwrap()[0], 0x0E);
    }

    #[test]
    fn mac_byte_orders() {
        let mac = Mac::from_be_slice(&[0x00, 0x23, 0xf7, 0x45, 0x66, 0x67, 0x62, 0x43]).unwrap();
        assert_eq!(mac.to_string(), "0023f74566676243");
        assert_eq!(mac.packed()[0], 0x43);
        assert_eq!(mac.to_be_bytes()[1], 0x23);
    }
}
