//! Link key obfuscation and the AES-128-CFB transport cipher.

use crate::error::PumpError;
use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

type Aes128CfbEnc = cfb_mode::Encryptor<aes::Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<aes::Aes128>;

pub const KEY_SIZE: usize = 16;
/// Smallest buffer that fits 16 key bytes at the widest stride.
pub const MIN_PACKED_LENGTH: usize = 55;

const HMAC_PADDING: &str = "A4BD6CED9A42602564F413123";

pub type LinkKey = [u8; KEY_SIZE];

/// The IV is the key with its first byte replaced by the radio channel.
pub fn derive_iv(key: &LinkKey, radio_channel: u8) -> LinkKey {
    let mut iv = *key;
    iv[0] = radio_channel;
    iv
}

pub fn encrypt(key: &LinkKey, iv: &LinkKey, clear: &[u8]) -> Vec<u8> {
    let mut buf = clear.to_vec();
    Aes128CfbEnc::new(key.into(), iv.into()).encrypt(&mut buf);
    buf
}

pub fn decrypt(key: &LinkKey, iv: &LinkKey, cipher: &[u8]) -> Vec<u8> {
    let mut buf = cipher.to_vec();
    Aes128CfbDec::new(key.into(), iv.into()).decrypt(&mut buf);
    buf
}

fn start_position(key: &[u8]) -> usize {
    key.last().map(|b| (b & 7) as usize).unwrap_or(0)
}

/// Recover the 16-byte link key from the bridge's obfuscated buffer.
///
/// `key` is the ASCII model/serial string of the bridge; its last byte picks
/// the start position. Each key byte is followed by a control byte whose bit 0
/// says the key byte is inverted and whose bit 1, when clear, says one filler
/// byte follows.
pub fn unpack_link_key(packed: &[u8], key: &[u8]) -> Result<LinkKey, PumpError> {
    let mut out = [0u8; KEY_SIZE];
    let mut pos = start_position(key);

    for slot in out.iter_mut() {
        let (value, control) = match (packed.get(pos), packed.get(pos + 1)) {
            (Some(v), Some(c)) => (*v, *c),
            _ => {
                return Err(PumpError::InvalidMessage(format!(
                    "packed link key truncated at byte {} of {}",
                    pos,
                    packed.len()
                )));
            }
        };
        *slot = if control & 1 == 1 { !value } else { value };
        pos += if (control >> 1) & 1 == 0 { 3 } else { 2 };
    }

    Ok(out)
}

/// Inverse of [`unpack_link_key`], filling unused bytes from `rng`.
pub fn pack_link_key_with<R: RngCore>(
    rng: &mut R,
    plaintext: &LinkKey,
    key: &[u8],
    length: usize,
) -> Result<Vec<u8>, PumpError> {
    if length < MIN_PACKED_LENGTH {
        return Err(PumpError::InvalidMessage(format!(
            "packed link key must be at least {} bytes, requested {}",
            MIN_PACKED_LENGTH, length
        )));
    }

    let mut packed = vec![0u8; length];
    rng.fill_bytes(&mut packed);

    let mut pos = start_position(key);
    for byte in plaintext {
        let control: u8 = rng.r#gen();
        packed[pos] = if control & 1 == 1 { !byte } else { *byte };
        packed[pos + 1] = control;
        pos += if (control >> 1) & 1 == 0 { 3 } else { 2 };
    }

    Ok(packed)
}

pub fn pack_link_key(plaintext: &LinkKey, key: &[u8], length: usize) -> Result<Vec<u8>, PumpError> {
    pack_link_key_with(&mut rand::thread_rng(), plaintext, key, length)
}

/// Authentication payload for opening and closing a connection: SHA-256 of the
/// bridge serial plus a fixed padding string, byte-reversed.
pub fn connection_hmac(bcnl_serial: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(bcnl_serial.as_bytes());
    hasher.update(HMAC_PADDING.as_bytes());
    let mut digest = hasher.finalize().to_vec();
    digest.reverse();
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const MODEL_SERIAL: &[u8] = b"6213-1234567";

    #[test]
    fn link_key_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x600);
        for _ in 0..200 {
            let mut plaintext = [0u8; KEY_SIZE];
            rng.fill_bytes(&mut plaintext);
            let packed = pack_link_key_with(&mut rng, &plaintext, MODEL_SERIAL, MIN_PACKED_LENGTH).unwrap();
            assert_eq!(packed.len(), MIN_PACKED_LENGTH);
            assert_eq!(unpack_link_key(&packed, MODEL_SERIAL).unwrap(), plaintext);
        }
    }

    #[test]
    fn start_position_uses_last_key_byte() {
        // '7' = 0x37, so the first key byte sits at position 7.
        let packed: Vec<u8> = (0..MIN_PACKED_LENGTH as u8).map(|i| i.wrapping_mul(2)).collect();
        let key = unpack_link_key(&packed, MODEL_SERIAL).unwrap();
        // control bytes are even: no inversion, three-byte stride
        assert_eq!(key[0], packed[7]);
        assert_eq!(key[1], packed[10]);
    }

    #[test]
    fn pack_rejects_short_buffer() {
        assert!(pack_link_key(&[0u8; KEY_SIZE], MODEL_SERIAL, 54).is_err());
    }

    #[test]
    fn unpack_rejects_truncated_buffer() {
        assert!(matches!(
            unpack_link_key(&[0u8; 20], MODEL_SERIAL),
            Err(PumpError::InvalidMessage(_))
        ));
    }

    #[test]
    fn cfb_round_trip_and_iv_depends_on_channel() {
        let key: LinkKey = *b"0123456789abcdef";
        let clear = b"comd payload of odd length".to_vec();
        let iv14 = derive_iv(&key, 0x14);
        let iv11 = derive_iv(&key, 0x11);
        assert_eq!(iv14[0], 0x14);
        assert_eq!(&iv14[1..], &key[1..]);

        let sealed = encrypt(&key, &iv14, &clear);
        assert_eq!(sealed.len(), clear.len());
        assert_ne!(sealed, clear);
        assert_eq!(decrypt(&key, &iv14, &sealed), clear);
        assert_ne!(encrypt(&key, &iv11, &clear), sealed);
    }

    #[test]
    fn hmac_is_reversed_digest() {
        let hmac = connection_hmac("1234567");
        let mut forward = Sha256::digest(b"1234567A4BD6CED9A42602564F413123").to_vec();
        forward.reverse();
        assert_eq!(hmac, forward);
        assert_eq!(hmac.len(), 32);
    }
}
