//! Meshtastic channel decryption.
//!
//! Channel traffic is AES-128-CTR with a nonce built from the packet id and
//! the sender: bytes 0..8 are the packet id widened to 64 bits (LE), 8..12 the
//! sender node number (LE), 12..16 a zero block counter. The cipher carries no
//! authentication tag, so the only way to tell the right key is that the
//! plaintext parses as a `Data` message. Keys are tried in keyring order and
//! the first one that parses wins.

use aes::Aes128;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ctr::cipher::{KeyIvInit, StreamCipher};
use prost::Message;

use super::DecodedData;
use crate::protobuf::meshtastic_generated as proto;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Well-known channel keys: the default `AQ==` key and the single-byte
/// variants used by popular public channels.
pub const DEFAULT_CHANNEL_KEYS: &[&str] = &[
    "1PG7OiApB1nwvP+rz05pAQ==", // default (AQ==)
    "1PG7OiApB1nwvP+rz05pCQ==", // Ham
    "1PG7OiApB1nwvP+rz05pEQ==", // MeshQuake
    "1PG7OiApB1nwvP+rz05p5g==", // BayMeshNews
    "1PG7OiApB1nwvP+rz05pSA==", // SF
    "1PG7OiApB1nwvP+rz05pTQ==", // Test
    "1PG7OiApB1nwvP+rz05pNA==", // CRUZ
    "1PG7OiApB1nwvP+rz05pew==", // Boozin'
    "1PG7OiApB1nwvP+rz05p1A==", // First
    "1PG7OiApB1nwvP+rz05peQ==", // Retro
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is not valid base64")]
    Base64,
    #[error("key must be 16 bytes, got {0}")]
    Length(usize),
}

/// A 128-bit channel key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelKey([u8; 16]);

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only the discriminating last byte; the rest is the shared default prefix.
        write!(f, "ChannelKey(..{:02x})", self.0[15])
    }
}

impl ChannelKey {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let raw = STANDARD.decode(encoded.trim()).map_err(|_| KeyError::Base64)?;
        let bytes: [u8; 16] = raw
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Length(raw.len()))?;
        Ok(Self(bytes))
    }
}

/// Build the 16-byte initial counter block for a packet.
pub fn packet_nonce(packet_id: u32, from: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[0..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
    nonce[8..12].copy_from_slice(&from.to_le_bytes());
    // bytes 12..16: block counter, starts at zero
    nonce
}

/// XOR `buf` with the AES-CTR keystream. Encryption and decryption are the
/// same operation.
pub fn apply_keystream(key: &ChannelKey, nonce: &[u8; 16], buf: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(&key.0.into(), &(*nonce).into());
    cipher.apply_keystream(buf);
}

/// Try each key in order; return the first plaintext that parses as `Data`.
/// Keys after the first success are never pulled from the iterator.
pub fn decrypt<'a, I>(packet_id: u32, from: u32, encrypted: &[u8], keys: I) -> Option<DecodedData>
where
    I: IntoIterator<Item = &'a ChannelKey>,
{
    let nonce = packet_nonce(packet_id, from);
    keys.into_iter().find_map(|key| {
        let mut plain = encrypted.to_vec();
        apply_keystream(key, &nonce, &mut plain);
        proto::Data::decode(plain.as_slice()).ok().map(DecodedData::from)
    })
}

/// Ordered set of channel keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyring {
    keys: Vec<ChannelKey>,
}

impl Keyring {
    pub fn new(keys: Vec<ChannelKey>) -> Self {
        Self { keys }
    }

    pub fn from_base64<S: AsRef<str>>(encoded: &[S]) -> Result<Self, (usize, KeyError)> {
        let keys = encoded
            .iter()
            .enumerate()
            .map(|(i, k)| ChannelKey::from_base64(k.as_ref()).map_err(|e| (i, e)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn decrypt(&self, packet_id: u32, from: u32, encrypted: &[u8]) -> Option<DecodedData> {
        decrypt(packet_id, from, encrypted, &self.keys)
    }
}

impl Default for Keyring {
    fn default() -> Self {
        let keys = DEFAULT_CHANNEL_KEYS
            .iter()
            .filter_map(|k| ChannelKey::from_base64(k).ok())
            .collect();
        Self { keys }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::PortNum;
    use bytes::Bytes;

    fn key(last: u8) -> ChannelKey {
        let mut bytes = [
            0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e,
            0x69, 0x00,
        ];
        bytes[15] = last;
        ChannelKey::from_bytes(bytes)
    }

    fn sealed(packet_id: u32, from: u32, key: &ChannelKey, data: &proto::Data) -> Vec<u8> {
        let mut buf = data.encode_to_vec();
        apply_keystream(key, &packet_nonce(packet_id, from), &mut buf);
        buf
    }

    fn sample_data() -> proto::Data {
        proto::Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: Bytes::from_static(
                b"Checking in from the ridge, signal looks good tonight. Anyone on LongFast?",
            ),
            reply_id: 0x1234_5678,
            ..Default::default()
        }
    }

    #[test]
    fn nonce_layout() {
        let nonce = packet_nonce(0x0102_0304, 0xa1b2_c3d4);
        assert_eq!(&nonce[0..8], &[0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
        assert_eq!(&nonce[8..12], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(&nonce[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn default_keyring_loads_all_keys() {
        let ring = Keyring::default();
        assert_eq!(ring.len(), DEFAULT_CHANNEL_KEYS.len());
        assert_eq!(ChannelKey::from_base64("1PG7OiApB1nwvP+rz05pAQ==").unwrap(), key(0x01));
    }

    #[test]
    fn rejects_bad_keys() {
        assert_eq!(ChannelKey::from_base64("%%%"), Err(KeyError::Base64));
        assert_eq!(ChannelKey::from_base64("AQ=="), Err(KeyError::Length(1)));
        let err = Keyring::from_base64(&["1PG7OiApB1nwvP+rz05pAQ==", "AQ=="]).unwrap_err();
        assert_eq!(err, (1, KeyError::Length(1)));
    }

    #[test]
    fn finds_correct_key_and_stops() {
        let (packet_id, from) = (0x5eed_1234, 0x0badcafe);
        let right = key(0x48);
        let ring = [key(0x09), key(0x11), key(0xe6), right, key(0x4d), key(0x34)];
        let cipher = sealed(packet_id, from, &right, &sample_data());

        let mut consulted = 0usize;
        let decoded = decrypt(
            packet_id,
            from,
            &cipher,
            ring.iter().inspect(|_| consulted += 1),
        )
        .expect("decrypts with the fourth key");

        assert_eq!(consulted, 4);
        assert_eq!(decoded.port(), PortNum::TextMessageApp);
        assert_eq!(decoded.payload, sample_data().payload);
        assert_eq!(decoded.reply_id, Some(0x1234_5678));
    }

    #[test]
    fn wrong_nonce_inputs_do_not_yield_plaintext() {
        let right = key(0x01);
        let cipher = sealed(100, 200, &right, &sample_data());
        let ring = Keyring::new(vec![right]);
        let decoded = ring.decrypt(100, 200, &cipher).unwrap();
        assert_eq!(decoded.payload, sample_data().payload);

        // Same key, different sender: keystream differs, plaintext must not match.
        let other = ring.decrypt(100, 201, &cipher);
        assert!(other.map_or(true, |d| d.payload != sample_data().payload));
    }

    #[test]
    fn empty_keyring_fails() {
        let ring = Keyring::new(Vec::new());
        assert!(ring.is_empty());
        assert!(ring.decrypt(1, 2, &[0xde, 0xad]).is_none());
    }
}
