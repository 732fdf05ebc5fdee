//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include `mac` or the length field itself
//! - `padding_length` is between 4 and 255
//! - `packet_length + 4` is a multiple of the cipher block size (8 at least).
//!   AEAD ciphers leave the length in clear, so for them only `packet_length`
//!   is aligned.
//! - Packets larger than [`MAX_PACKET_LEN`] are rejected before any buffering
//!
//! # Example
//!
//! ```rust
//! use bytes::{Bytes, BytesMut};
//! use fjord_proto::ssh::packet::{PacketDecoder, PacketEncoder};
//!
//! let mut encoder = PacketEncoder::new();
//! let mut decoder = PacketDecoder::new();
//!
//! let wire = encoder.encode(Bytes::from_static(&[2, 0, 0, 0, 0])).unwrap();
//! let mut input = BytesMut::from(&wire[..]);
//! let payload = decoder.decode(&mut input).unwrap().unwrap();
//! assert_eq!(&payload[..], &[2, 0, 0, 0, 0]);
//! ```

use crate::ssh::algorithms::{
    Cipher, CipherAlgorithm, Compression, CompressionAlgorithm, Mac,
};
use bytes::{Buf, Bytes, BytesMut};
use fjord_platform::{FjordError, FjordResult};
use rand::RngCore;

/// Largest accepted `packet_length + 4`.
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Smallest alignment regardless of cipher.
const MIN_BLOCK_SIZE: usize = 8;

/// Cipher, MAC and compression state for one direction.
pub struct DirectionKeys {
    cipher: Box<dyn Cipher>,
    mac: Option<Box<dyn Mac>>,
    compression: Box<dyn Compression>,
}

impl DirectionKeys {
    /// Cleartext state used before the first NEWKEYS.
    pub fn none() -> Self {
        Self {
            cipher: Box::new(crate::ssh::algorithms::cipher::NoneCipher),
            mac: None,
            compression: CompressionAlgorithm::None.create(),
        }
    }

    /// Combines negotiated instances.
    ///
    /// An AEAD cipher authenticates the packet itself, so any MAC passed
    /// alongside it is dropped.
    pub fn new(
        cipher: Box<dyn Cipher>,
        mac: Option<Box<dyn Mac>>,
        compression: Box<dyn Compression>,
    ) -> Self {
        let mac = if cipher.is_aead() { None } else { mac };
        Self {
            cipher,
            mac,
            compression,
        }
    }

    /// Name of the active cipher.
    pub fn cipher_name(&self) -> &'static str {
        self.cipher.name()
    }

    /// Name of the active MAC, `none` if there is none.
    pub fn mac_name(&self) -> &'static str {
        self.mac.as_ref().map(|m| m.name()).unwrap_or("none")
    }

    fn block_size(&self) -> usize {
        self.cipher.block_size().max(MIN_BLOCK_SIZE)
    }

    fn trailer_len(&self) -> usize {
        self.cipher.tag_len() + self.mac.as_ref().map(|m| m.mac_len()).unwrap_or(0)
    }
}

impl Default for DirectionKeys {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher.name())
            .field("mac", &self.mac_name())
            .field("compression", &self.compression.name())
            .finish()
    }
}

/// Bytes and packets processed since the keys were last replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    /// Wire bytes
    pub bytes: u64,
    /// Packets
    pub packets: u64,
}

impl TrafficCounters {
    fn record(&mut self, wire_len: usize) {
        self.bytes = self.bytes.saturating_add(wire_len as u64);
        self.packets = self.packets.saturating_add(1);
    }
}

/// Outbound half of the codec.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    keys: DirectionKeys,
    sequence: u32,
    counters: TrafficCounters,
}

impl PacketEncoder {
    /// Creates an encoder in cleartext mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the keys. The sequence number keeps running across rekeys.
    pub fn set_keys(&mut self, keys: DirectionKeys) {
        self.keys = keys;
        self.counters = TrafficCounters::default();
    }

    /// Active keys.
    pub fn keys(&self) -> &DirectionKeys {
        &self.keys
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Traffic since the last key change.
    pub fn counters(&self) -> TrafficCounters {
        self.counters
    }

    /// Frames a payload (opcode included) into wire bytes.
    pub fn encode(&mut self, payload: Bytes) -> FjordResult<Bytes> {
        let payload = self.keys.compression.compress(payload)?;
        let block = self.keys.block_size();
        let aead = self.keys.cipher.is_aead();

        let covered = if aead { 1 } else { 5 } + payload.len();
        let mut padding = block - covered % block;
        if padding < MIN_PADDING_LEN {
            padding += block;
        }
        let packet_length = 1 + payload.len() + padding;
        if packet_length + 4 > MAX_PACKET_LEN {
            return Err(FjordError::Protocol(format!(
                "Packet too large: {} bytes (max {})",
                packet_length + 4,
                MAX_PACKET_LEN
            )));
        }

        let mut packet = Vec::with_capacity(4 + packet_length + self.keys.trailer_len());
        packet.extend_from_slice(&(packet_length as u32).to_be_bytes());
        packet.push(padding as u8);
        packet.extend_from_slice(&payload);
        let start = packet.len();
        packet.resize(start + padding, 0);
        rand::thread_rng().fill_bytes(&mut packet[start..]);

        let tag = self
            .keys
            .mac
            .as_ref()
            .map(|mac| mac.sign(self.sequence, &packet));
        self.keys.cipher.encrypt(&mut packet)?;
        if let Some(tag) = tag {
            packet.extend_from_slice(&tag);
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.counters.record(packet.len());
        Ok(Bytes::from(packet))
    }
}

/// Inbound half of the codec.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    keys: DirectionKeys,
    sequence: u32,
    counters: TrafficCounters,
}

impl PacketDecoder {
    /// Creates a decoder in cleartext mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the keys. The sequence number keeps running across rekeys.
    pub fn set_keys(&mut self, keys: DirectionKeys) {
        self.keys = keys;
        self.counters = TrafficCounters::default();
    }

    /// Active keys.
    pub fn keys(&self) -> &DirectionKeys {
        &self.keys
    }

    /// Sequence number of the most recently decoded packet.
    pub fn last_sequence(&self) -> u32 {
        self.sequence.wrapping_sub(1)
    }

    /// Traffic since the last key change.
    pub fn counters(&self) -> TrafficCounters {
        self.counters
    }

    /// Extracts one payload from `input`.
    ///
    /// Returns `Ok(None)` and leaves `input` untouched while the packet is
    /// incomplete.
    pub fn decode(&mut self, input: &mut BytesMut) -> FjordResult<Option<Bytes>> {
        if input.len() < 4 {
            return Ok(None);
        }
        let packet_length = (&input[..4]).get_u32() as usize;
        if packet_length < 1 + MIN_PADDING_LEN || packet_length + 4 > MAX_PACKET_LEN {
            return Err(FjordError::Protocol(format!(
                "Invalid packet length: {}",
                packet_length
            )));
        }

        let tag_len = self.keys.cipher.tag_len();
        let mac_len = self.keys.mac.as_ref().map(|m| m.mac_len()).unwrap_or(0);
        let total = 4 + packet_length + tag_len + mac_len;
        if input.len() < total {
            return Ok(None);
        }

        let mut packet = input.split_to(total);
        let body_end = 4 + packet_length;
        self.keys.cipher.decrypt(&mut packet[..body_end + tag_len])?;
        if let Some(mac) = &self.keys.mac {
            mac.verify(
                self.sequence,
                &packet[..body_end],
                &packet[body_end + tag_len..],
            )?;
        }

        let block = self.keys.block_size();
        let aligned = if self.keys.cipher.is_aead() {
            packet_length
        } else {
            packet_length + 4
        };
        if aligned % block != 0 {
            return Err(FjordError::Protocol(format!(
                "Packet length {} not aligned to block size {}",
                packet_length, block
            )));
        }

        let padding = packet[4] as usize;
        if padding < MIN_PADDING_LEN || padding + 1 >= packet_length {
            return Err(FjordError::Protocol(format!(
                "Invalid padding length: {}",
                padding
            )));
        }

        let payload = packet.freeze().slice(5..body_end - padding);
        let payload = self.keys.compression.decompress(payload)?;

        self.sequence = self.sequence.wrapping_add(1);
        self.counters.record(total);
        Ok(Some(payload))
    }
}

/// Builds matching direction keys from derived key material.
pub fn build_keys(
    cipher: CipherAlgorithm,
    key: &[u8],
    iv: &[u8],
    mac: Option<Box<dyn Mac>>,
    compression: CompressionAlgorithm,
) -> FjordResult<DirectionKeys> {
    Ok(DirectionKeys::new(
        cipher.create(key, iv)?,
        mac,
        compression.create(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithms::MacAlgorithm;

    fn gcm_pair() -> (PacketEncoder, PacketDecoder) {
        let key = [9u8; 32];
        let iv = [4u8; 12];
        let mut enc = PacketEncoder::new();
        let mut dec = PacketDecoder::new();
        enc.set_keys(
            build_keys(CipherAlgorithm::Aes256Gcm, &key, &iv, None, CompressionAlgorithm::None)
                .unwrap(),
        );
        dec.set_keys(
            build_keys(CipherAlgorithm::Aes256Gcm, &key, &iv, None, CompressionAlgorithm::None)
                .unwrap(),
        );
        (enc, dec)
    }

    #[test]
    fn test_cleartext_alignment_and_padding() {
        let mut enc = PacketEncoder::new();
        for len in 1..40 {
            let wire = enc.encode(Bytes::from(vec![2u8; len])).unwrap();
            assert_eq!(wire.len() % 8, 0);
            let padding = wire[4] as usize;
            assert!((MIN_PADDING_LEN..MIN_PADDING_LEN + 8).contains(&padding));
        }
        assert_eq!(enc.sequence(), 39);
    }

    #[test]
    fn test_incomplete_input_is_kept() {
        let mut enc = PacketEncoder::new();
        let mut dec = PacketDecoder::new();
        let wire = enc.encode(Bytes::from_static(b"\x05hello")).unwrap();

        let mut input = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(dec.decode(&mut input).unwrap().is_none());
        assert_eq!(input.len(), wire.len() - 1);

        input.extend_from_slice(&wire[wire.len() - 1..]);
        let payload = dec.decode(&mut input).unwrap().unwrap();
        assert_eq!(&payload[..], b"\x05hello");
        assert!(input.is_empty());
        assert_eq!(dec.last_sequence(), 0);
    }

    #[test]
    fn test_gcm_stream_of_packets() {
        let (mut enc, mut dec) = gcm_pair();
        let mut input = BytesMut::new();
        for i in 0..5u8 {
            let wire = enc.encode(Bytes::from(vec![94, i, i, i])).unwrap();
            // length in clear, rest aligned to 16
            assert_eq!((wire.len() - 4 - 16) % 16, 0);
            input.extend_from_slice(&wire);
        }
        for i in 0..5u8 {
            let payload = dec.decode(&mut input).unwrap().unwrap();
            assert_eq!(&payload[..], &[94, i, i, i]);
        }
        assert_eq!(dec.counters().packets, 5);
        assert_eq!(dec.counters().bytes, enc.counters().bytes);
    }

    #[test]
    fn test_gcm_tampering_is_a_mac_error() {
        let (mut enc, mut dec) = gcm_pair();
        let wire = enc.encode(Bytes::from_static(b"\x5esecret")).unwrap();
        let mut bad = BytesMut::from(&wire[..]);
        bad[8] ^= 1;
        match dec.decode(&mut bad) {
            Err(FjordError::Security(msg)) => assert!(msg.contains("MAC")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_hmac_detects_corruption() {
        let key = [1u8; 32];
        let mut enc = PacketEncoder::new();
        let mut dec = PacketDecoder::new();
        enc.set_keys(DirectionKeys::new(
            CipherAlgorithm::None.create(&[], &[]).unwrap(),
            MacAlgorithm::HmacSha256.create(&key).unwrap(),
            CompressionAlgorithm::None.create(),
        ));
        dec.set_keys(DirectionKeys::new(
            CipherAlgorithm::None.create(&[], &[]).unwrap(),
            MacAlgorithm::HmacSha256.create(&key).unwrap(),
            CompressionAlgorithm::None.create(),
        ));

        let wire = enc.encode(Bytes::from_static(b"\x02ok")).unwrap();
        let mut good = BytesMut::from(&wire[..]);
        assert_eq!(&dec.decode(&mut good).unwrap().unwrap()[..], b"\x02ok");

        let wire = enc.encode(Bytes::from_static(b"\x02ok")).unwrap();
        let mut bad = BytesMut::from(&wire[..]);
        bad[6] ^= 0xff;
        assert!(dec.decode(&mut bad).is_err());
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut dec = PacketDecoder::new();
        let mut input = BytesMut::from(&[0x7f, 0xff, 0xff, 0xff, 0][..]);
        assert!(matches!(dec.decode(&mut input), Err(FjordError::Protocol(_))));

        let mut enc = PacketEncoder::new();
        assert!(enc.encode(Bytes::from(vec![0u8; MAX_PACKET_LEN])).is_err());
    }

    #[test]
    fn test_rejects_short_padding() {
        // packet_length 12, padding 2: aligned but padding too short
        let mut raw = vec![0, 0, 0, 12, 2];
        raw.extend_from_slice(&[2u8; 9]);
        raw.extend_from_slice(&[0u8; 2]);
        let mut input = BytesMut::from(&raw[..]);
        assert!(PacketDecoder::new().decode(&mut input).is_err());
    }
}
