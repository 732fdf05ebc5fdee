//! Packet ciphers.
//!
//! - `aes256-gcm@openssh.com`, `aes128-gcm@openssh.com` (RFC 5647 as profiled
//!   by OpenSSH): the packet length stays in clear and is authenticated as
//!   associated data; a 16 byte tag follows the ciphertext.
//! - `none`: no encryption, used before the first key exchange and after an
//!   explicit switch to the none cipher.

use fjord_platform::{FjordError, FjordResult};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use zeroize::Zeroize;

/// Packet cipher instance for one direction.
///
/// `packet` always starts with the 4 byte length field, which is left in
/// clear by every built-in cipher.
pub trait Cipher: Send {
    /// Negotiated name.
    fn name(&self) -> &'static str;

    /// Alignment the padded packet must satisfy.
    fn block_size(&self) -> usize;

    /// Authenticated ciphers make a separate MAC unnecessary.
    fn is_aead(&self) -> bool;

    /// Bytes appended after the ciphertext (AEAD tag).
    fn tag_len(&self) -> usize;

    /// Encrypts `packet[4..]` in place and appends the tag.
    fn encrypt(&mut self, packet: &mut Vec<u8>) -> FjordResult<()>;

    /// Verifies and decrypts `packet` (length field, ciphertext and tag) in place.
    fn decrypt(&mut self, packet: &mut [u8]) -> FjordResult<()>;
}

/// Built-in cipher catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-256-GCM
    Aes256Gcm,
    /// AES-128-GCM
    Aes128Gcm,
    /// No encryption
    None,
}

impl CipherAlgorithm {
    /// Default preference order. `none` is offered last so it is only ever
    /// chosen when both sides ask for it explicitly.
    pub const ALL: [CipherAlgorithm; 3] = [
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::None,
    ];

    /// Returns the algorithm name.
    pub fn name(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::None => "none",
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }

    /// Returns the key size in bytes.
    pub fn key_size(self) -> usize {
        match self {
            CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::None => 0,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(self) -> usize {
        match self {
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes128Gcm => 12,
            CipherAlgorithm::None => 0,
        }
    }

    /// Creates an instance from derived key material.
    pub fn create(self, key: &[u8], iv: &[u8]) -> FjordResult<Box<dyn Cipher>> {
        match self {
            CipherAlgorithm::None => Ok(Box::new(NoneCipher)),
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes128Gcm => {
                Ok(Box::new(GcmCipher::new(self, key, iv)?))
            }
        }
    }
}

/// Identity cipher.
#[derive(Debug, Default)]
pub struct NoneCipher;

impl Cipher for NoneCipher {
    fn name(&self) -> &'static str {
        "none"
    }

    fn block_size(&self) -> usize {
        8
    }

    fn is_aead(&self) -> bool {
        false
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn encrypt(&mut self, _packet: &mut Vec<u8>) -> FjordResult<()> {
        Ok(())
    }

    fn decrypt(&mut self, _packet: &mut [u8]) -> FjordResult<()> {
        Ok(())
    }
}

/// AES-GCM with the OpenSSH nonce layout: 4 fixed IV bytes followed by a
/// 64-bit invocation counter incremented once per packet.
struct GcmCipher {
    algorithm: CipherAlgorithm,
    key: LessSafeKey,
    iv: [u8; 12],
}

impl GcmCipher {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> FjordResult<Self> {
        if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
            return Err(FjordError::Security(format!(
                "Insufficient key material for {}",
                algorithm.name()
            )));
        }
        let ring_alg = match algorithm {
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            _ => &AES_256_GCM,
        };
        let unbound = UnboundKey::new(ring_alg, &key[..algorithm.key_size()])
            .map_err(|_| FjordError::Security("Invalid AES-GCM key".to_string()))?;
        let mut fixed = [0u8; 12];
        fixed.copy_from_slice(&iv[..12]);
        Ok(Self {
            algorithm,
            key: LessSafeKey::new(unbound),
            iv: fixed,
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let nonce = Nonce::assume_unique_for_key(self.iv);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.iv[4..]);
        let next = u64::from_be_bytes(counter).wrapping_add(1);
        self.iv[4..].copy_from_slice(&next.to_be_bytes());
        nonce
    }
}

impl Cipher for GcmCipher {
    fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    fn block_size(&self) -> usize {
        16
    }

    fn is_aead(&self) -> bool {
        true
    }

    fn tag_len(&self) -> usize {
        16
    }

    fn encrypt(&mut self, packet: &mut Vec<u8>) -> FjordResult<()> {
        if packet.len() < 4 {
            return Err(FjordError::Protocol("Packet shorter than length field".into()));
        }
        let nonce = self.next_nonce();
        let mut aad = [0u8; 4];
        aad.copy_from_slice(&packet[..4]);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(aad), &mut packet[4..])
            .map_err(|_| FjordError::Security("AES-GCM encryption failed".to_string()))?;
        packet.extend_from_slice(tag.as_ref());
        Ok(())
    }

    fn decrypt(&mut self, packet: &mut [u8]) -> FjordResult<()> {
        if packet.len() < 4 + 16 {
            return Err(FjordError::Protocol("Packet shorter than GCM tag".into()));
        }
        let nonce = self.next_nonce();
        let mut aad = [0u8; 4];
        aad.copy_from_slice(&packet[..4]);
        self.key
            .open_in_place(nonce, Aad::from(aad), &mut packet[4..])
            .map_err(|_| FjordError::Security("MAC error: AES-GCM tag mismatch".to_string()))?;
        Ok(())
    }
}

impl Drop for GcmCipher {
    fn drop(&mut self) {
        // ring wipes the expanded key itself
        self.iv.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_from_name() {
        assert_eq!(
            CipherAlgorithm::from_name("aes256-gcm@openssh.com"),
            Some(CipherAlgorithm::Aes256Gcm)
        );
        assert_eq!(CipherAlgorithm::from_name("none"), Some(CipherAlgorithm::None));
        assert_eq!(CipherAlgorithm::from_name("3des-cbc"), None);
    }

    #[test]
    fn test_gcm_seal_open() {
        let key = [7u8; 32];
        let iv = [1u8; 12];
        let mut enc = CipherAlgorithm::Aes256Gcm.create(&key, &iv).unwrap();
        let mut dec = CipherAlgorithm::Aes256Gcm.create(&key, &iv).unwrap();

        for round in 0..3u8 {
            let mut packet = vec![0, 0, 0, 16];
            packet.extend_from_slice(&[round; 16]);
            let plain = packet.clone();

            enc.encrypt(&mut packet).unwrap();
            assert_eq!(packet.len(), plain.len() + 16);
            assert_eq!(&packet[..4], &plain[..4]);
            assert_ne!(&packet[4..20], &plain[4..]);

            dec.decrypt(&mut packet).unwrap();
            assert_eq!(&packet[..20], &plain[..]);
        }
    }

    #[test]
    fn test_gcm_rejects_tampering() {
        let key = [9u8; 16];
        let iv = [2u8; 12];
        let mut enc = CipherAlgorithm::Aes128Gcm.create(&key, &iv).unwrap();
        let mut dec = CipherAlgorithm::Aes128Gcm.create(&key, &iv).unwrap();

        let mut packet = vec![0, 0, 0, 16];
        packet.extend_from_slice(&[0x55; 16]);
        enc.encrypt(&mut packet).unwrap();
        packet[6] ^= 1;
        assert!(matches!(dec.decrypt(&mut packet), Err(FjordError::Security(_))));
    }

    #[test]
    fn test_short_key_material() {
        assert!(CipherAlgorithm::Aes256Gcm.create(&[0; 8], &[0; 12]).is_err());
    }
}
