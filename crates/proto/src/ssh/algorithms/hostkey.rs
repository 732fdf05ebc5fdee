//! Host key signatures.
//!
//! Public key blob (RFC 8709):
//!
//! ```text
//! string  "ssh-ed25519"
//! string  key (32 bytes)
//! ```
//!
//! Signature blob:
//!
//! ```text
//! string  "ssh-ed25519"
//! string  signature (64 bytes)
//! ```

use crate::ssh::buffer::{SshReader, SshWrite};
use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use fjord_platform::{FjordError, FjordResult};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Host key algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
}

impl HostKeyAlgorithm {
    /// Default preference order.
    pub const ALL: [HostKeyAlgorithm; 1] = [HostKeyAlgorithm::SshEd25519];

    /// Get the algorithm name as specified in RFC 4253
    pub fn name(self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }
}

/// A private key able to produce SSH signatures.
///
/// Used for server host keys and for client public key authentication.
pub trait HostKey: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format
    fn public_key_blob(&self) -> Vec<u8>;

    /// Sign data and return the signature blob
    fn sign(&self, data: &[u8]) -> FjordResult<Vec<u8>>;

    /// `SHA256:` fingerprint of the public key blob.
    fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_blob())
    }
}

/// Computes the `SHA256:<hex>` fingerprint of a public key blob.
pub fn fingerprint(public_key_blob: &[u8]) -> String {
    format!("SHA256:{}", hex::encode(Sha256::digest(public_key_blob)))
}

/// Ed25519 key pair (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let secret_bytes: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(rand::Rng::gen(&mut csprng));
        Self {
            signing_key: SigningKey::from_bytes(&secret_bytes),
        }
    }

    /// Create from raw key bytes (32-byte secret key)
    pub fn from_bytes(secret_bytes: &[u8]) -> FjordResult<Self> {
        let key_bytes: [u8; SECRET_KEY_LENGTH] = secret_bytes.try_into().map_err(|_| {
            FjordError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        let key_bytes = Zeroizing::new(key_bytes);
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    /// Raw 32 byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(51);
        blob.put_utf8("ssh-ed25519");
        blob.put_ssh_string(&self.public_key_bytes());
        blob
    }

    fn sign(&self, data: &[u8]) -> FjordResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut blob = Vec::with_capacity(83);
        blob.put_utf8("ssh-ed25519");
        blob.put_ssh_string(&signature.to_bytes());
        Ok(blob)
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verifies a signature blob against a public key blob.
///
/// `algorithm` is the negotiated host key algorithm; both blobs must name it.
pub fn verify_signature(
    algorithm: &str,
    public_key_blob: &[u8],
    data: &[u8],
    signature_blob: &[u8],
) -> FjordResult<()> {
    let alg = HostKeyAlgorithm::from_name(algorithm).ok_or_else(|| {
        FjordError::Security(format!("Unsupported host key algorithm: {}", algorithm))
    })?;

    let mut key = SshReader::new(Bytes::copy_from_slice(public_key_blob));
    let key_alg = key.get_utf8()?;
    let mut sig = SshReader::new(Bytes::copy_from_slice(signature_blob));
    let sig_alg = sig.get_utf8()?;
    if key_alg != alg.name() || sig_alg != alg.name() {
        return Err(FjordError::Security(format!(
            "Host key algorithm mismatch: negotiated {}, key {}, signature {}",
            algorithm, key_alg, sig_alg
        )));
    }

    match alg {
        HostKeyAlgorithm::SshEd25519 => {
            let raw_key: [u8; 32] = key.get_string()?[..].try_into().map_err(|_| {
                FjordError::Security("Ed25519 public key must be 32 bytes".to_string())
            })?;
            let raw_sig: [u8; 64] = sig.get_string()?[..].try_into().map_err(|_| {
                FjordError::Security("Ed25519 signature must be 64 bytes".to_string())
            })?;
            let verifying_key = VerifyingKey::from_bytes(&raw_key)
                .map_err(|e| FjordError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
            verifying_key
                .verify(data, &Signature::from_bytes(&raw_sig))
                .map_err(|_| FjordError::Security("Host key signature invalid".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let key = Ed25519HostKey::generate();
        let blob = key.public_key_blob();
        let sig = key.sign(b"exchange hash").unwrap();

        verify_signature("ssh-ed25519", &blob, b"exchange hash", &sig).unwrap();
        assert!(verify_signature("ssh-ed25519", &blob, b"other data", &sig).is_err());
        assert!(verify_signature("ssh-rsa", &blob, b"exchange hash", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = Ed25519HostKey::generate();
        let b = Ed25519HostKey::generate();
        let sig = a.sign(b"data").unwrap();
        assert!(verify_signature("ssh-ed25519", &b.public_key_blob(), b"data", &sig).is_err());
    }

    #[test]
    fn test_from_bytes_is_deterministic() {
        let a = Ed25519HostKey::from_bytes(&[3u8; 32]).unwrap();
        let b = Ed25519HostKey::from_bytes(&[3u8; 32]).unwrap();
        assert_eq!(a.public_key_blob(), b.public_key_blob());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().starts_with("SHA256:"));
        assert!(Ed25519HostKey::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_blob_layout() {
        let key = Ed25519HostKey::generate();
        let blob = key.public_key_blob();
        assert_eq!(blob.len(), 4 + 11 + 4 + 32);
        assert_eq!(&blob[4..15], b"ssh-ed25519");
    }
}
