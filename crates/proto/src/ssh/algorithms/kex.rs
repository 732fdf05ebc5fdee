//! Key exchange methods (RFC 4253 Section 8, RFC 8268, RFC 8731).
//!
//! A [`KeyExchange`] instance lives for exactly one exchange. The session
//! calls [`KeyExchange::start`] right after negotiation and then feeds it every
//! message in the 30-49 opcode range until it reports [`KexStep::Done`].
//!
//! Exchange hash:
//!
//! ```text
//! H = HASH(string V_C || string V_S || string I_C || string I_S ||
//!          string K_S || e/Q_C || f/Q_S || mpint K)
//! ```
//!
//! where the ephemeral public values are `mpint` for finite field groups and
//! `string` for Curve25519.

use crate::ssh::algorithms::hostkey::{verify_signature, HostKey};
use crate::ssh::buffer::{self, SshReader, SshWrite};
use crate::ssh::message::MessageType;
use bytes::{BufMut, Bytes};
use fjord_platform::{FjordError, FjordResult};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// 2048-bit MODP group prime (RFC 3526 group 14).
const GROUP14_PRIME_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22\
514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6\
F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E8603\
9B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
15728E5A8AACAA68FFFFFFFFFFFFFFFF";

static GROUP14_P: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(GROUP14_PRIME_HEX.as_bytes(), 16).unwrap_or_default());

static GROUP14_G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// Built-in key exchange catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// curve25519-sha256 (RFC 8731)
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org (pre-standard alias)
    Curve25519Sha256Libssh,
    /// diffie-hellman-group14-sha256 (RFC 8268)
    DhGroup14Sha256,
}

impl KexAlgorithm {
    /// Default preference order.
    pub const ALL: [KexAlgorithm; 3] = [
        KexAlgorithm::Curve25519Sha256,
        KexAlgorithm::Curve25519Sha256Libssh,
        KexAlgorithm::DhGroup14Sha256,
    ];

    /// Returns the algorithm name.
    pub fn name(self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 => "curve25519-sha256",
            KexAlgorithm::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexAlgorithm::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
        }
    }

    /// Parses key exchange algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }

    /// Creates a fresh exchange.
    pub fn create(self) -> Box<dyn KeyExchange> {
        Box::new(EphemeralExchange {
            algorithm: self,
            secret: Secret::Pending,
            public: Vec::new(),
        })
    }
}

/// Inputs an exchange needs from the session.
pub struct KexContext<'a> {
    /// True when the local side is the client
    pub is_client: bool,
    /// V_C without CR LF
    pub client_version: &'a str,
    /// V_S without CR LF
    pub server_version: &'a str,
    /// I_C, the client's KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// Negotiated host key algorithm
    pub host_key_algorithm: &'a str,
    /// Server side signing key
    pub host_key: Option<&'a dyn HostKey>,
}

/// Result of a finished exchange.
pub struct KexOutput {
    /// K as an unsigned big-endian magnitude
    pub shared_secret: Zeroizing<Vec<u8>>,
    /// H
    pub exchange_hash: Vec<u8>,
    /// K_S, the server's public host key blob
    pub host_key_blob: Vec<u8>,
}

impl std::fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutput")
            .field("exchange_hash", &hex::encode(&self.exchange_hash))
            .finish_non_exhaustive()
    }
}

/// Progress report from [`KeyExchange::next`].
#[derive(Debug)]
pub enum KexStep {
    /// More messages are expected; optionally send this payload first.
    Continue(Option<Bytes>),
    /// Exchange finished; send `reply` (if any) and then NEWKEYS.
    Done {
        /// Payload to send before NEWKEYS
        reply: Option<Bytes>,
        /// Derived values
        output: KexOutput,
    },
}

/// One run of a key exchange method.
pub trait KeyExchange: Send {
    /// Negotiated name.
    fn name(&self) -> &'static str;

    /// Called once after negotiation. The client returns its first message.
    fn start(&mut self, ctx: &KexContext<'_>) -> FjordResult<Option<Bytes>>;

    /// Handles one message from the 30-49 range.
    fn next(&mut self, opcode: u8, buf: &mut SshReader, ctx: &KexContext<'_>)
        -> FjordResult<KexStep>;

    /// The method's hash function, used for H and key derivation.
    fn hash(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }
}

enum Secret {
    Pending,
    X25519(EphemeralPrivateKey),
    Group14(Zeroizing<Vec<u8>>),
    Used,
}

struct EphemeralExchange {
    algorithm: KexAlgorithm,
    secret: Secret,
    public: Vec<u8>,
}

impl EphemeralExchange {
    fn is_curve(&self) -> bool {
        self.algorithm != KexAlgorithm::DhGroup14Sha256
    }

    fn generate(&mut self) -> FjordResult<()> {
        if self.is_curve() {
            let rng = SystemRandom::new();
            let private_key = EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| {
                FjordError::Security("Failed to generate Curve25519 key".to_string())
            })?;
            let public = private_key.compute_public_key().map_err(|_| {
                FjordError::Security("Failed to compute Curve25519 public key".to_string())
            })?;
            self.public = public.as_ref().to_vec();
            self.secret = Secret::X25519(private_key);
        } else {
            let mut rng = rand::thread_rng();
            let p_minus_one = &*GROUP14_P - 1u32;
            let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
            self.public = GROUP14_G.modpow(&x, &GROUP14_P).to_bytes_be();
            self.secret = Secret::Group14(Zeroizing::new(x.to_bytes_be()));
        }
        Ok(())
    }

    fn put_public(&self, buf: &mut impl BufMut, value: &[u8]) {
        if self.is_curve() {
            buf.put_ssh_string(value);
        } else {
            buf.put_mpint(value);
        }
    }

    fn read_public(&self, buf: &mut SshReader) -> FjordResult<Bytes> {
        if self.is_curve() {
            let q = buf.get_string()?;
            if q.len() != 32 {
                return Err(FjordError::Protocol(format!(
                    "Invalid Curve25519 public key length: {}",
                    q.len()
                )));
            }
            Ok(q)
        } else {
            buf.get_mpint()
        }
    }

    fn agree(&mut self, peer_public: &[u8]) -> FjordResult<Zeroizing<Vec<u8>>> {
        match std::mem::replace(&mut self.secret, Secret::Used) {
            Secret::X25519(private_key) => {
                let peer = UnparsedPublicKey::new(&X25519, peer_public);
                let k = agree_ephemeral(private_key, &peer, |material| material.to_vec())
                    .map_err(|_| {
                        FjordError::Security("Curve25519 key agreement failed".to_string())
                    })?;
                Ok(Zeroizing::new(k))
            }
            Secret::Group14(x) => {
                let y = BigUint::from_bytes_be(peer_public);
                let p_minus_one = &*GROUP14_P - 1u32;
                if y <= BigUint::from(1u32) || y >= p_minus_one {
                    return Err(FjordError::Protocol(
                        "Invalid DH public value: out of range".to_string(),
                    ));
                }
                let k = y.modpow(&BigUint::from_bytes_be(&x), &GROUP14_P);
                Ok(Zeroizing::new(k.to_bytes_be()))
            }
            Secret::Pending | Secret::Used => Err(FjordError::Protocol(
                "Key exchange message received out of order".to_string(),
            )),
        }
    }

    fn exchange_hash(
        &self,
        ctx: &KexContext<'_>,
        host_key_blob: &[u8],
        client_public: &[u8],
        server_public: &[u8],
        k: &[u8],
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(2048);
        data.put_utf8(ctx.client_version);
        data.put_utf8(ctx.server_version);
        data.put_ssh_string(ctx.client_kexinit);
        data.put_ssh_string(ctx.server_kexinit);
        data.put_ssh_string(host_key_blob);
        self.put_public(&mut data, client_public);
        self.put_public(&mut data, server_public);
        data.put_mpint(k);
        self.hash(&[&data])
    }
}

impl KeyExchange for EphemeralExchange {
    fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    fn start(&mut self, ctx: &KexContext<'_>) -> FjordResult<Option<Bytes>> {
        self.generate()?;
        if !ctx.is_client {
            return Ok(None);
        }
        let mut msg = buffer::payload(MessageType::KexdhInit as u8);
        self.put_public(&mut msg, &self.public);
        Ok(Some(msg.freeze()))
    }

    fn next(
        &mut self,
        opcode: u8,
        buf: &mut SshReader,
        ctx: &KexContext<'_>,
    ) -> FjordResult<KexStep> {
        match (ctx.is_client, MessageType::from_u8(opcode)) {
            (false, Some(MessageType::KexdhInit)) => {
                let host_key = ctx.host_key.ok_or_else(|| {
                    FjordError::Config("No host key available for key exchange".to_string())
                })?;
                let client_public = self.read_public(buf)?;
                let k = self.agree(&client_public)?;
                let host_key_blob = host_key.public_key_blob();
                let h = self.exchange_hash(ctx, &host_key_blob, &client_public, &self.public, &k);
                let signature = host_key.sign(&h)?;

                let mut reply = buffer::payload(MessageType::KexdhReply as u8);
                reply.put_ssh_string(&host_key_blob);
                self.put_public(&mut reply, &self.public);
                reply.put_ssh_string(&signature);

                Ok(KexStep::Done {
                    reply: Some(reply.freeze()),
                    output: KexOutput {
                        shared_secret: k,
                        exchange_hash: h,
                        host_key_blob,
                    },
                })
            }
            (true, Some(MessageType::KexdhReply)) => {
                let host_key_blob = buf.get_string()?.to_vec();
                let server_public = self.read_public(buf)?;
                let signature = buf.get_string()?;
                let k = self.agree(&server_public)?;
                let h = self.exchange_hash(ctx, &host_key_blob, &self.public, &server_public, &k);
                verify_signature(ctx.host_key_algorithm, &host_key_blob, &h, &signature)?;

                Ok(KexStep::Done {
                    reply: None,
                    output: KexOutput {
                        shared_secret: k,
                        exchange_hash: h,
                        host_key_blob,
                    },
                })
            }
            _ => Err(FjordError::Protocol(format!(
                "Unexpected {} during {}",
                MessageType::describe(opcode),
                self.algorithm.name()
            ))),
        }
    }
}

/// Derives key material (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// Kn = HASH(K || H || K1 || ... || K(n-1))
/// ```
pub fn derive_key(
    kex: &dyn KeyExchange,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    len: usize,
) -> Zeroizing<Vec<u8>> {
    let k = Zeroizing::new(buffer::encode_mpint(shared_secret));
    let mut key = Zeroizing::new(kex.hash(&[&k, exchange_hash, &[letter], session_id]));
    while key.len() < len {
        let block = kex.hash(&[&k, exchange_hash, &key]);
        key.extend_from_slice(&block);
    }
    key.truncate(len);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithms::hostkey::Ed25519HostKey;

    fn run_exchange(alg: KexAlgorithm) -> (KexOutput, KexOutput) {
        let host_key = Ed25519HostKey::generate();
        let client_ctx = KexContext {
            is_client: true,
            client_version: "SSH-2.0-client",
            server_version: "SSH-2.0-server",
            client_kexinit: b"ic",
            server_kexinit: b"is",
            host_key_algorithm: "ssh-ed25519",
            host_key: None,
        };
        let server_ctx = KexContext {
            is_client: false,
            host_key: Some(&host_key),
            ..client_ctx
        };

        let mut client = alg.create();
        let mut server = alg.create();
        let init = client.start(&client_ctx).unwrap().unwrap();
        assert!(server.start(&server_ctx).unwrap().is_none());

        let mut r = SshReader::new(init);
        let opcode = r.get_u8().unwrap();
        let (reply, server_out) = match server.next(opcode, &mut r, &server_ctx).unwrap() {
            KexStep::Done { reply, output } => (reply.unwrap(), output),
            other => panic!("unexpected {:?}", other),
        };

        let mut r = SshReader::new(reply);
        let opcode = r.get_u8().unwrap();
        let client_out = match client.next(opcode, &mut r, &client_ctx).unwrap() {
            KexStep::Done { output, .. } => output,
            other => panic!("unexpected {:?}", other),
        };
        (client_out, server_out)
    }

    #[test]
    fn test_curve25519_agreement() {
        let (c, s) = run_exchange(KexAlgorithm::Curve25519Sha256);
        assert_eq!(*c.shared_secret, *s.shared_secret);
        assert_eq!(c.exchange_hash, s.exchange_hash);
        assert_eq!(c.exchange_hash.len(), 32);
        assert_eq!(c.host_key_blob, s.host_key_blob);
    }

    #[test]
    fn test_group14_agreement() {
        let (c, s) = run_exchange(KexAlgorithm::DhGroup14Sha256);
        assert_eq!(*c.shared_secret, *s.shared_secret);
        assert_eq!(c.exchange_hash, s.exchange_hash);
    }

    #[test]
    fn test_unexpected_message() {
        let mut kex = KexAlgorithm::Curve25519Sha256.create();
        let ctx = KexContext {
            is_client: true,
            client_version: "a",
            server_version: "b",
            client_kexinit: b"",
            server_kexinit: b"",
            host_key_algorithm: "ssh-ed25519",
            host_key: None,
        };
        kex.start(&ctx).unwrap();
        let mut r = SshReader::new(Bytes::new());
        assert!(matches!(
            kex.next(30, &mut r, &ctx),
            Err(FjordError::Protocol(_))
        ));
    }

    #[test]
    fn test_derive_key_extends_with_all_previous_blocks() {
        let kex = KexAlgorithm::Curve25519Sha256.create();
        let k = [0x42u8; 32];
        let h = [0x01u8; 32];
        let sid = [0x02u8; 32];

        let short = derive_key(kex.as_ref(), &k, &h, &sid, b'C', 16);
        let long = derive_key(kex.as_ref(), &k, &h, &sid, b'C', 64);
        assert_eq!(short.len(), 16);
        assert_eq!(long.len(), 64);
        assert_eq!(&long[..16], &short[..]);

        let k_mpint = buffer::encode_mpint(&k);
        let k1 = kex.hash(&[&k_mpint, &h, b"C", &sid]);
        let k2 = kex.hash(&[&k_mpint, &h, &k1]);
        assert_eq!(&long[..32], &k1[..]);
        assert_eq!(&long[32..], &k2[..]);

        let other = derive_key(kex.as_ref(), &k, &h, &sid, b'D', 16);
        assert_ne!(&short[..], &other[..]);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            KexAlgorithm::from_name("diffie-hellman-group14-sha256"),
            Some(KexAlgorithm::DhGroup14Sha256)
        );
        assert_eq!(KexAlgorithm::from_name("diffie-hellman-group1-sha1"), None);
        assert!(GROUP14_P.bits() == 2048);
    }
}
