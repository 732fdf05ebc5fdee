//! Algorithm catalogs consumed by the transport.
//!
//! Each family (key exchange, host key, cipher, MAC, compression) is a fixed
//! enum of built-in variants. Negotiation works on the name strings exchanged
//! in `SSH_MSG_KEXINIT`; the winning name is resolved with `from_name` and an
//! instance is created from the derived key material. Instances are used
//! through the traits below so the packet codec never depends on a concrete
//! primitive.

pub mod cipher;
pub mod compression;
pub mod hostkey;
pub mod kex;
pub mod mac;

pub use cipher::{Cipher, CipherAlgorithm};
pub use compression::{Compression, CompressionAlgorithm};
pub use hostkey::{verify_signature, Ed25519HostKey, HostKey, HostKeyAlgorithm};
pub use kex::{KexAlgorithm, KexContext, KexOutput, KexStep, KeyExchange};
pub use mac::{Mac, MacAlgorithm};

/// Names of the built-in algorithms of one family in preference order.
pub(crate) fn names<T: Copy>(all: &[T], name: impl Fn(T) -> &'static str) -> Vec<String> {
    all.iter().map(|a| name(*a).to_string()).collect()
}
