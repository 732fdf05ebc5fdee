//! Algorithm negotiation (RFC 4253 Section 7.1).
//!
//! A [`KexProposal`] is the ordered content of the ten name-lists of an
//! `SSH_MSG_KEXINIT`. [`KexInit`] adds the cookie and flags and handles the
//! wire encoding; the encoded payload is kept as the KEX seed (`I_C`/`I_S`)
//! because the exchange hash covers it byte for byte.
//!
//! Negotiation picks, per slot, the first name in the client's list that the
//! server also lists.
//!
//! ```rust
//! use fjord_proto::ssh::proposal::negotiate_algorithm;
//!
//! let client = vec!["curve25519-sha256".to_string(), "diffie-hellman-group14-sha256".to_string()];
//! let server = vec!["diffie-hellman-group14-sha256".to_string(), "diffie-hellman-group1-sha1".to_string()];
//! assert_eq!(
//!     negotiate_algorithm(&client, &server).as_deref(),
//!     Some("diffie-hellman-group14-sha256")
//! );
//! ```

use crate::ssh::buffer::{self, SshReader, SshWrite};
use crate::ssh::message::MessageType;
use bytes::{BufMut, Bytes};
use fjord_platform::{FjordError, FjordResult};
use rand::RngCore;
use std::fmt;

/// The ten negotiation slots in KEXINIT order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexProposalOption {
    /// kex_algorithms
    Algorithms,
    /// server_host_key_algorithms
    ServerKeys,
    /// encryption_algorithms_client_to_server
    C2sEncryption,
    /// encryption_algorithms_server_to_client
    S2cEncryption,
    /// mac_algorithms_client_to_server
    C2sMac,
    /// mac_algorithms_server_to_client
    S2cMac,
    /// compression_algorithms_client_to_server
    C2sCompression,
    /// compression_algorithms_server_to_client
    S2cCompression,
    /// languages_client_to_server
    C2sLanguage,
    /// languages_server_to_client
    S2cLanguage,
}

impl KexProposalOption {
    /// All slots in wire order.
    pub const ALL: [KexProposalOption; 10] = [
        KexProposalOption::Algorithms,
        KexProposalOption::ServerKeys,
        KexProposalOption::C2sEncryption,
        KexProposalOption::S2cEncryption,
        KexProposalOption::C2sMac,
        KexProposalOption::S2cMac,
        KexProposalOption::C2sCompression,
        KexProposalOption::S2cCompression,
        KexProposalOption::C2sLanguage,
        KexProposalOption::S2cLanguage,
    ];

    /// Position in the KEXINIT message.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Human readable slot name.
    pub fn description(self) -> &'static str {
        match self {
            KexProposalOption::Algorithms => "kex algorithms",
            KexProposalOption::ServerKeys => "server host key algorithms",
            KexProposalOption::C2sEncryption => "encryption algorithms (client to server)",
            KexProposalOption::S2cEncryption => "encryption algorithms (server to client)",
            KexProposalOption::C2sMac => "mac algorithms (client to server)",
            KexProposalOption::S2cMac => "mac algorithms (server to client)",
            KexProposalOption::C2sCompression => "compression algorithms (client to server)",
            KexProposalOption::S2cCompression => "compression algorithms (server to client)",
            KexProposalOption::C2sLanguage => "languages (client to server)",
            KexProposalOption::S2cLanguage => "languages (server to client)",
        }
    }

    /// Languages may legitimately fail to match; every other slot must.
    pub fn is_mandatory(self) -> bool {
        !matches!(
            self,
            KexProposalOption::C2sLanguage | KexProposalOption::S2cLanguage
        )
    }
}

impl fmt::Display for KexProposalOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Ordered algorithm preferences for all ten slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KexProposal {
    slots: [Vec<String>; 10],
}

impl KexProposal {
    /// Creates an empty proposal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preferences for a slot.
    pub fn get(&self, option: KexProposalOption) -> &[String] {
        &self.slots[option.index()]
    }

    /// Replaces the preferences for a slot.
    pub fn set<S: Into<String>>(&mut self, option: KexProposalOption, names: Vec<S>) {
        self.slots[option.index()] = names.into_iter().map(Into::into).collect();
    }

    /// Builder style [`KexProposal::set`].
    pub fn with<S: Into<String>>(mut self, option: KexProposalOption, names: Vec<S>) -> Self {
        self.set(option, names);
        self
    }

    /// True if `name` is listed in the slot.
    pub fn contains(&self, option: KexProposalOption, name: &str) -> bool {
        self.get(option).iter().any(|n| n == name)
    }

    /// True if no slot holds a value.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }

    /// Copies slots from `other` that are not already fixed here.
    pub fn merge_from(&mut self, other: &KexProposal) {
        for (mine, theirs) in self.slots.iter_mut().zip(other.slots.iter()) {
            if mine.is_empty() {
                mine.clone_from(theirs);
            }
        }
    }

    /// Drops every slot.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
    }
}

/// SSH_MSG_KEXINIT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    proposal: KexProposal,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a random cookie.
    pub fn new(proposal: KexProposal) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        Self {
            cookie,
            proposal,
            first_kex_packet_follows: false,
        }
    }

    /// The random cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// The proposed algorithms.
    pub fn proposal(&self) -> &KexProposal {
        &self.proposal
    }

    /// Whether a guessed KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Encodes the full payload, opcode included. This is the KEX seed.
    pub fn to_payload(&self) -> Bytes {
        let mut buf = buffer::payload(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        for option in KexProposalOption::ALL {
            buf.put_name_list(self.proposal.get(option));
        }
        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.freeze()
    }

    /// Decodes a payload, opcode included.
    pub fn from_payload(payload: Bytes) -> FjordResult<Self> {
        let mut r = SshReader::new(payload);
        let opcode = r.get_u8()?;
        if opcode != MessageType::KexInit as u8 {
            return Err(FjordError::Protocol(format!(
                "Expected SSH_MSG_KEXINIT, got {}",
                MessageType::describe(opcode)
            )));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&r.get_raw(16)?);

        let mut proposal = KexProposal::new();
        for option in KexProposalOption::ALL {
            proposal.set(option, r.get_name_list()?);
        }
        let first_kex_packet_follows = r.get_bool()?;
        // reserved, ignored
        let _ = r.get_u32()?;

        Ok(Self {
            cookie,
            proposal,
            first_kex_packet_follows,
        })
    }
}

/// Outcome of negotiation, one name per slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    values: [Option<String>; 10],
}

impl Negotiated {
    /// The agreed name for a slot; empty for unmatched optional slots.
    pub fn get(&self, option: KexProposalOption) -> &str {
        self.values[option.index()].as_deref().unwrap_or("")
    }
}

impl fmt::Display for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kex={} hostkey={} c2s={}/{}/{} s2c={}/{}/{}",
            self.get(KexProposalOption::Algorithms),
            self.get(KexProposalOption::ServerKeys),
            self.get(KexProposalOption::C2sEncryption),
            self.get(KexProposalOption::C2sMac),
            self.get(KexProposalOption::C2sCompression),
            self.get(KexProposalOption::S2cEncryption),
            self.get(KexProposalOption::S2cMac),
            self.get(KexProposalOption::S2cCompression),
        )
    }
}

/// First entry of `client_list` that also appears in `server_list`.
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> Option<String> {
    client_list
        .iter()
        .find(|name| server_list.contains(name))
        .cloned()
}

/// Negotiates all ten slots.
///
/// Fails with a protocol error naming the slot if a mandatory slot has no
/// common algorithm.
pub fn negotiate(client: &KexProposal, server: &KexProposal) -> FjordResult<Negotiated> {
    let mut result = Negotiated::default();
    for option in KexProposalOption::ALL {
        let agreed = negotiate_algorithm(client.get(option), server.get(option));
        if agreed.is_none() && option.is_mandatory() {
            return Err(FjordError::Protocol(format!(
                "No common algorithm for {}: client={:?}, server={:?}",
                option,
                client.get(option),
                server.get(option)
            )));
        }
        result.values[option.index()] = agreed;
    }
    Ok(result)
}
