//! Key exchange driver.
//!
//! Runs KEXINIT negotiation, the negotiated exchange method and the NEWKEYS
//! switch for one session, for the first exchange and every rekey. The
//! exchange hash of the first run becomes the session id.

use super::transport::Transport;
use super::{KexState, Role};
use crate::ssh::algorithms::kex::derive_key;
use crate::ssh::algorithms::{
    CipherAlgorithm, CompressionAlgorithm, HostKey, KexAlgorithm, KexContext, KexOutput, KexStep,
    KeyExchange, MacAlgorithm,
};
use crate::ssh::buffer::SshReader;
use crate::ssh::config::{RoleConfig, SshConfig};
use crate::ssh::future::KexFuture;
use crate::ssh::message::MessageType;
use crate::ssh::packet::{build_keys, DirectionKeys, PacketDecoder};
use crate::ssh::proposal::{negotiate, KexInit, KexProposal, KexProposalOption, Negotiated};
use bytes::Bytes;
use fjord_platform::{FjordError, FjordResult};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, trace};

const NONE_CIPHER: &str = "none";

/// Key exchange state of one session.
pub(crate) struct KexMachine {
    role: Role,
    client_version: String,
    server_version: String,
    state: KexState,
    local_init: Option<Bytes>,
    peer_init: Option<Bytes>,
    peer_proposal: KexProposal,
    exchange: Option<Box<dyn KeyExchange>>,
    negotiated: Option<Negotiated>,
    incoming_keys: Option<DirectionKeys>,
    session_id: Option<Vec<u8>>,
    skip_guess: bool,
    waiters: Vec<KexFuture>,
    completed: u64,
    last_done: Instant,
}

impl KexMachine {
    pub(crate) fn new(role: Role, local_version: String) -> Self {
        let (client_version, server_version) = match role {
            Role::Client => (local_version, String::new()),
            Role::Server => (String::new(), local_version),
        };
        Self {
            role,
            client_version,
            server_version,
            state: KexState::Unknown,
            local_init: None,
            peer_init: None,
            peer_proposal: KexProposal::new(),
            exchange: None,
            negotiated: None,
            incoming_keys: None,
            session_id: None,
            skip_guess: false,
            waiters: Vec::new(),
            completed: 0,
            last_done: Instant::now(),
        }
    }

    /// Records the peer's identification line (without CR LF).
    pub(crate) fn set_peer_version(&mut self, line: &str) {
        match self.role {
            Role::Client => self.server_version = line.to_string(),
            Role::Server => self.client_version = line.to_string(),
        }
    }

    pub(crate) fn state(&self) -> KexState {
        self.state
    }

    pub(crate) fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    pub(crate) fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Number of finished exchanges.
    pub(crate) fn completed(&self) -> u64 {
        self.completed
    }

    /// True between our KEXINIT and the peer's NEWKEYS.
    pub(crate) fn is_running(&self) -> bool {
        !matches!(self.state, KexState::Unknown | KexState::Done)
    }

    /// Sends our KEXINIT unless one is already out for this exchange.
    pub(crate) fn start(&mut self, t: &mut Transport, config: &RoleConfig, none_cipher: bool) -> FjordResult<()> {
        if self.local_init.is_some() {
            return Ok(());
        }
        let mut proposal = config.proposal();
        if none_cipher {
            proposal.set(KexProposalOption::C2sEncryption, vec![NONE_CIPHER]);
            proposal.set(KexProposalOption::S2cEncryption, vec![NONE_CIPHER]);
        }
        let init = KexInit::new(proposal);
        let payload = init.to_payload();
        t.set_kex_in_flight(true);
        t.send(payload.clone())?;
        debug!("Sent KEXINIT ({} bytes)", payload.len());
        self.local_init = Some(payload);
        if !self.is_running() {
            self.state = KexState::Init;
        }
        Ok(())
    }

    /// Starts a rekey, or joins the one in progress.
    pub(crate) fn rekey(&mut self, t: &mut Transport, config: &RoleConfig, future: KexFuture) -> FjordResult<()> {
        self.waiters.push(future);
        if self.is_running() {
            return Ok(());
        }
        info!("Starting key re-exchange");
        self.start(t, config, false)
    }

    /// Re-exchanges keys with `none` as the only cipher.
    ///
    /// Fails without sending anything if channels are open, an exchange is
    /// running, or either side did not offer `none`.
    pub(crate) fn switch_to_none_cipher(
        &mut self,
        t: &mut Transport,
        config: &RoleConfig,
        open_channels: usize,
        future: KexFuture,
    ) -> FjordResult<()> {
        if let Err(e) = self.check_none_cipher(config.ssh(), open_channels) {
            future.set_value(Err(e));
            return Ok(());
        }
        info!("Switching to none cipher");
        self.waiters.push(future);
        self.start(t, config, true)
    }

    fn check_none_cipher(&self, ssh: &SshConfig, open_channels: usize) -> FjordResult<()> {
        if open_channels > 0 {
            return Err(FjordError::IllegalState(format!(
                "Cannot switch to none cipher with {} open channel(s)",
                open_channels
            )));
        }
        if self.is_running() {
            return Err(FjordError::IllegalState(
                "Cannot switch to none cipher while a key exchange is in progress".to_string(),
            ));
        }
        if !ssh.ciphers.iter().any(|c| c == NONE_CIPHER) {
            return Err(FjordError::IllegalState(
                "Local proposal does not offer the none cipher".to_string(),
            ));
        }
        let peer_offers = self
            .peer_proposal
            .contains(KexProposalOption::C2sEncryption, NONE_CIPHER)
            && self
                .peer_proposal
                .contains(KexProposalOption::S2cEncryption, NONE_CIPHER);
        if !peer_offers {
            return Err(FjordError::IllegalState(
                "Peer proposal does not offer the none cipher".to_string(),
            ));
        }
        Ok(())
    }

    /// Handles KEXINIT, a method message (30-49) or NEWKEYS.
    ///
    /// Returns true when this message completed an exchange.
    pub(crate) fn process(
        &mut self,
        t: &mut Transport,
        decoder: &mut PacketDecoder,
        config: &RoleConfig,
        peer_addr: Option<SocketAddr>,
        payload: Bytes,
    ) -> FjordResult<bool> {
        let opcode = payload.first().copied().unwrap_or(0);
        if opcode == MessageType::KexInit as u8 {
            self.handle_kexinit(t, config, payload)?;
            Ok(false)
        } else if opcode == MessageType::NewKeys as u8 {
            self.handle_newkeys(decoder)?;
            Ok(true)
        } else {
            self.handle_method(t, config, peer_addr, payload)?;
            Ok(false)
        }
    }

    fn handle_kexinit(&mut self, t: &mut Transport, config: &RoleConfig, payload: Bytes) -> FjordResult<()> {
        if !matches!(self.state, KexState::Unknown | KexState::Done | KexState::Init)
            || self.peer_init.is_some()
        {
            return Err(FjordError::Protocol(
                "Unexpected SSH_MSG_KEXINIT during key exchange".to_string(),
            ));
        }
        let peer = KexInit::from_payload(payload.clone())?;
        // peer initiated rekey
        self.start(t, config, false)?;
        let local_init = self.local_init.clone().unwrap_or_default();
        let local = KexInit::from_payload(local_init)?;

        let (client, server) = match self.role {
            Role::Client => (local.proposal(), peer.proposal()),
            Role::Server => (peer.proposal(), local.proposal()),
        };
        let negotiated = negotiate(client, server)?;
        debug!("Negotiated {}", negotiated);

        if peer.first_kex_packet_follows() {
            let guessed = |option| {
                peer.proposal().get(option).first().map(String::as_str)
                    == Some(negotiated.get(option))
            };
            self.skip_guess = !(guessed(KexProposalOption::Algorithms)
                && guessed(KexProposalOption::ServerKeys));
        }

        let kex_name = negotiated.get(KexProposalOption::Algorithms);
        let mut exchange = KexAlgorithm::from_name(kex_name)
            .ok_or_else(|| {
                FjordError::Protocol(format!("Unsupported key exchange algorithm: {}", kex_name))
            })?
            .create();

        if !self.peer_proposal.is_empty() {
            trace!("Dropping the peer proposal of the previous exchange");
            self.peer_proposal.clear();
        }
        self.peer_proposal.merge_from(peer.proposal());
        self.peer_init = Some(payload);
        self.state = KexState::Run;

        let first = {
            let host_key = self.host_key(config, &negotiated)?;
            let ctx = self.context(&negotiated, host_key.as_deref())?;
            exchange.start(&ctx)?
        };
        if let Some(first) = first {
            t.send(first)?;
        }
        self.exchange = Some(exchange);
        self.negotiated = Some(negotiated);
        Ok(())
    }

    fn handle_method(
        &mut self,
        t: &mut Transport,
        config: &RoleConfig,
        peer_addr: Option<SocketAddr>,
        payload: Bytes,
    ) -> FjordResult<()> {
        let opcode = payload.first().copied().unwrap_or(0);
        if self.skip_guess {
            trace!("Ignoring wrongly guessed {}", MessageType::describe(opcode));
            self.skip_guess = false;
            return Ok(());
        }
        let (Some(mut exchange), Some(negotiated)) = (self.exchange.take(), self.negotiated.clone())
        else {
            return Err(FjordError::Protocol(format!(
                "Unexpected {} outside key exchange",
                MessageType::describe(opcode)
            )));
        };
        let mut reader = SshReader::new(payload);
        reader.get_u8()?;
        let step = {
            let host_key = self.host_key(config, &negotiated)?;
            let ctx = self.context(&negotiated, host_key.as_deref())?;
            exchange.next(opcode, &mut reader, &ctx)?
        };
        match step {
            KexStep::Continue(reply) => {
                if let Some(reply) = reply {
                    t.send(reply)?;
                }
                self.exchange = Some(exchange);
                Ok(())
            }
            KexStep::Done { reply, output } => {
                if let Some(reply) = reply {
                    t.send(reply)?;
                }
                if let Some(client) = config.client() {
                    if !client
                        .server_key_verifier
                        .verify_server_key(peer_addr, &output.host_key_blob)
                    {
                        return Err(FjordError::Security(format!(
                            "Server host key {} not verifiable",
                            crate::ssh::algorithms::hostkey::fingerprint(&output.host_key_blob)
                        )));
                    }
                }
                self.send_newkeys(t, exchange.as_ref(), &negotiated, output)
            }
        }
    }

    fn send_newkeys(
        &mut self,
        t: &mut Transport,
        exchange: &dyn KeyExchange,
        negotiated: &Negotiated,
        output: KexOutput,
    ) -> FjordResult<()> {
        let session_id = self
            .session_id
            .get_or_insert_with(|| output.exchange_hash.clone())
            .clone();
        let derive = |letter: u8, len: usize| {
            derive_key(
                exchange,
                &output.shared_secret,
                &output.exchange_hash,
                &session_id,
                letter,
                len,
            )
        };
        let c2s = direction_keys(
            negotiated,
            [
                KexProposalOption::C2sEncryption,
                KexProposalOption::C2sMac,
                KexProposalOption::C2sCompression,
            ],
            [b'A', b'C', b'E'],
            &derive,
        )?;
        let s2c = direction_keys(
            negotiated,
            [
                KexProposalOption::S2cEncryption,
                KexProposalOption::S2cMac,
                KexProposalOption::S2cCompression,
            ],
            [b'B', b'D', b'F'],
            &derive,
        )?;
        let (outgoing, incoming) = match self.role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };

        t.send(Bytes::from_static(&[MessageType::NewKeys as u8]))?;
        t.activate_keys(outgoing)?;
        self.incoming_keys = Some(incoming);
        self.state = KexState::Keys;
        debug!("Sent NEWKEYS");
        Ok(())
    }

    fn handle_newkeys(&mut self, decoder: &mut PacketDecoder) -> FjordResult<()> {
        let Some(keys) = self.incoming_keys.take() else {
            return Err(FjordError::Protocol(
                "Unexpected SSH_MSG_NEWKEYS".to_string(),
            ));
        };
        decoder.set_keys(keys);
        self.state = KexState::Done;
        self.local_init = None;
        self.peer_init = None;
        self.completed += 1;
        self.last_done = Instant::now();
        info!(
            "Key exchange #{} complete: {}",
            self.completed,
            self.negotiated
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default()
        );
        for waiter in self.waiters.drain(..) {
            waiter.set_value(Ok(()));
        }
        Ok(())
    }

    /// True once the traffic or age of the current keys exceeds a limit.
    pub(crate) fn needs_rekey(&self, ssh: &SshConfig, t: &Transport, decoder: &PacketDecoder, now: Instant) -> bool {
        if self.state != KexState::Done {
            return false;
        }
        let tx = t.encoder().counters();
        let rx = decoder.counters();
        tx.bytes >= ssh.rekey_bytes_limit
            || rx.bytes >= ssh.rekey_bytes_limit
            || tx.packets >= ssh.rekey_packets_limit
            || rx.packets >= ssh.rekey_packets_limit
            || ssh
                .rekey_time_limit
                .map_or(false, |limit| now.duration_since(self.last_done) >= limit)
    }

    /// Fails every waiter; the session is going away.
    pub(crate) fn abort(&mut self, error: &FjordError) {
        for waiter in self.waiters.drain(..) {
            waiter.set_value(Err(error.clone()));
        }
    }

    fn host_key(&self, config: &RoleConfig, negotiated: &Negotiated) -> FjordResult<Option<std::sync::Arc<dyn HostKey>>> {
        let Some(server) = config.server() else {
            return Ok(None);
        };
        let algorithm = negotiated.get(KexProposalOption::ServerKeys);
        server
            .host_key(algorithm)
            .cloned()
            .map(Some)
            .ok_or_else(|| FjordError::Security(format!("No host key for {}", algorithm)))
    }

    fn context<'a>(
        &'a self,
        negotiated: &'a Negotiated,
        host_key: Option<&'a dyn HostKey>,
    ) -> FjordResult<KexContext<'a>> {
        let (Some(local), Some(peer)) = (self.local_init.as_deref(), self.peer_init.as_deref()) else {
            return Err(FjordError::Protocol(
                "Key exchange message before KEXINIT".to_string(),
            ));
        };
        let (client_kexinit, server_kexinit) = match self.role {
            Role::Client => (local, peer),
            Role::Server => (peer, local),
        };
        Ok(KexContext {
            is_client: self.role == Role::Client,
            client_version: &self.client_version,
            server_version: &self.server_version,
            client_kexinit,
            server_kexinit,
            host_key_algorithm: negotiated.get(KexProposalOption::ServerKeys),
            host_key,
        })
    }
}

fn direction_keys<F>(
    negotiated: &Negotiated,
    [cipher, mac, compression]: [KexProposalOption; 3],
    [iv_letter, key_letter, mac_letter]: [u8; 3],
    derive: &F,
) -> FjordResult<DirectionKeys>
where
    F: Fn(u8, usize) -> zeroize::Zeroizing<Vec<u8>>,
{
    let lookup = |option: KexProposalOption| negotiated.get(option).to_string();
    let cipher_name = lookup(cipher);
    let cipher = CipherAlgorithm::from_name(&cipher_name)
        .ok_or_else(|| FjordError::Protocol(format!("Unsupported cipher: {}", cipher_name)))?;
    let mac_name = lookup(mac);
    let mac = MacAlgorithm::from_name(&mac_name)
        .ok_or_else(|| FjordError::Protocol(format!("Unsupported MAC: {}", mac_name)))?;
    let compression_name = lookup(compression);
    let compression = CompressionAlgorithm::from_name(&compression_name).ok_or_else(|| {
        FjordError::Protocol(format!("Unsupported compression: {}", compression_name))
    })?;

    let iv = derive(iv_letter, cipher.iv_size());
    let key = derive(key_letter, cipher.key_size());
    let mac_key = derive(mac_letter, mac.key_size());
    build_keys(cipher, &key, &iv, mac.create(&mac_key)?, compression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithms::Ed25519HostKey;
    use crate::ssh::config::{AcceptAllServerKeys, ClientConfig, ServerConfig};
    use crate::ssh::io::IoWriter;
    use std::sync::Arc;

    fn client_config(ssh: SshConfig) -> RoleConfig {
        RoleConfig::Client(Arc::new(
            ClientConfig::new(Arc::new(AcceptAllServerKeys)).with_ssh(ssh),
        ))
    }

    fn server_config(ssh: SshConfig) -> RoleConfig {
        RoleConfig::Server(Arc::new(
            ServerConfig::new(Arc::new(Ed25519HostKey::generate())).with_ssh(ssh),
        ))
    }

    fn transport() -> Transport {
        Transport::new(IoWriter::spawn(tokio::io::sink()))
    }

    #[tokio::test]
    async fn test_none_cipher_refused_with_open_channels() {
        let config = client_config(SshConfig::default().with_none_cipher_allowed());
        let mut t = transport();
        let mut kex = KexMachine::new(Role::Client, "SSH-2.0-test".to_string());
        let future = KexFuture::new("switch");
        kex.switch_to_none_cipher(&mut t, &config, 1, future.clone())
            .unwrap();
        assert!(matches!(future.peek(), Some(Err(FjordError::IllegalState(_)))));
        assert_eq!(kex.state(), KexState::Unknown);
        assert!(!t.kex_in_flight());
        assert_eq!(t.encoder().sequence(), 0);
    }

    #[tokio::test]
    async fn test_none_cipher_requires_local_offer() {
        let config = client_config(SshConfig::default());
        let mut t = transport();
        let mut kex = KexMachine::new(Role::Client, "SSH-2.0-test".to_string());
        let future = KexFuture::new("switch");
        kex.switch_to_none_cipher(&mut t, &config, 0, future.clone())
            .unwrap();
        assert!(matches!(future.peek(), Some(Err(_))));
        assert_eq!(t.encoder().sequence(), 0);
    }

    #[tokio::test]
    async fn test_peer_kexinit_triggers_our_kexinit() {
        let config = server_config(SshConfig::default());
        let mut t = transport();
        let mut decoder = PacketDecoder::new();
        let mut kex = KexMachine::new(Role::Server, "SSH-2.0-server".to_string());
        kex.set_peer_version("SSH-2.0-client");

        let client = KexInit::new(SshConfig::default().proposal(None));
        let done = kex
            .process(&mut t, &mut decoder, &config, None, client.to_payload())
            .unwrap();
        assert!(!done);
        assert_eq!(kex.state(), KexState::Run);
        assert!(t.kex_in_flight());
        assert_eq!(t.encoder().sequence(), 1);
        assert_eq!(
            kex.negotiated().unwrap().get(KexProposalOption::Algorithms),
            "curve25519-sha256"
        );
    }

    #[tokio::test]
    async fn test_peer_proposal_follows_each_kexinit() {
        let config = server_config(SshConfig::default().with_none_cipher_allowed());
        let mut t = transport();
        let mut decoder = PacketDecoder::new();
        let mut kex = KexMachine::new(Role::Server, "SSH-2.0-server".to_string());
        kex.set_peer_version("SSH-2.0-client");

        let first = SshConfig::default().with_none_cipher_allowed().proposal(None);
        kex.process(&mut t, &mut decoder, &config, None, KexInit::new(first.clone()).to_payload())
            .unwrap();
        assert_eq!(kex.peer_proposal, first);
        assert!(kex
            .peer_proposal
            .contains(KexProposalOption::C2sEncryption, NONE_CIPHER));

        // pretend the exchange finished, then the client rekeys with fewer ciphers
        kex.state = KexState::Done;
        kex.local_init = None;
        kex.peer_init = None;
        kex.exchange = None;
        let second = SshConfig::default()
            .with_ciphers(vec!["aes128-gcm@openssh.com"])
            .proposal(None);
        kex.process(&mut t, &mut decoder, &config, None, KexInit::new(second.clone()).to_payload())
            .unwrap();
        assert_eq!(kex.peer_proposal, second);
        assert_eq!(
            kex.peer_proposal.get(KexProposalOption::C2sEncryption),
            ["aes128-gcm@openssh.com".to_string()]
        );
        assert_eq!(
            kex.negotiated().unwrap().get(KexProposalOption::C2sEncryption),
            "aes128-gcm@openssh.com"
        );
    }

    #[tokio::test]
    async fn test_unexpected_newkeys_is_protocol_error() {
        let config = server_config(SshConfig::default());
        let mut t = transport();
        let mut decoder = PacketDecoder::new();
        let mut kex = KexMachine::new(Role::Server, "SSH-2.0-server".to_string());
        let err = kex
            .process(
                &mut t,
                &mut decoder,
                &config,
                None,
                Bytes::from_static(&[MessageType::NewKeys as u8]),
            )
            .unwrap_err();
        assert!(matches!(err, FjordError::Protocol(_)));
    }
}
