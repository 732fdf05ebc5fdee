//! SSH authentication protocol (RFC 4252).
//!
//! The `ssh-userauth` service runs after the first key exchange. The server
//! side dispatches each request by method name to the configured
//! [`PasswordAuthenticator`] or [`PublicKeyAuthenticator`] and disconnects
//! once `max_auth_attempts` requests have failed. The client side sends one
//! request at a time and completes an [`AuthFuture`] with the outcome.
//!
//! Supported methods:
//! - "publickey" - Ed25519 signatures, with the "try" query answered by PK_OK
//! - "password" - plaintext password, compared by the authenticator
//! - "none" - answered with the list of usable methods, never counted
//!
//! # Example
//!
//! ```rust
//! use fjord_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new(
//!     "alice",
//!     "ssh-connection",
//!     AuthMethod::Password("secret".to_string().into()),
//! );
//! let decoded = AuthRequest::decode(request.encode()).unwrap();
//! assert_eq!(decoded.user_name(), "alice");
//! ```
//!
//! [`AuthFuture`]: crate::ssh::future::AuthFuture

use crate::ssh::algorithms::{verify_signature, HostKey};
use crate::ssh::buffer::{self, SshReader, SshWrite};
use crate::ssh::config::ServerConfig;
use crate::ssh::future::AuthFuture;
use crate::ssh::message::MessageType;
use crate::ssh::session::transport::Transport;
use bytes::{BufMut, Bytes, BytesMut};
use fjord_platform::{FjordError, FjordResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Name of the authentication service.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";
/// Name of the connection service started after authentication.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Query for usable methods.
    None,
    /// Password authentication.
    Password(Zeroizing<String>),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature; absent for the "try" query
        signature: Option<Vec<u8>>,
    },
    /// A method this implementation does not know.
    Other(String),
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::Other(name) => name,
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Encodes the payload, opcode included.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut buf = buffer::payload(MessageType::UserauthRequest as u8);
        buf.put_utf8(&self.user_name);
        buf.put_utf8(&self.service_name);
        buf.put_utf8(self.method.name());
        match &self.method {
            AuthMethod::None | AuthMethod::Other(_) => {}
            AuthMethod::Password(password) => {
                // not changing the password
                buf.put_bool(false);
                buf.put_utf8(password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                buf.put_bool(signature.is_some());
                buf.put_utf8(algorithm);
                buf.put_ssh_string(public_key);
                if let Some(sig) = signature {
                    buf.put_ssh_string(sig);
                }
            }
        }
        buf.freeze()
    }

    /// Decodes a payload, opcode included.
    ///
    /// Unknown methods decode to [`AuthMethod::Other`] so the server can
    /// answer them with a failure.
    pub fn decode(payload: Bytes) -> FjordResult<Self> {
        let mut r = SshReader::new(payload);
        let opcode = r.get_u8()?;
        if opcode != MessageType::UserauthRequest as u8 {
            return Err(FjordError::Protocol(format!(
                "Expected SSH_MSG_USERAUTH_REQUEST, got {}",
                MessageType::describe(opcode)
            )));
        }
        let user_name = r.get_utf8()?;
        let service_name = r.get_utf8()?;
        let method_name = r.get_utf8()?;
        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = r.get_bool()?;
                AuthMethod::Password(Zeroizing::new(r.get_utf8()?))
            }
            "publickey" => {
                let has_signature = r.get_bool()?;
                let algorithm = r.get_utf8()?;
                let public_key = r.get_string()?.to_vec();
                let signature = if has_signature {
                    Some(r.get_string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            _ => AuthMethod::Other(method_name),
        };
        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that can continue
    pub methods: Vec<String>,
    /// True if the request succeeded but more methods are required
    pub partial_success: bool,
}

impl AuthFailure {
    /// Encodes the payload, opcode included.
    pub fn encode(&self) -> Bytes {
        let mut buf = buffer::payload(MessageType::UserauthFailure as u8);
        buf.put_name_list(&self.methods);
        buf.put_bool(self.partial_success);
        buf.freeze()
    }

    /// Decodes a payload, opcode included.
    pub fn decode(payload: Bytes) -> FjordResult<Self> {
        let mut r = SshReader::new(payload);
        r.get_u8()?;
        Ok(Self {
            methods: r.get_name_list()?,
            partial_success: r.get_bool()?,
        })
    }
}

/// Data signed for public key authentication (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_ssh_string(session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    buf.put_utf8(user_name);
    buf.put_utf8(service_name);
    buf.put_utf8("publickey");
    buf.put_bool(true);
    buf.put_utf8(algorithm);
    buf.put_ssh_string(public_key_blob);
    buf.to_vec()
}

/// Compares two passwords in constant time.
///
/// ```rust
/// use fjord_proto::ssh::auth::constant_time_compare;
///
/// assert!(constant_time_compare("secret", "secret"));
/// assert!(!constant_time_compare("secret", "wrong"));
/// ```
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    // hash first so differing lengths take the same time
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());
    hash_a.ct_eq(&hash_b).into()
}

/// Verifies user passwords.
pub trait PasswordAuthenticator: Send + Sync {
    /// Returns true if `password` is valid for `user`.
    fn authenticate(&self, user: &str, password: &str) -> bool;
}

/// Decides which public keys may log in.
///
/// The signature is verified by the server itself; the authenticator only
/// decides whether the key is acceptable for the user.
pub trait PublicKeyAuthenticator: Send + Sync {
    /// Returns true if the key may authenticate `user`.
    fn authenticate(&self, user: &str, algorithm: &str, public_key_blob: &[u8]) -> bool;
}

/// Fixed user/password table.
#[derive(Default)]
pub struct StaticPasswordAuthenticator {
    users: HashMap<String, Zeroizing<String>>,
}

impl StaticPasswordAuthenticator {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user.
    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.users
            .insert(user.into(), Zeroizing::new(password.into()));
        self
    }
}

impl std::fmt::Debug for StaticPasswordAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPasswordAuthenticator")
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PasswordAuthenticator for StaticPasswordAuthenticator {
    fn authenticate(&self, user: &str, password: &str) -> bool {
        self.users
            .get(user)
            .map_or(false, |expected| constant_time_compare(expected, password))
    }
}

/// Fixed set of authorized public key blobs per user.
#[derive(Debug, Default, Clone)]
pub struct StaticPublicKeyAuthenticator {
    keys: HashMap<String, Vec<Vec<u8>>>,
}

impl StaticPublicKeyAuthenticator {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorizes a key for a user.
    pub fn with_key(mut self, user: impl Into<String>, public_key_blob: Vec<u8>) -> Self {
        self.keys.entry(user.into()).or_default().push(public_key_blob);
        self
    }
}

impl PublicKeyAuthenticator for StaticPublicKeyAuthenticator {
    fn authenticate(&self, user: &str, _algorithm: &str, public_key_blob: &[u8]) -> bool {
        self.keys
            .get(user)
            .map_or(false, |keys| keys.iter().any(|k| k.as_slice() == public_key_blob))
    }
}

/// A client authentication attempt.
pub(crate) enum ClientAuth {
    Password {
        user: String,
        password: Zeroizing<String>,
    },
    PublicKey {
        user: String,
        key: Arc<dyn HostKey>,
    },
}

impl ClientAuth {
    fn user(&self) -> &str {
        match self {
            ClientAuth::Password { user, .. } | ClientAuth::PublicKey { user, .. } => user,
        }
    }

    fn request(&self, session_id: &[u8]) -> FjordResult<AuthRequest> {
        let method = match self {
            ClientAuth::Password { password, .. } => AuthMethod::Password(password.clone()),
            ClientAuth::PublicKey { user, key } => {
                let algorithm = key.algorithm().name().to_string();
                let public_key = key.public_key_blob();
                let data =
                    signature_data(session_id, user, SERVICE_CONNECTION, &algorithm, &public_key);
                AuthMethod::PublicKey {
                    signature: Some(key.sign(&data)?),
                    algorithm,
                    public_key,
                }
            }
        };
        Ok(AuthRequest::new(self.user(), SERVICE_CONNECTION, method))
    }
}

/// Client side of `ssh-userauth`.
#[derive(Default)]
pub(crate) struct ClientAuthService {
    accepted: bool,
    queued: Option<(ClientAuth, AuthFuture)>,
    in_flight: Option<(String, AuthFuture)>,
}

impl ClientAuthService {
    /// The server accepted the service request.
    pub(crate) fn service_accepted(&mut self, t: &mut Transport, session_id: &[u8]) -> FjordResult<()> {
        self.accepted = true;
        if let Some((auth, future)) = self.queued.take() {
            self.send(t, session_id, auth, future)?;
        }
        Ok(())
    }

    /// Starts an attempt, or queues it until the service is accepted.
    pub(crate) fn authenticate(
        &mut self,
        t: &mut Transport,
        session_id: Option<&[u8]>,
        auth: ClientAuth,
        future: AuthFuture,
    ) -> FjordResult<()> {
        if self.in_flight.is_some() || self.queued.is_some() {
            future.set_value(Err(FjordError::IllegalState(
                "Authentication already in progress".to_string(),
            )));
            return Ok(());
        }
        match session_id {
            Some(id) if self.accepted => self.send(t, id, auth, future),
            _ => {
                self.queued = Some((auth, future));
                Ok(())
            }
        }
    }

    fn send(&mut self, t: &mut Transport, session_id: &[u8], auth: ClientAuth, future: AuthFuture) -> FjordResult<()> {
        let request = match auth.request(session_id) {
            Ok(request) => request,
            Err(e) => {
                future.set_value(Err(e));
                return Ok(());
            }
        };
        debug!(
            "Authenticating {} with {}",
            request.user_name(),
            request.method().name()
        );
        t.send(request.encode())?;
        self.in_flight = Some((request.user_name().to_string(), future));
        Ok(())
    }

    /// Handles a message from the 50-79 range. Returns the user once
    /// authentication succeeded.
    pub(crate) fn process(&mut self, payload: Bytes) -> FjordResult<Option<String>> {
        let opcode = payload.first().copied().unwrap_or(0);
        match MessageType::from_u8(opcode) {
            Some(MessageType::UserauthSuccess) => {
                let Some((user, future)) = self.in_flight.take() else {
                    return Err(FjordError::Protocol(
                        "Unexpected SSH_MSG_USERAUTH_SUCCESS".to_string(),
                    ));
                };
                info!("Authenticated as {}", user);
                future.set_value(Ok(()));
                Ok(Some(user))
            }
            Some(MessageType::UserauthFailure) => {
                let failure = AuthFailure::decode(payload)?;
                if let Some((user, future)) = self.in_flight.take() {
                    debug!("Authentication of {} failed", user);
                    future.set_value(Err(FjordError::Security(format!(
                        "Authentication rejected, methods that can continue: {}",
                        failure.methods.join(",")
                    ))));
                }
                Ok(None)
            }
            Some(MessageType::UserauthBanner) => {
                let mut r = SshReader::new(payload);
                r.get_u8()?;
                info!("Server banner: {}", r.get_utf8()?.trim_end());
                Ok(None)
            }
            _ => {
                debug!("Ignoring {}", MessageType::describe(opcode));
                Ok(None)
            }
        }
    }

    /// Fails pending attempts.
    pub(crate) fn abort(&mut self, error: &FjordError) {
        if let Some((_, future)) = self.queued.take() {
            future.set_value(Err(error.clone()));
        }
        if let Some((_, future)) = self.in_flight.take() {
            future.set_value(Err(error.clone()));
        }
    }
}

/// Server side of `ssh-userauth`.
#[derive(Debug, Default)]
pub(crate) struct ServerAuthService {
    failures: u32,
}

impl ServerAuthService {
    fn methods(config: &ServerConfig) -> Vec<String> {
        let mut methods = Vec::new();
        if config.publickey_authenticator.is_some() {
            methods.push("publickey".to_string());
        }
        if config.password_authenticator.is_some() {
            methods.push("password".to_string());
        }
        methods
    }

    /// Handles one request. Returns the user once authentication succeeded.
    pub(crate) fn process(
        &mut self,
        t: &mut Transport,
        config: &ServerConfig,
        session_id: &[u8],
        payload: Bytes,
    ) -> FjordResult<Option<String>> {
        let request = AuthRequest::decode(payload)?;
        let user = request.user_name();
        let accepted = match request.method() {
            AuthMethod::None => {
                // a query, not an attempt
                return self.reject(t, config, false).map(|_| None);
            }
            _ if request.service_name() != SERVICE_CONNECTION => {
                warn!("Authentication for unknown service '{}'", request.service_name());
                false
            }
            AuthMethod::Password(password) => config
                .password_authenticator
                .as_ref()
                .map_or(false, |a| a.authenticate(user, password)),
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                let acceptable = config
                    .publickey_authenticator
                    .as_ref()
                    .map_or(false, |a| a.authenticate(user, algorithm, public_key));
                match signature {
                    None if acceptable => {
                        let mut buf = buffer::payload(MessageType::UserauthPkOk as u8);
                        buf.put_utf8(algorithm);
                        buf.put_ssh_string(public_key);
                        t.send(buf.freeze())?;
                        return Ok(None);
                    }
                    None => false,
                    Some(signature) => {
                        let data = signature_data(
                            session_id,
                            user,
                            request.service_name(),
                            algorithm,
                            public_key,
                        );
                        acceptable
                            && verify_signature(algorithm, public_key, &data, signature).is_ok()
                    }
                }
            }
            AuthMethod::Other(name) => {
                debug!("Unsupported authentication method '{}'", name);
                false
            }
        };

        if accepted {
            info!("User {} authenticated with {}", user, request.method().name());
            t.send(Bytes::from_static(&[MessageType::UserauthSuccess as u8]))?;
            return Ok(Some(user.to_string()));
        }
        warn!("Authentication of {} with {} failed", user, request.method().name());
        self.reject(t, config, true)?;
        Ok(None)
    }

    fn reject(&mut self, t: &mut Transport, config: &ServerConfig, counted: bool) -> FjordResult<()> {
        if counted {
            self.failures += 1;
            if self.failures >= config.max_auth_attempts {
                return Err(FjordError::Security(format!(
                    "Too many authentication failures ({})",
                    self.failures
                )));
            }
        }
        let failure = AuthFailure {
            methods: Self::methods(config),
            partial_success: false,
        };
        t.send(failure.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithms::Ed25519HostKey;
    use crate::ssh::io::IoWriter;

    fn transport() -> Transport {
        Transport::new(IoWriter::spawn(tokio::io::sink()))
    }

    fn server_config(max: u32) -> ServerConfig {
        ServerConfig::new(Arc::new(Ed25519HostKey::generate()))
            .with_password_authenticator(Arc::new(
                StaticPasswordAuthenticator::new().with_user("alice", "secret"),
            ))
            .with_max_auth_attempts(max)
    }

    fn password(user: &str, password: &str) -> Bytes {
        AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            AuthMethod::Password(Zeroizing::new(password.to_string())),
        )
        .encode()
    }

    #[test]
    fn test_publickey_request_layout() {
        let request = AuthRequest::new(
            "bob",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: None,
            },
        );
        let decoded = AuthRequest::decode(request.encode()).unwrap();
        assert_eq!(decoded, request);

        let unknown = AuthRequest::new("bob", SERVICE_CONNECTION, AuthMethod::Other("hostbased".into()));
        let decoded = AuthRequest::decode(unknown.encode()).unwrap();
        assert_eq!(decoded.method().name(), "hostbased");
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("password123", "password123"));
        assert!(!constant_time_compare("password123", "password124"));
        assert!(!constant_time_compare("short", "verylongpassword"));
    }

    #[tokio::test]
    async fn test_password_success() {
        let config = server_config(3);
        let mut t = transport();
        let mut service = ServerAuthService::default();
        let user = service
            .process(&mut t, &config, b"sid", password("alice", "secret"))
            .unwrap();
        assert_eq!(user.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_none_is_not_counted_and_failures_disconnect() {
        let config = server_config(2);
        let mut t = transport();
        let mut service = ServerAuthService::default();
        let none = AuthRequest::new("alice", SERVICE_CONNECTION, AuthMethod::None).encode();
        for _ in 0..5 {
            assert!(service.process(&mut t, &config, b"sid", none.clone()).unwrap().is_none());
        }
        assert!(service
            .process(&mut t, &config, b"sid", password("alice", "wrong"))
            .unwrap()
            .is_none());
        let err = service
            .process(&mut t, &config, b"sid", password("alice", "wrong"))
            .unwrap_err();
        assert!(err.to_string().contains("Too many authentication failures"));
    }

    #[tokio::test]
    async fn test_publickey_signature_checked() {
        let key = Arc::new(Ed25519HostKey::generate());
        let config = ServerConfig::new(Arc::new(Ed25519HostKey::generate()))
            .with_publickey_authenticator(Arc::new(
                StaticPublicKeyAuthenticator::new().with_key("carol", key.public_key_blob()),
            ));
        let mut t = transport();
        let mut service = ServerAuthService::default();

        let auth = ClientAuth::PublicKey {
            user: "carol".to_string(),
            key: key.clone(),
        };
        let good = auth.request(b"session").unwrap().encode();
        let user = service.process(&mut t, &config, b"session", good).unwrap();
        assert_eq!(user.as_deref(), Some("carol"));

        // signed over another session id
        let replayed = auth.request(b"other").unwrap().encode();
        assert!(service
            .process(&mut t, &config, b"session", replayed)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_client_queues_until_service_accepted() {
        let mut t = transport();
        let mut client = ClientAuthService::default();
        let future = AuthFuture::new("auth");
        client
            .authenticate(
                &mut t,
                Some(&b"sid"[..]),
                ClientAuth::Password {
                    user: "alice".to_string(),
                    password: Zeroizing::new("secret".to_string()),
                },
                future.clone(),
            )
            .unwrap();
        assert_eq!(t.encoder().sequence(), 0);

        let second = AuthFuture::new("auth");
        client
            .authenticate(
                &mut t,
                Some(&b"sid"[..]),
                ClientAuth::Password {
                    user: "alice".to_string(),
                    password: Zeroizing::new("again".to_string()),
                },
                second.clone(),
            )
            .unwrap();
        assert!(matches!(second.peek(), Some(Err(FjordError::IllegalState(_)))));

        client.service_accepted(&mut t, b"sid").unwrap();
        assert_eq!(t.encoder().sequence(), 1);
        let user = client
            .process(Bytes::from_static(&[MessageType::UserauthSuccess as u8]))
            .unwrap();
        assert_eq!(user.as_deref(), Some("alice"));
        assert!(matches!(future.peek(), Some(Ok(()))));
    }
}
