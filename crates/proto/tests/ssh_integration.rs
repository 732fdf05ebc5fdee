//! Integration tests for SSH client-server communication.
//!
//! These tests run a client and a server over loopback TCP and cover:
//! - Version exchange and key exchange
//! - Password and public key authentication
//! - Command execution
//! - Local, remote and dynamic port forwarding
//! - Rekeying and shutdown

use async_trait::async_trait;
use fjord_platform::{FjordError, FjordResult};
use fjord_proto::ssh::algorithms::hostkey::{Ed25519HostKey, HostKey};
use fjord_proto::ssh::auth::{StaticPasswordAuthenticator, StaticPublicKeyAuthenticator};
use fjord_proto::ssh::channel::command::{
    AsyncCommand, CommandFactory, Environment, Program, ProgramRequest, StreamIo,
};
use fjord_proto::ssh::client::{RemoteCommandError, SshClient};
use fjord_proto::ssh::config::{AcceptAllServerKeys, ClientConfig, KnownServerKeys, ServerConfig};
use fjord_proto::ssh::forward::filter::AcceptAllForwardingFilter;
use fjord_proto::ssh::forward::listener::{PortForwardingEventListener, TunnelEvent};
use fjord_proto::ssh::forward::types::ForwardAddr;
use fjord_proto::ssh::server::SshServer;
use fjord_proto::ssh::session::{KexState, SessionState};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(10);

/// Prints its command line; `fail` writes to stderr and exits with 3.
struct TestCommand(String);

#[async_trait]
impl AsyncCommand for TestCommand {
    async fn run(
        &mut self,
        _env: Environment,
        io: StreamIo,
        _signals: mpsc::UnboundedReceiver<String>,
    ) -> u32 {
        if self.0 == "fail" {
            let _ = io.stderr.write_all(b"something broke\n").await;
            return 3;
        }
        match io
            .stdout
            .write_all(format!("Executed: {}", self.0).as_bytes())
            .await
        {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }
}

struct TestFactory;

impl CommandFactory for TestFactory {
    fn create_command(&self, request: &ProgramRequest) -> FjordResult<Program> {
        match request {
            ProgramRequest::Exec(command) => {
                Ok(Program::Async(Box::new(TestCommand(command.clone()))))
            }
            _ => Err(FjordError::NotImplemented("exec only".to_string())),
        }
    }
}

fn server_config(host_key: Arc<Ed25519HostKey>) -> ServerConfig {
    ServerConfig::new(host_key)
        .with_password_authenticator(Arc::new(
            StaticPasswordAuthenticator::new().with_user("alice", "secret"),
        ))
        .with_command_factory(Arc::new(TestFactory))
        .with_forwarding_filter(Arc::new(AcceptAllForwardingFilter))
}

/// Starts a server in the background and returns its address.
async fn start_server(config: ServerConfig) -> SocketAddr {
    let server = SshServer::bind("127.0.0.1:0", config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

fn client_config() -> ClientConfig {
    ClientConfig::new(Arc::new(AcceptAllServerKeys))
}

async fn connected_client(addr: SocketAddr) -> SshClient {
    let client = timeout(WAIT, SshClient::connect(&addr.to_string(), client_config()))
        .await
        .unwrap()
        .unwrap();
    client.authenticate_password("alice", "secret").await.unwrap();
    client
}

/// TCP echo server on loopback.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn assert_echo(mut stream: TcpStream, message: &[u8]) {
    stream.write_all(message).await.unwrap();
    let mut buf = vec![0u8; message.len()];
    timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, message);
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<TunnelEvent>>,
}

impl PortForwardingEventListener for RecordingListener {
    fn on_event(&self, event: &TunnelEvent) -> FjordResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_key_exchange_with_pinned_host_key() {
    let host_key = Arc::new(Ed25519HostKey::generate());
    let blob = host_key.public_key_blob();
    let addr = start_server(server_config(host_key)).await;

    let config = ClientConfig::new(Arc::new(KnownServerKeys::new().with_key(&blob)));
    let client = timeout(WAIT, SshClient::connect(&addr.to_string(), config))
        .await
        .unwrap()
        .unwrap();
    let session = client.session();
    assert_eq!(session.kex_state(), KexState::Done);
    assert_eq!(session.state(), SessionState::Established);
    assert!(client.server_version().unwrap().starts_with("SSH-2.0-"));
    assert_eq!(client.server_addr(), Some(addr));
}

#[tokio::test]
async fn test_unknown_host_key_is_rejected() {
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let other = Ed25519HostKey::generate().public_key_blob();
    let config = ClientConfig::new(Arc::new(KnownServerKeys::new().with_key(&other)));
    let err = timeout(WAIT, SshClient::connect(&addr.to_string(), config))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, FjordError::Security(_)), "{}", err);
}

#[tokio::test]
async fn test_execute_remote_command() {
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let client = connected_client(addr).await;
    assert_eq!(client.username().as_deref(), Some("alice"));

    let output = timeout(WAIT, client.execute_remote_command("ls -la"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output, "Executed: ls -la");

    // the session stays usable for further channels
    let output = client.execute_remote_command("whoami").await.unwrap();
    assert_eq!(output, "Executed: whoami");
}

#[tokio::test]
async fn test_remote_command_failure() {
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let client = connected_client(addr).await;

    let err = timeout(WAIT, client.execute_remote_command("fail"))
        .await
        .unwrap()
        .unwrap_err();
    let FjordError::Other(inner) = err else {
        panic!("expected a remote command error");
    };
    let remote = inner.downcast_ref::<RemoteCommandError>().unwrap();
    assert_eq!(remote.exit_status, Some(3));
    assert_eq!(remote.stderr, "something broke\n");
}

#[tokio::test]
async fn test_authentication_failure_then_success() {
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let client = SshClient::connect(&addr.to_string(), client_config())
        .await
        .unwrap();

    let err = client
        .authenticate_password("alice", "wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, FjordError::Security(_)));
    assert!(!client.is_authenticated());

    client.authenticate_password("alice", "secret").await.unwrap();
    assert!(client.is_authenticated());
}

#[tokio::test]
async fn test_too_many_failures_disconnects() {
    let config =
        server_config(Arc::new(Ed25519HostKey::generate())).with_max_auth_attempts(2);
    let addr = start_server(config).await;
    let client = SshClient::connect(&addr.to_string(), client_config())
        .await
        .unwrap();

    assert!(client.authenticate_password("alice", "one").await.is_err());
    assert!(client.authenticate_password("alice", "two").await.is_err());
    client
        .session()
        .close_future()
        .verify(Some(WAIT))
        .await
        .unwrap();
    assert!(!client.session().is_open());
}

#[tokio::test]
async fn test_publickey_authentication() {
    let user_key = Arc::new(Ed25519HostKey::generate());
    let config = server_config(Arc::new(Ed25519HostKey::generate())).with_publickey_authenticator(
        Arc::new(StaticPublicKeyAuthenticator::new().with_key("bob", user_key.public_key_blob())),
    );
    let addr = start_server(config).await;
    let client = SshClient::connect(&addr.to_string(), client_config())
        .await
        .unwrap();

    let stranger = Arc::new(Ed25519HostKey::generate());
    assert!(client.authenticate_publickey("bob", stranger).await.is_err());
    client.authenticate_publickey("bob", user_key).await.unwrap();
    assert_eq!(client.username().as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_local_port_forwarding() {
    let echo = echo_server().await;
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let client = connected_client(addr).await;

    let forwarder = client.forwarder();
    let recorder = Arc::new(RecordingListener::default());
    forwarder.events().add_listener(recorder.clone());

    let bound = forwarder
        .start_local_port_forwarding(
            ForwardAddr::new("127.0.0.1", 0),
            ForwardAddr::new("127.0.0.1", echo.port()),
        )
        .await
        .unwrap();
    assert_ne!(bound.port, 0);

    let stream = TcpStream::connect(bound.to_socket_addr().unwrap()).await.unwrap();
    assert_echo(stream, b"through the tunnel").await;

    forwarder.stop_local_port_forwarding(&bound).await.unwrap();
    assert!(forwarder.bound_addresses().is_empty());

    let events = recorder.events.lock().unwrap().clone();
    assert!(matches!(events.first(), Some(TunnelEvent::Establishing { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, TunnelEvent::Established { error: None, .. })));
    assert!(matches!(events.last(), Some(TunnelEvent::TornDown { error: None, .. })));
}

#[tokio::test]
async fn test_local_port_forwarding_rejected_target_closes_connection() {
    let echo = echo_server().await;
    // the default server filter refuses all forwarding
    let config = ServerConfig::new(Arc::new(Ed25519HostKey::generate())).with_password_authenticator(
        Arc::new(StaticPasswordAuthenticator::new().with_user("alice", "secret")),
    );
    let addr = start_server(config).await;
    let client = connected_client(addr).await;

    let bound = client
        .forwarder()
        .start_local_port_forwarding(
            ForwardAddr::new("127.0.0.1", 0),
            ForwardAddr::new("127.0.0.1", echo.port()),
        )
        .await
        .unwrap();
    let mut stream = TcpStream::connect(bound.to_socket_addr().unwrap()).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(WAIT, stream.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_remote_port_forwarding() {
    let echo = echo_server().await;
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let client = connected_client(addr).await;

    let forwarder = client.forwarder();
    let bound = timeout(
        WAIT,
        forwarder.start_remote_port_forwarding(
            ForwardAddr::new("127.0.0.1", 0),
            ForwardAddr::new("127.0.0.1", echo.port()),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_ne!(bound.port, 0);

    let stream = TcpStream::connect(("127.0.0.1", bound.port)).await.unwrap();
    assert_echo(stream, b"back from the server").await;

    forwarder.stop_remote_port_forwarding(&bound).await.unwrap();
}

#[tokio::test]
async fn test_dynamic_port_forwarding_socks5() {
    let echo = echo_server().await;
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let client = connected_client(addr).await;

    let bound = client
        .forwarder()
        .start_dynamic_port_forwarding(ForwardAddr::new("127.0.0.1", 0))
        .await
        .unwrap();
    let mut stream = TcpStream::connect(bound.to_socket_addr().unwrap()).await.unwrap();

    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);

    let port = echo.port().to_be_bytes();
    stream
        .write_all(&[5, 1, 0, 1, 127, 0, 0, 1, port[0], port[1]])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    timeout(WAIT, stream.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(&reply[..2], &[5, 0]);

    assert_echo(stream, b"socks works").await;
}

#[tokio::test]
async fn test_rekey_with_open_channel() {
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let client = connected_client(addr).await;
    let session_id = client.session().session_id();

    let channel = client.open_session().await.unwrap();
    client
        .session()
        .rekey()
        .verify(Some(WAIT))
        .await
        .unwrap();
    assert_eq!(client.session().session_id(), session_id);

    let output = client.execute_remote_command("after rekey").await.unwrap();
    assert_eq!(output, "Executed: after rekey");
    channel.close(false).verify(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn test_none_cipher_refused_with_open_channel() {
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let client = connected_client(addr).await;
    let _channel = client.open_session().await.unwrap();

    let err = client
        .session()
        .switch_to_none_cipher()
        .verify(Some(WAIT))
        .await
        .unwrap_err();
    assert!(matches!(err, FjordError::IllegalState(_)));
    assert!(client.session().is_open());
}

#[tokio::test]
async fn test_graceful_close() {
    let addr = start_server(server_config(Arc::new(Ed25519HostKey::generate()))).await;
    let client = connected_client(addr).await;
    let mut channel = client.open_session().await.unwrap();

    timeout(WAIT, client.close()).await.unwrap().unwrap();
    assert_eq!(client.session().state(), SessionState::Closed);
    assert!(channel.close_future().is_done());

    // the channel reports its end
    let mut saw_closed = false;
    while let Some(event) = channel.next_event().await {
        if event == fjord_proto::ssh::channel::ChannelEvent::Closed {
            saw_closed = true;
        }
    }
    assert!(saw_closed);

    let err = client.session().open_channel(
        fjord_proto::ssh::connection::messages::ChannelType::Session,
    );
    assert!(err.await.is_err());
}
