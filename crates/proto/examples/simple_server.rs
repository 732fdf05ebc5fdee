//! Simple SSH Server Example
//!
//! This example demonstrates how to:
//! - Create an SSH server with an Ed25519 host key
//! - Authenticate users with password
//! - Handle command execution requests
//! - Allow TCP/IP port forwarding
//!
//! Usage:
//!   cargo run --example simple_server [bind_address]
//!
//! Example:
//!   cargo run --example simple_server 127.0.0.1:2222
//!
//! Then connect with a client:
//!   cargo run --example simple_client 127.0.0.1:2222 testuser testpass "whoami"

use fjord_platform::{FjordError, FjordResult};
use fjord_proto::ssh::algorithms::hostkey::{Ed25519HostKey, HostKey};
use fjord_proto::ssh::auth::StaticPasswordAuthenticator;
use fjord_proto::ssh::channel::command::{
    AsyncCommand, CommandFactory, Environment, Program, ProgramRequest, StreamIo,
};
use fjord_proto::ssh::config::{ServerConfig, SshConfig};
use fjord_proto::ssh::forward::filter::AcceptAllForwardingFilter;
use fjord_proto::ssh::server::SshServer;
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Answers a few well known commands and echoes the rest.
struct SimpleCommand(String);

#[async_trait::async_trait]
impl AsyncCommand for SimpleCommand {
    async fn run(
        &mut self,
        env: Environment,
        io: StreamIo,
        _signals: mpsc::UnboundedReceiver<String>,
    ) -> u32 {
        println!("  Executing command: {}", self.0);
        let output = match self.0.trim() {
            "whoami" => format!("{}\n", env.user().unwrap_or("unknown")),
            "pwd" => "/home/user\n".to_string(),
            "hostname" => "ssh-server-example\n".to_string(),
            "uname" | "uname -a" => "Fjord SSH Server Example\n".to_string(),
            cmd if cmd.starts_with("echo ") => format!("{}\n", &cmd[5..]),
            "false" => {
                let _ = io.stderr.write_all(b"false: failed as requested\n").await;
                return 1;
            }
            cmd => format!("Command executed: {}\n", cmd),
        };
        match io.stdout.write_all(output.as_bytes()).await {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }
}

struct SimpleFactory;

impl CommandFactory for SimpleFactory {
    fn create_command(&self, request: &ProgramRequest) -> FjordResult<Program> {
        match request {
            ProgramRequest::Exec(command) => {
                Ok(Program::Async(Box::new(SimpleCommand(command.clone()))))
            }
            other => Err(FjordError::NotImplemented(format!("{:?}", other))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let bind_addr = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:2222");

    println!("=== Fjord SSH Server Example ===");
    println!();

    // In production, load a persistent host key so the server identity
    // survives restarts.
    let host_key = Arc::new(Ed25519HostKey::generate());
    println!("✓ Host key generated");
    println!("  Algorithm: ssh-ed25519");
    println!("  Fingerprint: {}", host_key.fingerprint());
    println!();

    let passwords = StaticPasswordAuthenticator::new()
        .with_user("testuser", "testpass")
        .with_user("admin", "secret");
    let config = ServerConfig::new(host_key)
        .with_ssh(SshConfig::default().with_software_version("FjordServer_Example_1.0"))
        .with_password_authenticator(Arc::new(passwords))
        .with_command_factory(Arc::new(SimpleFactory))
        .with_forwarding_filter(Arc::new(AcceptAllForwardingFilter))
        .with_banner_line("Fjord example server");

    let server = SshServer::bind(bind_addr, config).await?;
    println!("✓ Server listening on {}", server.local_addr()?);
    println!();
    println!("Accepted credentials:");
    println!("  - testuser / testpass");
    println!("  - admin / secret");
    println!();
    println!("Waiting for connections... (Press Ctrl+C to stop)");

    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok(session) => {
                    let peer = session.peer_addr();
                    println!("[{:?}] New connection", peer);
                    tokio::spawn(async move {
                        let _ = session.close_future().wait(None).await;
                        println!(
                            "[{:?}] Connection closed (user: {})",
                            peer,
                            session.username().unwrap_or_else(|| "none".to_string())
                        );
                    });
                }
                Err(e) => {
                    eprintln!("Error accepting connection: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}
