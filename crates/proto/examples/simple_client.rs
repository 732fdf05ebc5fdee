//! Simple SSH Client Example
//!
//! This example demonstrates how to:
//! - Connect to an SSH server
//! - Authenticate with username/password
//! - Execute a remote command
//! - Optionally forward a local port through the server
//!
//! Usage:
//!   cargo run --example simple_client <host:port> <username> <password> <command> [local_port:target_host:target_port]
//!
//! Example:
//!   cargo run --example simple_client 127.0.0.1:2222 testuser testpass "whoami"

use fjord_proto::ssh::client::SshClient;
use fjord_proto::ssh::config::{AcceptAllServerKeys, ClientConfig, SshConfig};
use fjord_proto::ssh::forward::types::{parse_forward_addr, ForwardAddr};
use std::env;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 5 && args.len() != 6 {
        eprintln!(
            "Usage: {} <host:port> <username> <password> <command> [local_port:target_host:target_port]",
            args[0]
        );
        eprintln!("Example: {} 127.0.0.1:2222 testuser testpass \"whoami\"", args[0]);
        std::process::exit(1);
    }

    let server_addr = &args[1];
    let username = &args[2];
    let password = &args[3];
    let command = &args[4];

    println!("Connecting to SSH server at {}...", server_addr);

    // Host keys are not checked here; pin them with KnownServerKeys in real use.
    let ssh = SshConfig::default()
        .with_connect_timeout(Duration::from_secs(10))
        .with_heartbeat_interval(Duration::from_secs(30));
    let config = ClientConfig::new(Arc::new(AcceptAllServerKeys)).with_ssh(ssh);
    let client = SshClient::connect(server_addr, config).await?;

    println!("✓ Connected successfully");
    if let Some(version) = client.server_version() {
        println!("  Server version: {}", version);
    }
    if let Some(negotiated) = client.session().negotiated() {
        println!("  Negotiated: {:?}", negotiated);
    }

    println!();
    println!("Authenticating as user '{}'...", username);
    client.authenticate_password(username, password).await?;
    println!("✓ Authentication successful");

    println!();
    println!("Executing command: {}", command);
    match client.execute_remote_command(command).await {
        Ok(output) => {
            println!("--- Output ---");
            println!("{}", output);
            println!("--- End of Output ---");
        }
        Err(e) => println!("✗ Command failed: {}", e),
    }

    if let Some(forward) = args.get(5) {
        let (port, target) = forward
            .split_once(':')
            .ok_or("forwarding argument must be local_port:target_host:target_port")?;
        let local = ForwardAddr::new("127.0.0.1", port.parse()?);
        let target = parse_forward_addr(target)?;
        let bound = client
            .forwarder()
            .start_local_port_forwarding(local, target.clone())
            .await?;
        println!();
        println!("Forwarding {} to {}, press Ctrl-C to stop", bound, target);
        tokio::signal::ctrl_c().await?;
    }

    println!();
    println!("Disconnecting...");
    client.close().await?;
    println!("✓ Disconnected");

    Ok(())
}
