//! VeilGuard CLI - WireGuard-compatible tunnel core
//!
//! Key management helpers, configuration rendering and checking, a
//! loopback self-test, and a minimal foreground tunnel.

use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing_subscriber::{fmt, EnvFilter};

use veilguard::config::{parse_key, ProviderResponse, TunnelConfig};
use veilguard::crypto::x25519::KeyPair;
use veilguard::endpoint::{self, EndpointOptions, PeerTarget};
use veilguard::error::{CryptoError, NetworkError};
use veilguard::protocol::Responder;
use veilguard::VeilGuardError;

/// VeilGuard - WireGuard-compatible secure tunnel
#[derive(Parser, Debug)]
#[command(name = "veilguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a private key
    Genkey,
    /// Read a private key on stdin and print its public key
    Pubkey,
    /// Generate a preshared key
    Genpsk,
    /// Render a provider JSON response as a WireGuard configuration block
    Render {
        /// Path to the provider response
        #[arg(short, long)]
        provider: PathBuf,
    },
    /// Parse and validate a configuration file
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Handshake two in-process endpoints over 127.0.0.1 and exchange a payload
    Loopback,
    /// Connect to the first peer of a configuration and keep the tunnel up
    Up {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args.command).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(command: Command) -> Result<(), VeilGuardError> {
    match command {
        Command::Genkey => {
            let key = KeyPair::generate()?;
            println!("{}", BASE64.encode(key.private_key()));
            Ok(())
        }
        Command::Pubkey => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            let private_key = parse_key(&input, "PrivateKey")?;
            println!("{}", BASE64.encode(KeyPair::from_private(private_key).public_key()));
            Ok(())
        }
        Command::Genpsk => {
            let mut psk = zeroize::Zeroizing::new([0u8; 32]);
            OsRng
                .try_fill_bytes(&mut psk[..])
                .map_err(|e| CryptoError::RandomUnavailable {
                    reason: e.to_string(),
                })?;
            println!("{}", BASE64.encode(*psk));
            Ok(())
        }
        Command::Render { provider } => {
            let json = std::fs::read_to_string(&provider)?;
            let config = ProviderResponse::from_json(&json)?.into_config()?;
            print!("{}", config);
            Ok(())
        }
        Command::Check { config } => {
            tracing::info!("Loading configuration from: {}", config.display());
            let config = TunnelConfig::from_file(&config)?;
            config.validate()?;
            println!(
                "OK: {} address(es), {} peer(s), MTU {}",
                config.interface.addresses.len(),
                config.peers.len(),
                config.mtu()
            );
            Ok(())
        }
        Command::Loopback => loopback().await,
        Command::Up { config } => up(config).await,
    }
}

async fn loopback() -> Result<(), VeilGuardError> {
    let localhost: SocketAddr = ([127, 0, 0, 1], 0).into();
    let alice = Arc::new(KeyPair::generate()?);
    let bob = Arc::new(KeyPair::generate()?);

    let mut responder = Responder::new(Arc::clone(&bob))?;
    responder.add_peer(*alice.public_key(), None);

    let server_socket = endpoint::bind(localhost).await?;
    let server_addr = server_socket.local_addr()?;
    let server = tokio::spawn(endpoint::accept(
        server_socket,
        responder,
        EndpointOptions::default(),
    ));

    let target = PeerTarget {
        public_key: *bob.public_key(),
        preshared_key: None,
        addr: server_addr,
    };
    let client_socket = endpoint::bind(localhost).await?;
    let client = endpoint::connect(client_socket, alice, target, EndpointOptions::default()).await?;
    let mut server = server
        .await
        .map_err(|_| NetworkError::TunnelClosed)??;

    let payload = [0x01, 0x02, 0x03];
    client.send(&payload).await?;
    let received = server.recv().await.ok_or(NetworkError::TunnelClosed)?;
    println!(
        "Loopback OK: {} -> {} delivered {:02x?}",
        client.local_addr(),
        server_addr,
        received
    );

    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}

async fn up(path: PathBuf) -> Result<(), VeilGuardError> {
    tracing::info!("Loading configuration from: {}", path.display());
    let config = TunnelConfig::from_file(&path)?;
    config.validate()?;

    let mut tunnel = endpoint::connect_with_config(&config).await?;
    tracing::info!("Tunnel up with {}", tunnel.peer().addr);

    loop {
        tokio::select! {
            payload = tunnel.recv() => {
                match payload {
                    Some(payload) => tracing::info!("Received {} bytes", payload.len()),
                    None => return Err(NetworkError::TunnelClosed.into()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down...");
                return tunnel.shutdown().await;
            }
        }
    }
}
