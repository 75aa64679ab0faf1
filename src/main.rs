//! Tempora node binary.
//!
//! Runs a full temporal-consensus node with P2P networking, a mempool,
//! persistent storage, and a local control socket.
//!
//! Usage:
//!   tempora start                       # run the node
//!   tempora status                      # query a running node
//!   tempora stop                        # stop a running node
//!   tempora peer add <addr>             # dial a peer on a running node
//!
//! Exit codes: 0 success, 1 configuration error, 2 network unreachable at
//! startup, 3 unrecoverable state corruption.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use tempora::config::TemporaConfig;
use tempora::node::{self, Node, NodeConfig, EXIT_CONFIG, EXIT_CORRUPTION, EXIT_NETWORK};
use tempora::storage::StorageError;

/// Tempora temporal-consensus node.
#[derive(Parser, Debug)]
#[command(name = "tempora", version, about = "Tempora temporal-consensus node")]
struct Cli {
    /// Data directory for persistent storage.
    #[arg(long, default_value = "./tempora-data", global = true)]
    data_dir: PathBuf,

    /// Control socket host of a running node.
    #[arg(long, default_value = "127.0.0.1", global = true)]
    control_host: String,

    /// Control socket port of a running node.
    #[arg(long, default_value_t = tempora::constants::DEFAULT_CONTROL_PORT, global = true)]
    control_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node.
    Start {
        /// P2P listen host.
        #[arg(long)]
        host: Option<String>,

        /// P2P listen port.
        #[arg(long)]
        port: Option<u16>,

        /// Bootstrap peer addresses (comma-separated).
        #[arg(long, value_delimiter = ',')]
        peers: Vec<SocketAddr>,

        /// Run without requiring peers (bootstrap a new network).
        #[arg(long)]
        standalone: bool,
    },

    /// Query a running node's status.
    Status,

    /// Stop a running node.
    Stop,

    /// Manage a running node's peers.
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },
}

#[derive(Subcommand, Debug)]
enum PeerAction {
    /// Dial a peer address.
    Add { addr: SocketAddr },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            host,
            port,
            peers,
            standalone,
        } => run_node(cli.data_dir, host, port, peers, standalone).await,
        Command::Status => control_command(&cli.control_host, cli.control_port, "status").await,
        Command::Stop => control_command(&cli.control_host, cli.control_port, "stop").await,
        Command::Peer {
            action: PeerAction::Add { addr },
        } => {
            control_command(&cli.control_host, cli.control_port, &format!("peer add {}", addr))
                .await
        }
    }
}

async fn run_node(
    data_dir: PathBuf,
    host: Option<String>,
    port: Option<u16>,
    cli_peers: Vec<SocketAddr>,
    standalone: bool,
) -> ExitCode {
    let mut settings = match TemporaConfig::load(&data_dir) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };
    if let Some(host) = host {
        settings.node.p2p_host = host;
    }
    if let Some(port) = port {
        settings.node.p2p_port = port;
    }
    if standalone {
        settings.node.standalone = true;
    }
    if let Err(e) = settings.validate() {
        eprintln!("configuration error: {}", e);
        return ExitCode::from(EXIT_CONFIG as u8);
    }

    let listen_addr: SocketAddr =
        match format!("{}:{}", settings.node.p2p_host, settings.node.p2p_port).parse() {
            Ok(addr) => addr,
            Err(_) => {
                eprintln!("configuration error: invalid p2p listen address");
                return ExitCode::from(EXIT_CONFIG as u8);
            }
        };
    let control_addr: SocketAddr = match format!(
        "{}:{}",
        settings.node.control_host, settings.node.control_port
    )
    .parse()
    {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("configuration error: invalid control address");
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let (keypair, kem_keypair) = match node::load_or_generate_keypair(&data_dir) {
        Ok(keys) => keys,
        Err(StorageError::Corruption(e)) => {
            eprintln!("state corruption: {}", e);
            return ExitCode::from(EXIT_CORRUPTION as u8);
        }
        Err(e) => {
            eprintln!("startup error: {}", e);
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let mut bootstrap = settings.parse_bootstrap_peers();
    bootstrap.extend(cli_peers);
    let standalone = settings.node.standalone;

    tracing::info!(p2p = %listen_addr, control = %control_addr, data = %data_dir.display(), "starting tempora node");

    let mut node = match Node::new(NodeConfig {
        data_dir,
        listen_addr,
        control_addr,
        bootstrap_peers: bootstrap.clone(),
        keypair,
        kem_keypair,
        settings,
    })
    .await
    {
        Ok(node) => node,
        Err(StorageError::Corruption(e)) => {
            eprintln!("state corruption: {}", e);
            return ExitCode::from(EXIT_CORRUPTION as u8);
        }
        Err(e) => {
            eprintln!("startup error: {}", e);
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    // A node with configured peers that cannot reach any of them cannot
    // make progress; surface that as a startup failure.
    if !bootstrap.is_empty() {
        let connected = node.connect_bootstrap(&bootstrap).await;
        if connected == 0 && !standalone {
            eprintln!("network unreachable: none of {} bootstrap peers answered", bootstrap.len());
            return ExitCode::from(EXIT_NETWORK as u8);
        }
    } else if !standalone {
        tracing::warn!("no bootstrap peers configured; node will report stalled until peers arrive");
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupt received, shutting down");
        signal_token.cancel();
    });

    node.run(shutdown).await;
    ExitCode::SUCCESS
}

/// Send one command line to a running node's control socket and print the
/// reply.
async fn control_command(host: &str, port: u16, command: &str) -> ExitCode {
    let addr = format!("{}:{}", host, port);
    let mut stream = match tokio::net::TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(_) => {
            eprintln!("no node listening on {}", addr);
            return ExitCode::from(EXIT_NETWORK as u8);
        }
    };
    if stream
        .write_all(format!("{}\n", command).as_bytes())
        .await
        .is_err()
    {
        eprintln!("failed to send command");
        return ExitCode::from(EXIT_NETWORK as u8);
    }
    let mut reply = String::new();
    let _ = stream.read_to_string(&mut reply).await;
    print!("{}", reply);
    ExitCode::SUCCESS
}
