//! icoin P2P node binary.
//!
//! Listens for peers, optionally dials one remote node, and reads control
//! commands (`broadcast:<text>`, `peers`) from stdin until Ctrl+C.

use std::process;

use clap::{ArgAction, Parser};
use icoin_core::constants::NetworkType;
use icoin_network::{HandshakeMode, NetworkConfig, Server};
use tokio::io::BufReader;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "icoind", version, about = "icoin P2P network node")]
struct Args {
    /// Network to join ("main" or "test")
    #[arg(long, default_value = "main")]
    net: String,

    /// Remote node to dial at startup (host or host:port)
    #[arg(long)]
    connect: Option<String>,

    /// Accept inbound connections
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    listen: bool,

    /// P2P listen address
    #[arg(long, default_value = "0.0.0.0")]
    listen_addr: String,

    /// P2P listen port (defaults to the network's port)
    #[arg(long)]
    port: Option<u16>,

    /// Protocol negotiation ("none" or "version")
    #[arg(long, default_value = "none")]
    handshake: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn into_config(self) -> Result<NetworkConfig, String> {
        let network: NetworkType = self.net.parse().map_err(|e| format!("{e}"))?;
        let handshake: HandshakeMode = self.handshake.parse()?;

        let defaults = NetworkConfig::for_network(network);
        let config = NetworkConfig {
            listen_addr: self.listen_addr,
            listen_port: self.port.unwrap_or(defaults.listen_port),
            listen: self.listen,
            connect: self.connect,
            handshake,
            ..defaults
        };
        config.connect_target().map_err(|e| e.to_string())?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            process::exit(1);
        }
    };

    info!("icoin node v{}", env!("CARGO_PKG_VERSION"));
    info!("network: {} ({})", config.network, config.net_id());
    if config.listen {
        info!("p2p_listen: {}", config.listen_socket_addr());
    }
    if let Some(connect) = &config.connect {
        info!("connect: {}", connect);
    }
    info!("handshake: {}", config.handshake);

    let server = Server::new(config);
    let input = BufReader::new(tokio::io::stdin());
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down...");
    };

    info!("icoin node running (Ctrl+C to stop)");
    if let Err(e) = server.start(input, shutdown_signal).await {
        error!("failed to start node: {}", e);
        process::exit(1);
    }

    info!("icoin node shutdown complete");
    // The stdin reader sits on a blocking thread the runtime would wait for.
    process::exit(0);
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG` takes precedence over `level_str`. Pass `format = "json"` for
/// structured JSON output; any other value gives human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
