//! Network configuration for the icoin P2P layer.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use icoin_core::constants::{
    DIAL_TIMEOUT, NEGOTIATE_TIMEOUT, NetId, NetworkType, SHUTDOWN_TIMEOUT, WRITE_TIMEOUT,
};
use icoin_core::error::ConfigError;

/// Which negotiation strategy fresh connections run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeMode {
    /// Accept every connection without exchanging messages.
    #[default]
    None,
    /// Exchange `version` messages before entering the read loop.
    Version,
}

impl FromStr for HandshakeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "version" => Ok(Self::Version),
            other => Err(format!("unknown handshake mode: {other}")),
        }
    }
}

impl fmt::Display for HandshakeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Version => f.write_str("version"),
        }
    }
}

/// Configuration for the P2P server. Immutable once the server starts.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Which network to join; selects the magic and default port.
    pub network: NetworkType,
    /// IP address to listen on.
    pub listen_addr: String,
    /// TCP port to listen on. `0` asks the OS for a free port.
    pub listen_port: u16,
    /// Accept inbound connections.
    pub listen: bool,
    /// Remote node to dial once at startup (`host` or `host:port`).
    pub connect: Option<String>,
    /// Negotiation strategy for new peers.
    pub handshake: HandshakeMode,
    /// Deadline for protocol negotiation on a new peer.
    pub negotiate_timeout: Duration,
    /// Timeout for the outbound dial.
    pub dial_timeout: Duration,
    /// Timeout for writing a single frame to a peer.
    pub write_timeout: Duration,
    /// How long shutdown waits for peer tasks to finish.
    pub shutdown_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::for_network(NetworkType::default())
    }
}

impl NetworkConfig {
    /// Defaults for `network`: listen on all interfaces at its port, no dial target.
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            network,
            listen_addr: "0.0.0.0".to_string(),
            listen_port: network.default_port(),
            listen: true,
            connect: None,
            handshake: HandshakeMode::default(),
            negotiate_timeout: NEGOTIATE_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    pub fn mainnet() -> Self {
        Self::for_network(NetworkType::Mainnet)
    }

    pub fn testnet() -> Self {
        Self::for_network(NetworkType::Testnet)
    }

    pub fn net_id(&self) -> NetId {
        self.network.net_id()
    }

    /// `addr:port` string the listener binds to.
    pub fn listen_socket_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Resolve the dial target. A bare host gets the network's default port.
    pub fn connect_target(&self) -> Result<Option<String>, ConfigError> {
        let Some(raw) = self.connect.as_deref() else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        if raw.parse::<SocketAddr>().is_ok() {
            return Ok(Some(raw.to_string()));
        }
        match raw.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                port.parse::<u16>()
                    .map_err(|_| ConfigError::InvalidConnectTarget(raw.to_string()))?;
                Ok(Some(raw.to_string()))
            }
            None => Ok(Some(format!("{raw}:{}", self.network.default_port()))),
            _ => Err(ConfigError::InvalidConnectTarget(raw.to_string())),
        }
    }
}
