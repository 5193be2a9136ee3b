//! Protocol constants. All wire integers are little-endian.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Four-byte network identifier carried as the magic of every frame header.
///
/// # Examples
///
/// ```
/// use icoin_core::constants::NetId;
/// assert_eq!(NetId::MAIN.to_le_bytes(), [0x86, 0x19, 0xdb, 0xda]);
/// assert_ne!(NetId::MAIN, NetId::TEST);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetId(pub u32);

impl NetId {
    /// Production network.
    pub const MAIN: NetId = NetId(0xdadb_1986);
    /// Test network.
    pub const TEST: NetId = NetId(0xccdd_2086);

    /// Wire form, as it appears in the first four header bytes.
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Inverse of [`NetId::to_le_bytes`].
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        NetId(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Network type: Mainnet or Testnet.
///
/// Binds the network id and the default listen port.
///
/// # Examples
///
/// ```
/// use icoin_core::constants::{NetId, NetworkType};
/// let net: NetworkType = "test".parse().unwrap();
/// assert_eq!(net, NetworkType::Testnet);
/// assert_eq!(net.net_id(), NetId::TEST);
/// assert_eq!(net.default_port(), 11986);
/// assert!("regtest".parse::<NetworkType>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
}

impl NetworkType {
    /// Magic value prepended to every frame on this network.
    pub fn net_id(&self) -> NetId {
        match self {
            Self::Mainnet => NetId::MAIN,
            Self::Testnet => NetId::TEST,
        }
    }

    /// Default TCP port for P2P connections.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Mainnet => 1986,
            Self::Testnet => 11986,
        }
    }

    /// Name used on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mainnet => "main",
            Self::Testnet => "test",
        }
    }
}

impl FromStr for NetworkType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Self::Mainnet),
            "test" => Ok(Self::Testnet),
            other => Err(ConfigError::InvalidNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Size of the fixed frame header: magic + command + length + checksum.
pub const HEADER_LEN: usize = 24;
/// Width of the NUL-padded command field.
pub const COMMAND_SIZE: usize = 12;
/// Largest payload a peer may announce in a header.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

pub const CMD_VERSION: &str = "version";
pub const CMD_BROADCAST: &str = "broadcast";

/// Version advertised by the `version` handshake message.
pub const PROTOCOL_VERSION: u32 = 1;
/// Oldest remote protocol version the handshake accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;
pub const USER_AGENT: &str = concat!("/icoin:", env!("CARGO_PKG_VERSION"), "/");

/// Deadline for protocol negotiation on a fresh connection.
pub const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on draining peer tasks during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
