//! # icoin-network: TCP transport for the icoin node.
//!
//! Frames typed messages over raw TCP streams with a fixed 24-byte header,
//! tracks live peers in a lock-guarded registry, and runs one negotiation +
//! read-loop task per connection.
//!
//! The main entry point is [`Server::start`], which launches the listener and
//! the outbound connector, reads control commands, and blocks until the
//! shutdown signal fires.

pub mod config;
pub mod console;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod server;

#[cfg(test)]
mod test_support;

pub use config::{HandshakeMode, NetworkConfig};
pub use console::ControlCommand;
pub use negotiation::{AcceptAll, Negotiator, VersionHandshake};
pub use peer::{Direction, Peer, PeerContext, PeerState};
pub use protocol::{Message, MessageHeader, MsgBroadcast, MsgVersion, read_message, write_message};
pub use registry::Registry;
pub use server::{BroadcastReport, NetworkEvent, Server};
