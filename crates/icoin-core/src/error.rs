//! Error types for the icoin network layer.
use std::time::Duration;

use thiserror::Error;

use crate::constants::NetId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid network type: {0:?} (expected \"main\" or \"test\")")] InvalidNetwork(String),
    #[error("invalid connect target: {0:?}")] InvalidConnectTarget(String),
}

/// Failures while decoding or encoding a single frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("short read: expected {expected} bytes, got {got}")] ShortRead { expected: usize, got: usize },
    #[error("magic mismatch: got {got}, expected {expected}")] MagicMismatch { got: NetId, expected: NetId },
    #[error("unknown command: {0:?}")] UnknownCommand(String),
    #[error("payload too large: {size} > {max}")] PayloadTooLarge { size: usize, max: usize },
    #[error("payload decode: {0}")] PayloadDecode(String),
    #[error("payload encode: {0}")] PayloadEncode(String),
    #[error("io: {0}")] Io(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("bind {addr}: {reason}")] Bind { addr: String, reason: String },
    #[error("dial {addr}: {reason}")] Dial { addr: String, reason: String },
    #[error("protocol negotiation timeout after {0:?}")] NegotiationTimeout(Duration),
    #[error("protocol negotiation failed: {0}")] NegotiationFailure(String),
    #[error("write: {0}")] Write(String),
    #[error("peer not active")] PeerNotActive,
    #[error("peer disconnected: {0}")] PeerDisconnected(String),
    #[error(transparent)] Frame(#[from] FrameError),
}

#[derive(Error, Debug)]
pub enum IcoinError {
    #[error(transparent)] Config(#[from] ConfigError),
    #[error(transparent)] Network(#[from] NetworkError),
    #[error(transparent)] Frame(#[from] FrameError),
}
