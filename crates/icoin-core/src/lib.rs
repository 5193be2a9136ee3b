//! # icoin-core
//! Network identifiers, wire constants, and the error taxonomy shared by the
//! icoin crates.

pub mod constants;
pub mod error;

pub use constants::{NetId, NetworkType};
pub use error::{ConfigError, FrameError, IcoinError, NetworkError};
