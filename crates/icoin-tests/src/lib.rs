//! Integration test suite for the icoin network layer.
//!
//! Every scenario runs real servers on loopback sockets and drives them the
//! way a remote node or a misbehaving client would.

pub mod helpers;
