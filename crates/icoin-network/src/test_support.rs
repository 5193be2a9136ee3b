//! Loopback fixtures shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use icoin_core::constants::{NEGOTIATE_TIMEOUT, NetId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::negotiation::Negotiator;
use crate::peer::{Peer, PeerContext};
use crate::registry::Registry;

pub fn context(registry: &Registry, negotiator: Arc<dyn Negotiator>) -> PeerContext {
    let (events, _) = broadcast::channel(256);
    PeerContext {
        net_id: NetId::TEST,
        registry: registry.clone(),
        negotiator,
        negotiate_timeout: NEGOTIATE_TIMEOUT,
        write_timeout: Duration::from_secs(2),
        events,
        tracker: TaskTracker::new(),
        shutdown: CancellationToken::new(),
    }
}

/// Connected pair: `(outbound, inbound)`, both in `Created`.
pub async fn loopback_peers(ctx: &PeerContext) -> (Arc<Peer>, Arc<Peer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let dialed = dialed.unwrap();
    let (accepted, remote) = accepted.unwrap();

    let outbound = Peer::outbound(dialed, addr, ctx.clone());
    let inbound = Peer::inbound(accepted, remote, ctx.clone());
    (outbound, inbound)
}

/// A bare client socket and the inbound peer wrapping the server side.
pub async fn raw_loopback(ctx: &PeerContext) -> (TcpStream, Arc<Peer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (accepted, remote) = accepted.unwrap();
    (dialed.unwrap(), Peer::inbound(accepted, remote, ctx.clone()))
}
