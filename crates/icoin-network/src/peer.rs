//! A single TCP connection and its lifecycle.
//!
//! `Created → Negotiating → Active → Disconnected`, never backwards.
//!
//! [`Peer::disconnect`] is the only teardown path. It is guarded by a
//! close-once flag, so the read loop, a failed negotiation, a failed write and
//! server shutdown can all call it without double-closing the socket or
//! double-removing the peer from the registry.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use icoin_core::constants::{HEADER_LEN, NetId};
use icoin_core::error::{FrameError, NetworkError};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::negotiation::Negotiator;
use crate::protocol::{self, Message};
use crate::registry::Registry;
use crate::server::NetworkEvent;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The remote node dialed us.
    Inbound,
    /// We dialed the remote node.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("Inbound"),
            Direction::Outbound => f.write_str("Outbound"),
        }
    }
}

/// Lifecycle position of a [`Peer`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Wrapped and registered; negotiation not started.
    Created,
    /// Running the negotiator under the negotiation timeout.
    Negotiating,
    /// Read loop running; writes are accepted.
    Active,
    /// Torn down. Terminal.
    Disconnected,
}

/// Shared, read-only state a peer needs from the server that created it.
#[derive(Clone)]
pub struct PeerContext {
    pub(crate) net_id: NetId,
    pub(crate) registry: Registry,
    pub(crate) negotiator: Arc<dyn Negotiator>,
    pub(crate) negotiate_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) events: broadcast::Sender<NetworkEvent>,
    pub(crate) tracker: TaskTracker,
    pub(crate) shutdown: CancellationToken,
}

/// One live connection, identified by its remote socket address.
pub struct Peer {
    id: SocketAddr,
    direction: Direction,
    ctx: PeerContext,
    state: Mutex<PeerState>,
    /// Taken by the read loop once negotiation succeeds.
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl Peer {
    /// Wrap a connection accepted by the listener. `addr` is the remote end
    /// and becomes the peer's identity.
    pub fn inbound(stream: TcpStream, addr: SocketAddr, ctx: PeerContext) -> Arc<Self> {
        Self::new(stream, addr, Direction::Inbound, ctx)
    }

    /// Wrap a connection we dialed to `addr`.
    pub fn outbound(stream: TcpStream, addr: SocketAddr, ctx: PeerContext) -> Arc<Self> {
        Self::new(stream, addr, Direction::Outbound, ctx)
    }

    fn new(stream: TcpStream, addr: SocketAddr, direction: Direction, ctx: PeerContext) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let cancel = ctx.shutdown.child_token();
        Arc::new(Self {
            id: addr,
            direction,
            ctx,
            state: Mutex::new(PeerState::Created),
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// Remote socket address; the registry key.
    pub fn id(&self) -> SocketAddr {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    pub fn net_id(&self) -> NetId {
        self.ctx.net_id
    }

    /// Negotiate the protocol within the negotiation timeout, then launch the
    /// read loop and return without waiting for it.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetworkError> {
        {
            let mut state = self.state.lock();
            if *state != PeerState::Created {
                return Err(NetworkError::NegotiationFailure(format!(
                    "cannot start peer in state {:?}",
                    *state
                )));
            }
            *state = PeerState::Negotiating;
        }
        debug!(peer = %self.id, direction = %self.direction, "negotiating protocol");

        let timeout = self.ctx.negotiate_timeout;
        let negotiation = async {
            match self.direction {
                Direction::Inbound => self.ctx.negotiator.negotiate_inbound(self).await,
                Direction::Outbound => self.ctx.negotiator.negotiate_outbound(self).await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(NetworkError::NegotiationFailure("peer shut down".into()));
            }
            result = tokio::time::timeout(timeout, negotiation) => match result {
                Err(_) => return Err(NetworkError::NegotiationTimeout(timeout)),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(())) => {}
            },
        }

        {
            let mut state = self.state.lock();
            if *state != PeerState::Negotiating {
                return Err(NetworkError::NegotiationFailure(
                    "peer disconnected during negotiation".into(),
                ));
            }
            *state = PeerState::Active;
        }
        info!(peer = %self.id, direction = %self.direction, "peer active");
        let _ = self.ctx.events.send(NetworkEvent::PeerConnected {
            id: self.id,
            direction: self.direction,
        });

        self.ctx.tracker.spawn(Arc::clone(self).in_handler());
        Ok(())
    }

    /// Read loop. Any frame error ends it; the peer then tears itself down.
    async fn in_handler(self: Arc<Self>) {
        let taken = self.reader.lock().await.take();
        let Some(mut reader) = taken else {
            warn!(peer = %self.id, "read half already taken");
            self.disconnect().await;
            return;
        };

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(peer = %self.id, "read loop cancelled");
                    break;
                }
                result = protocol::read_message(&mut reader, self.ctx.net_id) => result,
            };

            match result {
                Ok(message) => {
                    info!(peer = %self.id, command = message.command(), "received message");
                    debug!(peer = %self.id, ?message, "message body");
                    // Dispatch to handlers goes here; for now subscribers only observe.
                    let _ = self.ctx.events.send(NetworkEvent::MessageReceived {
                        from: self.id,
                        message,
                    });
                }
                Err(FrameError::ShortRead { expected: HEADER_LEN, got: 0 }) => {
                    info!(peer = %self.id, "remote closed connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %self.id, error = %e, "read message error, dropping peer");
                    break;
                }
            }
        }

        drop(reader);
        self.disconnect().await;
    }

    /// Read one frame outside the read loop. Used by negotiators before the
    /// loop owns the read half.
    pub async fn read_message(&self) -> Result<Message, FrameError> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| FrameError::Io("read half owned by read loop".into()))?;
        protocol::read_message(reader, self.ctx.net_id).await
    }

    /// Write one frame regardless of state.
    ///
    /// Concurrent senders are serialized on the write half. The write timeout
    /// covers waiting for the write half as well as the write itself, and
    /// cancelling the peer aborts both.
    pub async fn send(&self, message: &Message) -> Result<(), NetworkError> {
        let timeout = self.ctx.write_timeout;
        let write = async {
            let mut writer = self.writer.lock().await;
            protocol::write_message(&mut *writer, self.ctx.net_id, message).await
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(NetworkError::PeerDisconnected(self.id.to_string()))
            }
            result = tokio::time::timeout(timeout, write) => match result {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Write(format!("timed out after {timeout:?}"))),
            },
        }
    }

    /// Write one frame to an active peer. A failed write leaves the stream
    /// desynchronized, so the peer is disconnected.
    pub async fn write_message(&self, message: &Message) -> Result<(), NetworkError> {
        match self.state() {
            PeerState::Active => {}
            PeerState::Disconnected => {
                return Err(NetworkError::PeerDisconnected(self.id.to_string()));
            }
            PeerState::Created | PeerState::Negotiating => return Err(NetworkError::PeerNotActive),
        }

        if let Err(e) = self.send(message).await {
            warn!(peer = %self.id, error = %e, "write failed, dropping peer");
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Close the connection and leave the registry. Only the first call does
    /// anything.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        *self.state.lock() = PeerState::Disconnected;

        // Drop a read half the read loop never took.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        // In-flight sends were aborted by the cancel above.
        match tokio::time::timeout(self.ctx.write_timeout, async {
            self.writer.lock().await.shutdown().await
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.id, error = %e, "shutdown of write half failed"),
            Err(_) => debug!(peer = %self.id, "write half busy, skipping shutdown"),
        }

        if self.ctx.registry.remove(self) {
            info!(peer = %self.id, direction = %self.direction, "removed peer from registry");
        }
        let _ = self
            .ctx
            .events
            .send(NetworkEvent::PeerDisconnected { id: self.id });
    }

    /// `true` once [`Peer::disconnect`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::AcceptAll;
    use crate::test_support::{context, loopback_peers, raw_loopback};
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;

    /// Never finishes negotiating.
    struct Stall;

    #[async_trait]
    impl Negotiator for Stall {
        async fn negotiate_inbound(&self, _peer: &Peer) -> Result<(), NetworkError> {
            std::future::pending().await
        }

        async fn negotiate_outbound(&self, _peer: &Peer) -> Result<(), NetworkError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn start_activates_and_forwards_messages() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let mut events = ctx.events.subscribe();
        let (outbound, inbound) = loopback_peers(&ctx).await;

        inbound.start().await.unwrap();
        outbound.start().await.unwrap();
        assert!(inbound.is_active());

        outbound.write_message(&Message::broadcast("ping")).await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                NetworkEvent::MessageReceived { from, message } => {
                    assert_eq!(from, inbound.id());
                    assert_eq!(message, Message::broadcast("ping"));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn negotiation_timeout_is_reported() {
        let registry = Registry::new();
        let mut ctx = context(&registry, Arc::new(Stall));
        ctx.negotiate_timeout = Duration::from_millis(30);
        let (_outbound, inbound) = loopback_peers(&ctx).await;

        let err = inbound.start().await.unwrap_err();
        assert_eq!(err, NetworkError::NegotiationTimeout(Duration::from_millis(30)));
        assert_eq!(inbound.state(), PeerState::Negotiating);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let (_outbound, inbound) = loopback_peers(&ctx).await;

        inbound.start().await.unwrap();
        assert!(matches!(
            inbound.start().await,
            Err(NetworkError::NegotiationFailure(_))
        ));
    }

    #[tokio::test]
    async fn write_before_active_is_rejected() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let (outbound, _inbound) = loopback_peers(&ctx).await;

        let err = outbound.write_message(&Message::broadcast("early")).await.unwrap_err();
        assert_eq!(err, NetworkError::PeerNotActive);
        assert!(!outbound.is_closed(), "rejected write must not drop the peer");
    }

    #[tokio::test]
    async fn disconnect_aborts_stuck_write() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        // `_inbound` is never started, so nothing drains the socket.
        let (outbound, _inbound) = loopback_peers(&ctx).await;
        outbound.start().await.unwrap();

        let writer = Arc::clone(&outbound);
        let flood = tokio::spawn(async move {
            let chunk = Message::broadcast("x".repeat(1024 * 1024));
            loop {
                if let Err(e) = writer.write_message(&chunk).await {
                    return e;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = tokio::time::Instant::now();
        outbound.disconnect().await;
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());

        let err = tokio::time::timeout(Duration::from_secs(1), flood)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, NetworkError::PeerDisconnected(_)), "{err}");
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let mut events = ctx.events.subscribe();
        let (outbound, _inbound) = loopback_peers(&ctx).await;
        registry.add(Arc::clone(&outbound));

        outbound.disconnect().await;
        outbound.disconnect().await;

        assert_eq!(outbound.state(), PeerState::Disconnected);
        assert!(registry.is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(NetworkEvent::PeerDisconnected { .. })
        ));
        assert!(events.try_recv().is_err(), "second disconnect must be a no-op");
    }

    #[tokio::test]
    async fn write_after_disconnect_fails() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let (outbound, _inbound) = loopback_peers(&ctx).await;
        outbound.start().await.unwrap();
        outbound.disconnect().await;

        assert!(matches!(
            outbound.write_message(&Message::broadcast("late")).await,
            Err(NetworkError::PeerDisconnected(_))
        ));
    }

    #[tokio::test]
    async fn bad_magic_drops_peer_from_registry() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let mut events = ctx.events.subscribe();
        let (mut client, peer) = raw_loopback(&ctx).await;
        registry.add(Arc::clone(&peer));
        peer.start().await.unwrap();

        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&0x0bad_f00du32.to_le_bytes());
        client.write_all(&header).await.unwrap();

        loop {
            if let NetworkEvent::PeerDisconnected { id } = events.recv().await.unwrap() {
                assert_eq!(id, peer.id());
                break;
            }
        }
        assert!(registry.is_empty());
        assert_eq!(peer.state(), PeerState::Disconnected);
    }

    #[tokio::test]
    async fn remote_close_ends_read_loop() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let mut events = ctx.events.subscribe();
        let (client, peer) = raw_loopback(&ctx).await;
        registry.add(Arc::clone(&peer));
        peer.start().await.unwrap();

        drop(client);
        loop {
            if let NetworkEvent::PeerDisconnected { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert!(!registry.contains(&peer.id()));
    }

    #[tokio::test]
    async fn shutdown_token_stops_read_loop() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let mut events = ctx.events.subscribe();
        let (_client, peer) = raw_loopback(&ctx).await;
        registry.add(Arc::clone(&peer));
        peer.start().await.unwrap();

        ctx.shutdown.cancel();
        loop {
            if let NetworkEvent::PeerDisconnected { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert!(peer.is_closed());
        assert!(registry.is_empty());
    }

    #[test]
    fn direction_display() {
        assert_eq!(Direction::Inbound.to_string(), "Inbound");
        assert_eq!(Direction::Outbound.to_string(), "Outbound");
    }
}
