//! The P2P server: listener, outbound connector, control input and broadcast.
//!
//! Every peer task is spawned on one [`TaskTracker`] and observes one
//! [`CancellationToken`], so [`Server::shutdown`] can stop the listener, close
//! every connection and wait for the tasks to drain.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use icoin_core::constants::NetId;
use icoin_core::error::NetworkError;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::console::ControlCommand;
use crate::negotiation::{Negotiator, negotiator_for};
use crate::peer::{Direction, Peer, PeerContext};
use crate::protocol::Message;
use crate::registry::Registry;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Events emitted by the network layer for consumption by higher layers.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer finished negotiation and entered its read loop.
    PeerConnected { id: SocketAddr, direction: Direction },
    /// A peer was torn down.
    PeerDisconnected { id: SocketAddr },
    /// A peer delivered a well-formed frame.
    MessageReceived { from: SocketAddr, message: Message },
}

/// Outcome of a fan-out to every registered peer.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Peers in the snapshot the broadcast iterated.
    pub attempted: usize,
    pub delivered: usize,
    /// Peers the write failed for. Each has been disconnected.
    pub failures: Vec<(SocketAddr, NetworkError)>,
}

impl BroadcastReport {
    /// `true` if every attempted peer received the message.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owns the configuration, the peer registry and every network task.
pub struct Server {
    config: NetworkConfig,
    registry: Registry,
    negotiator: Arc<dyn Negotiator>,
    events: broadcast::Sender<NetworkEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Server using the negotiator selected by `config.handshake`.
    pub fn new(config: NetworkConfig) -> Arc<Self> {
        let negotiator = negotiator_for(config.handshake);
        Self::with_negotiator(config, negotiator)
    }

    /// Server using a caller-supplied negotiation strategy.
    pub fn with_negotiator(config: NetworkConfig, negotiator: Arc<dyn Negotiator>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            registry: Registry::new(),
            negotiator,
            events,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn net_id(&self) -> NetId {
        self.config.net_id()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Subscribe to peer and message events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Address the listener is bound to, once [`Server::bind`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn peer_context(&self) -> PeerContext {
        PeerContext {
            net_id: self.config.net_id(),
            registry: self.registry.clone(),
            negotiator: Arc::clone(&self.negotiator),
            negotiate_timeout: self.config.negotiate_timeout,
            write_timeout: self.config.write_timeout,
            events: self.events.clone(),
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Register `peer` and start it in the background. Negotiation failure
    /// disconnects the peer, which also removes it from the registry.
    pub fn add_peer(&self, peer: Arc<Peer>) {
        if self.shutdown.is_cancelled() {
            debug!(peer = %peer.id(), "server shutting down, refusing peer");
            self.tracker.spawn(async move { peer.disconnect().await });
            return;
        }

        if let Some(displaced) = self.registry.add(Arc::clone(&peer)) {
            if !Arc::ptr_eq(&displaced, &peer) {
                warn!(peer = %peer.id(), "replacing existing peer with the same address");
                self.tracker.spawn(async move { displaced.disconnect().await });
            }
        }
        info!(
            peer = %peer.id(),
            direction = %peer.direction(),
            peers = self.registry.len(),
            "added peer"
        );

        self.tracker.spawn(async move {
            if let Err(e) = peer.start().await {
                warn!(peer = %peer.id(), error = %e, "peer start failed");
                peer.disconnect().await;
            }
        });
    }

    /// Remove `peer` from the registry. Idempotent.
    pub fn remove_peer(&self, peer: &Peer) -> bool {
        let removed = self.registry.remove(peer);
        if removed {
            info!(peer = %peer.id(), direction = %peer.direction(), "removed peer");
        }
        removed
    }

    /// Bind the listening socket from the configuration.
    pub async fn bind(&self) -> Result<TcpListener, NetworkError> {
        let addr = self.config.listen_socket_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|e| NetworkError::Bind {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
        let local = listener.local_addr().map_err(|e| NetworkError::Bind {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
        *self.local_addr.lock() = Some(local);
        info!(%local, network = %self.config.network, "listening");
        Ok(listener)
    }

    /// Accept connections until shutdown. Accept errors are logged and the
    /// loop keeps going.
    pub async fn listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    info!(peer = %addr, "accepted inbound connection");
                    let peer = Peer::inbound(stream, addr, self.peer_context());
                    self.add_peer(peer);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }
        debug!("listener stopped");
    }

    /// Dial `addr` (`host:port`) and register the resulting outbound peer.
    pub async fn connect_to_peer(&self, addr: &str) -> Result<Arc<Peer>, NetworkError> {
        let dial = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(addr)).await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NetworkError::Dial {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(NetworkError::Dial {
                    addr: addr.to_string(),
                    reason: format!("timed out after {:?}", self.config.dial_timeout),
                });
            }
        };
        let remote = stream.peer_addr().map_err(|e| NetworkError::Dial {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        info!(peer = %remote, "connected to remote node");
        let peer = Peer::outbound(stream, remote, self.peer_context());
        self.add_peer(Arc::clone(&peer));
        Ok(peer)
    }

    /// Send a `broadcast` message to every peer in a registry snapshot.
    ///
    /// Writes run concurrently, so a stalled peer costs the others nothing. A
    /// failed peer is recorded and disconnected.
    pub async fn broadcast(&self, content: &str) -> BroadcastReport {
        let message = Message::broadcast(content);
        let peers = self.registry.snapshot();
        let mut report = BroadcastReport {
            attempted: peers.len(),
            ..BroadcastReport::default()
        };

        let message = &message;
        let writes = peers
            .iter()
            .map(|peer| async move { (peer.id(), peer.write_message(message).await) });
        for (id, result) in futures::future::join_all(writes).await {
            match result {
                Ok(()) => {
                    debug!(peer = %id, "broadcast delivered");
                    report.delivered += 1;
                }
                Err(e) => {
                    warn!(peer = %id, error = %e, "broadcast to peer failed");
                    report.failures.push((id, e));
                }
            }
        }

        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failures.len(),
            "broadcast finished"
        );
        report
    }

    /// Run one control line. Returns the broadcast report for `broadcast:`.
    pub async fn handle_command(&self, line: &str) -> Option<BroadcastReport> {
        match ControlCommand::parse(line) {
            ControlCommand::Broadcast(content) => Some(self.broadcast(&content).await),
            ControlCommand::Peers => {
                for peer in self.registry.snapshot() {
                    info!(
                        peer = %peer.id(),
                        direction = %peer.direction(),
                        state = ?peer.state(),
                        "peer"
                    );
                }
                info!(peers = self.registry.len(), "peer count");
                None
            }
            ControlCommand::Unknown(line) => {
                debug!(%line, "ignoring unknown command");
                None
            }
            ControlCommand::Empty => None,
        }
    }

    /// Read control lines from `input` until EOF or shutdown.
    pub async fn read_input<R>(self: Arc<Self>, input: R)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    self.handle_command(&line).await;
                }
                Ok(None) => {
                    debug!("control input closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "reading control input failed");
                    break;
                }
            }
        }
    }

    /// Bind the listener (if enabled) and dial the configured target (if
    /// any), both in the background. Returns once the socket is bound.
    pub async fn launch(self: &Arc<Self>) -> Result<(), NetworkError> {
        if self.config.listen {
            let listener = self.bind().await?;
            self.tracker.spawn(Arc::clone(self).listener(listener));
        }

        match self.config.connect_target() {
            Ok(Some(addr)) => {
                let server = Arc::clone(self);
                self.tracker.spawn(async move {
                    tokio::select! {
                        _ = server.shutdown.cancelled() => {}
                        result = server.connect_to_peer(&addr) => {
                            if let Err(e) = result {
                                error!(error = %e, "outbound connection failed");
                            }
                        }
                    }
                });
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "skipping outbound connection"),
        }
        Ok(())
    }

    /// Launch, serve control input, and block until `shutdown_signal`
    /// resolves. Then shut down.
    pub async fn start<R, S>(self: Arc<Self>, input: R, shutdown_signal: S) -> Result<(), NetworkError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        S: Future<Output = ()>,
    {
        self.launch().await?;
        info!(
            network = %self.config.network,
            net_id = %self.config.net_id(),
            listen = self.config.listen,
            "node started"
        );

        self.tracker.spawn(Arc::clone(&self).read_input(input));

        tokio::select! {
            _ = shutdown_signal => info!("shutdown signal received"),
            _ = self.shutdown.cancelled() => {}
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stop accepting, disconnect every peer and wait for tasks. The whole
    /// sequence is bounded by the configured shutdown timeout.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() && self.tracker.is_closed() {
            return;
        }
        info!(peers = self.registry.len(), "shutting down");
        let deadline = Instant::now() + self.config.shutdown_timeout;
        self.shutdown.cancel();

        let peers = self.registry.snapshot();
        let disconnects = futures::future::join_all(peers.iter().map(|peer| peer.disconnect()));
        if tokio::time::timeout_at(deadline, disconnects).await.is_err() {
            warn!(
                timeout = ?self.config.shutdown_timeout,
                "peers did not disconnect before shutdown timeout"
            );
        }

        self.tracker.close();
        if tokio::time::timeout_at(deadline, self.tracker.wait()).await.is_err() {
            warn!(
                timeout = ?self.config.shutdown_timeout,
                "peer tasks did not finish before shutdown timeout"
            );
        }
        info!("network stopped");
    }
}
