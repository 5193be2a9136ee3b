//! Shared helpers for the loopback scenarios.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use icoin_core::constants::{NetId, NetworkType};
use icoin_core::error::NetworkError;
use icoin_network::{Message, MessageHeader, NetworkConfig, NetworkEvent, Peer, Server};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Upper bound for any single wait in a scenario.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback config on an OS-assigned port.
pub fn local_config(network: NetworkType) -> NetworkConfig {
    NetworkConfig {
        listen_addr: "127.0.0.1".to_string(),
        listen_port: 0,
        ..NetworkConfig::for_network(network)
    }
}

/// Launch a listening node and return it with its bound address.
pub async fn listening_node(config: NetworkConfig) -> (Arc<Server>, SocketAddr) {
    let server = Server::new(config);
    server.launch().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// A node that never listens, for dialing other nodes.
pub fn dialing_node(network: NetworkType) -> Arc<Server> {
    Server::new(NetworkConfig {
        listen: false,
        ..local_config(network)
    })
}

/// Poll `check` until it holds or the scenario timeout elapses.
pub async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(SCENARIO_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached before timeout");
}

/// Wait for the first event `select` maps to `Some`.
pub async fn next_matching<T, F>(events: &mut broadcast::Receiver<NetworkEvent>, mut select: F) -> T
where
    F: FnMut(NetworkEvent) -> Option<T>,
{
    tokio::time::timeout(SCENARIO_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = select(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not received before timeout")
}

/// Wait until every registered peer on `server` is active.
pub async fn wait_all_active(server: &Server, count: usize) {
    wait_until(|| {
        let peers = server.registry().snapshot();
        peers.len() == count && peers.iter().all(|p| p.is_active())
    })
    .await;
}

/// Raw bytes of one frame, for clients that bypass the peer machinery.
pub fn raw_frame(magic: NetId, message: &Message) -> Vec<u8> {
    let payload = message.to_payload().unwrap();
    let header = MessageHeader::new(magic, message.command(), &payload).unwrap();
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(&payload);
    frame
}

/// Connect to `addr` with a tiny receive buffer. The caller never reads, so
/// the server side's writes back up quickly.
pub async fn stalled_client(addr: SocketAddr) -> TcpStream {
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    socket.connect(addr).await.unwrap()
}

/// Write 1 MiB broadcasts to `peer` until a write fails; returns that error.
pub fn flood(peer: Arc<Peer>) -> JoinHandle<NetworkError> {
    tokio::spawn(async move {
        let chunk = Message::broadcast("x".repeat(1024 * 1024));
        loop {
            if let Err(e) = peer.write_message(&chunk).await {
                return e;
            }
        }
    })
}
