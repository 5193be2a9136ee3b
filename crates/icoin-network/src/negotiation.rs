//! Protocol negotiation strategies.
//!
//! A [`Negotiator`] runs once per connection, between registration and the
//! read loop, bounded by the negotiation timeout. Swapping the strategy does
//! not touch the read-loop plumbing in [`crate::peer`].

use std::sync::Arc;

use async_trait::async_trait;
use icoin_core::constants::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, USER_AGENT};
use icoin_core::error::NetworkError;
use tracing::{debug, info};

use crate::config::HandshakeMode;
use crate::peer::Peer;
use crate::protocol::{Message, MsgVersion};

#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Negotiate with a peer that connected to us.
    async fn negotiate_inbound(&self, peer: &Peer) -> Result<(), NetworkError>;

    /// Negotiate with a peer we dialed.
    async fn negotiate_outbound(&self, peer: &Peer) -> Result<(), NetworkError>;
}

/// Build the negotiator selected by `mode`.
pub fn negotiator_for(mode: HandshakeMode) -> Arc<dyn Negotiator> {
    match mode {
        HandshakeMode::None => Arc::new(AcceptAll),
        HandshakeMode::Version => Arc::new(VersionHandshake::default()),
    }
}

/// Accepts every connection without exchanging any message.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl Negotiator for AcceptAll {
    async fn negotiate_inbound(&self, _peer: &Peer) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn negotiate_outbound(&self, _peer: &Peer) -> Result<(), NetworkError> {
        Ok(())
    }
}

/// Exchanges `version` messages. The dialer speaks first; the listener reads
/// the remote version before answering with its own.
#[derive(Debug, Clone)]
pub struct VersionHandshake {
    version: u32,
    min_version: u32,
    user_agent: String,
}

impl Default for VersionHandshake {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, USER_AGENT)
    }
}

impl VersionHandshake {
    pub fn new(version: u32, min_version: u32, user_agent: impl Into<String>) -> Self {
        Self {
            version,
            min_version,
            user_agent: user_agent.into(),
        }
    }

    async fn read_remote_version(&self, peer: &Peer) -> Result<MsgVersion, NetworkError> {
        let message = peer.read_message().await.map_err(|e| {
            NetworkError::NegotiationFailure(format!("reading remote version: {e}"))
        })?;

        let remote = match message {
            Message::Version(v) => v,
            other => {
                return Err(NetworkError::NegotiationFailure(format!(
                    "expected version, got {}",
                    other.command()
                )));
            }
        };

        if remote.version < self.min_version {
            return Err(NetworkError::NegotiationFailure(format!(
                "remote protocol version {} below minimum {}",
                remote.version, self.min_version
            )));
        }

        info!(
            peer = %peer.id(),
            version = remote.version,
            user_agent = %remote.user_agent,
            "received remote version"
        );
        Ok(remote)
    }

    async fn write_local_version(&self, peer: &Peer) -> Result<(), NetworkError> {
        debug!(peer = %peer.id(), version = self.version, "sending local version");
        peer.send(&Message::version(self.version, self.user_agent.clone()))
            .await
            .map_err(|e| NetworkError::NegotiationFailure(format!("sending local version: {e}")))
    }
}

#[async_trait]
impl Negotiator for VersionHandshake {
    async fn negotiate_inbound(&self, peer: &Peer) -> Result<(), NetworkError> {
        self.read_remote_version(peer).await?;
        self.write_local_version(peer).await
    }

    async fn negotiate_outbound(&self, peer: &Peer) -> Result<(), NetworkError> {
        self.write_local_version(peer).await?;
        self.read_remote_version(peer).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerState;
    use crate::registry::Registry;
    use crate::test_support::{context, loopback_peers};
    use std::time::Duration;

    #[tokio::test]
    async fn version_handshake_activates_both_sides() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(VersionHandshake::default()));
        let (outbound, inbound) = loopback_peers(&ctx).await;

        let (out_res, in_res) = tokio::join!(outbound.start(), inbound.start());
        out_res.unwrap();
        in_res.unwrap();
        assert_eq!(outbound.state(), PeerState::Active);
        assert_eq!(inbound.state(), PeerState::Active);
    }

    #[tokio::test]
    async fn inbound_rejects_non_version_first_message() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(VersionHandshake::default()));
        let (outbound, inbound) = loopback_peers(&ctx).await;

        outbound.send(&Message::broadcast("too early")).await.unwrap();
        let err = inbound.start().await.unwrap_err();
        match err {
            NetworkError::NegotiationFailure(reason) => {
                assert!(reason.contains("expected version"), "{reason}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn outdated_remote_version_rejected() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let (outbound, inbound) = loopback_peers(&ctx).await;

        outbound.send(&Message::version(1, "/old/")).await.unwrap();
        let strict = VersionHandshake::new(3, 2, "/new/");
        match strict.negotiate_inbound(&inbound).await.unwrap_err() {
            NetworkError::NegotiationFailure(reason) => {
                assert!(reason.contains("below minimum"), "{reason}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn accept_all_never_touches_the_stream() {
        let registry = Registry::new();
        let ctx = context(&registry, Arc::new(AcceptAll));
        let (outbound, inbound) = loopback_peers(&ctx).await;

        AcceptAll.negotiate_inbound(&inbound).await.unwrap();
        AcceptAll.negotiate_outbound(&outbound).await.unwrap();
        assert_eq!(inbound.state(), PeerState::Created);
    }

    #[tokio::test]
    async fn silent_dialer_times_out_inbound_handshake() {
        let registry = Registry::new();
        let mut ctx = context(&registry, Arc::new(VersionHandshake::default()));
        ctx.negotiate_timeout = Duration::from_millis(50);
        let (_outbound, inbound) = loopback_peers(&ctx).await;

        let err = inbound.start().await.unwrap_err();
        assert_eq!(err, NetworkError::NegotiationTimeout(Duration::from_millis(50)));
    }
}
