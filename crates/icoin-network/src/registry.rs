//! Concurrent map of live peers keyed by remote socket address.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::peer::Peer;

/// Cheap to clone; all clones share one map.
#[derive(Clone, Default)]
pub struct Registry {
    peers: Arc<RwLock<HashMap<SocketAddr, Arc<Peer>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `peer`, returning whichever peer previously held its id.
    pub fn add(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.peers.write().insert(peer.id(), peer)
    }

    /// Remove `peer` only if the registry still maps its id to this exact
    /// peer. A newer connection that reused the address stays registered.
    pub fn remove(&self, peer: &Peer) -> bool {
        let mut peers = self.peers.write();
        match peers.get(&peer.id()) {
            Some(existing) if std::ptr::eq(Arc::as_ptr(existing), peer) => {
                peers.remove(&peer.id());
                true
            }
            _ => false,
        }
    }

    pub fn remove_id(&self, id: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers.write().remove(id)
    }

    pub fn get(&self, id: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &SocketAddr) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Copy of the current peer set. Callers iterate this instead of holding
    /// the lock across network I/O.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<SocketAddr> {
        self.peers.read().keys().copied().collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("peers", &self.ids()).finish()
    }
}
