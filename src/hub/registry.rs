//! Registry of live peers
//!
//! The registry is the only shared mutable structure of the hub. Every
//! operation runs entirely under its lock, and none of them performs I/O, so
//! the relay iterates a snapshot without blocking registrations.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::Peer;

/// Registry entry: the peer handle plus its liveness flag
#[derive(Debug)]
struct Entry {
    peer: Arc<Peer>,
    live: bool,
}

/// Process-wide set of connected peers
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<Uuid, Entry>>,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, keyed by its identity
    ///
    /// Inserting a peer that is already present only refreshes its flag.
    pub async fn insert(&self, peer: Arc<Peer>, live: bool) {
        let id = peer.id();
        let mut peers = self.peers.write().await;
        peers
            .entry(id)
            .and_modify(|entry| entry.live = live)
            .or_insert(Entry { peer, live });
        debug!("Registered peer {} ({} total)", id, peers.len());
    }

    /// Remove a peer if present
    ///
    /// Returns whether the peer was a member. The session itself is left open;
    /// closing it belongs to the caller that decided to remove it.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut peers = self.peers.write().await;
        let removed = peers.remove(&id).is_some();
        if removed {
            debug!("Unregistered peer {} ({} remaining)", id, peers.len());
        }
        removed
    }

    /// Copy of the current membership, safe to iterate outside the lock
    pub async fn snapshot(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|entry| entry.live)
            .map(|entry| Arc::clone(&entry.peer))
            .collect()
    }

    /// Check whether a peer is registered
    pub async fn contains(&self, id: Uuid) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    /// Number of registered peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether no peers are registered
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Remove every peer, returning them to the caller
    pub async fn clear(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.peers.write().await;
        peers.drain().map(|(_, entry)| entry.peer).collect()
    }
}
