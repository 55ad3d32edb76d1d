//! Connected peer handle
//!
//! A `Peer` is the shared view of one websocket session. The relay pushes
//! encoded frames onto its bounded outbound queue; the session's writer task
//! drains that queue onto the socket. Closing is a one-shot signal observed by
//! both the reader and the writer of the session.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Errors that can occur when writing to a peer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("Peer {0} is closed")]
    Closed(Uuid),

    #[error("Peer {0} outbound queue is full")]
    Backlogged(Uuid),
}

/// Result type for peer operations
pub type PeerResult<T> = Result<T, PeerError>;

/// Shared handle to a live session
#[derive(Debug)]
pub struct Peer {
    /// Identity of the session
    id: Uuid,
    /// Remote address, informational only
    addr: SocketAddr,
    /// Encoded frames waiting for the writer
    outbound: mpsc::Sender<String>,
    /// Set to true exactly once, when the session is closed
    closed: watch::Sender<bool>,
}

/// Receiving side of a peer, owned by the session's writer task
#[derive(Debug)]
pub struct PeerOutbox {
    /// Frames to write, in relay order
    pub frames: mpsc::Receiver<String>,
    /// Close signal for the writer
    pub closed: watch::Receiver<bool>,
}

impl Peer {
    /// Create a peer with an outbound queue of the given capacity
    pub fn new(addr: SocketAddr, outbound_capacity: usize) -> (Arc<Self>, PeerOutbox) {
        let (outbound, frames) = mpsc::channel(outbound_capacity.max(1));
        let (closed, closed_rx) = watch::channel(false);

        let peer = Arc::new(Self {
            id: Uuid::new_v4(),
            addr,
            outbound,
            closed,
        });

        (
            peer,
            PeerOutbox {
                frames,
                closed: closed_rx,
            },
        )
    }

    /// Get the peer identity
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the remote address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue an encoded frame for the writer without waiting
    pub fn send(&self, frame: String) -> PeerResult<()> {
        if self.is_closed() {
            return Err(PeerError::Closed(self.id));
        }

        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::Backlogged(self.id),
            mpsc::error::TrySendError::Closed(_) => PeerError::Closed(self.id),
        })
    }

    /// Close the session
    ///
    /// Returns `true` for the caller that actually closed it; every later call
    /// is a no-op returning `false`.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the session is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_peers_have_distinct_ids() {
        let (a, _a_out) = Peer::new(addr(), 4);
        let (b, _b_out) = Peer::new(addr(), 4);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.addr(), addr());
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let (peer, mut outbox) = Peer::new(addr(), 8);
        for i in 0..5 {
            peer.send(format!("frame-{}", i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(outbox.frames.recv().await.unwrap(), format!("frame-{}", i));
        }
    }

    #[test]
    fn test_send_backlogged() {
        let (peer, _outbox) = Peer::new(addr(), 1);
        peer.send("one".to_string()).unwrap();
        assert_eq!(
            peer.send("two".to_string()),
            Err(PeerError::Backlogged(peer.id()))
        );
    }

    #[test]
    fn test_send_after_writer_gone() {
        let (peer, outbox) = Peer::new(addr(), 4);
        drop(outbox);
        assert_eq!(peer.send("x".to_string()), Err(PeerError::Closed(peer.id())));
    }

    #[test]
    fn test_close_is_one_shot() {
        let (peer, outbox) = Peer::new(addr(), 4);
        assert!(!peer.is_closed());
        assert!(peer.close());
        assert!(!peer.close());
        assert!(!peer.close());
        assert!(peer.is_closed());
        assert!(*outbox.closed.borrow());
    }

    #[test]
    fn test_send_after_close() {
        let (peer, _outbox) = Peer::new(addr(), 4);
        peer.close();
        assert_eq!(peer.send("x".to_string()), Err(PeerError::Closed(peer.id())));
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let (peer, _outbox) = Peer::new(addr(), 4);
        let waiter = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.closed().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        peer.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_returns_immediately_when_already_closed() {
        let (peer, _outbox) = Peer::new(addr(), 4);
        peer.close();
        tokio::time::timeout(Duration::from_secs(1), peer.closed())
            .await
            .expect("closed() should not block");
    }
}
