//! Fan-in queue and relay
//!
//! Connection handlers push decoded messages onto a single bounded queue. One
//! relay task drains it and hands each message to every registered peer. A
//! peer that cannot take the frame is evicted; the broadcast carries on with
//! the rest of the snapshot.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Message, PeerRegistry};
use crate::shutdown::ShutdownSignal;

/// Default capacity of the fan-in queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Outcome of offering a message to the fan-in queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The message is queued for broadcast
    Queued,
    /// The queue was full and the message was discarded
    Dropped,
    /// The relay is gone
    Closed,
}

/// Producer side of the fan-in queue, one clone per connection handler
#[derive(Debug, Clone)]
pub struct FanInSender {
    tx: mpsc::Sender<Message>,
}

/// Consumer side of the fan-in queue, owned by the relay
#[derive(Debug)]
pub struct FanInReceiver {
    rx: mpsc::Receiver<Message>,
}

/// Create the fan-in queue
pub fn fan_in(capacity: usize) -> (FanInSender, FanInReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FanInSender { tx }, FanInReceiver { rx })
}

impl FanInSender {
    /// Offer a message without waiting for queue space
    pub fn offer(&self, message: Message) -> Enqueued {
        match self.tx.try_send(message) {
            Ok(()) => Enqueued::Queued,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    "Fan-in queue full, dropping message {} (schema {})",
                    message.id, message.schema_id
                );
                Enqueued::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueued::Closed,
        }
    }
}

impl FanInReceiver {
    /// Wait for the next queued message
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Stop accepting messages and discard whatever is still queued
    ///
    /// Returns the number of discarded messages.
    pub fn close_and_discard(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

/// Result of broadcasting one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers that accepted the frame
    pub delivered: usize,
    /// Peers removed because the frame could not be written
    pub evicted: usize,
}

/// The single consumer of the fan-in queue
pub struct Relay {
    queue: FanInReceiver,
    registry: Arc<PeerRegistry>,
}

impl Relay {
    /// Create a relay over the given queue and registry
    pub fn new(queue: FanInReceiver, registry: Arc<PeerRegistry>) -> Self {
        Self { queue, registry }
    }

    /// Write one message to every registered peer
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        // Encode once so every peer gets the identical frame
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode message {}: {}", message.id, e);
                return report;
            }
        };

        for peer in self.registry.snapshot().await {
            match peer.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    info!("Write to {} failed, evicting: {}", peer.addr(), e);
                    // Close before removing so the writer stops first
                    peer.close();
                    self.registry.remove(peer.id()).await;
                    report.evicted += 1;
                }
            }
        }

        report
    }

    /// Drain the queue until it closes or shutdown is signalled
    ///
    /// Messages still queued at shutdown are discarded.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!("Relay started");

        loop {
            tokio::select! {
                next = self.queue.recv() => {
                    let Some(message) = next else {
                        debug!("Fan-in queue closed");
                        break;
                    };
                    let report = self.broadcast(&message).await;
                    debug!(
                        "Relayed message {} to {} peers ({} evicted)",
                        message.id, report.delivered, report.evicted
                    );
                }
                _ = shutdown.recv() => {
                    let discarded = self.queue.close_and_discard();
                    if discarded > 0 {
                        info!("Discarded {} queued messages on shutdown", discarded);
                    }
                    break;
                }
            }
        }

        info!("Relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Peer, PeerOutbox};
    use crate::shutdown::shutdown_channel;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:6000".parse().unwrap()
    }

    async fn registered(registry: &PeerRegistry, capacity: usize) -> (Arc<Peer>, PeerOutbox) {
        let (peer, outbox) = Peer::new(addr(), capacity);
        registry.insert(Arc::clone(&peer), true).await;
        (peer, outbox)
    }

    #[test]
    fn test_offer_drops_when_full() {
        let (tx, _rx) = fan_in(1);
        assert_eq!(tx.offer(Message::new("1", "s", 1)), Enqueued::Queued);
        assert_eq!(tx.offer(Message::new("2", "s", 1)), Enqueued::Dropped);
    }

    #[test]
    fn test_offer_after_relay_gone() {
        let (tx, rx) = fan_in(4);
        drop(rx);
        assert_eq!(tx.offer(Message::new("1", "s", 1)), Enqueued::Closed);
    }

    #[test]
    fn test_close_and_discard() {
        let (tx, mut rx) = fan_in(4);
        tx.offer(Message::new("1", "s", 1));
        tx.offer(Message::new("2", "s", 1));
        assert_eq!(rx.close_and_discard(), 2);
        assert_eq!(tx.offer(Message::new("3", "s", 1)), Enqueued::Closed);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        let registry = Arc::new(PeerRegistry::new());
        let (_tx, rx) = fan_in(4);
        let relay = Relay::new(rx, Arc::clone(&registry));

        let mut outboxes = Vec::new();
        for _ in 0..3 {
            outboxes.push(registered(&registry, 4).await);
        }

        let message = Message::new("x", "s", 7);
        let report = relay.broadcast(&message).await;
        assert_eq!(report, BroadcastReport { delivered: 3, evicted: 0 });

        let expected = message.to_json().unwrap();
        for (_, outbox) in outboxes.iter_mut() {
            assert_eq!(outbox.frames.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers() {
        let registry = Arc::new(PeerRegistry::new());
        let (_tx, rx) = fan_in(4);
        let relay = Relay::new(rx, registry);
        let report = relay.broadcast(&Message::new("x", "s", 1)).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_failed_peer_is_evicted_and_others_still_receive() {
        let registry = Arc::new(PeerRegistry::new());
        let (_tx, rx) = fan_in(4);
        let relay = Relay::new(rx, Arc::clone(&registry));

        let (good_a, mut out_a) = registered(&registry, 4).await;
        let (dead, dead_outbox) = registered(&registry, 4).await;
        let (good_b, mut out_b) = registered(&registry, 4).await;
        drop(dead_outbox);

        let report = relay.broadcast(&Message::new("m", "s", 1)).await;
        assert_eq!(report, BroadcastReport { delivered: 2, evicted: 1 });

        assert!(!registry.contains(dead.id()).await);
        assert!(dead.is_closed());
        assert!(registry.contains(good_a.id()).await);
        assert!(registry.contains(good_b.id()).await);
        assert!(out_a.frames.recv().await.is_some());
        assert!(out_b.frames.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_backlogged_peer_is_evicted() {
        let registry = Arc::new(PeerRegistry::new());
        let (_tx, rx) = fan_in(4);
        let relay = Relay::new(rx, Arc::clone(&registry));

        let (slow, _slow_outbox) = registered(&registry, 1).await;
        relay.broadcast(&Message::new("1", "s", 1)).await;
        let report = relay.broadcast(&Message::new("2", "s", 1)).await;

        assert_eq!(report.evicted, 1);
        assert!(slow.is_closed());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_evicted_peer_receives_nothing_further() {
        let registry = Arc::new(PeerRegistry::new());
        let (_tx, rx) = fan_in(4);
        let relay = Relay::new(rx, Arc::clone(&registry));

        let (peer, mut outbox) = registered(&registry, 8).await;
        relay.broadcast(&Message::new("1", "s", 1)).await;
        registry.remove(peer.id()).await;
        peer.close();
        relay.broadcast(&Message::new("2", "s", 1)).await;

        assert!(outbox.frames.recv().await.unwrap().contains("\"ID\":\"1\""));
        assert!(outbox.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_preserves_publisher_order() {
        let registry = Arc::new(PeerRegistry::new());
        let (tx, rx) = fan_in(32);
        let (_peer, mut outbox) = registered(&registry, 32).await;

        let (trigger, shutdown) = shutdown_channel();
        let relay = tokio::spawn(Relay::new(rx, Arc::clone(&registry)).run(shutdown));

        for i in 1..=10 {
            assert_eq!(tx.offer(Message::new(i.to_string(), "s", i)), Enqueued::Queued);
        }

        for i in 1..=10 {
            let frame = tokio::time::timeout(Duration::from_secs(1), outbox.frames.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(Message::from_json(&frame).unwrap().message_type, i);
        }

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_when_queue_closes() {
        let registry = Arc::new(PeerRegistry::new());
        let (tx, rx) = fan_in(4);
        let (_trigger, shutdown) = shutdown_channel();
        let relay = tokio::spawn(Relay::new(rx, registry).run(shutdown));

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_started_after_shutdown_stops() {
        let registry = Arc::new(PeerRegistry::new());
        let (tx, rx) = fan_in(4);
        let (trigger, _shutdown) = shutdown_channel();
        trigger.trigger();

        tx.offer(Message::new("1", "s", 1));
        let relay = tokio::spawn(Relay::new(rx, registry).run(trigger.subscribe()));

        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.offer(Message::new("2", "s", 1)), Enqueued::Closed);
    }
}
