//! WebSocket session handling
//!
//! Each upgraded session runs two tasks: the handler, which reads and decodes
//! frames and pushes them onto the fan-in queue, and the writer, which owns the
//! write half and drains the peer's outbound queue onto the socket. Whichever
//! side sees a fatal error first closes the peer and removes it from the
//! registry; the close signal then stops the other side. Once a peer is
//! closed the writer starts no further frame writes, even if some are still
//! queued.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::hub::{Enqueued, FanInSender, Message, Peer, PeerOutbox, PeerRegistry};
use crate::shutdown::ShutdownSignal;

/// Shared state handed to every session
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Registry the session joins
    pub registry: Arc<PeerRegistry>,
    /// Fan-in queue feeding the relay
    pub queue: FanInSender,
    /// Capacity of the peer's outbound queue
    pub peer_buffer: usize,
    /// Upper bound on a single socket write
    pub write_timeout: Option<Duration>,
}

/// Why a session's read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the connection or the stream ended
    Disconnected,
    /// The peer sent a frame that is not a valid message
    Malformed,
    /// Reading from the socket failed
    ReadError,
    /// The session was closed from outside, e.g. evicted by the relay
    Closed,
    /// The relay is no longer accepting messages
    RelayStopped,
    /// The server is shutting down
    Shutdown,
}

/// Run a session from registration to close
///
/// Returns once the peer has been removed from the registry and its writer
/// has finished closing the socket.
pub async fn handle_session<S>(
    ws_stream: WebSocketStream<S>,
    peer_addr: SocketAddr,
    ctx: HandlerContext,
    mut shutdown: ShutdownSignal,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let (peer, outbox) = Peer::new(peer_addr, ctx.peer_buffer);

    let writer = tokio::spawn(run_writer(
        ws_sender,
        Arc::clone(&peer),
        outbox,
        Arc::clone(&ctx.registry),
        ctx.write_timeout,
    ));

    ctx.registry.insert(Arc::clone(&peer), true).await;
    info!("Peer {} connected from {}", peer.id(), peer_addr);

    let end = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let decoded = match msg {
                    Some(Ok(WsMessage::Text(text))) => Message::from_json(&text),
                    Some(Ok(WsMessage::Binary(data))) => Message::from_bytes(&data),
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                        // Pongs are queued by the websocket layer
                        continue;
                    }
                    Some(Ok(WsMessage::Frame(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Peer {} disconnected", peer_addr);
                        break SessionEnd::Disconnected;
                    }
                    Some(Err(e)) => {
                        info!("Read error from {}: {}", peer_addr, e);
                        break SessionEnd::ReadError;
                    }
                };

                let message = match decoded {
                    Ok(message) => message,
                    Err(e) => {
                        info!("Dropping peer {}: {}", peer_addr, e);
                        break SessionEnd::Malformed;
                    }
                };

                debug!(
                    "Received message {} (schema {}, type {}) from {}",
                    message.id, message.schema_id, message.message_type, peer_addr
                );

                // A full queue drops the frame but keeps the peer
                if ctx.queue.offer(message) == Enqueued::Closed {
                    break SessionEnd::RelayStopped;
                }
            }
            _ = peer.closed() => {
                debug!("Peer {} closed by the relay", peer_addr);
                break SessionEnd::Closed;
            }
            _ = shutdown.recv() => {
                debug!("Shutdown signal received, closing connection to {}", peer_addr);
                break SessionEnd::Shutdown;
            }
        }
    };

    peer.close();
    ctx.registry.remove(peer.id()).await;
    if let Err(e) = writer.await {
        warn!("Writer task for {} failed: {}", peer_addr, e);
    }

    info!("Connection from {} closed ({:?})", peer_addr, end);
    end
}

/// Drain a peer's outbound queue onto the socket until the peer is closed
async fn run_writer<S>(
    mut ws_sender: SplitSink<WebSocketStream<S>, WsMessage>,
    peer: Arc<Peer>,
    mut outbox: PeerOutbox,
    registry: Arc<PeerRegistry>,
    write_timeout: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            // Fires once, when the flag flips to closed
            _ = outbox.closed.changed() => break,
            frame = outbox.frames.recv() => {
                let Some(frame) = frame else { break };
                if peer.is_closed() {
                    break;
                }
                if let Err(e) = send_bounded(&mut ws_sender, WsMessage::Text(frame), write_timeout).await {
                    info!("Write to {} failed: {}", peer.addr(), e);
                    peer.close();
                    registry.remove(peer.id()).await;
                    break;
                }
            }
        }
    }

    // Close the socket exactly once; this also sends the close frame
    let close = ws_sender.close();
    let result = match write_timeout {
        Some(limit) => tokio::time::timeout(limit, close)
            .await
            .unwrap_or_else(|_| Ok(())),
        None => close.await,
    };
    if let Err(e) = result {
        debug!("Close handshake with {} failed: {}", peer.addr(), e);
    }
}

/// Send one frame, giving up after `limit`
async fn send_bounded<S>(
    ws_sender: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    frame: WsMessage,
    limit: Option<Duration>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, ws_sender.send(frame))
            .await
            .map_err(|_| anyhow::anyhow!("write timed out after {:?}", limit))??,
        None => ws_sender.send(frame).await?,
    }
    Ok(())
}
