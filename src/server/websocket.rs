//! WebSocket server implementation
//!
//! Listens on a configurable address, upgrades requests for the configured
//! path into websocket sessions and runs the relay that fans messages out to
//! every connected peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::ORIGIN, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use super::handler::{handle_session, HandlerContext};
use super::origin::{policy_from_list, OriginPolicy};
use crate::config::HubConfig;
use crate::hub::{fan_in, PeerRegistry, Relay, MAX_FRAME_LENGTH};
use crate::shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

/// Time sessions get to finish closing on shutdown, on top of the write timeout
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// WebSocket broadcast server
pub struct WebSocketServer {
    config: HubConfig,
    registry: Arc<PeerRegistry>,
    origin_policy: Arc<dyn OriginPolicy>,
    shutdown: ShutdownTrigger,
}

impl WebSocketServer {
    /// Create a new server
    ///
    /// The origin policy is built from `allowed_origins`; see
    /// [`WebSocketServer::with_origin_policy`] to replace it.
    pub fn new(config: HubConfig) -> Self {
        let (shutdown, _) = shutdown_channel();
        let origin_policy: Arc<dyn OriginPolicy> =
            Arc::from(policy_from_list(&config.allowed_origins));
        Self {
            config,
            registry: Arc::new(PeerRegistry::new()),
            origin_policy,
            shutdown,
        }
    }

    /// Replace the origin acceptance policy
    pub fn with_origin_policy(mut self, policy: impl OriginPolicy + 'static) -> Self {
        self.origin_policy = Arc::new(policy);
        self
    }

    /// Get the server configuration
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the peer registry
    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Number of currently registered peers
    pub async fn peer_count(&self) -> usize {
        self.registry.len().await
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.subscribe()
    }

    /// Trigger server shutdown
    ///
    /// Sessions accepted afterwards still observe it and end right away.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    ///
    /// Returns after every session has closed its peer, or after the
    /// shutdown grace period, when the remaining sessions are aborted.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "WebSocket server listening on ws://{}{}",
            local_addr, self.config.path
        );

        let mut shutdown = self.shutdown.subscribe();

        let (queue_tx, queue_rx) = fan_in(self.config.queue_capacity);
        let relay = tokio::spawn(
            Relay::new(queue_rx, Arc::clone(&self.registry)).run(self.shutdown.subscribe()),
        );
        let mut sessions = JoinSet::new();

        let ctx = HandlerContext {
            registry: Arc::clone(&self.registry),
            queue: queue_tx,
            peer_buffer: self.config.peer_buffer,
            write_timeout: self.config.write_timeout(),
        };

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let ctx = ctx.clone();
                            let path = self.config.path.clone();
                            let policy = Arc::clone(&self.origin_policy);
                            let shutdown = self.shutdown.subscribe();

                            sessions.spawn(accept_connection(
                                stream, peer_addr, path, policy, ctx, shutdown,
                            ));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished sessions
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                // Handle shutdown signal
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        drop(ctx);

        if !sessions.is_empty() {
            info!("Waiting for {} active sessions to close...", sessions.len());
        }
        let grace = self.config.write_timeout().unwrap_or_default() + SHUTDOWN_GRACE;
        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} sessions still open after {:?}, aborting",
                sessions.len(),
                grace
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
            // Writers outlive an aborted session; closing the peer stops them
            for peer in self.registry.clear().await {
                peer.close();
            }
        }

        if let Err(e) = relay.await {
            error!("Relay task failed: {}", e);
        }

        Ok(())
    }
}

/// Upgrade one TCP connection and run its session
async fn accept_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    path: String,
    policy: Arc<dyn OriginPolicy>,
    ctx: HandlerContext,
    shutdown: ShutdownSignal,
) {
    debug!("New connection from {}", peer_addr);

    let check_request =
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            check_upgrade(request, &path, policy.as_ref())?;
            Ok(response)
        };

    let ws_stream = match accept_hdr_async_with_config(stream, check_request, Some(session_config()))
        .await
    {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            info!("Upgrade from {} failed: {}", peer_addr, e);
            return;
        }
    };

    handle_session(ws_stream, peer_addr, ctx, shutdown).await;
}

/// Websocket limits for accepted sessions
///
/// Frames and reassembled messages are capped at the codec's message limit,
/// so an oversized payload is refused before it is buffered.
fn session_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_LENGTH);
    config.max_frame_size = Some(MAX_FRAME_LENGTH);
    config
}

/// Decide whether a handshake request may be upgraded
fn check_upgrade(
    request: &Request,
    path: &str,
    policy: &dyn OriginPolicy,
) -> Result<(), ErrorResponse> {
    if request.uri().path() != path {
        return Err(reject(StatusCode::NOT_FOUND, "Not found"));
    }

    let origin = request.headers().get(ORIGIN).and_then(|v| v.to_str().ok());
    if !policy.allows(origin) {
        debug!("Rejected origin {:?}", origin);
        return Err(reject(StatusCode::FORBIDDEN, "Origin not allowed"));
    }

    Ok(())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
