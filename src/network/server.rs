//! WebSocket Broker Server
//!
//! Accepts client connections, authenticates the handshake and runs one
//! [`TransportBridge`] per client. Outbound diff frames and control replies
//! share a single writer task per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::core::{CancelHandle, Context};
use crate::network::auth::{validate_token, AuthConfig, AuthError};
use crate::network::bandwidth::BandwidthRegulator;
use crate::network::bridge::{BridgeError, FrameSink, TransportBridge};
use crate::network::protocol::{
    ClientMessage, DiffFrame, ErrorCode, HelloRequest, IntentFrame, ServerMessage, WelcomeInfo,
};

/// Time a new connection has to send its hello.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection outbound message queue.
const OUTBOUND_QUEUE: usize = 64;

/// Per-connection inbound intent queue.
const INTENT_QUEUE: usize = 32;

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Client broke the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Decrements the live connection count when dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outbound half of a client connection as seen by the bridge.
struct ClientFrames(mpsc::Sender<ServerMessage>);

impl FrameSink for ClientFrames {
    fn send(&mut self, frame: DiffFrame) -> impl Future<Output = Result<(), BridgeError>> + Send {
        async move {
            self.0
                .send(ServerMessage::Diff(frame))
                .await
                .map_err(|_| BridgeError::Transport("connection writer closed".to_string()))
        }
    }
}

/// The broker's WebSocket front end.
pub struct BrokerServer {
    config: BrokerConfig,
    auth: AuthConfig,
    broker: Arc<Broker>,
    bandwidth: Option<Arc<BandwidthRegulator>>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BrokerServer {
    /// Create a server in front of `broker`.
    pub fn new(config: BrokerConfig, broker: Arc<Broker>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            auth: config.auth_config(),
            bandwidth: config.bandwidth_regulator(),
            config,
            broker,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Shared outbound byte budget, if configured.
    pub fn bandwidth(&self) -> Option<&Arc<BandwidthRegulator>> {
        self.bandwidth.as_ref()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => info!("Broker listening on {}", addr),
            Err(e) => warn!("Broker listening on unknown address: {}", e),
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => self.admit(stream, addr),
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let active = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = ConnectionSlot(self.connections.clone());

        if self.config.max_clients > 0 && active > self.config.max_clients {
            warn!("Connection limit reached, rejecting {}", addr);
            tokio::spawn(async move {
                let _slot = slot;
                if let Ok(mut ws) = accept_async(stream).await {
                    if let Ok(text) = ServerMessage::error(ErrorCode::ServerOverloaded, "server full").to_json() {
                        let _ = ws.send(Message::Text(text)).await;
                    }
                    let _ = ws.close(None).await;
                }
            });
            return;
        }

        info!("New connection from {}", addr);
        let connection = Connection {
            addr,
            auth: self.auth.clone(),
            config: self.config.clone(),
            broker: self.broker.clone(),
            bandwidth: self.bandwidth.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        tokio::spawn(async move {
            let _slot = slot;
            if let Err(e) = connection.run(stream).await {
                debug!("Connection {} ended: {}", addr, e);
            }
        });
    }
}

/// Resolve the client id for a handshake.
pub fn authenticate(hello: &HelloRequest, auth: &AuthConfig) -> Result<String, ServerMessage> {
    if !auth.is_configured() {
        let requested = hello
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        return Ok(match requested {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        });
    }

    let Some(token) = hello.token.as_deref() else {
        return Err(ServerMessage::error(ErrorCode::AuthFailed, "token required"));
    };
    match validate_token(token, auth) {
        Ok(claims) => Ok(claims.sub.trim().to_string()),
        Err(AuthError::Expired) => Err(ServerMessage::error(ErrorCode::TokenExpired, "token expired")),
        Err(e) => Err(ServerMessage::error(ErrorCode::InvalidToken, e.to_string())),
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

type ClientStream = SplitStream<WebSocketStream<TcpStream>>;

/// One accepted client.
struct Connection {
    addr: SocketAddr,
    auth: AuthConfig,
    config: BrokerConfig,
    broker: Arc<Broker>,
    bandwidth: Option<Arc<BandwidthRegulator>>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) -> Result<(), ServerError> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);

        let addr = self.addr;
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!("Writer for {} stopped", addr);
        });

        let result = match self.handshake(&mut ws_receiver, &out_tx).await {
            Ok(client_id) => self.session(client_id, &mut ws_receiver, &out_tx).await,
            Err(e) => Err(e),
        };

        drop(out_tx);
        if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
            debug!("Writer for {} did not flush in time", addr);
        }
        info!("Client {} cleaned up", addr);
        result
    }

    async fn handshake(
        &mut self,
        ws_receiver: &mut ClientStream,
        out_tx: &mpsc::Sender<ServerMessage>,
    ) -> Result<String, ServerError> {
        let first = tokio::select! {
            _ = self.shutdown_rx.recv() => {
                return Err(ServerError::Protocol("shutdown during handshake".to_string()));
            }
            first = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_client_message(ws_receiver)) => first,
        };

        let hello = match first {
            Err(_) => {
                let _ = out_tx
                    .send(ServerMessage::error(ErrorCode::NotAuthenticated, "handshake timed out"))
                    .await;
                return Err(ServerError::Protocol("handshake timed out".to_string()));
            }
            Ok(None) => return Err(ServerError::Protocol("closed before hello".to_string())),
            Ok(Some(Ok(ClientMessage::Hello(hello)))) => hello,
            Ok(Some(Ok(_))) | Ok(Some(Err(_))) => {
                let _ = out_tx
                    .send(ServerMessage::error(ErrorCode::NotAuthenticated, "first message must be hello"))
                    .await;
                return Err(ServerError::Protocol("first message was not hello".to_string()));
            }
        };

        let client_id = match authenticate(&hello, &self.auth) {
            Ok(client_id) => client_id,
            Err(reply) => {
                warn!("Authentication failed for {}", self.addr);
                let _ = out_tx.send(reply).await;
                return Err(ServerError::Protocol("authentication failed".to_string()));
            }
        };

        let welcome = ServerMessage::Welcome(WelcomeInfo {
            client_id: client_id.clone(),
            encoding: crate::network::GzipCompressor::NAME.to_string(),
            outbound_rate_hz: self.config.outbound_rate_hz,
            server_version: crate::VERSION.to_string(),
        });
        out_tx
            .send(welcome)
            .await
            .map_err(|_| ServerError::Protocol("writer closed".to_string()))?;
        info!(client = %client_id, version = %hello.client_version, "Client {} authenticated", self.addr);
        Ok(client_id)
    }

    async fn session(
        &mut self,
        client_id: String,
        ws_receiver: &mut ClientStream,
        out_tx: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), ServerError> {
        let mut bridge = TransportBridge::new(self.broker.clone(), self.config.bridge_config());
        if let Some(regulator) = &self.bandwidth {
            bridge = bridge.with_bandwidth(regulator.clone());
        }
        let bridge = Arc::new(bridge);
        let (ctx, cancel) = Context::with_cancel();

        let outbound = spawn_outbound(&bridge, &ctx, &cancel, &client_id, out_tx);
        let mut intents: Option<mpsc::Sender<IntentFrame>> = None;
        let mut intent_tasks: Vec<JoinHandle<()>> = Vec::new();

        let result = loop {
            let message = tokio::select! {
                _ = ctx.cancelled() => break Ok(()),
                _ = self.shutdown_rx.recv() => {
                    let _ = out_tx
                        .send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        })
                        .await;
                    break Ok(());
                }
                message = next_client_message(ws_receiver) => message,
            };

            let message = match message {
                None => {
                    debug!(client = %client_id, "Client {} disconnected", self.addr);
                    break Ok(());
                }
                Some(Err(e)) => {
                    if matches!(e, ServerError::WebSocket(_)) {
                        break Err(e);
                    }
                    debug!(client = %client_id, error = %e, "Invalid message");
                    let _ = out_tx
                        .send(ServerMessage::error(ErrorCode::InvalidArgument, "Invalid message format"))
                        .await;
                    continue;
                }
                Some(Ok(message)) => message,
            };

            match message {
                ClientMessage::Intent(mut frame) => {
                    frame.client_id = client_id.clone();
                    let sender = intents.get_or_insert_with(|| {
                        let (tx, rx) = mpsc::channel(INTENT_QUEUE);
                        intent_tasks.push(spawn_inbound(&bridge, &ctx, &cancel, rx, out_tx));
                        tx
                    });
                    if sender.send(frame).await.is_err() {
                        intents = None;
                    }
                }
                ClientMessage::EndIntents => {
                    // Dropping the sender ends the intent stream; its task replies
                    intents = None;
                }
                ClientMessage::Ack { sequence } => {
                    if let Err(e) = self.broker.ack(&client_id, sequence) {
                        debug!(client = %client_id, error = %e, "Rejected ack");
                        let _ = out_tx
                            .send(ServerMessage::error(ErrorCode::InvalidArgument, e.to_string()))
                            .await;
                    }
                }
                ClientMessage::Ping { timestamp } => {
                    let _ = out_tx
                        .send(ServerMessage::Pong {
                            timestamp,
                            server_time: unix_millis(),
                        })
                        .await;
                }
                ClientMessage::Hello(_) => {
                    let _ = out_tx
                        .send(ServerMessage::error(ErrorCode::InvalidArgument, "already authenticated"))
                        .await;
                }
            }
        };

        drop(intents);
        for task in intent_tasks {
            let _ = task.await;
        }
        cancel.cancel();
        let _ = outbound.await;
        self.broker.ledger().forget_client(&client_id);
        if let Some(regulator) = &self.bandwidth {
            regulator.forget(&client_id);
        }
        result
    }
}

/// Read the next protocol message, skipping transport control frames.
async fn next_client_message(ws_receiver: &mut ClientStream) -> Option<Result<ClientMessage, ServerError>> {
    loop {
        let message = match ws_receiver.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e.into())),
        };
        match message {
            Message::Text(text) => {
                return Some(ClientMessage::from_json(&text).map_err(|e| ServerError::Protocol(e.to_string())));
            }
            // Binary frames carry bincode-encoded intents
            Message::Binary(data) => {
                return Some(
                    IntentFrame::from_bytes(&data)
                        .map(ClientMessage::Intent)
                        .map_err(|e| ServerError::Protocol(e.to_string())),
                );
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

fn spawn_outbound(
    bridge: &Arc<TransportBridge<Broker>>,
    ctx: &Context,
    cancel: &CancelHandle,
    client_id: &str,
    out_tx: &mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    let bridge = bridge.clone();
    let ctx = ctx.clone();
    let cancel = cancel.clone();
    let client_id = client_id.to_string();
    let out_tx = out_tx.clone();

    tokio::spawn(async move {
        let mut sink = ClientFrames(out_tx.clone());
        match bridge.stream_state_diffs(&ctx, &client_id, &mut sink).await {
            Ok(report) => {
                info!(client = %client_id, frames = report.frames_sent, "Diff stream closed");
                let _ = out_tx
                    .send(ServerMessage::Shutdown {
                        reason: "diff stream closed".to_string(),
                    })
                    .await;
            }
            Err(BridgeError::Canceled) => {}
            Err(e) => {
                warn!(client = %client_id, error = %e, "Diff stream failed");
                let _ = out_tx.send(ServerMessage::error(e.code(), e.to_string())).await;
            }
        }
        cancel.cancel();
    })
}

fn spawn_inbound(
    bridge: &Arc<TransportBridge<Broker>>,
    ctx: &Context,
    cancel: &CancelHandle,
    mut intents: mpsc::Receiver<IntentFrame>,
    out_tx: &mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    let bridge = bridge.clone();
    let ctx = ctx.clone();
    let cancel = cancel.clone();
    let out_tx = out_tx.clone();

    tokio::spawn(async move {
        match bridge.publish_intents(&ctx, &mut intents).await {
            Ok(ack) => {
                let _ = out_tx.send(ServerMessage::IntentAck(ack)).await;
            }
            Err(BridgeError::Canceled) => {}
            Err(e) => {
                warn!(error = %e, "Intent stream failed");
                let _ = out_tx.send(ServerMessage::error(e.code(), e.to_string())).await;
                cancel.cancel();
            }
        }
    })
}

// =============================================================================
// TESTS
// =============================================================================
