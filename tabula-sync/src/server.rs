//! WebSocket sync server with channel-based event routing.
//!
//! Architecture:
//! ```text
//! Socket A ──┐
//!            ├── ChannelHub ── ChannelGroup (team:<id> / task:<id>)
//! Socket B ──┘                      │
//!                                   │ encoded event frames
//!            MutationService ───────┤
//!                 │                 │
//!                 ├── ItemStore (RocksDB or memory)
//!                 └── AuditSink (activity feed)
//!                                   │
//!                        ┌──────────┼──────────┐
//!                        ▼          ▼          ▼
//!                    Socket A   Socket B   Socket C
//! ```
//!
//! Each connection:
//! - Receives a server-assigned `socket_id` in the `Welcome` frame
//! - Subscribes to one channel with a signed credential
//! - Gets the canonical snapshot, then the live event stream
//!
//! Mutations run in their own tasks: a disconnect mid-commit never rolls
//! back the write, it only loses the private reply. A subscriber that lags
//! past the broadcast backlog is resynced with a fresh snapshot instead of
//! being fed a gap.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tabula_core::Scope;

use crate::audit::MemoryAuditSink;
use crate::auth::CredentialVerifier;
use crate::broadcast::ChannelHub;
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::service::{MutationConfig, MutationService};
use crate::store::{MemoryStore, RocksStore, RocksStoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum subscribers per channel
    pub max_subscribers_per_channel: usize,
    /// Broadcast backlog per channel before slow subscribers lag
    pub broadcast_capacity: usize,
    /// Max wait for a scope's mutation turn, in milliseconds
    pub lock_timeout_ms: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9474".to_string(),
            max_subscribers_per_channel: 100,
            broadcast_capacity: 256,
            lock_timeout_ms: 5_000,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    /// Channel groups: channel name → broadcast group
    hub: Arc<ChannelHub>,
    /// Authoritative mutation path shared by every connection
    service: Arc<MutationService>,
    /// Checks subscribe credentials; holds the public key only
    verifier: CredentialVerifier,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening persistent storage when configured.
    pub fn new(config: ServerConfig, verifier: CredentialVerifier) -> Result<Self, StoreError> {
        let hub = Arc::new(ChannelHub::new(config.broadcast_capacity));

        let service = match &config.storage_path {
            Some(path) => {
                let store = Arc::new(RocksStore::open(RocksStoreConfig {
                    path: path.clone(),
                    ..RocksStoreConfig::default()
                })?);
                Arc::new(MutationService::new(
                    store.clone(),
                    hub.clone(),
                    store,
                    Self::mutation_config(&config),
                ))
            }
            None => Arc::new(MutationService::new(
                Arc::new(MemoryStore::new()),
                hub.clone(),
                Arc::new(MemoryAuditSink::new()),
                Self::mutation_config(&config),
            )),
        };

        Ok(Self {
            config,
            hub,
            service,
            verifier,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// In-memory server with default configuration.
    pub fn in_memory(bind_addr: impl Into<String>, verifier: CredentialVerifier) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            ..ServerConfig::default()
        };
        let hub = Arc::new(ChannelHub::new(config.broadcast_capacity));
        let service = Arc::new(MutationService::new(
            Arc::new(MemoryStore::new()),
            hub.clone(),
            Arc::new(MemoryAuditSink::new()),
            Self::mutation_config(&config),
        ));
        Self {
            config,
            hub,
            service,
            verifier,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Server with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
        verifier: CredentialVerifier,
    ) -> Result<Self, StoreError> {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config, verifier)
    }

    fn mutation_config(config: &ServerConfig) -> MutationConfig {
        MutationConfig {
            lock_timeout_ms: config.lock_timeout_ms,
            ..MutationConfig::default()
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let service = self.service.clone();
            let verifier = self.verifier.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, hub, service, verifier, stats, config)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<ChannelHub>,
        service: Arc<MutationService>,
        verifier: CredentialVerifier,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Server-assigned identity; subscribe credentials must bind to it.
        let socket_id = Uuid::new_v4();
        let welcome = ServerMessage::Welcome { socket_id }.encode()?;
        ws_sender.send(Message::Binary(welcome.into())).await?;

        // State for this connection
        let mut subscribed: Option<(String, Scope)> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;
        // Mutation tasks send their private replies back through here.
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match ClientMessage::decode(&bytes) {
                                Ok(client_msg) => {
                                    {
                                        let mut s = stats.write().await;
                                        s.total_messages += 1;
                                        s.total_bytes += bytes.len() as u64;
                                    }

                                    match client_msg {
                                        ClientMessage::Subscribe { channel, credential } => {
                                            let reply = Self::subscribe(
                                                &hub,
                                                &service,
                                                &verifier,
                                                &config,
                                                socket_id,
                                                &channel,
                                                &credential,
                                                &mut subscribed,
                                                &mut broadcast_rx,
                                            );
                                            let encoded = reply.encode()?;
                                            ws_sender.send(Message::Binary(encoded.into())).await?;

                                            let mut s = stats.write().await;
                                            s.active_channels = hub.channel_count();
                                        }

                                        ClientMessage::Create { scope, name, actor } => {
                                            // Commit in its own task so a disconnect
                                            // mid-flight never abandons the write.
                                            let service = service.clone();
                                            let reply_tx = reply_tx.clone();
                                            tokio::spawn(async move {
                                                let reply = match service
                                                    .create_item(scope, &name, actor)
                                                    .await
                                                {
                                                    Ok(outcome) => ServerMessage::MutationOk {
                                                        item: outcome.item,
                                                        snapshot: outcome.snapshot,
                                                    },
                                                    Err(e) => ServerMessage::MutationFailed {
                                                        code: e.code(),
                                                        message: e.to_string(),
                                                    },
                                                };
                                                let _ = reply_tx.send(reply);
                                            });
                                        }

                                        ClientMessage::Update { item_id, name, order, actor } => {
                                            let service = service.clone();
                                            let reply_tx = reply_tx.clone();
                                            tokio::spawn(async move {
                                                let reply = match service
                                                    .update_item(item_id, Some(&name), Some(order), actor)
                                                    .await
                                                {
                                                    Ok(outcome) => ServerMessage::MutationOk {
                                                        item: outcome.item,
                                                        snapshot: outcome.snapshot,
                                                    },
                                                    Err(e) => ServerMessage::MutationFailed {
                                                        code: e.code(),
                                                        message: e.to_string(),
                                                    },
                                                };
                                                let _ = reply_tx.send(reply);
                                            });
                                        }

                                        ClientMessage::Delete { item_id, actor } => {
                                            let service = service.clone();
                                            let reply_tx = reply_tx.clone();
                                            tokio::spawn(async move {
                                                let reply = match service
                                                    .delete_item(item_id, actor)
                                                    .await
                                                {
                                                    Ok(outcome) => ServerMessage::MutationOk {
                                                        item: outcome.item,
                                                        snapshot: outcome.snapshot,
                                                    },
                                                    Err(e) => ServerMessage::MutationFailed {
                                                        code: e.code(),
                                                        message: e.to_string(),
                                                    },
                                                };
                                                let _ = reply_tx.send(reply);
                                            });
                                        }

                                        ClientMessage::Ping => {
                                            let pong = ServerMessage::Pong.encode()?;
                                            ws_sender.send(Message::Binary(pong.into())).await?;
                                        }
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Private reply from a finished mutation task
                reply = reply_rx.recv() => {
                    if let Some(message) = reply {
                        let encoded = message.encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }
                }

                // Outgoing broadcast frame
                frame = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // No subscription yet — wait forever
                        std::future::pending().await
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            ws_sender.send(Message::Binary(frame.as_ref().clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // The backlog is gone; a fresh snapshot beats a gap.
                            log::warn!("Socket {socket_id} lagged by {n} events, resyncing");
                            if let Some((name, scope)) = &subscribed {
                                match service.scope_snapshot(*scope) {
                                    Ok(snapshot) => {
                                        let resync = ServerMessage::Subscribed {
                                            channel: name.clone(),
                                            snapshot,
                                        };
                                        let encoded = resync.encode()?;
                                        ws_sender.send(Message::Binary(encoded.into())).await?;
                                    }
                                    Err(e) => {
                                        log::error!("Failed to build resync snapshot for {name}: {e}");
                                    }
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: detach from the channel group, prune it if idle
        if let Some((name, _)) = &subscribed {
            if let Some(group) = hub.get(name) {
                group.remove_socket(&socket_id);
            }
            hub.remove_if_idle(name);
            log::info!("Socket {socket_id} left {name}");
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_channels = hub.channel_count();
        }

        Ok(())
    }

    /// Validate a subscribe request and attach the socket on success.
    ///
    /// The reply is either `Subscribed` with the canonical snapshot or a
    /// `MutationFailed` carrying the rejection; the connection stays open
    /// either way.
    #[allow(clippy::too_many_arguments)]
    fn subscribe(
        hub: &Arc<ChannelHub>,
        service: &Arc<MutationService>,
        verifier: &CredentialVerifier,
        config: &ServerConfig,
        socket_id: Uuid,
        channel_name: &str,
        credential: &crate::auth::SubscriptionCredential,
        subscribed: &mut Option<(String, Scope)>,
        broadcast_rx: &mut Option<broadcast::Receiver<Arc<Vec<u8>>>>,
    ) -> ServerMessage {
        if let Err(e) = verifier.verify(credential, socket_id, channel_name) {
            log::info!("Socket {socket_id} rejected on {channel_name}: {e}");
            return ServerMessage::MutationFailed {
                code: ErrorCode::Forbidden,
                message: e.to_string(),
            };
        }

        let channel = match crate::protocol::Channel::parse(channel_name) {
            Ok(channel) => channel,
            Err(e) => {
                return ServerMessage::MutationFailed {
                    code: ErrorCode::BadRequest,
                    message: e.to_string(),
                }
            }
        };

        let group = hub.get_or_create(channel_name);
        if group.subscriber_count() >= config.max_subscribers_per_channel
            && !group.has_socket(&socket_id)
        {
            hub.remove_if_idle(channel_name);
            return ServerMessage::MutationFailed {
                code: ErrorCode::Forbidden,
                message: format!("channel {channel_name} is full"),
            };
        }

        let snapshot = match service.scope_snapshot(channel.scope) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Failed to load snapshot for {channel_name}: {e}");
                hub.remove_if_idle(channel_name);
                return ServerMessage::MutationFailed {
                    code: ErrorCode::Internal,
                    message: e.to_string(),
                };
            }
        };

        // Moving to a different channel detaches from the old group first.
        if let Some((old_name, _)) = subscribed.take() {
            if old_name != channel_name {
                if let Some(old_group) = hub.get(&old_name) {
                    old_group.remove_socket(&socket_id);
                }
                hub.remove_if_idle(&old_name);
            }
        }

        *broadcast_rx = Some(group.subscribe_socket(socket_id));
        *subscribed = Some((channel_name.to_string(), channel.scope));
        log::info!("Socket {socket_id} subscribed to {channel_name}");

        ServerMessage::Subscribed {
            channel: channel_name.to_string(),
            snapshot,
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The mutation pipeline, for embedding and tests.
    pub fn service(&self) -> &Arc<MutationService> {
        &self.service
    }

    /// The channel hub carrying the event fan-out.
    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }
}
