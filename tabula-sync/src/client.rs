//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Channel subscription with a signed credential
//! - A `LocalView` replica fed by snapshots and events
//!
//! Every change goes to the server and comes back as a reply or a channel
//! event. The only local write is a tentative display order echoing a
//! pending move; the next canonical frame replaces it wholesale, and a
//! rejection reverts it. A reconnect starts from a fresh `Subscribed`
//! snapshot, so there is nothing to replay.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tabula_core::{OrderedItem, Scope, ScopeSnapshot};

use crate::auth::SubscriptionCredential;
use crate::protocol::{ClientMessage, ErrorCode, EventPayload, ItemEvent, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established; the server assigned this socket id
    Connected { socket_id: Uuid },
    /// Connection lost
    Disconnected,
    /// Full snapshot received (initial subscribe, reconnect, or lag resync)
    Synced(ScopeSnapshot),
    /// A change broadcast on the subscribed channel
    Event(ItemEvent),
    /// Our mutation committed
    MutationOk {
        item: OrderedItem,
        snapshot: ScopeSnapshot,
    },
    /// Our mutation (or subscribe) was rejected
    MutationFailed { code: ErrorCode, message: String },
}

/// Client-side replica of one scope's live items.
///
/// Snapshots replace the whole view but only when their version is not
/// behind, so a late frame can never roll the replica backwards. Item
/// events upsert a single row.
///
/// A caller may echo its own pending move as a tentative display order.
/// The echo is a pure permutation of item ids over the authoritative
/// rows: deltas keep landing in the rows and are never merged into the
/// permutation, and the next canonical snapshot discards it.
#[derive(Debug, Clone, Default)]
pub struct LocalView {
    version: u64,
    items: Vec<OrderedItem>,
    tentative: Option<Vec<Uuid>>,
}

impl LocalView {
    /// Replace the view wholesale. Returns false for stale snapshots.
    pub fn apply_snapshot(&mut self, snapshot: &ScopeSnapshot) -> bool {
        if snapshot.version < self.version {
            return false;
        }
        self.version = snapshot.version;
        self.items = snapshot.items.clone();
        self.tentative = None;
        true
    }

    /// Apply one channel event. Returns false if it was stale.
    pub fn apply_event(&mut self, event: &ItemEvent) -> bool {
        match &event.payload {
            EventPayload::Item(item) => {
                self.upsert(item.clone());
                true
            }
            EventPayload::Snapshot(snapshot) => self.apply_snapshot(snapshot),
        }
    }

    /// Echo a not-yet-confirmed move as the display order.
    ///
    /// Accepts targets in `[1, N+1]` over the N authoritative rows
    /// (`N+1` lands at the end, the range the server accepts); anything
    /// else returns false and echoes nothing.
    pub fn apply_tentative_move(&mut self, item_id: Uuid, to_order: i64) -> bool {
        let live = self.items.len() as i64;
        if !self.items.iter().any(|i| i.id == item_id) {
            return false;
        }
        if to_order < 1 || to_order > live + 1 {
            return false;
        }

        let mut ids: Vec<Uuid> = match &self.tentative {
            Some(ids) => ids.clone(),
            None => self.items.iter().map(|i| i.id).collect(),
        };
        ids.retain(|id| *id != item_id);
        let slot = (to_order.min(live) - 1) as usize;
        ids.insert(slot.min(ids.len()), item_id);
        self.tentative = Some(ids);
        true
    }

    /// Drop any tentative order, falling back to the authoritative rows.
    pub fn clear_tentative(&mut self) {
        self.tentative = None;
    }

    fn upsert(&mut self, item: OrderedItem) {
        match self.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
        self.items.sort_by_key(|i| i.order);
    }

    /// Live items in the confirmed server order.
    pub fn items(&self) -> &[OrderedItem] {
        &self.items
    }

    /// Live items in display order: the tentative permutation while one
    /// is pending, the confirmed order otherwise. Rows created since the
    /// echo trail at the end.
    pub fn display_items(&self) -> Vec<&OrderedItem> {
        match &self.tentative {
            Some(ids) => {
                let mut ordered: Vec<&OrderedItem> = ids
                    .iter()
                    .filter_map(|id| self.items.iter().find(|i| i.id == *id))
                    .collect();
                ordered.extend(self.items.iter().filter(|i| !ids.contains(&i.id)));
                ordered
            }
            None => self.items.iter().collect(),
        }
    }

    pub fn has_tentative_order(&self) -> bool {
        self.tentative.is_some()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn find(&self, id: Uuid) -> Option<&OrderedItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the sync server, one channel
/// subscription, and the local replica of that channel's scope.
pub struct SyncClient {
    /// Who our mutations act as
    actor: Uuid,

    /// Channel we subscribe to (`team:<uuid>` or `task:<uuid>`)
    channel: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Identity the server assigned in its Welcome frame
    socket_id: Arc<RwLock<Option<Uuid>>>,

    /// Replica of the subscribed scope
    view: Arc<RwLock<LocalView>>,

    /// Channel to send frames to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(actor: Uuid, channel: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            actor,
            channel: channel.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            socket_id: Arc::new(RwLock::new(None)),
            view: Arc::new(RwLock::new(LocalView::default())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and complete the Welcome handshake.
    ///
    /// Returns the server-assigned socket id; the caller passes it to the
    /// authorization endpoint to obtain a subscribe credential, then calls
    /// [`subscribe`](Self::subscribe).
    pub async fn connect(&mut self) -> Result<Uuid, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;
        let (ws_stream, _) = match ws_result {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // The server speaks first; its Welcome carries our identity.
        let socket_id = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match ServerMessage::decode(&bytes)? {
                        ServerMessage::Welcome { socket_id } => break socket_id,
                        other => {
                            log::debug!("Ignoring pre-welcome frame: {other:?}");
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    *self.state.write().await = ConnectionState::Disconnected;
                    return Err(ProtocolError::ConnectionClosed);
                }
            }
        };
        *self.socket_id.write().await = Some(socket_id);

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: decode frames, maintain the view, surface events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let view = self.view.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if let Ok(server_msg) = ServerMessage::decode(&bytes) {
                            let event = match server_msg {
                                ServerMessage::Welcome { .. } => None,
                                ServerMessage::Subscribed { snapshot, .. } => {
                                    view.write().await.apply_snapshot(&snapshot);
                                    Some(ClientEvent::Synced(snapshot))
                                }
                                ServerMessage::Event(event) => {
                                    view.write().await.apply_event(&event);
                                    Some(ClientEvent::Event(event))
                                }
                                ServerMessage::MutationOk { item, snapshot } => {
                                    view.write().await.apply_snapshot(&snapshot);
                                    Some(ClientEvent::MutationOk { item, snapshot })
                                }
                                ServerMessage::MutationFailed { code, message } => {
                                    // No snapshot follows a rejection; drop the echo
                                    view.write().await.clear_tentative();
                                    Some(ClientEvent::MutationFailed { code, message })
                                }
                                ServerMessage::Pong => None,
                            };
                            if let Some(evt) = event {
                                let _ = event_tx.send(evt).await;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected { socket_id }).await;
        Ok(socket_id)
    }

    /// Reconnect after a drop.
    ///
    /// The new connection gets a new socket id, so the caller must
    /// re-authorize and resubscribe; the next `Subscribed` frame resyncs
    /// the view.
    pub async fn reconnect(&mut self) -> Result<Uuid, ProtocolError> {
        *self.state.write().await = ConnectionState::Reconnecting;
        self.outgoing_tx = None;
        self.connect().await
    }

    /// Present a credential for this client's channel.
    pub async fn subscribe(&self, credential: SubscriptionCredential) -> Result<(), ProtocolError> {
        let frame = ClientMessage::Subscribe {
            channel: self.channel.clone(),
            credential,
        }
        .encode()?;
        self.send_frame(frame).await
    }

    /// Ask the server to create an item at the end of `scope`.
    pub async fn create(&self, scope: Scope, name: impl Into<String>) -> Result<(), ProtocolError> {
        let frame = ClientMessage::Create {
            scope,
            name: name.into(),
            actor: self.actor,
        }
        .encode()?;
        self.send_frame(frame).await
    }

    /// Ask the server to rename and/or move an item.
    pub async fn update(
        &self,
        item_id: Uuid,
        name: impl Into<String>,
        order: i64,
    ) -> Result<(), ProtocolError> {
        let frame = ClientMessage::Update {
            item_id,
            name: name.into(),
            order,
            actor: self.actor,
        }
        .encode()?;
        self.send_frame(frame).await
    }

    /// Echo a pending move into the local view before the server confirms.
    ///
    /// Pairs with [`update`](Self::update): the display order changes
    /// immediately, then the canonical reply replaces it (or a rejection
    /// reverts it).
    pub async fn apply_tentative_move(&self, item_id: Uuid, to_order: i64) -> bool {
        self.view.write().await.apply_tentative_move(item_id, to_order)
    }

    /// Ask the server to soft-delete an item.
    pub async fn delete(&self, item_id: Uuid) -> Result<(), ProtocolError> {
        let frame = ClientMessage::Delete {
            item_id,
            actor: self.actor,
        }
        .encode()?;
        self.send_frame(frame).await
    }

    /// Send a ping to the server.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(ClientMessage::Ping.encode()?).await
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Socket id from the last Welcome, if connected.
    pub async fn socket_id(&self) -> Option<Uuid> {
        *self.socket_id.read().await
    }

    /// Copy of the current replica.
    pub async fn view(&self) -> LocalView {
        self.view.read().await.clone()
    }

    /// Get the actor our mutations act as.
    pub fn actor(&self) -> Uuid {
        self.actor
    }

    /// Get the subscribed channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
