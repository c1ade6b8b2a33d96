//! Binary wire protocol for ordered-collection synchronization.
//!
//! Every frame is one bincode-encoded [`ClientMessage`] or
//! [`ServerMessage`] carried in a WebSocket binary message:
//!
//! ```text
//! client ──► Subscribe { channel, credential }
//!        ──► Create / Update / Delete { ... }
//! server ──► Welcome { socket_id }
//!        ──► Subscribed { channel, snapshot }      (also the resync path)
//!        ──► Event { <resource>-created/updated/deleted, payload }
//!        ──► MutationOk { item, snapshot } / MutationFailed { code }
//! ```
//!
//! Channels are named deterministically from scopes (`team:<uuid>`,
//! `task:<uuid>`). Event payloads follow the broadcast contract: create and
//! rename-only updates carry the single entity, order-affecting operations
//! carry the full refreshed snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::auth::SubscriptionCredential;
use tabula_core::{OrderedItem, Scope, ScopeSnapshot};

/// Upper bound on one encoded frame; larger input is rejected before decode.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// A broadcast topic, derived from a scope and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub scope: Scope,
}

impl Channel {
    pub fn for_scope(scope: Scope) -> Self {
        Self { scope }
    }

    /// Parse a channel name (`team:<uuid>` or `task:<uuid>`).
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        let (prefix, raw_id) = name
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidChannel(name.to_string()))?;
        let id = Uuid::parse_str(raw_id)
            .map_err(|_| ProtocolError::InvalidChannel(name.to_string()))?;
        match prefix {
            "team" => Ok(Self::for_scope(Scope::team(id))),
            "task" => Ok(Self::for_scope(Scope::task_list(id))),
            _ => Err(ProtocolError::InvalidChannel(name.to_string())),
        }
    }

    /// Resource noun for this channel's event names.
    pub fn resource_name(&self) -> &'static str {
        self.scope.resource_name()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A channel's name is its scope's canonical name.
        self.scope.fmt(f)
    }
}

/// Payload of one broadcast event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    /// The single changed entity (create, rename-only update).
    Item(OrderedItem),
    /// Full refreshed canonical list (order-affecting operations).
    Snapshot(ScopeSnapshot),
}

/// One event on a scope's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEvent {
    /// Name of the channel the event belongs to.
    pub channel: String,
    /// `<resource>-created`, `<resource>-updated`, or `<resource>-deleted`.
    pub name: String,
    pub payload: EventPayload,
}

impl ItemEvent {
    /// Item appended to its scope; nobody else moved.
    pub fn created(item: &OrderedItem) -> Self {
        Self {
            channel: item.scope.to_string(),
            name: format!("{}-created", item.scope.resource_name()),
            payload: EventPayload::Item(item.clone()),
        }
    }

    /// Rename without an order change.
    pub fn renamed(item: &OrderedItem) -> Self {
        Self {
            channel: item.scope.to_string(),
            name: format!("{}-updated", item.scope.resource_name()),
            payload: EventPayload::Item(item.clone()),
        }
    }

    /// Order-affecting update; subscribers replace their list wholesale.
    pub fn reordered(snapshot: &ScopeSnapshot) -> Self {
        Self {
            channel: snapshot.scope.to_string(),
            name: format!("{}-updated", snapshot.scope.resource_name()),
            payload: EventPayload::Snapshot(snapshot.clone()),
        }
    }

    /// Soft deletion; carries the survivors' refreshed list.
    pub fn deleted(snapshot: &ScopeSnapshot) -> Self {
        Self {
            channel: snapshot.scope.to_string(),
            name: format!("{}-deleted", snapshot.scope.resource_name()),
            payload: EventPayload::Snapshot(snapshot.clone()),
        }
    }

    /// Scope this event belongs to.
    pub fn scope(&self) -> Scope {
        match &self.payload {
            EventPayload::Item(item) => item.scope,
            EventPayload::Snapshot(snapshot) => snapshot.scope,
        }
    }
}

/// Error categories surfaced to the mutating caller over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    InvalidOrder,
    Forbidden,
    BadRequest,
    Conflict,
    Timeout,
    Internal,
}

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join a channel. The credential must bind this connection's socket id.
    Subscribe {
        channel: String,
        credential: SubscriptionCredential,
    },
    /// Create an item appended at the end of the scope.
    Create {
        scope: Scope,
        name: String,
        actor: Uuid,
    },
    /// Rename and/or move an item; `order` is the requested target position.
    Update {
        item_id: Uuid,
        name: String,
        order: i64,
        actor: Uuid,
    },
    /// Soft-delete an item.
    Delete { item_id: Uuid, actor: Uuid },
    Ping,
}

impl ClientMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First frame on every connection: the socket id credentials must bind.
    Welcome { socket_id: Uuid },
    /// Subscription accepted. Also the resync path: sent again with a fresh
    /// snapshot after a reconnect or when the subscriber lagged.
    Subscribed {
        channel: String,
        snapshot: ScopeSnapshot,
    },
    /// A change published on the subscribed channel.
    Event(ItemEvent),
    /// Mutation committed; the full canonical state of the touched scope.
    MutationOk {
        item: OrderedItem,
        snapshot: ScopeSnapshot,
    },
    /// Mutation rejected; the store is unchanged.
    MutationFailed { code: ErrorCode, message: String },
    Pong,
}

impl ServerMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_frame<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(bytes.len()));
    }
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Encoded frame exceeds [`MAX_FRAME_BYTES`].
    FrameTooLarge(usize),
    /// Channel name is not `team:<uuid>` or `task:<uuid>`.
    InvalidChannel(String),
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::FrameTooLarge(n) => write!(f, "Frame of {n} bytes exceeds limit"),
            Self::InvalidChannel(name) => write!(f, "Invalid channel name: {name}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
