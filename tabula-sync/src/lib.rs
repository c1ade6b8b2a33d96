//! # tabula-sync — Real-time sync layer for Tabula
//!
//! Provides WebSocket-based live updates for ordered item collections.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer      │
//! │ (per user)  │     Binary Proto    │ (authority)     │
//! └──────┬──────┘                     └──────┬──────────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────────┐
//! │ LocalView   │                     │ MutationService │
//! │ (replica)   │                     │ (per-scope lock)│
//! └─────────────┘                     └──────┬──────────┘
//!                                            │
//!                               ┌────────────┼────────────┐
//!                               ▼            ▼            ▼
//!                        ┌────────────┐ ┌─────────┐ ┌───────────┐
//!                        │ ChannelHub │ │ItemStore│ │ AuditSink │
//!                        │ (fan-out)  │ │(RocksDB)│ │ (activity)│
//!                        └────────────┘ └─────────┘ └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded frames)
//! - [`auth`] — Signed per-socket channel credentials
//! - [`broadcast`] — Channel-based fan-out with backpressure
//! - [`service`] — Scope-serialized mutation pipeline
//! - [`store`] — Durable item storage (RocksDB) plus in-memory fake
//! - [`audit`] — Append-only activity feed
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with a snapshot-fed replica
//!
//! ## Performance Targets
//!
//! | Metric | Target | Achieved |
//! |--------|--------|----------|
//! | Event serialization | <2µs | ✅ |
//! | Broadcast 1K events × 100 sockets | <10ms | ✅ |
//! | Mutation commit (RocksDB, no fsync) | <1ms | ✅ |
//! | Snapshot of 500-item scope | <1ms | ✅ |

pub mod protocol;
pub mod auth;
pub mod broadcast;
pub mod service;
pub mod store;
pub mod audit;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    Channel, ClientMessage, ErrorCode, EventPayload, ItemEvent, ProtocolError, ServerMessage,
};
pub use auth::{
    AllowAll, AuthError, AuthRequest, AuthResponse, ChannelAuthorizer, CredentialVerifier,
    MembershipPolicy, ScopeAccess, SubscriptionCredential,
};
pub use broadcast::{ChannelGroup, ChannelHub, GroupStats, HubStats, Publisher};
pub use service::{
    MutationConfig, MutationError, MutationOutcome, MutationService, ServiceStats,
};
pub use store::{
    ItemStore, MemoryStore, RocksStore, RocksStoreConfig, ScopeMeta, ScopeMutation, StoreError,
};
pub use audit::{
    ActivityAction, ActivityEvent, ActivityRecord, AuditError, AuditSink, MemoryAuditSink,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientEvent, ConnectionState, LocalView, SyncClient};
