//! # reel-sync: Serverless collaboration for shared review files
//!
//! Keeps comment and drawing state loosely consistent between everyone
//! reviewing the same video file, without a central server.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  peers + signals  ┌───────────────────┐
//! │ DiscoveryAdapter │ ────────────────► │ ConnectionManager │
//! │ (identity hash)  │ ◄──────────────── │ (per-peer links)  │
//! └──────────────────┘   send_signal     └─────────┬─────────┘
//!                                                  │ SyncMessage
//!                                                  ▼
//! ┌──────────────────┐  read/write  ┌──────────────────────────┐
//! │ SharedStore      │ ◄──────────► │ CollaborationSession     │
//! │ .x.collab.json   │              │ presence, locks, cadence │
//! └──────────────────┘              └───────┬──────────┬───────┘
//!                                           │          │
//!                                           ▼          ▼
//!                                   AnnotationStore  EventBus
//!                                   (LWW merge)      (UI)
//! ```
//!
//! Direct connections are best-effort. The shared presence file next to
//! the document is the durable fallback: it carries presence and editing
//! locks for everyone, including peers no direct link reaches.
//!
//! ## Modules
//!
//! - [`protocol`]: Typed message catalog, wire envelope, timestamp ordering
//! - [`discovery`]: Document-identity correlation and signaling pass-through
//! - [`connection`]: Peer transport lifecycle, negotiation, heartbeat
//! - [`session`]: Orchestrator: presence, locks, adaptive sync, merge dispatch
//! - [`presence_file`] / [`shared_file`]: Shared presence/lock record and its storage
//! - [`annotations`]: Annotation-state collaborator and in-memory reference store
//! - [`peer_presence`]: Live frame/cursor map of connected peers
//! - [`events`]: Outward event bus

pub mod activity;
pub mod annotations;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod peer_presence;
pub mod presence_file;
pub mod protocol;
pub mod session;
pub mod shared_file;

// Re-exports for convenience
pub use activity::{ActivityTracker, SyncTier};
pub use annotations::{AnnotationStore, InMemoryAnnotations};
pub use config::{CollabConfig, ConnectionConfig, RetryPolicy, SyncCadenceConfig};
pub use connection::{
    ConnectionEvent, ConnectionInfo, ConnectionManager, ConnectionState, LoopbackNetwork,
    PeerTransport, Role, TransportFactory, WsTransportFactory,
};
pub use discovery::{DiscoveryAdapter, DiscoveryBackend, DiscoveryEvent, Peer, SignalingRelay};
pub use error::{
    AnnotationError, CollabError, DiscoveryError, ProtocolError, StoreError, TransportError,
};
pub use events::{CollabEvent, EventBus, FileOp, MutationKind};
pub use peer_presence::{PeerPresence, PresenceRoom};
pub use presence_file::{Collaborator, LockResult, LockStatus, SharedDocument};
pub use protocol::{compare_timestamps, MessageType, OutboundMessage, SyncMessage};
pub use session::{CollaborationSession, DirectTransport};
pub use shared_file::{JsonFileStore, MemoryStore, SharedStore};
