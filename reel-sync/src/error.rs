//! Error types for the collaboration engine.
//!
//! Each concern has its own enum; [`CollabError`] wraps them at the
//! session boundary. None of these are fatal to a running session: the
//! orchestrator degrades (fail-open locks, held presence, file-only mode)
//! and reports through [`crate::events::CollabEvent`].

use thiserror::Error;

/// Message encoding and validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// The message type is not part of the catalog.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Catalogued type, but no `data` payload.
    #[error("Message {0} carries no data")]
    MissingData(String),
}

/// Shared presence/lock file errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on shared file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed shared file: {0}")]
    Parse(String),

    /// Every retry attempt failed.
    #[error("Shared file unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
}

/// Direct peer transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Channel closed")]
    ChannelClosed,

    /// Outbound buffer is full; the frame was not queued.
    #[error("Channel backpressure")]
    Backpressure,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Discovery collaborator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Discovery backend unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Signal relay failed: {0}")]
    Relay(String),
}

/// Errors from the external annotation-state collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("Malformed annotation record: {0}")]
    Malformed(String),

    #[error("Annotation store failure: {0}")]
    Store(String),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("No collaboration session is active")]
    NotStarted,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Annotation(#[from] AnnotationError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
