//! Transport seam between the connection manager and a concrete
//! peer-to-peer channel.
//!
//! A transport is created per connection attempt. It reports progress
//! through [`TransportEvents`], which tags every callback with the peer id
//! and the attempt's generation so the manager can discard callbacks from a
//! superseded attempt.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::discovery::Peer;
use crate::error::{ProtocolError, TransportError};

/// Opaque negotiation blob exchanged through the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub body: String,
}

impl SessionDescription {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// A network path the remote side may use to reach us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCandidate {
    pub address: String,
}

impl PathCandidate {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

/// Asynchronous transport callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(PathCandidate),
    ChannelOpen,
    /// One inbound frame, in channel order.
    Message(Vec<u8>),
    Closed(String),
}

#[derive(Debug)]
pub(crate) struct TaggedTransportEvent {
    pub peer_id: String,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Callback sink handed to a transport at creation.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedTransportEvent>,
}

impl TransportEvents {
    pub(crate) fn new(
        peer_id: String,
        generation: u64,
        tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    ) -> Self {
        Self { peer_id, generation, tx }
    }

    /// Report an event. Returns false once the manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedTransportEvent {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// One direct channel to one peer.
///
/// Negotiation steps are async but must return promptly: anything that
/// waits on the network (accepting, dialling) runs in a spawned task and
/// reports back through [`TransportEvents`].
pub trait PeerTransport: Send + Sync {
    /// Initiator: prepare a local channel and produce the offer.
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>>;

    /// Responder: apply the remote offer and produce the answer.
    fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> BoxFuture<'_, Result<SessionDescription, TransportError>>;

    /// Initiator: apply the remote answer.
    fn set_remote_answer(&self, answer: SessionDescription)
        -> BoxFuture<'_, Result<(), TransportError>>;

    /// Apply a remote path candidate. Only called after the remote
    /// description is known.
    fn add_remote_candidate(&self, candidate: PathCandidate)
        -> BoxFuture<'_, Result<(), TransportError>>;

    /// Queue one frame without blocking.
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

/// Creates a fresh transport per connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(&self, peer: &Peer, events: TransportEvents) -> Box<dyn PeerTransport>;
}

/// Signaling payload carried by the discovery relay as JSON.
///
/// `attempt` names the initiator's negotiation attempt; answers and
/// candidates from an older attempt are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Signal {
    Offer {
        attempt: String,
        description: SessionDescription,
    },
    Answer {
        attempt: String,
        description: SessionDescription,
    },
    Candidate {
        attempt: String,
        candidate: PathCandidate,
    },
}

impl Signal {
    pub fn attempt(&self) -> &str {
        match self {
            Signal::Offer { attempt, .. }
            | Signal::Answer { attempt, .. }
            | Signal::Candidate { attempt, .. } => attempt,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_json_shape() {
        let signal = Signal::Candidate {
            attempt: "a1".into(),
            candidate: PathCandidate::new("ws:4100"),
        };
        let json = signal.to_json().unwrap();
        assert!(json.contains("\"kind\":\"candidate\""));
        assert_eq!(Signal::from_json(&json).unwrap(), signal);
        assert_eq!(signal.attempt(), "a1");
    }

    #[test]
    fn test_malformed_signal() {
        assert!(Signal::from_json("{\"kind\":\"bogus\"}").is_err());
        assert!(Signal::from_json("not json").is_err());
    }

    #[tokio::test]
    async fn test_events_are_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new("peer-1".into(), 7, tx);
        assert!(events.emit(TransportEvent::ChannelOpen));

        let tagged = rx.recv().await.unwrap();
        assert_eq!(tagged.peer_id, "peer-1");
        assert_eq!(tagged.generation, 7);
        assert_eq!(tagged.event, TransportEvent::ChannelOpen);

        drop(rx);
        assert!(!events.emit(TransportEvent::ChannelOpen));
    }
}
