//! In-process transport: every [`ConnectionManager`](super::ConnectionManager)
//! built on the same [`LoopbackNetwork`] can reach the others.
//!
//! Used by tests and by hosts that run several sessions in one process.
//! The initiator registers a rendezvous token in its offer and announces
//! it as a path candidate; the responder pairs on that candidate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;

use super::transport::{
    PathCandidate, PeerTransport, SessionDescription, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::discovery::Peer;
use crate::error::TransportError;

const CANDIDATE_PREFIX: &str = "loopback:";

type Slot = Arc<Mutex<Option<TransportEvents>>>;

struct Listening {
    events: TransportEvents,
    /// Where the initiator sends once paired.
    remote: Slot,
    open: Arc<AtomicBool>,
}

#[derive(Default)]
struct NetworkState {
    listening: HashMap<String, Listening>,
    partitioned: bool,
}

/// Shared in-process medium.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// While partitioned, path candidates never pair and negotiations time out.
    pub fn set_partitioned(&self, partitioned: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.partitioned = partitioned;
        }
    }

    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory { network: self.clone() }
    }
}

/// [`TransportFactory`] over a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackFactory {
    network: LoopbackNetwork,
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, _peer: &Peer, events: TransportEvents) -> Box<dyn PeerTransport> {
        Box::new(LoopbackTransport {
            network: self.network.clone(),
            events,
            remote: Arc::new(Mutex::new(None)),
            open: Arc::new(AtomicBool::new(false)),
            token: Mutex::new(None),
        })
    }
}

struct LoopbackTransport {
    network: LoopbackNetwork,
    events: TransportEvents,
    remote: Slot,
    open: Arc<AtomicBool>,
    /// Rendezvous token: ours as initiator, the offer's as responder.
    token: Mutex<Option<String>>,
}

impl LoopbackTransport {
    fn set_token(&self, token: String) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token);
        }
    }

    fn token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    fn pair(&self, token: &str) -> Result<(), TransportError> {
        let mut state = self
            .network
            .state
            .lock()
            .map_err(|_| TransportError::Io("loopback network poisoned".into()))?;
        if state.partitioned {
            log::debug!("loopback partitioned, dropping candidate {token}");
            return Ok(());
        }
        let Some(listening) = state.listening.remove(token) else {
            return Err(TransportError::Negotiation(format!("no listener for {token}")));
        };
        drop(state);

        if let Ok(mut theirs) = listening.remote.lock() {
            *theirs = Some(self.events.clone());
        }
        if let Ok(mut ours) = self.remote.lock() {
            *ours = Some(listening.events.clone());
        }
        listening.open.store(true, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);

        listening.events.emit(TransportEvent::ChannelOpen);
        self.events.emit(TransportEvent::ChannelOpen);
        Ok(())
    }
}

impl PeerTransport for LoopbackTransport {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            let token = uuid::Uuid::new_v4().simple().to_string();
            {
                let mut state = self
                    .network
                    .state
                    .lock()
                    .map_err(|_| TransportError::Io("loopback network poisoned".into()))?;
                state.listening.insert(
                    token.clone(),
                    Listening {
                        events: self.events.clone(),
                        remote: self.remote.clone(),
                        open: self.open.clone(),
                    },
                );
            }
            self.set_token(token.clone());
            self.events.emit(TransportEvent::LocalCandidate(PathCandidate::new(format!(
                "{CANDIDATE_PREFIX}{token}"
            ))));
            Ok(SessionDescription::new(token))
        })
    }

    fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            if offer.body.is_empty() {
                return Err(TransportError::Negotiation("empty offer".into()));
            }
            self.set_token(offer.body);
            Ok(SessionDescription::new("loopback-answer"))
        })
    }

    fn set_remote_answer(
        &self,
        _answer: SessionDescription,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn add_remote_candidate(
        &self,
        candidate: PathCandidate,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let Some(token) = candidate.address.strip_prefix(CANDIDATE_PREFIX) else {
                return Err(TransportError::Negotiation(format!(
                    "unsupported candidate {}",
                    candidate.address
                )));
            };
            if self.token().as_deref() != Some(token) {
                return Err(TransportError::Negotiation("candidate for another offer".into()));
            }
            self.pair(token)
        })
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        let remote = self
            .remote
            .lock()
            .map_err(|_| TransportError::ChannelClosed)?
            .clone();
        match remote {
            Some(remote) if remote.emit(TransportEvent::Message(frame)) => Ok(()),
            _ => Err(TransportError::ChannelClosed),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if let Some(token) = self.token() {
            if let Ok(mut state) = self.network.state.lock() {
                state.listening.remove(&token);
            }
        }
        let remote = self.remote.lock().ok().and_then(|mut r| r.take());
        if let (true, Some(remote)) = (was_open, remote) {
            remote.emit(TransportEvent::Closed("remote closed the channel".into()));
        }
    }
}
