//! Connection manager: per-peer direct transport lifecycle and messaging.
//!
//! ```text
//!            connect(peer)                       handle_signal(offer)
//!                 │                                     │
//!                 ▼                                     ▼
//!   NEW ──▶ CONNECTING ──(channel open)──▶ CONNECTED ◀──┘
//!                 │  ▲                          │
//!   timeout/close │  │ retry after delay        │ transport failure
//!                 ▼  │                          ▼
//!             DISCONNECTED ◀────────────────────┘
//!                 │
//!                 │ attempt budget exhausted
//!                 ▼
//!              CLOSED (removed, Disconnected event)
//! ```
//!
//! Every transport callback, negotiation timeout and reconnect wake-up is
//! funnelled into one event-loop task. Callbacks carry the generation of
//! the attempt that produced them; anything from a superseded attempt is
//! dropped. No lock is held across a transport await.
//!
//! The manager knows nothing about annotations: it stamps outbound
//! `{type, data}` messages with sender identity and time, and dispatches
//! inbound ones to at most one handler per message type.

pub mod loopback;
pub mod transport;
pub mod ws;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ConnectionConfig;
use crate::discovery::{Peer, SignalingRelay};
use crate::error::TransportError;
use crate::protocol::{MessageType, OutboundMessage, SyncMessage};

pub use loopback::{LoopbackFactory, LoopbackNetwork};
pub use transport::{
    PathCandidate, PeerTransport, SessionDescription, Signal, TransportEvent, TransportEvents,
    TransportFactory,
};
pub use ws::{WsTransport, WsTransportFactory};

use transport::TaggedTransportEvent;

/// Candidates buffered per peer before any offer from it arrives.
const MAX_EARLY_CANDIDATES: usize = 32;

/// Per-connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Failed; waiting for the next reconnect attempt.
    Disconnected,
    /// Terminal. The connection is removed from the active set.
    Closed,
}

/// Which side of the negotiation this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Introspection snapshot of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub peer: Peer,
    pub state: ConnectionState,
    pub role: Role,
    pub established_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Lifecycle notifications for the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected(Peer),
    Disconnected { peer_id: String, reason: String },
    Reconnecting { peer_id: String, attempt: u32 },
}

type Handler = Arc<dyn Fn(SyncMessage) -> BoxFuture<'static, ()> + Send + Sync>;

struct Connection {
    peer: Peer,
    state: ConnectionState,
    role: Role,
    /// Negotiation attempt id shared with the remote side.
    attempt: String,
    generation: u64,
    transport: Option<Arc<dyn PeerTransport>>,
    remote_description_set: bool,
    /// Remote candidates received before the remote description, in receipt order.
    pending_candidates: Vec<PathCandidate>,
    /// Negotiation timeout or reconnect wake-up.
    timer: Option<JoinHandle<()>>,
    established_at: Option<DateTime<Utc>>,
    reconnect_attempts: u32,
    last_error: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl Connection {
    fn new(peer: Peer, role: Role) -> Self {
        Self {
            peer,
            state: ConnectionState::New,
            role,
            attempt: String::new(),
            generation: 0,
            transport: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            timer: None,
            established_at: None,
            reconnect_attempts: 0,
            last_error: None,
            last_heartbeat: None,
        }
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer: self.peer.clone(),
            state: self.state,
            role: self.role,
            established_at: self.established_at,
            reconnect_attempts: self.reconnect_attempts,
            last_error: self.last_error.clone(),
            last_heartbeat: self.last_heartbeat,
        }
    }

    /// Stop the timer and close the transport of the current attempt.
    fn teardown(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.remote_description_set = false;
        self.pending_candidates.clear();
    }

    fn begin_attempt(
        &mut self,
        role: Role,
        attempt: String,
        generation: u64,
        transport: Arc<dyn PeerTransport>,
    ) {
        self.teardown();
        self.role = role;
        self.attempt = attempt;
        self.generation = generation;
        self.transport = Some(transport);
        self.state = ConnectionState::Connecting;
    }
}

#[derive(Debug)]
enum Wakeup {
    Timeout { peer_id: String, generation: u64 },
    Retry { peer_id: String, generation: u64 },
}

struct Inner {
    local_id: String,
    local_name: String,
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    relay: Arc<dyn SignalingRelay>,
    connections: RwLock<HashMap<String, Connection>>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    early_candidates: Mutex<HashMap<String, Vec<(String, PathCandidate)>>>,
    transport_tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    wakeup_tx: mpsc::UnboundedSender<Wakeup>,
    lifecycle_tx: mpsc::UnboundedSender<ConnectionEvent>,
    next_generation: AtomicU64,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

enum FailOutcome {
    Retrying(u32),
    Closed,
}

/// Owns every direct connection of one session. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create the manager and spawn its event loop and heartbeat.
    ///
    /// Must be called inside a tokio runtime. The receiver yields
    /// connect/disconnect/reconnect notifications.
    pub fn new(
        local_id: impl Into<String>,
        local_name: impl Into<String>,
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        relay: Arc<dyn SignalingRelay>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let heartbeat = config.heartbeat_interval();

        let manager = Self {
            inner: Arc::new(Inner {
                local_id: local_id.into(),
                local_name: local_name.into(),
                config,
                factory,
                relay,
                connections: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                early_candidates: Mutex::new(HashMap::new()),
                transport_tx,
                wakeup_tx,
                lifecycle_tx,
                next_generation: AtomicU64::new(0),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        };

        let weak = Arc::downgrade(&manager.inner);
        let mut tasks = vec![tokio::spawn(run_event_loop(weak.clone(), transport_rx, wakeup_rx))];
        if !heartbeat.is_zero() {
            tasks.push(tokio::spawn(run_heartbeat(weak, heartbeat)));
        }
        if let Ok(mut slot) = manager.inner.tasks.lock() {
            slot.extend(tasks);
        }

        (manager, lifecycle_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start negotiating with `peer` as initiator. No-op while a
    /// connection to that peer is in progress, retrying or established.
    pub async fn connect(&self, peer: Peer) {
        {
            let mut conns = self.inner.connections.write().await;
            if conns.contains_key(&peer.id) {
                log::trace!("connect({}) ignored: connection exists", peer.id);
                return;
            }
            conns.insert(peer.id.clone(), Connection::new(peer.clone(), Role::Initiator));
        }
        log::info!("connecting to {} ({})", peer.display_name, peer.id);
        self.start_attempt(&peer.id).await;
    }

    /// Close one connection without retry.
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        let removed = self.inner.connections.write().await.remove(peer_id);
        self.inner.early_candidates.lock().await.remove(peer_id);
        match removed {
            Some(mut conn) => {
                conn.teardown();
                self.notify(ConnectionEvent::Disconnected {
                    peer_id: peer_id.to_string(),
                    reason: "closed locally".into(),
                });
                true
            }
            None => false,
        }
    }

    /// Close every connection without retry. Returns how many were closed.
    pub async fn disconnect_all(&self) -> usize {
        let drained: Vec<(String, Connection)> =
            self.inner.connections.write().await.drain().collect();
        self.inner.early_candidates.lock().await.clear();
        let count = drained.len();
        for (peer_id, mut conn) in drained {
            conn.teardown();
            self.notify(ConnectionEvent::Disconnected {
                peer_id,
                reason: "closed locally".into(),
            });
        }
        if count > 0 {
            log::info!("closed {count} peer connections");
        }
        count
    }

    /// Close everything and stop the background tasks.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    // ── Messaging ───────────────────────────────────────────────────

    /// Send to one peer. Fails unless the connection is CONNECTED with an
    /// open channel; never waits and never queues.
    pub async fn send(&self, peer_id: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        let transport = {
            let conns = self.inner.connections.read().await;
            match conns.get(peer_id) {
                Some(conn) if conn.state == ConnectionState::Connected => conn.transport.clone(),
                _ => None,
            }
        };
        let transport = transport.ok_or(TransportError::ChannelClosed)?;
        if !transport.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        transport.send(self.encode(message)?)
    }

    /// Send to every open connection. Returns the number of successful
    /// deliveries; partial delivery is not an error.
    pub async fn broadcast(&self, message: &OutboundMessage) -> usize {
        let open: Vec<(String, Arc<dyn PeerTransport>)> = {
            let conns = self.inner.connections.read().await;
            conns
                .iter()
                .filter(|(_, c)| c.state == ConnectionState::Connected)
                .filter_map(|(id, c)| c.transport.clone().map(|t| (id.clone(), t)))
                .filter(|(_, t)| t.is_open())
                .collect()
        };
        if open.is_empty() {
            return 0;
        }

        let frame = match self.encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("dropping {} broadcast: {e}", message.msg_type);
                return 0;
            }
        };

        let mut delivered = 0;
        for (peer_id, transport) in open {
            match transport.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("broadcast {} to {peer_id} failed: {e}", message.msg_type),
            }
        }
        delivered
    }

    fn encode(&self, message: &OutboundMessage) -> Result<Vec<u8>, TransportError> {
        message
            .stamp(&self.inner.local_id, &self.inner.local_name)
            .encode()
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Register the handler for `msg_type`, replacing any previous one.
    /// Returns true if a handler was replaced.
    pub async fn on_message<F, Fut>(&self, msg_type: MessageType, handler: F) -> bool
    where
        F: Fn(SyncMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |msg| Box::pin(handler(msg)));
        self.inner
            .handlers
            .write()
            .await
            .insert(msg_type, handler)
            .is_some()
    }

    pub async fn remove_handler(&self, msg_type: MessageType) -> bool {
        self.inner.handlers.write().await.remove(&msg_type).is_some()
    }

    // ── Introspection ───────────────────────────────────────────────

    pub async fn connection_info(&self, peer_id: &str) -> Option<ConnectionInfo> {
        self.inner.connections.read().await.get(peer_id).map(Connection::info)
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.connections.read().await.values().map(Connection::info).collect()
    }

    pub async fn connected_peers(&self) -> Vec<Peer> {
        self.inner
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.peer.clone())
            .collect()
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        matches!(
            self.inner.connections.read().await.get(peer_id),
            Some(conn) if conn.state == ConnectionState::Connected
        )
    }

    // ── Negotiation ─────────────────────────────────────────────────

    fn notify(&self, event: ConnectionEvent) {
        let _ = self.inner.lifecycle_tx.send(event);
    }

    fn schedule(&self, wakeup: Wakeup, delay: Duration) -> JoinHandle<()> {
        let tx = self.inner.wakeup_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(wakeup);
        })
    }

    fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn new_transport(&self, peer: &Peer, generation: u64) -> Arc<dyn PeerTransport> {
        let events =
            TransportEvents::new(peer.id.clone(), generation, self.inner.transport_tx.clone());
        Arc::from(self.inner.factory.create(peer, events))
    }

    fn send_signal(&self, peer_id: &str, signal: &Signal) -> Result<(), String> {
        let payload = signal.to_json().map_err(|e| e.to_string())?;
        self.inner
            .relay
            .send_signal(peer_id, &payload)
            .map_err(|e| e.to_string())
    }

    /// Initiator side: fresh transport, offer, timeout.
    async fn start_attempt(&self, peer_id: &str) {
        let generation = self.next_generation();
        let attempt = uuid::Uuid::new_v4().simple().to_string();

        let transport = {
            let mut conns = self.inner.connections.write().await;
            let Some(conn) = conns.get_mut(peer_id) else {
                return;
            };
            let transport = self.new_transport(&conn.peer, generation);
            conn.begin_attempt(Role::Initiator, attempt.clone(), generation, transport.clone());
            conn.timer = Some(self.schedule(
                Wakeup::Timeout { peer_id: peer_id.to_string(), generation },
                self.inner.config.connect_timeout(),
            ));
            transport
        };
        log::debug!("offering to {peer_id} (generation {generation})");

        let description = match transport.create_offer().await {
            Ok(description) => description,
            Err(e) => {
                self.fail(peer_id, generation, e.to_string()).await;
                return;
            }
        };
        if !self.is_current(peer_id, generation).await {
            return;
        }
        if let Err(e) = self.send_signal(peer_id, &Signal::Offer { attempt, description }) {
            self.fail(peer_id, generation, format!("signaling failed: {e}")).await;
        }
    }

    async fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        matches!(
            self.inner.connections.read().await.get(peer_id),
            Some(conn) if conn.generation == generation
        )
    }

    /// Feed a signaling payload received from `from`.
    ///
    /// Malformed payloads are logged and dropped.
    pub async fn handle_signal(&self, from: &Peer, payload: &str) {
        let signal = match Signal::from_json(payload) {
            Ok(signal) => signal,
            Err(e) => {
                log::warn!("dropping malformed signal from {}: {e}", from.id);
                return;
            }
        };
        match signal {
            Signal::Offer { attempt, description } => self.on_offer(from, attempt, description).await,
            Signal::Answer { attempt, description } => {
                self.on_answer(&from.id, attempt, description).await
            }
            Signal::Candidate { attempt, candidate } => {
                self.on_candidate(&from.id, attempt, candidate).await
            }
        }
    }

    async fn on_offer(&self, from: &Peer, attempt: String, description: SessionDescription) {
        let generation = self.next_generation();
        let transport = {
            let mut conns = self.inner.connections.write().await;
            if let Some(existing) = conns.get(&from.id) {
                if existing.attempt == attempt {
                    log::trace!("duplicate offer from {}", from.id);
                    return;
                }
                // Glare: the smaller session id keeps the initiator role
                if existing.role == Role::Initiator && self.inner.local_id < from.id {
                    log::debug!("glare with {}: keeping initiator role", from.id);
                    return;
                }
            }
            let conn = conns
                .entry(from.id.clone())
                .or_insert_with(|| Connection::new(from.clone(), Role::Responder));
            conn.peer = from.clone();
            let transport = self.new_transport(from, generation);
            conn.begin_attempt(Role::Responder, attempt.clone(), generation, transport.clone());
            conn.timer = Some(self.schedule(
                Wakeup::Timeout { peer_id: from.id.clone(), generation },
                self.inner.config.connect_timeout(),
            ));
            transport
        };
        log::debug!("answering offer from {} (generation {generation})", from.id);

        let answer = match transport.accept_offer(description).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(&from.id, generation, e.to_string()).await;
                return;
            }
        };

        let early = self
            .inner
            .early_candidates
            .lock()
            .await
            .remove(&from.id)
            .unwrap_or_default();
        let Some(queued) = self.mark_remote_description(&from.id, generation, early, &attempt).await
        else {
            return;
        };

        if let Err(e) = self.send_signal(&from.id, &Signal::Answer { attempt, description: answer }) {
            self.fail(&from.id, generation, format!("signaling failed: {e}")).await;
            return;
        }
        Self::replay_candidates(&from.id, &transport, queued).await;
    }

    async fn on_answer(&self, peer_id: &str, attempt: String, description: SessionDescription) {
        let current = {
            let conns = self.inner.connections.read().await;
            match conns.get(peer_id) {
                Some(conn)
                    if conn.role == Role::Initiator
                        && conn.attempt == attempt
                        && !conn.remote_description_set =>
                {
                    conn.transport.clone().map(|t| (t, conn.generation))
                }
                _ => None,
            }
        };
        let Some((transport, generation)) = current else {
            log::debug!("ignoring stale answer from {peer_id}");
            return;
        };

        if let Err(e) = transport.set_remote_answer(description).await {
            self.fail(peer_id, generation, e.to_string()).await;
            return;
        }
        if let Some(queued) = self
            .mark_remote_description(peer_id, generation, Vec::new(), &attempt)
            .await
        {
            Self::replay_candidates(peer_id, &transport, queued).await;
        }
    }

    /// Flag the remote description as set and take the candidates queued
    /// before it, oldest first. `None` if the attempt was superseded.
    async fn mark_remote_description(
        &self,
        peer_id: &str,
        generation: u64,
        early: Vec<(String, PathCandidate)>,
        attempt: &str,
    ) -> Option<Vec<PathCandidate>> {
        let mut conns = self.inner.connections.write().await;
        let conn = conns.get_mut(peer_id)?;
        if conn.generation != generation {
            return None;
        }
        conn.remote_description_set = true;
        let mut queued: Vec<PathCandidate> = early
            .into_iter()
            .filter(|(a, _)| a == attempt)
            .map(|(_, c)| c)
            .collect();
        queued.append(&mut conn.pending_candidates);
        Some(queued)
    }

    async fn replay_candidates(
        peer_id: &str,
        transport: &Arc<dyn PeerTransport>,
        candidates: Vec<PathCandidate>,
    ) {
        for candidate in candidates {
            if let Err(e) = transport.add_remote_candidate(candidate).await {
                log::debug!("candidate from {peer_id} rejected: {e}");
            }
        }
    }

    async fn on_candidate(&self, peer_id: &str, attempt: String, candidate: PathCandidate) {
        let route = {
            let mut conns = self.inner.connections.write().await;
            match conns.get_mut(peer_id) {
                Some(conn) if conn.attempt == attempt => {
                    if !conn.remote_description_set {
                        conn.pending_candidates.push(candidate);
                        return;
                    }
                    Some(conn.transport.clone())
                }
                _ => None,
            }
        };

        match route {
            Some(Some(transport)) => {
                if let Err(e) = transport.add_remote_candidate(candidate).await {
                    log::debug!("candidate from {peer_id} rejected: {e}");
                }
            }
            Some(None) => {}
            None => {
                // Offer not seen yet; keep it for when it arrives
                let mut early = self.inner.early_candidates.lock().await;
                let queue = early.entry(peer_id.to_string()).or_default();
                if queue.len() < MAX_EARLY_CANDIDATES {
                    queue.push((attempt, candidate));
                }
            }
        }
    }

    // ── Event loop handlers ─────────────────────────────────────────

    async fn on_transport_event(&self, tagged: TaggedTransportEvent) {
        let TaggedTransportEvent { peer_id, generation, event } = tagged;
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let attempt = {
                    let conns = self.inner.connections.read().await;
                    match conns.get(&peer_id) {
                        Some(conn) if conn.generation == generation => conn.attempt.clone(),
                        _ => return,
                    }
                };
                if let Err(e) = self.send_signal(&peer_id, &Signal::Candidate { attempt, candidate }) {
                    log::debug!("could not relay candidate to {peer_id}: {e}");
                }
            }
            TransportEvent::ChannelOpen => {
                let peer = {
                    let mut conns = self.inner.connections.write().await;
                    let Some(conn) = conns.get_mut(&peer_id) else {
                        return;
                    };
                    if conn.generation != generation || conn.state == ConnectionState::Connected {
                        return;
                    }
                    if let Some(timer) = conn.timer.take() {
                        timer.abort();
                    }
                    conn.state = ConnectionState::Connected;
                    conn.established_at = Some(Utc::now());
                    conn.reconnect_attempts = 0;
                    conn.last_error = None;
                    conn.peer.clone()
                };
                log::info!("connected to {} ({})", peer.display_name, peer.id);
                self.notify(ConnectionEvent::Connected(peer));
            }
            TransportEvent::Message(frame) => self.dispatch(&peer_id, generation, &frame).await,
            TransportEvent::Closed(reason) => self.fail(&peer_id, generation, reason).await,
        }
    }

    async fn dispatch(&self, peer_id: &str, generation: u64, frame: &[u8]) {
        if !self.is_current(peer_id, generation).await {
            return;
        }
        let message = match SyncMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("dropping frame from {peer_id}: {e}");
                return;
            }
        };

        if message.msg_type == MessageType::Heartbeat {
            if let Some(conn) = self.inner.connections.write().await.get_mut(peer_id) {
                conn.last_heartbeat = Some(Utc::now());
            }
        }

        let handler = self.inner.handlers.read().await.get(&message.msg_type).cloned();
        match handler {
            Some(handler) => handler(message).await,
            None => log::trace!("no handler for {} from {peer_id}", message.msg_type),
        }
    }

    async fn on_wakeup(&self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Timeout { peer_id, generation } => {
                let timed_out = matches!(
                    self.inner.connections.read().await.get(&peer_id),
                    Some(conn) if conn.generation == generation
                        && conn.state == ConnectionState::Connecting
                );
                if timed_out {
                    let secs = self.inner.config.connect_timeout().as_secs_f32();
                    self.fail(&peer_id, generation, format!("negotiation timed out after {secs}s"))
                        .await;
                }
            }
            Wakeup::Retry { peer_id, generation } => {
                let due = matches!(
                    self.inner.connections.read().await.get(&peer_id),
                    Some(conn) if conn.generation == generation
                        && conn.state == ConnectionState::Disconnected
                );
                if due {
                    self.start_attempt(&peer_id).await;
                }
            }
        }
    }

    /// Transport failure for the attempt `generation`: schedule a retry
    /// while the budget lasts, otherwise close and remove.
    async fn fail(&self, peer_id: &str, generation: u64, reason: String) {
        let outcome = {
            let mut conns = self.inner.connections.write().await;
            let Some(conn) = conns.get_mut(peer_id) else {
                return;
            };
            if conn.generation != generation
                || matches!(conn.state, ConnectionState::Disconnected | ConnectionState::Closed)
            {
                return;
            }
            conn.teardown();
            conn.last_error = Some(reason.clone());

            // Only the initiator redials; a responder waits for a fresh offer
            if conn.role == Role::Initiator
                && conn.reconnect_attempts < self.inner.config.max_reconnect_attempts
            {
                conn.reconnect_attempts += 1;
                conn.state = ConnectionState::Disconnected;
                conn.timer = Some(self.schedule(
                    Wakeup::Retry { peer_id: peer_id.to_string(), generation },
                    self.inner.config.reconnect_delay(),
                ));
                FailOutcome::Retrying(conn.reconnect_attempts)
            } else {
                conn.state = ConnectionState::Closed;
                conns.remove(peer_id);
                FailOutcome::Closed
            }
        };

        match outcome {
            FailOutcome::Retrying(attempt) => {
                log::warn!("connection to {peer_id} failed ({reason}); reconnect attempt {attempt}");
                self.notify(ConnectionEvent::Reconnecting { peer_id: peer_id.to_string(), attempt });
            }
            FailOutcome::Closed => {
                log::warn!("connection to {peer_id} closed: {reason}");
                self.notify(ConnectionEvent::Disconnected { peer_id: peer_id.to_string(), reason });
            }
        }
    }
}

async fn run_event_loop(
    weak: Weak<Inner>,
    mut transport_rx: mpsc::UnboundedReceiver<TaggedTransportEvent>,
    mut wakeup_rx: mpsc::UnboundedReceiver<Wakeup>,
) {
    loop {
        tokio::select! {
            Some(tagged) = transport_rx.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                ConnectionManager { inner }.on_transport_event(tagged).await;
            }
            Some(wakeup) = wakeup_rx.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                ConnectionManager { inner }.on_wakeup(wakeup).await;
            }
            else => break,
        }
    }
    log::debug!("connection event loop stopped");
}

async fn run_heartbeat(weak: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { break };
        let sent = ConnectionManager { inner }
            .broadcast(&OutboundMessage::heartbeat())
            .await;
        log::trace!("heartbeat sent to {sent} peers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;
    use std::sync::Mutex as StdMutex;

    /// Records outgoing signals instead of delivering them.
    #[derive(Default)]
    struct RecordingRelay {
        sent: StdMutex<Vec<(String, Signal)>>,
    }

    impl SignalingRelay for RecordingRelay {
        fn send_signal(&self, peer_id: &str, payload: &str) -> Result<(), DiscoveryError> {
            let signal = Signal::from_json(payload).map_err(|e| DiscoveryError::Relay(e.to_string()))?;
            self.sent.lock().unwrap().push((peer_id.to_string(), signal));
            Ok(())
        }
    }

    fn peer(id: &str) -> Peer {
        Peer {
            id: id.into(),
            display_name: format!("user-{id}"),
            network_address: "127.0.0.1".into(),
            document_hash: "doc".into(),
        }
    }

    fn manager(
        local: &str,
        network: &LoopbackNetwork,
        relay: Arc<RecordingRelay>,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
        ConnectionManager::new(
            local,
            format!("user-{local}"),
            ConnectionConfig::default(),
            Arc::new(network.factory()),
            relay,
        )
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let network = LoopbackNetwork::new();
        let relay = Arc::new(RecordingRelay::default());
        let (cm, _events) = manager("a", &network, relay.clone());

        cm.connect(peer("b")).await;
        cm.connect(peer("b")).await;

        let offers = relay
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| matches!(s, Signal::Offer { .. }))
            .count();
        assert_eq!(offers, 1);
        assert_eq!(cm.connections().await.len(), 1);
        assert_eq!(cm.connection_info("b").await.unwrap().state, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let network = LoopbackNetwork::new();
        let (cm, _events) = manager("a", &network, Arc::new(RecordingRelay::default()));

        let msg = OutboundMessage::frame_position(10);
        assert_eq!(cm.send("nobody", &msg).await, Err(TransportError::ChannelClosed));

        cm.connect(peer("b")).await;
        assert_eq!(cm.send("b", &msg).await, Err(TransportError::ChannelClosed));
        assert_eq!(cm.broadcast(&msg).await, 0);
    }

    #[tokio::test]
    async fn test_one_handler_per_type() {
        let network = LoopbackNetwork::new();
        let (cm, _events) = manager("a", &network, Arc::new(RecordingRelay::default()));

        assert!(!cm.on_message(MessageType::CommentAdd, |_| async {}).await);
        assert!(cm.on_message(MessageType::CommentAdd, |_| async {}).await);
        assert!(cm.remove_handler(MessageType::CommentAdd).await);
        assert!(!cm.remove_handler(MessageType::CommentAdd).await);
    }

    #[tokio::test]
    async fn test_glare_smaller_id_keeps_initiator() {
        let network = LoopbackNetwork::new();
        let relay = Arc::new(RecordingRelay::default());
        let (cm, _events) = manager("a", &network, relay.clone());
        cm.connect(peer("b")).await;

        let offer = Signal::Offer {
            attempt: "remote-attempt".into(),
            description: SessionDescription::new("token"),
        };
        cm.handle_signal(&peer("b"), &offer.to_json().unwrap()).await;

        let info = cm.connection_info("b").await.unwrap();
        assert_eq!(info.role, Role::Initiator);
        assert!(!relay
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|(_, s)| matches!(s, Signal::Answer { .. })));
    }

    #[tokio::test]
    async fn test_glare_larger_id_yields() {
        let network = LoopbackNetwork::new();
        let relay = Arc::new(RecordingRelay::default());
        let (cm, _events) = manager("z", &network, relay.clone());
        cm.connect(peer("b")).await;

        let offer = Signal::Offer {
            attempt: "remote-attempt".into(),
            description: SessionDescription::new("token"),
        };
        cm.handle_signal(&peer("b"), &offer.to_json().unwrap()).await;

        assert_eq!(cm.connection_info("b").await.unwrap().role, Role::Responder);
        assert!(relay.sent.lock().unwrap().iter().any(|(to, s)| to == "b"
            && matches!(s, Signal::Answer { attempt, .. } if attempt == "remote-attempt")));
    }

    #[tokio::test]
    async fn test_malformed_signal_is_dropped() {
        let network = LoopbackNetwork::new();
        let (cm, _events) = manager("a", &network, Arc::new(RecordingRelay::default()));
        cm.handle_signal(&peer("b"), "{ nope").await;
        assert!(cm.connections().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_then_closes() {
        let network = LoopbackNetwork::new();
        let relay = Arc::new(RecordingRelay::default());
        let (cm, mut events) = manager("a", &network, relay.clone());

        let start = tokio::time::Instant::now();
        cm.connect(peer("b")).await;

        for expected in 1..=3 {
            match events.recv().await {
                Some(ConnectionEvent::Reconnecting { peer_id, attempt }) => {
                    assert_eq!(peer_id, "b");
                    assert_eq!(attempt, expected);
                }
                other => panic!("expected Reconnecting, got {other:?}"),
            }
        }
        match events.recv().await {
            Some(ConnectionEvent::Disconnected { peer_id, reason }) => {
                assert_eq!(peer_id, "b");
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }

        // Four 10s attempts separated by three 2s delays
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(46) && elapsed < Duration::from_secs(47));
        assert!(cm.connection_info("b").await.is_none());

        let offers = relay
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| matches!(s, Signal::Offer { .. }))
            .count();
        assert_eq!(offers, 4);
    }

    #[tokio::test]
    async fn test_disconnect_all_without_retry() {
        let network = LoopbackNetwork::new();
        let (cm, mut events) = manager("a", &network, Arc::new(RecordingRelay::default()));
        cm.connect(peer("b")).await;
        cm.connect(peer("c")).await;

        assert_eq!(cm.disconnect_all().await, 2);
        assert!(cm.connections().await.is_empty());
        for _ in 0..2 {
            assert!(matches!(
                events.recv().await,
                Some(ConnectionEvent::Disconnected { .. })
            ));
        }
        assert!(!cm.disconnect("b").await);
    }
}
