//! WebSocket transport for peers on the same LAN.
//!
//! ```text
//! Initiator                               Responder
//!   create_offer()
//!     bind TCP listener (ephemeral port)
//!     offer = one-time token ───────────▶ accept_offer()
//!     candidate = "ws:<port>" ──────────▶ add_remote_candidate()
//!                                           connect ws://<addr>:<port>
//!   accept, check first frame ◀────────── send token as first frame
//!   ChannelOpen                           ChannelOpen
//!         ◀──────── binary SyncMessage frames ────────▶
//! ```
//!
//! Each open channel runs a writer task fed by a bounded mpsc queue and a
//! reader task that turns frames into [`TransportEvent::Message`]. Either
//! task ending reports [`TransportEvent::Closed`].

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::transport::{
    PathCandidate, PeerTransport, SessionDescription, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::discovery::Peer;
use crate::error::TransportError;

const CANDIDATE_PREFIX: &str = "ws:";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates [`WsTransport`]s.
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    /// Interface the initiator listens on.
    pub bind_host: String,
    /// Outbound frame queue per channel.
    pub channel_capacity: usize,
}

impl Default for WsTransportFactory {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            channel_capacity: 256,
        }
    }
}

impl TransportFactory for WsTransportFactory {
    fn create(&self, peer: &Peer, events: TransportEvents) -> Box<dyn PeerTransport> {
        let (out_tx, out_rx) = mpsc::channel(self.channel_capacity.max(1));
        Box::new(WsTransport {
            bind_host: self.bind_host.clone(),
            peer_address: peer.network_address.clone(),
            events,
            open: Arc::new(AtomicBool::new(false)),
            outgoing_tx: out_tx,
            outgoing_rx: Arc::new(Mutex::new(Some(out_rx))),
            dial_token: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// One WebSocket channel to one peer.
pub struct WsTransport {
    bind_host: String,
    peer_address: String,
    events: TransportEvents,
    open: Arc<AtomicBool>,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    /// Taken by whichever side ends up running the channel.
    outgoing_rx: Arc<Mutex<Option<mpsc::Receiver<Vec<u8>>>>>,
    /// Token from an accepted offer. Only the responder dials.
    dial_token: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsTransport {
    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    fn dial_token(&self) -> Option<String> {
        self.dial_token.lock().ok().and_then(|t| t.clone())
    }

    fn set_dial_token(&self, token: String) {
        if let Ok(mut slot) = self.dial_token.lock() {
            *slot = Some(token);
        }
    }
}

/// `ws://host:port`, bracketing IPv6 literals.
fn ws_url(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("ws://[{host}]:{port}")
    } else {
        format!("ws://{host}:{port}")
    }
}

/// Pump frames between the socket and the manager until either side ends.
async fn run_channel<S, R>(
    mut sink: S,
    mut stream: R,
    events: TransportEvents,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    open: Arc<AtomicBool>,
) where
    S: futures_util::Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin + Send,
{
    open.store(true, Ordering::SeqCst);
    events.emit(TransportEvent::ChannelOpen);

    // Writer task: forward the outgoing queue to the socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                events.emit(TransportEvent::Message(bytes));
            }
            Some(Ok(Message::Close(_))) | None => break "channel closed by peer".to_string(),
            Some(Err(e)) => break format!("channel error: {e}"),
            Some(Ok(_)) => {}
        }
    };

    open.store(false, Ordering::SeqCst);
    writer.abort();
    log::debug!("ws channel to {} ended: {reason}", events.peer_id());
    events.emit(TransportEvent::Closed(reason));
}

impl PeerTransport for WsTransport {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            let listener = TcpListener::bind((self.bind_host.as_str(), 0))
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            let port = listener
                .local_addr()
                .map_err(|e| TransportError::Io(e.to_string()))?
                .port();
            let token = uuid::Uuid::new_v4().simple().to_string();

            let events = self.events.clone();
            let open = self.open.clone();
            let outgoing_rx = self.outgoing_rx.clone();
            let expected = token.clone();
            self.track(tokio::spawn(async move {
                loop {
                    let (stream, addr) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            events.emit(TransportEvent::Closed(format!("accept failed: {e}")));
                            return;
                        }
                    };
                    log::debug!("ws candidate connection from {addr}");

                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            log::debug!("ws handshake from {addr} failed: {e}");
                            continue;
                        }
                    };
                    let (sink, mut reader) = ws.split();

                    // First frame must present the offer's token
                    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next()).await;
                    match first {
                        Ok(Some(Ok(Message::Text(t)))) if t.as_str() == expected => {}
                        _ => {
                            log::warn!("rejecting ws connection from {addr}: bad token");
                            continue;
                        }
                    }

                    let Some(out_rx) = outgoing_rx.lock().ok().and_then(|mut rx| rx.take()) else {
                        return;
                    };
                    run_channel(sink, reader, events, out_rx, open).await;
                    return;
                }
            }));

            self.events.emit(TransportEvent::LocalCandidate(PathCandidate::new(format!(
                "{CANDIDATE_PREFIX}{port}"
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
                return Err(TransportError::Negotiation("offer carries no token".into()));
            }
            self.set_dial_token(offer.body);
            Ok(SessionDescription::new("ws"))
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
            let Some(token) = self.dial_token() else {
                // The initiator listens; only a side holding an accepted offer dials
                return Ok(());
            };
            let port: u16 = candidate
                .address
                .strip_prefix(CANDIDATE_PREFIX)
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| {
                    TransportError::Negotiation(format!("unsupported candidate {}", candidate.address))
                })?;
            let url = ws_url(&self.peer_address, port);

            let events = self.events.clone();
            let open = self.open.clone();
            let outgoing_rx = self.outgoing_rx.clone();
            self.track(tokio::spawn(async move {
                let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
                    Ok((ws, _)) => ws,
                    Err(e) => {
                        events.emit(TransportEvent::Closed(format!("connect {url} failed: {e}")));
                        return;
                    }
                };
                let (mut sink, reader) = ws.split();
                if let Err(e) = sink.send(Message::Text(token.into())).await {
                    events.emit(TransportEvent::Closed(format!("handshake failed: {e}")));
                    return;
                }
                let Some(out_rx) = outgoing_rx.lock().ok().and_then(|mut rx| rx.take()) else {
                    return;
                };
                run_channel(sink, reader, events, out_rx, open).await;
            }));
            Ok(())
        })
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.outgoing_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::ChannelClosed,
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}
