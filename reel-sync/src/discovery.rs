//! Discovery adapter: correlates externally discovered peers by document
//! identity and relays signaling payloads.
//!
//! ```text
//! DiscoveryBackend (LAN advertisement, external)
//!       │ DiscoveryInput (mpsc)
//!       ▼
//! DiscoveryAdapter ── filters by identity hash, tracks peers
//!       │ DiscoveryEvent (mpsc)
//!       ▼
//! CollaborationSession ── connect / handle_signal / disconnect
//! ```
//!
//! The adapter never talks to the network itself; it only consumes the
//! backend's peer list and passes signaling payloads through.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::error::DiscoveryError;

/// A remote participant's process as surfaced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Remote session id, stable for the remote session's lifetime
    pub id: String,
    pub display_name: String,
    /// Host or IP the peer advertised
    pub network_address: String,
    pub document_hash: String,
}

/// What the local participant announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub session_id: String,
    pub display_name: String,
    pub identity_hash: String,
}

/// Raw input pushed by the discovery backend.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryInput {
    PeerAppeared(Peer),
    PeerDisappeared(String),
    SignalReceived { from: String, payload: String },
}

/// Adapter output, already filtered to the current document.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    PeerAppeared(Peer),
    PeerDisappeared { peer: Peer, reason: String },
    Signal { from: String, payload: String },
}

/// External discovery mechanism (e.g. LAN service advertisement).
pub trait DiscoveryBackend: Send + Sync {
    /// Begin advertising and browsing. The backend pushes what it sees into `inputs`.
    fn start(
        &self,
        announcement: &Announcement,
        inputs: mpsc::UnboundedSender<DiscoveryInput>,
    ) -> Result<(), DiscoveryError>;

    fn stop(&self);

    /// Re-advertise under a new document identity.
    fn update_document_identity(&self, identity_hash: &str) -> Result<(), DiscoveryError>;

    /// Peer-addressed signaling pass-through.
    fn send_signal(&self, peer_id: &str, payload: &str) -> Result<(), DiscoveryError>;
}

/// Peer-addressed signaling channel used by the connection manager.
pub trait SignalingRelay: Send + Sync {
    fn send_signal(&self, peer_id: &str, payload: &str) -> Result<(), DiscoveryError>;
}

/// Deterministic identity for a document path.
///
/// The path is normalised lexically (separators unified, `.`/`..`
/// resolved, case folded, no trailing slash) so every participant that
/// opens the same file derives the same hash.
pub fn document_identity(path: &Path) -> String {
    let normalized = normalize_path(path);
    let digest = Sha256::digest(normalized.as_bytes());
    let hex = format!("{digest:x}");
    hex[..32].to_string()
}

fn normalize_path(path: &Path) -> String {
    let unified = path.to_string_lossy().replace('\\', "/");
    let mut parts: Vec<String> = Vec::new();
    let mut absolute = false;
    for component in Path::new(&unified).components() {
        match component {
            Component::RootDir => absolute = true,
            Component::Prefix(p) => parts.push(p.as_os_str().to_string_lossy().to_lowercase()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().to_lowercase()),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

struct AdapterState {
    local_session_id: String,
    identity_hash: String,
    peers: HashMap<String, Peer>,
}

/// Wraps a [`DiscoveryBackend`] for one session.
#[derive(Clone)]
pub struct DiscoveryAdapter {
    backend: Arc<dyn DiscoveryBackend>,
    state: Arc<RwLock<AdapterState>>,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    pump: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl DiscoveryAdapter {
    /// Start discovery for `document_path`. Returns the adapter and the
    /// filtered event stream.
    pub fn start(
        backend: Arc<dyn DiscoveryBackend>,
        session_id: &str,
        display_name: &str,
        document_path: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>), DiscoveryError> {
        let identity_hash = document_identity(document_path);
        let (inputs_tx, mut inputs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        backend.start(
            &Announcement {
                session_id: session_id.to_string(),
                display_name: display_name.to_string(),
                identity_hash: identity_hash.clone(),
            },
            inputs_tx,
        )?;

        let adapter = Self {
            backend,
            state: Arc::new(RwLock::new(AdapterState {
                local_session_id: session_id.to_string(),
                identity_hash,
                peers: HashMap::new(),
            })),
            events_tx,
            pump: Arc::new(std::sync::Mutex::new(None)),
        };

        let pump_adapter = adapter.clone();
        let handle = tokio::spawn(async move {
            while let Some(input) = inputs_rx.recv().await {
                pump_adapter.handle_input(input).await;
            }
            log::debug!("discovery input stream ended");
        });
        if let Ok(mut pump) = adapter.pump.lock() {
            *pump = Some(handle);
        }

        Ok((adapter, events_rx))
    }

    /// Apply one backend input. Public so hosts without a push-style
    /// backend can feed peers directly.
    pub async fn handle_input(&self, input: DiscoveryInput) {
        match input {
            DiscoveryInput::PeerAppeared(peer) => {
                let mut state = self.state.write().await;
                if peer.id == state.local_session_id {
                    return;
                }
                if peer.document_hash != state.identity_hash {
                    log::trace!("ignoring peer {} on another document", peer.id);
                    return;
                }
                let is_new = state.peers.insert(peer.id.clone(), peer.clone()).is_none();
                drop(state);
                if is_new {
                    log::info!("peer appeared: {} ({})", peer.display_name, peer.id);
                    let _ = self.events_tx.send(DiscoveryEvent::PeerAppeared(peer));
                }
            }
            DiscoveryInput::PeerDisappeared(peer_id) => {
                let removed = self.state.write().await.peers.remove(&peer_id);
                if let Some(peer) = removed {
                    log::info!("peer disappeared: {} ({})", peer.display_name, peer.id);
                    let _ = self.events_tx.send(DiscoveryEvent::PeerDisappeared {
                        peer,
                        reason: "no longer advertised".into(),
                    });
                }
            }
            DiscoveryInput::SignalReceived { from, payload } => {
                let _ = self.events_tx.send(DiscoveryEvent::Signal { from, payload });
            }
        }
    }

    /// Switch to a different document: re-advertise and drop peers that
    /// no longer share it. Returns the new identity hash.
    pub async fn switch_document(&self, document_path: &Path) -> Result<String, DiscoveryError> {
        let identity_hash = document_identity(document_path);
        self.backend.update_document_identity(&identity_hash)?;

        let dropped: Vec<Peer> = {
            let mut state = self.state.write().await;
            state.identity_hash = identity_hash.clone();
            let stale: Vec<String> = state
                .peers
                .values()
                .filter(|p| p.document_hash != identity_hash)
                .map(|p| p.id.clone())
                .collect();
            stale.iter().filter_map(|id| state.peers.remove(id)).collect()
        };

        for peer in dropped {
            let _ = self.events_tx.send(DiscoveryEvent::PeerDisappeared {
                peer,
                reason: "switched document".into(),
            });
        }
        Ok(identity_hash)
    }

    pub async fn peer(&self, peer_id: &str) -> Option<Peer> {
        self.state.read().await.peers.get(peer_id).cloned()
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.state.read().await.peers.values().cloned().collect()
    }

    pub async fn identity_hash(&self) -> String {
        self.state.read().await.identity_hash.clone()
    }

    pub fn stop(&self) {
        self.backend.stop();
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

impl SignalingRelay for DiscoveryAdapter {
    fn send_signal(&self, peer_id: &str, payload: &str) -> Result<(), DiscoveryError> {
        self.backend.send_signal(peer_id, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        identities: Mutex<Vec<String>>,
        signals: Mutex<Vec<(String, String)>>,
        stopped: Mutex<bool>,
    }

    impl DiscoveryBackend for RecordingBackend {
        fn start(
            &self,
            announcement: &Announcement,
            _inputs: mpsc::UnboundedSender<DiscoveryInput>,
        ) -> Result<(), DiscoveryError> {
            self.identities.lock().unwrap().push(announcement.identity_hash.clone());
            Ok(())
        }

        fn stop(&self) {
            *self.stopped.lock().unwrap() = true;
        }

        fn update_document_identity(&self, identity_hash: &str) -> Result<(), DiscoveryError> {
            self.identities.lock().unwrap().push(identity_hash.to_string());
            Ok(())
        }

        fn send_signal(&self, peer_id: &str, payload: &str) -> Result<(), DiscoveryError> {
            self.signals.lock().unwrap().push((peer_id.into(), payload.into()));
            Ok(())
        }
    }

    fn peer(id: &str, hash: &str) -> Peer {
        Peer {
            id: id.into(),
            display_name: format!("user-{id}"),
            network_address: "192.168.1.20".into(),
            document_hash: hash.into(),
        }
    }

    #[test]
    fn test_identity_normalisation() {
        let a = document_identity(Path::new("/Volumes/Share/Reel/./cut.mov"));
        let b = document_identity(Path::new("/volumes/share/reel/tmp/../cut.mov"));
        let c = document_identity(Path::new("\\Volumes\\Share\\Reel\\cut.mov"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(normalize_path(Path::new("\\Volumes\\Share\\Reel\\cut.mov")), "/volumes/share/reel/cut.mov");
        assert_eq!(a, c);
        assert_ne!(a, document_identity(Path::new("/Volumes/Share/Reel/cut2.mov")));
    }

    #[tokio::test]
    async fn test_filters_by_identity_and_self() {
        let backend = Arc::new(RecordingBackend::default());
        let path = Path::new("/share/cut.mov");
        let (adapter, mut events) =
            DiscoveryAdapter::start(backend.clone(), "local", "Me", path).unwrap();
        let hash = document_identity(path);

        adapter.handle_input(DiscoveryInput::PeerAppeared(peer("local", &hash))).await;
        adapter.handle_input(DiscoveryInput::PeerAppeared(peer("other-doc", "ffff"))).await;
        adapter.handle_input(DiscoveryInput::PeerAppeared(peer("p1", &hash))).await;
        // Duplicate appearance is not re-announced
        adapter.handle_input(DiscoveryInput::PeerAppeared(peer("p1", &hash))).await;

        assert_eq!(events.recv().await, Some(DiscoveryEvent::PeerAppeared(peer("p1", &hash))));
        assert!(events.try_recv().is_err());
        assert_eq!(adapter.peers().await.len(), 1);
        assert_eq!(backend.identities.lock().unwrap().as_slice(), &[hash]);
    }

    #[tokio::test]
    async fn test_switch_document_drops_mismatched_peers() {
        let backend = Arc::new(RecordingBackend::default());
        let old = Path::new("/share/a.mov");
        let (adapter, mut events) =
            DiscoveryAdapter::start(backend.clone(), "local", "Me", old).unwrap();
        let old_hash = document_identity(old);

        adapter.handle_input(DiscoveryInput::PeerAppeared(peer("p1", &old_hash))).await;
        let _ = events.recv().await;

        let new_hash = adapter.switch_document(Path::new("/share/b.mov")).await.unwrap();
        assert_ne!(new_hash, old_hash);

        match events.recv().await {
            Some(DiscoveryEvent::PeerDisappeared { peer, .. }) => assert_eq!(peer.id, "p1"),
            other => panic!("expected PeerDisappeared, got {other:?}"),
        }
        assert!(adapter.peers().await.is_empty());
        assert_eq!(adapter.identity_hash().await, new_hash);
        assert_eq!(backend.identities.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_signals_pass_through() {
        let backend = Arc::new(RecordingBackend::default());
        let (adapter, mut events) =
            DiscoveryAdapter::start(backend.clone(), "local", "Me", Path::new("/a.mov")).unwrap();

        adapter.send_signal("p1", "{\"kind\":\"offer\"}").unwrap();
        assert_eq!(backend.signals.lock().unwrap()[0].0, "p1");

        adapter
            .handle_input(DiscoveryInput::SignalReceived { from: "p1".into(), payload: "x".into() })
            .await;
        assert_eq!(
            events.recv().await,
            Some(DiscoveryEvent::Signal { from: "p1".into(), payload: "x".into() })
        );

        adapter.stop();
        assert!(*backend.stopped.lock().unwrap());
    }

    #[tokio::test]
    async fn test_backend_inputs_are_pumped() {
        struct PushingBackend;
        impl DiscoveryBackend for PushingBackend {
            fn start(
                &self,
                announcement: &Announcement,
                inputs: mpsc::UnboundedSender<DiscoveryInput>,
            ) -> Result<(), DiscoveryError> {
                let _ = inputs.send(DiscoveryInput::PeerAppeared(Peer {
                    id: "remote".into(),
                    display_name: "Remote".into(),
                    network_address: "10.0.0.2".into(),
                    document_hash: announcement.identity_hash.clone(),
                }));
                Ok(())
            }
            fn stop(&self) {}
            fn update_document_identity(&self, _: &str) -> Result<(), DiscoveryError> {
                Ok(())
            }
            fn send_signal(&self, _: &str, _: &str) -> Result<(), DiscoveryError> {
                Ok(())
            }
        }

        let (_adapter, mut events) =
            DiscoveryAdapter::start(Arc::new(PushingBackend), "local", "Me", Path::new("/a.mov"))
                .unwrap();
        match events.recv().await {
            Some(DiscoveryEvent::PeerAppeared(p)) => assert_eq!(p.id, "remote"),
            other => panic!("expected PeerAppeared, got {other:?}"),
        }
    }
}
