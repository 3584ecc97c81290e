//! Collaboration orchestrator.
//!
//! A [`CollaborationSession`] owns one participant's view of one document:
//!
//! - file presence, read-merge-written on a fixed interval next to the document
//! - editing locks kept in the same shared record (fail-open on I/O errors)
//! - the adaptive sync cadence (solo / collaborating / active)
//! - merge dispatch of inbound peer messages to the [`AnnotationStore`]
//! - optional direct transport (discovery + connection manager); when it
//!   cannot be brought up the session runs on file presence alone
//!
//! All outward notifications go through the session's [`EventBus`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::activity::{ActivityTracker, SyncTier};
use crate::annotations::AnnotationStore;
use crate::config::CollabConfig;
use crate::connection::{ConnectionEvent, ConnectionInfo, ConnectionManager, TransportFactory};
use crate::discovery::{DiscoveryAdapter, DiscoveryBackend, DiscoveryEvent, Peer, SignalingRelay};
use crate::error::{CollabError, StoreError};
use crate::events::{CollabEvent, EventBus, FileOp, MutationKind};
use crate::peer_presence::{PeerPresence, PresenceRoom};
use crate::presence_file::{
    collaborators_from, color_for_session, evict_stale_entries, presence_path_for, Collaborator,
    LockResult, LockStatus, PresenceEntry,
};
use crate::protocol::{
    CursorPosition, DrawingClear, FramePosition, MessageCategory, MessageType, OutboundMessage,
    RecordRef, RecordUpdate, ReplyAdd, ReplyRef, ReplyUpdate, ResolveChange, SyncMessage,
    SyncSnapshot,
};
use crate::shared_file::{read_with_retry, write_with_retry, SharedStore};

/// Collaborators needed for direct peer-to-peer transport.
#[derive(Clone)]
pub struct DirectTransport {
    pub discovery: Arc<dyn DiscoveryBackend>,
    pub transports: Arc<dyn TransportFactory>,
}

#[derive(Clone)]
struct DirectLink {
    connections: ConnectionManager,
    discovery: DiscoveryAdapter,
}

/// State of a running session. Replaced wholesale on restart.
struct Active {
    session_id: String,
    user_name: String,
    document_path: PathBuf,
    presence_path: PathBuf,
    started_at: DateTime<Utc>,
    /// Last known file presence, own entry always included.
    presence: BTreeMap<String, PresenceEntry>,
    last_revision: Option<u64>,
    others: usize,
    owned_locks: BTreeSet<String>,
    activity: ActivityTracker,
    tier: SyncTier,
    room: PresenceRoom,
    direct: Option<DirectLink>,
    tasks: Vec<JoinHandle<()>>,
    sync_timer: Option<JoinHandle<()>>,
}

impl Active {
    fn own_entry(&self, now: DateTime<Utc>) -> PresenceEntry {
        PresenceEntry {
            name: self.user_name.clone(),
            color: color_for_session(&self.session_id),
            last_seen_at: now,
            started_at: self.started_at,
        }
    }

    fn connections(&self) -> Option<ConnectionManager> {
        self.direct.as_ref().map(|d| d.connections.clone())
    }
}

struct LockContext {
    session_id: String,
    user_name: String,
    presence_path: PathBuf,
    others: usize,
}

struct Inner {
    config: CollabConfig,
    store: Arc<dyn SharedStore>,
    annotations: Arc<dyn AnnotationStore>,
    direct: Option<DirectTransport>,
    events: EventBus,
    state: RwLock<Option<Active>>,
}

fn current<'a>(state: &'a Option<Active>, session_id: &str) -> Option<&'a Active> {
    state.as_ref().filter(|a| a.session_id == session_id)
}

fn current_mut<'a>(state: &'a mut Option<Active>, session_id: &str) -> Option<&'a mut Active> {
    state.as_mut().filter(|a| a.session_id == session_id)
}

/// Presence to keep when the shared file cannot be read: the previous
/// view minus entries past `timeout`, with our own entry refreshed.
pub fn hold_last_known(
    mut previous: BTreeMap<String, PresenceEntry>,
    session_id: &str,
    own: PresenceEntry,
    now: DateTime<Utc>,
    timeout: Duration,
) -> BTreeMap<String, PresenceEntry> {
    evict_stale_entries(&mut previous, now, timeout);
    previous.insert(session_id.to_string(), own);
    previous
}

/// One participant's collaboration session. Cheap to clone.
#[derive(Clone)]
pub struct CollaborationSession {
    inner: Arc<Inner>,
}

impl CollaborationSession {
    /// Session that relies on the shared file only.
    pub fn new(
        config: CollabConfig,
        store: Arc<dyn SharedStore>,
        annotations: Arc<dyn AnnotationStore>,
    ) -> Self {
        Self::build(config, store, annotations, None)
    }

    /// Session that also connects directly to discovered peers.
    pub fn with_direct_transport(
        config: CollabConfig,
        store: Arc<dyn SharedStore>,
        annotations: Arc<dyn AnnotationStore>,
        direct: DirectTransport,
    ) -> Self {
        Self::build(config, store, annotations, Some(direct))
    }

    fn build(
        config: CollabConfig,
        store: Arc<dyn SharedStore>,
        annotations: Arc<dyn AnnotationStore>,
        direct: Option<DirectTransport>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                annotations,
                direct,
                events,
                state: RwLock::new(None),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CollabEvent> {
        self.inner.events.subscribe()
    }

    pub fn annotations(&self) -> &Arc<dyn AnnotationStore> {
        &self.inner.annotations
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start collaborating on `document_path`, stopping any previous
    /// session first. Returns the new session id.
    pub async fn start(
        &self,
        document_path: impl AsRef<Path>,
        user_name: &str,
    ) -> Result<String, CollabError> {
        self.inner.config.validate()?;
        self.stop().await;

        let document_path = document_path.as_ref().to_path_buf();
        let session_id = uuid::Uuid::new_v4().to_string();
        let config = &self.inner.config;

        let link = self.enable_direct_transport(&session_id, user_name, &document_path).await;
        let (direct, pumps) = match link {
            Some((direct, discovery_rx, connection_rx)) => {
                (Some(direct), Some((discovery_rx, connection_rx)))
            }
            None => (None, None),
        };

        let mut active = Active {
            session_id: session_id.clone(),
            user_name: user_name.to_string(),
            presence_path: presence_path_for(&document_path),
            document_path: document_path.clone(),
            started_at: Utc::now(),
            presence: BTreeMap::new(),
            last_revision: None,
            others: 0,
            owned_locks: BTreeSet::new(),
            activity: ActivityTracker::from_config(&config.sync),
            tier: SyncTier::Solo,
            room: PresenceRoom::new(session_id.clone(), config.peer_presence_idle()),
            direct,
            tasks: Vec::new(),
            sync_timer: None,
        };
        let own = active.own_entry(active.started_at);
        active.presence.insert(session_id.clone(), own);

        let weak = Arc::downgrade(&self.inner);
        active.tasks.push(tokio::spawn(run_presence_loop(
            weak.clone(),
            session_id.clone(),
            config.presence_interval(),
        )));
        if let Some((discovery_rx, connection_rx)) = pumps {
            active.tasks.push(tokio::spawn(run_discovery_events(
                weak.clone(),
                session_id.clone(),
                discovery_rx,
            )));
            active.tasks.push(tokio::spawn(run_connection_events(
                weak,
                session_id.clone(),
                connection_rx,
            )));
        }
        *self.inner.state.write().await = Some(active);

        log::info!(
            "collaboration session {session_id} started on {} as {user_name}",
            document_path.display()
        );
        self.inner.events.emit(CollabEvent::SessionStarted {
            session_id: session_id.clone(),
            document_path: document_path.display().to_string(),
        });

        self.publish_presence_for(&session_id).await;
        Ok(session_id)
    }

    async fn enable_direct_transport(
        &self,
        session_id: &str,
        user_name: &str,
        document_path: &Path,
    ) -> Option<(
        DirectLink,
        mpsc::UnboundedReceiver<DiscoveryEvent>,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    )> {
        let direct = self.inner.direct.as_ref()?;
        let (discovery, discovery_rx) = match DiscoveryAdapter::start(
            direct.discovery.clone(),
            session_id,
            user_name,
            document_path,
        ) {
            Ok(started) => started,
            Err(e) => {
                log::warn!("direct transport unavailable, using shared-file presence only: {e}");
                return None;
            }
        };

        let relay: Arc<dyn SignalingRelay> = Arc::new(discovery.clone());
        let (connections, connection_rx) = ConnectionManager::new(
            session_id,
            user_name,
            self.inner.config.connection.clone(),
            direct.transports.clone(),
            relay,
        );
        self.register_handlers(&connections).await;

        Some((DirectLink { connections, discovery }, discovery_rx, connection_rx))
    }

    async fn register_handlers(&self, connections: &ConnectionManager) {
        for msg_type in MessageType::ALL {
            if msg_type == MessageType::Heartbeat {
                continue;
            }
            let weak = Arc::downgrade(&self.inner);
            connections
                .on_message(msg_type, move |msg| {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            CollaborationSession { inner }.handle_remote(msg).await;
                        }
                    }
                })
                .await;
        }
    }

    /// End the session: release owned locks, stop timers, close peer
    /// connections, remove our presence entry. No-op when not started.
    pub async fn stop(&self) {
        let (session_id, presence_path, owned) = {
            let state = self.inner.state.read().await;
            let Some(active) = state.as_ref() else {
                return;
            };
            (
                active.session_id.clone(),
                active.presence_path.clone(),
                active.owned_locks.iter().cloned().collect::<Vec<_>>(),
            )
        };

        // Lock release needs the session still active
        if !owned.is_empty() {
            self.release_locks(&session_id, &presence_path, &owned).await;
        }

        let Some(mut active) = self.inner.state.write().await.take() else {
            return;
        };
        // Locks recorded after the snapshot above
        let late: Vec<String> = active
            .owned_locks
            .iter()
            .filter(|target| !owned.contains(*target))
            .cloned()
            .collect();
        if !late.is_empty() {
            self.release_locks(&session_id, &active.presence_path, &late).await;
        }
        for task in active.tasks.drain(..) {
            task.abort();
        }
        if let Some(timer) = active.sync_timer.take() {
            timer.abort();
        }
        if let Some(direct) = active.direct.take() {
            direct.connections.shutdown().await;
            direct.discovery.stop();
        }

        self.remove_own_presence(&session_id, &active.presence_path).await;

        log::info!("collaboration session {session_id} stopped");
        self.inner.events.emit(CollabEvent::SessionStopped { session_id });
    }

    /// Move the running session to another document.
    pub async fn switch_document(&self, document_path: impl AsRef<Path>) -> Result<(), CollabError> {
        let document_path = document_path.as_ref().to_path_buf();
        let (session_id, old_path, owned, direct) = {
            let state = self.inner.state.read().await;
            let active = state.as_ref().ok_or(CollabError::NotStarted)?;
            (
                active.session_id.clone(),
                active.presence_path.clone(),
                active.owned_locks.iter().cloned().collect::<Vec<_>>(),
                active.direct.clone(),
            )
        };

        if !owned.is_empty() {
            self.release_locks(&session_id, &old_path, &owned).await;
        }
        self.remove_own_presence(&session_id, &old_path).await;

        {
            let mut state = self.inner.state.write().await;
            let active = current_mut(&mut state, &session_id).ok_or(CollabError::NotStarted)?;
            active.presence_path = presence_path_for(&document_path);
            active.document_path = document_path.clone();
            active.last_revision = None;
            active.owned_locks.clear();
            let mut fresh = BTreeMap::new();
            fresh.insert(session_id.clone(), active.own_entry(Utc::now()));
            self.apply_presence_snapshot(active, fresh);
        }
        log::info!("session {session_id} switched to {}", document_path.display());

        if let Some(direct) = direct {
            direct.discovery.switch_document(&document_path).await?;
        }
        self.publish_presence_for(&session_id).await;
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn session_id(&self) -> Option<String> {
        self.inner.state.read().await.as_ref().map(|a| a.session_id.clone())
    }

    pub async fn is_active(&self) -> bool {
        self.inner.state.read().await.is_some()
    }

    pub async fn document_path(&self) -> Option<PathBuf> {
        self.inner.state.read().await.as_ref().map(|a| a.document_path.clone())
    }

    /// Everyone in the last known presence view, ourselves included.
    pub async fn collaborators(&self) -> Vec<Collaborator> {
        match self.inner.state.read().await.as_ref() {
            Some(active) => collaborators_from(&active.presence, &active.session_id),
            None => Vec::new(),
        }
    }

    pub async fn is_collaborating(&self) -> bool {
        matches!(self.inner.state.read().await.as_ref(), Some(a) if a.others > 0)
    }

    pub async fn sync_tier(&self) -> SyncTier {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .map_or(SyncTier::Solo, |a| a.tier)
    }

    /// Live frame/cursor state of connected peers.
    pub async fn peer_presence(&self) -> Vec<PeerPresence> {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .map(|a| a.room.peers())
            .unwrap_or_default()
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        match self.connection_manager().await {
            Some(connections) => connections.connections().await,
            None => Vec::new(),
        }
    }

    pub async fn connected_peers(&self) -> Vec<Peer> {
        match self.connection_manager().await {
            Some(connections) => connections.connected_peers().await,
            None => Vec::new(),
        }
    }

    async fn connection_manager(&self) -> Option<ConnectionManager> {
        self.inner.state.read().await.as_ref().and_then(Active::connections)
    }

    async fn direct_link(&self, session_id: &str) -> Option<DirectLink> {
        current(&*self.inner.state.read().await, session_id).and_then(|a| a.direct.clone())
    }

    async fn is_current(&self, session_id: &str) -> bool {
        current(&*self.inner.state.read().await, session_id).is_some()
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Broadcast a local message to connected peers. Mutations count
    /// towards the activity window. Returns the delivered count.
    pub async fn publish(&self, message: OutboundMessage) -> usize {
        let connections = {
            let mut state = self.inner.state.write().await;
            let Some(active) = state.as_mut() else {
                return 0;
            };
            if message.msg_type.is_mutation() {
                active.activity.record(Instant::now());
                self.apply_tier(active);
            }
            active.connections()
        };
        match connections {
            Some(connections) => connections.broadcast(&message).await,
            None => 0,
        }
    }

    pub async fn update_frame_position(&self, frame: u64) -> usize {
        self.publish(OutboundMessage::frame_position(frame)).await
    }

    pub async fn update_cursor(&self, x: f32, y: f32, frame: Option<u64>) -> usize {
        self.publish(OutboundMessage::cursor(x, y, frame)).await
    }

    /// Run one sync pass now.
    pub async fn trigger_sync(&self) {
        if let Some(session_id) = self.session_id().await {
            self.sync_pass(&session_id).await;
        }
    }

    async fn sync_pass(&self, session_id: &str) {
        let Some(connections) = current(&*self.inner.state.read().await, session_id)
            .map(Active::connections)
        else {
            return;
        };

        self.inner.events.emit(CollabEvent::SyncStarted);
        if let Err(e) = self.inner.annotations.refresh().await {
            log::warn!("sync pass failed: {e}");
            self.inner.events.emit(CollabEvent::SyncError { message: e.to_string() });
            return;
        }
        let asked = match connections {
            Some(connections) => connections.broadcast(&OutboundMessage::sync_request()).await,
            None => 0,
        };
        log::debug!("sync pass for {session_id}: asked {asked} peers");
        self.inner.events.emit(CollabEvent::SyncCompleted {
            comments: self.inner.annotations.get_all().len(),
            drawings: self.inner.annotations.get_all_drawings().len(),
        });
    }

    // ── Presence ────────────────────────────────────────────────────

    /// Run one presence round now. Returns false when no session is active.
    pub async fn publish_presence(&self) -> bool {
        match self.session_id().await {
            Some(session_id) => self.publish_presence_for(&session_id).await,
            None => false,
        }
    }

    async fn publish_presence_for(&self, session_id: &str) -> bool {
        let now = Utc::now();
        let (path, own, previous, last_revision) = {
            let state = self.inner.state.read().await;
            let Some(active) = current(&state, session_id) else {
                return false;
            };
            (
                active.presence_path.clone(),
                active.own_entry(now),
                active.presence.clone(),
                active.last_revision,
            )
        };
        let config = &self.inner.config;

        let (presence, revision) =
            match read_with_retry(self.inner.store.as_ref(), &path, &config.file_retry).await {
                Ok(mut doc) => {
                    if let Some(prev) = last_revision.filter(|prev| doc.revision < *prev) {
                        log::warn!(
                            "{} revision went back from {prev} to {}: a concurrent writer won",
                            path.display(),
                            doc.revision
                        );
                    }
                    doc.upsert_presence(session_id, own);
                    let evicted = doc.evict_stale(now, config.presence_timeout());
                    if !evicted.is_empty() {
                        log::debug!("evicted stale presence: {evicted:?}");
                    }
                    let freed = doc.prune_expired_locks(now, config.lock_timeout());
                    if !freed.is_empty() {
                        log::debug!("pruned expired locks: {freed:?}");
                    }
                    doc.revision += 1;

                    if !self.is_current(session_id).await {
                        return false;
                    }
                    if let Err(e) =
                        write_with_retry(self.inner.store.as_ref(), &path, &doc, &config.file_retry)
                            .await
                    {
                        self.report_file_error(FileOp::Write, &e);
                    }
                    (doc.presence, Some(doc.revision))
                }
                Err(e) => {
                    self.report_file_error(FileOp::Read, &e);
                    let kept =
                        hold_last_known(previous, session_id, own, now, config.presence_timeout());
                    (kept, None)
                }
            };

        let mut state = self.inner.state.write().await;
        let Some(active) = current_mut(&mut state, session_id) else {
            return false;
        };
        if revision.is_some() {
            active.last_revision = revision;
        }
        for peer_id in active.room.cleanup_idle() {
            self.inner.events.emit(CollabEvent::PeerPresenceChanged { peer_id });
        }
        self.apply_presence_snapshot(active, presence);
        true
    }

    /// Install a new presence view: collaborator-change detection,
    /// collaboration start/end and tier recomputation.
    fn apply_presence_snapshot(&self, active: &mut Active, presence: BTreeMap<String, PresenceEntry>) {
        let changed = !active.presence.keys().eq(presence.keys());
        active.presence = presence;
        if changed {
            self.inner.events.emit(CollabEvent::CollaboratorsChanged {
                collaborators: collaborators_from(&active.presence, &active.session_id),
            });
        }

        let others = active
            .presence
            .keys()
            .filter(|id| **id != active.session_id)
            .count();
        let was = active.others;
        active.others = others;

        if was == 0 && others > 0 {
            log::info!("collaborating with {others} others");
            self.inner.events.emit(CollabEvent::CollaborationStarted { others });
            let session = self.clone();
            let session_id = active.session_id.clone();
            tokio::spawn(async move { session.sync_pass(&session_id).await });
        } else if was > 0 && others == 0 {
            log::info!("no other collaborators left");
            self.inner.events.emit(CollabEvent::CollaborationEnded);
        }
        self.apply_tier(active);
    }

    /// Recompute the sync tier; restart the timer only on change.
    fn apply_tier(&self, active: &mut Active) {
        let tier = active.activity.tier(active.others, Instant::now());
        if tier == active.tier {
            return;
        }
        log::debug!("sync tier {:?} -> {tier:?}", active.tier);
        active.tier = tier;
        self.inner.events.emit(CollabEvent::SyncTierChanged { tier });

        if let Some(timer) = active.sync_timer.take() {
            timer.abort();
        }
        if let Some(period) = tier.interval(&self.inner.config.sync) {
            active.sync_timer = Some(tokio::spawn(run_sync_timer(
                Arc::downgrade(&self.inner),
                active.session_id.clone(),
                period,
            )));
        }
    }

    async fn remove_own_presence(&self, session_id: &str, path: &Path) {
        let policy = &self.inner.config.file_retry;
        let store = self.inner.store.as_ref();
        let mut doc = match read_with_retry(store, path, policy).await {
            Ok(doc) => doc,
            Err(e) => {
                self.report_file_error(FileOp::Read, &e);
                return;
            }
        };
        if doc.remove_presence(session_id).is_none() {
            return;
        }
        doc.revision += 1;
        if let Err(e) = write_with_retry(store, path, &doc, policy).await {
            self.report_file_error(FileOp::Write, &e);
        }
    }

    fn report_file_error(&self, op: FileOp, error: &StoreError) {
        log::warn!("shared file {op:?} failed: {error}");
        self.inner.events.emit(CollabEvent::SharedFileError {
            op,
            message: error.to_string(),
        });
    }

    // ── Editing locks ───────────────────────────────────────────────

    async fn lock_context(&self) -> Option<LockContext> {
        self.inner.state.read().await.as_ref().map(|a| LockContext {
            session_id: a.session_id.clone(),
            user_name: a.user_name.clone(),
            presence_path: a.presence_path.clone(),
            others: a.others,
        })
    }

    /// Claim `target_id` for editing.
    ///
    /// Granted without touching the file while nobody else is around, and
    /// granted when the shared file cannot be read or written.
    pub async fn acquire(&self, target_id: &str) -> LockResult {
        let Some(ctx) = self.lock_context().await else {
            return LockResult::granted();
        };
        if ctx.others == 0 {
            return LockResult::granted();
        }

        let policy = &self.inner.config.file_retry;
        let store = self.inner.store.as_ref();
        let mut doc = match read_with_retry(store, &ctx.presence_path, policy).await {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("cannot verify lock on {target_id}, allowing edit");
                self.report_file_error(FileOp::Read, &e);
                return LockResult::granted();
            }
        };

        let result = doc.try_acquire(
            target_id,
            &ctx.session_id,
            &ctx.user_name,
            Utc::now(),
            self.inner.config.lock_timeout(),
        );
        if !result.success {
            log::debug!("lock on {target_id} held by {:?}", result.locked_by);
            return result;
        }

        if !self.is_current(&ctx.session_id).await {
            return LockResult::granted();
        }
        doc.revision += 1;
        if let Err(e) = write_with_retry(store, &ctx.presence_path, &doc, policy).await {
            log::warn!("cannot record lock on {target_id}, allowing edit");
            self.report_file_error(FileOp::Write, &e);
            return LockResult::granted();
        }

        {
            let mut state = self.inner.state.write().await;
            if let Some(active) = current_mut(&mut state, &ctx.session_id) {
                active.owned_locks.insert(target_id.to_string());
                self.inner.events.emit(CollabEvent::LockAcquired {
                    target_id: target_id.to_string(),
                });
                return result;
            }
        }

        // Stopped or switched while the write was in flight. Our snapshot
        // may have restored the lock and our presence entry.
        log::debug!("session {} ended during lock write on {target_id}", ctx.session_id);
        self.release_locks(&ctx.session_id, &ctx.presence_path, &[target_id.to_string()])
            .await;
        self.remove_own_presence(&ctx.session_id, &ctx.presence_path).await;
        LockResult::granted()
    }

    /// Drop our lock on `target_id`. Returns true if one was removed.
    pub async fn release(&self, target_id: &str) -> bool {
        let (session_id, path, owned) = {
            let state = self.inner.state.read().await;
            let Some(active) = state.as_ref() else {
                return false;
            };
            (
                active.session_id.clone(),
                active.presence_path.clone(),
                active.owned_locks.contains(target_id),
            )
        };
        if !owned {
            return false;
        }
        self.release_locks(&session_id, &path, &[target_id.to_string()]).await > 0
    }

    /// Remove the given locks in one read-modify-write. Returns how many
    /// were removed from the file.
    async fn release_locks(&self, session_id: &str, path: &Path, targets: &[String]) -> usize {
        let policy = &self.inner.config.file_retry;
        let store = self.inner.store.as_ref();

        let released = match read_with_retry(store, path, policy).await {
            Ok(mut doc) => {
                let released: Vec<&String> = targets
                    .iter()
                    .filter(|target| doc.release(target, session_id))
                    .collect();
                if !released.is_empty() {
                    doc.revision += 1;
                    if let Err(e) = write_with_retry(store, path, &doc, policy).await {
                        self.report_file_error(FileOp::Write, &e);
                    }
                }
                released.len()
            }
            Err(e) => {
                self.report_file_error(FileOp::Read, &e);
                0
            }
        };

        let mut state = self.inner.state.write().await;
        if let Some(active) = current_mut(&mut state, session_id) {
            for target in targets {
                if active.owned_locks.remove(target) {
                    self.inner.events.emit(CollabEvent::LockReleased {
                        target_id: target.clone(),
                    });
                }
            }
        }
        released
    }

    /// Read-only lock check. Reports unlocked when alone or when the
    /// shared file cannot be read.
    pub async fn query_lock(&self, target_id: &str) -> LockStatus {
        let Some(ctx) = self.lock_context().await else {
            return LockStatus::default();
        };
        if ctx.others == 0 {
            return LockStatus::default();
        }
        match read_with_retry(self.inner.store.as_ref(), &ctx.presence_path, &self.inner.config.file_retry)
            .await
        {
            Ok(doc) => doc.lock_status(
                target_id,
                &ctx.session_id,
                Utc::now(),
                self.inner.config.lock_timeout(),
            ),
            Err(e) => {
                self.report_file_error(FileOp::Read, &e);
                LockStatus::default()
            }
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    async fn handle_remote(&self, msg: SyncMessage) {
        let outcome = match msg.msg_type.category() {
            MessageCategory::Connection => Ok(None),
            MessageCategory::Mutation => self.apply_mutation(&msg),
            MessageCategory::Presence => self.apply_presence(&msg).await,
            MessageCategory::Sync => self.apply_sync(&msg).await,
        };
        match outcome {
            Ok(Some(event)) => {
                self.inner.events.emit(event);
            }
            Ok(None) => {}
            Err(e) => log::warn!("dropping {} from {}: {e}", msg.msg_type, msg.from),
        }
    }

    /// Route a mutation to the annotation store. Missing record
    /// timestamps fall back to the message's send time.
    fn apply_mutation(&self, msg: &SyncMessage) -> Result<Option<CollabEvent>, CollabError> {
        let store = &self.inner.annotations;
        let sent_at = Some(msg.timestamp.as_str());
        let from = msg.from.clone();
        let id_of = |value: &Value| value.get("id").and_then(Value::as_str).map(str::to_string);

        let event = match msg.msg_type {
            MessageType::CommentAdd => {
                let comment_id = id_of(&msg.data).unwrap_or_default();
                store.add_from_remote(msg.data.clone())?.then(|| CollabEvent::RemoteComment {
                    kind: MutationKind::Added,
                    from,
                    comment_id,
                })
            }
            MessageType::CommentUpdate => {
                let p: RecordUpdate = msg.payload()?;
                let at = p.updated_at.as_deref().or(sent_at);
                store.update_from_remote(&p.id, p.changes.clone(), at)?.then(|| {
                    CollabEvent::RemoteComment { kind: MutationKind::Updated, from, comment_id: p.id.clone() }
                })
            }
            MessageType::CommentDelete => {
                let p: RecordRef = msg.payload()?;
                let at = p.deleted_at.as_deref().or(sent_at);
                store.delete_from_remote(&p.id, at)?.then(|| CollabEvent::RemoteComment {
                    kind: MutationKind::Deleted,
                    from,
                    comment_id: p.id.clone(),
                })
            }
            MessageType::CommentResolve => {
                let p: ResolveChange = msg.payload()?;
                let at = p.updated_at.as_deref().or(sent_at);
                store.resolve_from_remote(&p.id, p.resolved, at)?.then(|| {
                    CollabEvent::RemoteComment { kind: MutationKind::Resolved, from, comment_id: p.id.clone() }
                })
            }
            MessageType::ReplyAdd => {
                let p: ReplyAdd = msg.payload()?;
                let reply_id = id_of(&p.reply);
                store.add_reply_from_remote(&p.parent_id, p.reply.clone())?.then(|| {
                    CollabEvent::RemoteReply {
                        kind: MutationKind::Added,
                        from,
                        parent_id: p.parent_id.clone(),
                        reply_id,
                    }
                })
            }
            MessageType::ReplyUpdate => {
                let p: ReplyUpdate = msg.payload()?;
                let at = p.updated_at.as_deref().or(sent_at);
                store
                    .update_reply_from_remote(&p.parent_id, &p.reply_id, p.changes.clone(), at)?
                    .then(|| CollabEvent::RemoteReply {
                        kind: MutationKind::Updated,
                        from,
                        parent_id: p.parent_id.clone(),
                        reply_id: Some(p.reply_id.clone()),
                    })
            }
            MessageType::ReplyDelete => {
                let p: ReplyRef = msg.payload()?;
                let at = p.deleted_at.as_deref().or(sent_at);
                store
                    .delete_reply_from_remote(&p.parent_id, &p.reply_id, at)?
                    .then(|| CollabEvent::RemoteReply {
                        kind: MutationKind::Deleted,
                        from,
                        parent_id: p.parent_id.clone(),
                        reply_id: Some(p.reply_id.clone()),
                    })
            }
            MessageType::DrawingAdd => {
                let drawing_id = id_of(&msg.data);
                store.add_drawing_from_remote(msg.data.clone())?.then(|| CollabEvent::RemoteDrawing {
                    kind: MutationKind::Added,
                    from,
                    drawing_id,
                })
            }
            MessageType::DrawingUpdate => {
                let p: RecordUpdate = msg.payload()?;
                let at = p.updated_at.as_deref().or(sent_at);
                store.update_drawing_from_remote(&p.id, p.changes.clone(), at)?.then(|| {
                    CollabEvent::RemoteDrawing { kind: MutationKind::Updated, from, drawing_id: Some(p.id.clone()) }
                })
            }
            MessageType::DrawingDelete => {
                let p: RecordRef = msg.payload()?;
                let at = p.deleted_at.as_deref().or(sent_at);
                store.delete_drawing_from_remote(&p.id, at)?.then(|| CollabEvent::RemoteDrawing {
                    kind: MutationKind::Deleted,
                    from,
                    drawing_id: Some(p.id.clone()),
                })
            }
            MessageType::DrawingClear => {
                let p: DrawingClear = msg.payload()?;
                let at = p.cleared_at.as_deref().or(sent_at);
                let cleared = store.clear_drawings_from_remote(p.frame, at)?;
                (cleared > 0).then(|| CollabEvent::RemoteDrawing {
                    kind: MutationKind::Cleared,
                    from,
                    drawing_id: None,
                })
            }
            _ => None,
        };
        Ok(event)
    }

    async fn apply_presence(&self, msg: &SyncMessage) -> Result<Option<CollabEvent>, CollabError> {
        let mut state = self.inner.state.write().await;
        let Some(active) = state.as_mut() else {
            return Ok(None);
        };
        let changed = match msg.msg_type {
            MessageType::FramePosition => {
                let p: FramePosition = msg.payload()?;
                active.room.apply_frame(&msg.from, &msg.from_name, &msg.timestamp, p.frame)
            }
            MessageType::Cursor => {
                let p: CursorPosition = msg.payload()?;
                active.room.apply_cursor(&msg.from, &msg.from_name, &msg.timestamp, p)
            }
            _ => false,
        };
        Ok(changed.then(|| CollabEvent::PeerPresenceChanged { peer_id: msg.from.clone() }))
    }

    async fn apply_sync(&self, msg: &SyncMessage) -> Result<Option<CollabEvent>, CollabError> {
        match msg.msg_type {
            MessageType::SyncRequest => {
                let snapshot = self.inner.annotations.snapshot();
                if let Some(connections) = self.connection_manager().await {
                    connections
                        .send(&msg.from, &OutboundMessage::sync_response(&snapshot))
                        .await?;
                    log::debug!(
                        "sent {} comments, {} drawings to {}",
                        snapshot.comments.len(),
                        snapshot.drawings.len(),
                        msg.from
                    );
                }
                Ok(None)
            }
            MessageType::SyncResponse => {
                let snapshot: SyncSnapshot = msg.payload()?;
                let store = &self.inner.annotations;
                let mut comments = 0;
                for record in snapshot.comments {
                    match store.add_from_remote(record) {
                        Ok(true) => comments += 1,
                        Ok(false) => {}
                        Err(e) => log::debug!("skipping synced comment: {e}"),
                    }
                }
                let mut drawings = 0;
                for record in snapshot.drawings {
                    match store.add_drawing_from_remote(record) {
                        Ok(true) => drawings += 1,
                        Ok(false) => {}
                        Err(e) => log::debug!("skipping synced drawing: {e}"),
                    }
                }
                log::info!(
                    "merged state from {}: {comments} comments, {drawings} drawings changed",
                    msg.from
                );
                Ok(Some(CollabEvent::SyncCompleted { comments, drawings }))
            }
            _ => Ok(None),
        }
    }

    async fn on_connection_event(&self, session_id: &str, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(peer) => {
                let connections = {
                    let mut state = self.inner.state.write().await;
                    let Some(active) = current_mut(&mut state, session_id) else {
                        return;
                    };
                    active.room.join(&peer.id, &peer.display_name);
                    active.connections()
                };
                self.inner.events.emit(CollabEvent::PeerConnected {
                    peer_id: peer.id.clone(),
                    name: peer.display_name.clone(),
                });
                // Catch up on whatever the peer already has
                if let Some(connections) = connections {
                    if let Err(e) = connections.send(&peer.id, &OutboundMessage::sync_request()).await {
                        log::debug!("sync request to {} failed: {e}", peer.id);
                    }
                }
            }
            ConnectionEvent::Disconnected { peer_id, reason } => {
                if let Some(active) = current_mut(&mut *self.inner.state.write().await, session_id) {
                    active.room.remove(&peer_id);
                }
                self.inner.events.emit(CollabEvent::PeerDisconnected { peer_id, reason });
            }
            ConnectionEvent::Reconnecting { peer_id, attempt } => {
                self.inner.events.emit(CollabEvent::PeerReconnecting { peer_id, attempt });
            }
        }
    }

    async fn on_discovery_event(&self, session_id: &str, event: DiscoveryEvent) {
        let Some(direct) = self.direct_link(session_id).await else {
            return;
        };
        match event {
            DiscoveryEvent::PeerAppeared(peer) => {
                // The smaller session id initiates
                if session_id < peer.id.as_str() {
                    direct.connections.connect(peer).await;
                } else {
                    log::debug!("waiting for {} to initiate", peer.id);
                }
            }
            DiscoveryEvent::PeerDisappeared { peer, reason } => {
                log::debug!("dropping connection to {}: {reason}", peer.id);
                direct.connections.disconnect(&peer.id).await;
            }
            DiscoveryEvent::Signal { from, payload } => match direct.discovery.peer(&from).await {
                Some(peer) => direct.connections.handle_signal(&peer, &payload).await,
                None => log::debug!("signal from unknown peer {from} dropped"),
            },
        }
    }
}

async fn run_presence_loop(weak: Weak<Inner>, session_id: String, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { break };
        let session = CollaborationSession { inner };
        if !session.publish_presence_for(&session_id).await {
            break;
        }
    }
}

async fn run_sync_timer(weak: Weak<Inner>, session_id: String, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { break };
        CollaborationSession { inner }.sync_pass(&session_id).await;
    }
}

async fn run_discovery_events(
    weak: Weak<Inner>,
    session_id: String,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        CollaborationSession { inner }.on_discovery_event(&session_id, event).await;
    }
}

async fn run_connection_events(
    weak: Weak<Inner>,
    session_id: String,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        CollaborationSession { inner }.on_connection_event(&session_id, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::InMemoryAnnotations;
    use crate::shared_file::MemoryStore;

    fn entry(name: &str, last_seen_at: DateTime<Utc>) -> PresenceEntry {
        PresenceEntry {
            name: name.into(),
            color: "#000000".into(),
            last_seen_at,
            started_at: last_seen_at,
        }
    }

    fn session(store: &MemoryStore) -> CollaborationSession {
        CollaborationSession::new(
            CollabConfig::default(),
            Arc::new(store.clone()),
            Arc::new(InMemoryAnnotations::new()),
        )
    }

    #[test]
    fn test_hold_last_known_only_ages_out() {
        let now = Utc::now();
        let timeout = Duration::from_secs(45);
        let mut previous = BTreeMap::new();
        previous.insert("me".to_string(), entry("me", now - chrono::Duration::seconds(10)));
        previous.insert("fresh".to_string(), entry("fresh", now - chrono::Duration::seconds(30)));
        previous.insert("old".to_string(), entry("old", now - chrono::Duration::seconds(50)));

        let kept = hold_last_known(previous, "me", entry("me", now), now, timeout);

        assert_eq!(kept.keys().cloned().collect::<Vec<_>>(), vec!["fresh", "me"]);
        assert_eq!(kept["me"].last_seen_at, now);
    }

    #[tokio::test]
    async fn test_start_publishes_and_stop_removes_presence() {
        let store = MemoryStore::new();
        let session = session(&store);
        let mut events = session.subscribe();

        let id = session.start("/reviews/shot.mov", "Ana").await.unwrap();
        let path = presence_path_for(Path::new("/reviews/shot.mov"));

        let doc = store.snapshot(&path).await.unwrap();
        assert!(doc.presence.contains_key(&id));
        assert_eq!(doc.revision, 1);
        assert!(matches!(events.recv().await, Ok(CollabEvent::SessionStarted { .. })));

        session.stop().await;
        let doc = store.snapshot(&path).await.unwrap();
        assert!(doc.presence.is_empty());
        assert!(!session.is_active().await);
        assert!(session.session_id().await.is_none());
    }

    #[tokio::test]
    async fn test_alone_locks_skip_the_file() {
        let store = MemoryStore::new();
        let session = session(&store);
        session.start("/reviews/shot.mov", "Ana").await.unwrap();

        let reads = store.read_count();
        let writes = store.write_count();
        assert!(session.acquire("m1").await.success);
        assert!(!session.query_lock("m1").await.locked);
        assert!(!session.release("m1").await);
        assert_eq!(store.read_count(), reads);
        assert_eq!(store.write_count(), writes);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_restart_replaces_session() {
        let store = MemoryStore::new();
        let session = session(&store);
        let first = session.start("/reviews/a.mov", "Ana").await.unwrap();
        let second = session.start("/reviews/a.mov", "Ana").await.unwrap();
        assert_ne!(first, second);

        let doc = store
            .snapshot(&presence_path_for(Path::new("/reviews/a.mov")))
            .await
            .unwrap();
        assert_eq!(doc.presence.keys().cloned().collect::<Vec<_>>(), vec![second]);
        assert!(session.collaborators().await.iter().all(|c| c.is_self));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_publish_without_peers_counts_activity() {
        let store = MemoryStore::new();
        let session = session(&store);
        assert_eq!(session.publish(OutboundMessage::comment_delete("c1", None)).await, 0);

        session.start("/reviews/a.mov", "Ana").await.unwrap();
        assert_eq!(session.publish(OutboundMessage::comment_delete("c1", None)).await, 0);
        assert_eq!(session.update_frame_position(12).await, 0);
        // Alone stays solo no matter the activity
        assert_eq!(session.sync_tier().await, SyncTier::Solo);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_switch_requires_running_session() {
        let session = session(&MemoryStore::new());
        assert!(matches!(
            session.switch_document("/x.mov").await,
            Err(CollabError::NotStarted)
        ));
    }
}
