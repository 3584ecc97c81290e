//! Live presence of connected peers: playhead frame and pointer position.
//!
//! ```text
//! Local playhead / pointer move
//!       │
//!       ▼
//! CollaborationSession::update_frame_position() / update_cursor()
//!       │  presence:frame / presence:cursor (broadcast)
//!       ▼
//! Remote PresenceRoom::apply_frame() / apply_cursor()
//!       │
//!       ▼
//! CollabEvent::PeerPresenceChanged → UI overlay
//! ```
//!
//! Updates carry the sender's send time; anything older than what we
//! already hold for that peer is dropped so reordered frames never move a
//! playhead backwards. Peers that go quiet are dropped by
//! [`PresenceRoom::cleanup_idle`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::presence_file::color_for_session;
use crate::protocol::{compare_timestamps, CursorPosition};

/// One remote peer's live state.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub session_id: String,
    pub name: String,
    /// `#rrggbb`, derived from the session id
    pub color: String,
    pub frame: Option<u64>,
    pub cursor: Option<CursorPosition>,
    /// Sender timestamp of the newest applied update.
    last_timestamp: Option<String>,
    last_update: Instant,
}

impl PeerPresence {
    pub fn new(session_id: impl Into<String>, name: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self {
            color: color_for_session(&session_id),
            session_id,
            name: name.into(),
            frame: None,
            cursor: None,
            last_timestamp: None,
            last_update: Instant::now(),
        }
    }

    /// Accept an update stamped `timestamp` unless it is older than the last one.
    fn accept(&mut self, timestamp: &str) -> bool {
        if compare_timestamps(Some(timestamp), self.last_timestamp.as_deref()).is_lt() {
            return false;
        }
        self.last_timestamp = Some(timestamp.to_string());
        self.last_update = Instant::now();
        true
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }

    pub fn time_since_update(&self) -> Duration {
        self.last_update.elapsed()
    }
}

/// Tracks every connected peer's presence for one session.
#[derive(Debug)]
pub struct PresenceRoom {
    local_session_id: String,
    peers: HashMap<String, PeerPresence>,
    idle_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(local_session_id: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            local_session_id: local_session_id.into(),
            peers: HashMap::new(),
            idle_timeout,
        }
    }

    fn entry(&mut self, session_id: &str, name: &str) -> Option<&mut PeerPresence> {
        if session_id == self.local_session_id {
            return None;
        }
        let peer = self
            .peers
            .entry(session_id.to_string())
            .or_insert_with(|| PeerPresence::new(session_id, name));
        if !name.is_empty() && peer.name != name {
            peer.name = name.to_string();
        }
        Some(peer)
    }

    /// Apply a `presence:frame` update. Returns whether state changed.
    pub fn apply_frame(&mut self, from: &str, name: &str, timestamp: &str, frame: u64) -> bool {
        let Some(peer) = self.entry(from, name) else {
            return false;
        };
        if !peer.accept(timestamp) {
            return false;
        }
        peer.frame = Some(frame);
        true
    }

    /// Apply a `presence:cursor` update. A cursor that names a frame also
    /// moves the peer's playhead.
    pub fn apply_cursor(
        &mut self,
        from: &str,
        name: &str,
        timestamp: &str,
        cursor: CursorPosition,
    ) -> bool {
        let Some(peer) = self.entry(from, name) else {
            return false;
        };
        if !peer.accept(timestamp) {
            return false;
        }
        if cursor.frame.is_some() {
            peer.frame = cursor.frame;
        }
        peer.cursor = Some(cursor);
        true
    }

    /// Register a peer as soon as its connection opens.
    pub fn join(&mut self, session_id: &str, name: &str) {
        let _ = self.entry(session_id, name);
    }

    pub fn remove(&mut self, session_id: &str) -> Option<PeerPresence> {
        self.peers.remove(session_id)
    }

    /// Drop peers with no update for longer than the idle timeout.
    pub fn cleanup_idle(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }

        stale
    }

    pub fn peer(&self, session_id: &str) -> Option<&PeerPresence> {
        self.peers.get(session_id)
    }

    pub fn peers(&self) -> Vec<PeerPresence> {
        self.peers.values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: &str = "2026-03-01T10:00:00.000Z";
    const T2: &str = "2026-03-01T10:00:01.000Z";
    const T3: &str = "2026-03-01T10:00:02.000Z";

    fn room() -> PresenceRoom {
        PresenceRoom::new("local", Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_frame_update_creates_peer() {
        let mut room = room();
        assert!(room.apply_frame("p1", "Bob", T1, 120));

        let peer = room.peer("p1").unwrap();
        assert_eq!(peer.frame, Some(120));
        assert_eq!(peer.name, "Bob");
        assert!(peer.color.starts_with('#'));
    }

    #[tokio::test]
    async fn test_ignores_self() {
        let mut room = room();
        assert!(!room.apply_frame("local", "Me", T1, 10));
        room.join("local", "Me");
        assert_eq!(room.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_reordered_updates() {
        let mut room = room();
        room.apply_frame("p1", "Bob", T3, 300);
        assert!(!room.apply_frame("p1", "Bob", T2, 200));
        assert_eq!(room.peer("p1").unwrap().frame, Some(300));

        // Same timestamp is accepted (two updates in one millisecond)
        assert!(room.apply_frame("p1", "Bob", T3, 301));
        assert_eq!(room.peer("p1").unwrap().frame, Some(301));
    }

    #[tokio::test]
    async fn test_cursor_with_frame_moves_playhead() {
        let mut room = room();
        room.apply_frame("p1", "Bob", T1, 10);
        let cursor = CursorPosition { x: 0.25, y: 0.5, frame: Some(42) };
        assert!(room.apply_cursor("p1", "Bob", T2, cursor));

        let peer = room.peer("p1").unwrap();
        assert_eq!(peer.frame, Some(42));
        assert_eq!(peer.cursor, Some(cursor));

        let no_frame = CursorPosition { x: 0.3, y: 0.5, frame: None };
        room.apply_cursor("p1", "Bob", T3, no_frame);
        assert_eq!(room.peer("p1").unwrap().frame, Some(42));
    }

    #[tokio::test]
    async fn test_stale_cursor_is_rejected() {
        let mut room = room();
        let newer = CursorPosition { x: 0.9, y: 0.1, frame: Some(80) };
        assert!(room.apply_cursor("p1", "Bob", T3, newer));

        let older = CursorPosition { x: 0.1, y: 0.9, frame: Some(20) };
        assert!(!room.apply_cursor("p1", "Bob", T2, older));
        // A frame update older than the cursor loses too
        assert!(!room.apply_frame("p1", "Bob", T1, 5));

        let peer = room.peer("p1").unwrap();
        assert_eq!(peer.cursor, Some(newer));
        assert_eq!(peer.frame, Some(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_idle_peers() {
        let mut room = room();
        room.apply_frame("quiet", "Q", T1, 1);
        tokio::time::advance(Duration::from_secs(20)).await;
        room.apply_frame("busy", "B", T1, 1);
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(room.cleanup_idle(), vec!["quiet".to_string()]);
        assert!(room.peer("busy").is_some());
    }

    #[tokio::test]
    async fn test_remove_and_rename() {
        let mut room = room();
        room.join("p1", "Bob");
        room.apply_frame("p1", "Robert", T1, 5);
        assert_eq!(room.peer("p1").unwrap().name, "Robert");

        assert!(room.remove("p1").is_some());
        assert_eq!(room.peer_count(), 0);
    }
}
