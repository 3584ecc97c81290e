//! Shared presence/lock record kept next to the reviewed document.
//!
//! One JSON document per reviewed file, read-modify-written by every
//! participant:
//! ```text
//! {
//!   "presence":     { "<sessionId>": { name, color, lastSeenAt, startedAt } },
//!   "editingState": { "<targetId>":  { sessionId, userName, startedAt } },
//!   "revision": 17
//! }
//! ```
//!
//! There is no file lock. Concurrent writers race and the last one wins;
//! stale presence and expired locks are dropped lazily by whoever reads
//! next. Everything here is pure so the rules can be tested with explicit
//! clocks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One participant's presence entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub name: String,
    /// `#rrggbb`
    pub color: String,
    pub last_seen_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

/// A time-bounded claim on an annotation target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditingLock {
    pub session_id: String,
    pub user_name: String,
    pub started_at: DateTime<Utc>,
}

impl EditingLock {
    /// Valid only while `now - startedAt < timeout`.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        elapsed(now, self.started_at) >= timeout
    }
}

/// Result of `acquire`: `{success, lockedBy}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    pub success: bool,
    /// Holder's display name when `success` is false.
    pub locked_by: Option<String>,
}

impl LockResult {
    pub fn granted() -> Self {
        Self { success: true, locked_by: None }
    }

    pub fn denied(holder: impl Into<String>) -> Self {
        Self { success: false, locked_by: Some(holder.into()) }
    }
}

/// Result of `query_lock`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockStatus {
    pub locked: bool,
    pub locked_by: Option<String>,
    /// Held by the querying session.
    pub own: bool,
}

/// A participant as exposed to the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub session_id: String,
    pub name: String,
    pub color: String,
    pub last_seen_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub is_self: bool,
}

/// The whole shared record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDocument {
    #[serde(default)]
    pub presence: BTreeMap<String, PresenceEntry>,
    #[serde(default)]
    pub editing_state: BTreeMap<String, EditingLock>,
    /// Bumped by every writer.
    #[serde(default)]
    pub revision: u64,
}

impl SharedDocument {
    /// Write or refresh a presence entry. `lastSeenAt` never moves backwards.
    pub fn upsert_presence(&mut self, session_id: &str, mut entry: PresenceEntry) {
        if let Some(existing) = self.presence.get(session_id) {
            if existing.last_seen_at > entry.last_seen_at {
                entry.last_seen_at = existing.last_seen_at;
            }
        }
        self.presence.insert(session_id.to_string(), entry);
    }

    pub fn remove_presence(&mut self, session_id: &str) -> Option<PresenceEntry> {
        self.presence.remove(session_id)
    }

    /// Drop presence entries not seen within `timeout`. Returns evicted ids.
    pub fn evict_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        evict_stale_entries(&mut self.presence, now, timeout)
    }

    /// Drop locks past `timeout`. Returns the freed target ids.
    pub fn prune_expired_locks(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .editing_state
            .iter()
            .filter(|(_, lock)| lock.is_expired(now, timeout))
            .map(|(target, _)| target.clone())
            .collect();
        for target in &expired {
            self.editing_state.remove(target);
        }
        expired
    }

    /// Attempt to take the lock on `target_id` for `session_id`.
    ///
    /// Succeeds when the target is free, already ours, or the existing lock
    /// has expired; a live lock held by another session wins.
    pub fn try_acquire(
        &mut self,
        target_id: &str,
        session_id: &str,
        user_name: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> LockResult {
        if let Some(existing) = self.editing_state.get(target_id) {
            if existing.session_id != session_id && !existing.is_expired(now, timeout) {
                return LockResult::denied(existing.user_name.clone());
            }
        }
        self.editing_state.insert(
            target_id.to_string(),
            EditingLock {
                session_id: session_id.to_string(),
                user_name: user_name.to_string(),
                started_at: now,
            },
        );
        LockResult::granted()
    }

    /// Remove the lock only if `session_id` owns it.
    pub fn release(&mut self, target_id: &str, session_id: &str) -> bool {
        match self.editing_state.get(target_id) {
            Some(lock) if lock.session_id == session_id => {
                self.editing_state.remove(target_id);
                true
            }
            _ => false,
        }
    }

    /// Read-only lock check with the same expiry rule as `try_acquire`.
    pub fn lock_status(
        &self,
        target_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> LockStatus {
        match self.editing_state.get(target_id) {
            Some(lock) if !lock.is_expired(now, timeout) => LockStatus {
                locked: true,
                locked_by: Some(lock.user_name.clone()),
                own: lock.session_id == session_id,
            },
            _ => LockStatus::default(),
        }
    }

    /// Every participant, flagging `own_session`.
    pub fn collaborators(&self, own_session: &str) -> Vec<Collaborator> {
        collaborators_from(&self.presence, own_session)
    }
}

/// Duration since `since`, zero if `since` is in the future (clock skew).
pub fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Timeout eviction over a bare presence map, shared by the file path and
/// the in-memory fallback used when the file cannot be read.
pub fn evict_stale_entries(
    presence: &mut BTreeMap<String, PresenceEntry>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Vec<String> {
    let stale: Vec<String> = presence
        .iter()
        .filter(|(_, entry)| elapsed(now, entry.last_seen_at) > timeout)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &stale {
        presence.remove(id);
    }
    stale
}

pub fn collaborators_from(
    presence: &BTreeMap<String, PresenceEntry>,
    own_session: &str,
) -> Vec<Collaborator> {
    presence
        .iter()
        .map(|(id, entry)| Collaborator {
            session_id: id.clone(),
            name: entry.name.clone(),
            color: entry.color.clone(),
            last_seen_at: entry.last_seen_at,
            started_at: entry.started_at,
            is_self: id == own_session,
        })
        .collect()
}

/// Location of the shared record for a document: `dir/.name.ext.collab.json`.
pub fn presence_path_for(document: &Path) -> PathBuf {
    let name = document
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let file = format!(".{name}.collab.json");
    match document.parent() {
        Some(dir) => dir.join(file),
        None => PathBuf::from(file),
    }
}

// ───────────────────────────────────────────────────────────────────
// Session colours
// ───────────────────────────────────────────────────────────────────

/// Stable, vivid colour for a session id, as `#rrggbb`.
pub fn color_for_session(session_id: &str) -> String {
    // FNV-1a over the id; hue from the hash keeps colours stable across restarts
    let mut hash: u32 = 0x811c_9dc5;
    for byte in session_id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.55);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LOCK_TIMEOUT: Duration = Duration::from_secs(60);
    const PRESENCE_TIMEOUT: Duration = Duration::from_secs(45);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_780_000_000 + secs, 0).unwrap()
    }

    fn entry(name: &str, seen: DateTime<Utc>) -> PresenceEntry {
        PresenceEntry {
            name: name.into(),
            color: color_for_session(name),
            last_seen_at: seen,
            started_at: seen,
        }
    }

    #[test]
    fn test_lock_blocks_other_session_until_expiry() {
        let mut doc = SharedDocument::default();
        assert!(doc.try_acquire("m1", "a", "Alice", at(0), LOCK_TIMEOUT).success);

        let denied = doc.try_acquire("m1", "b", "Bob", at(59), LOCK_TIMEOUT);
        assert_eq!(denied, LockResult::denied("Alice"));

        let granted = doc.try_acquire("m1", "b", "Bob", at(60), LOCK_TIMEOUT);
        assert!(granted.success);
        assert_eq!(doc.editing_state["m1"].session_id, "b");
    }

    #[test]
    fn test_own_lock_is_refreshed() {
        let mut doc = SharedDocument::default();
        doc.try_acquire("m1", "a", "Alice", at(0), LOCK_TIMEOUT);
        assert!(doc.try_acquire("m1", "a", "Alice", at(30), LOCK_TIMEOUT).success);
        assert_eq!(doc.editing_state["m1"].started_at, at(30));
    }

    #[test]
    fn test_release_requires_ownership() {
        let mut doc = SharedDocument::default();
        doc.try_acquire("m1", "a", "Alice", at(0), LOCK_TIMEOUT);

        assert!(!doc.release("m1", "b"));
        assert!(doc.editing_state.contains_key("m1"));

        assert!(doc.release("m1", "a"));
        assert!(doc.editing_state.is_empty());
        assert!(!doc.release("m1", "a"));
    }

    #[test]
    fn test_lock_status_applies_expiry() {
        let mut doc = SharedDocument::default();
        doc.try_acquire("m1", "a", "Alice", at(0), LOCK_TIMEOUT);

        let status = doc.lock_status("m1", "b", at(10), LOCK_TIMEOUT);
        assert!(status.locked);
        assert!(!status.own);
        assert_eq!(status.locked_by.as_deref(), Some("Alice"));

        assert!(doc.lock_status("m1", "a", at(10), LOCK_TIMEOUT).own);
        assert_eq!(doc.lock_status("m1", "b", at(61), LOCK_TIMEOUT), LockStatus::default());
        // Query never mutates
        assert!(doc.editing_state.contains_key("m1"));
    }

    #[test]
    fn test_prune_expired_locks() {
        let mut doc = SharedDocument::default();
        doc.try_acquire("old", "a", "Alice", at(0), LOCK_TIMEOUT);
        doc.try_acquire("new", "a", "Alice", at(50), LOCK_TIMEOUT);

        let freed = doc.prune_expired_locks(at(70), LOCK_TIMEOUT);
        assert_eq!(freed, vec!["old".to_string()]);
        assert!(doc.editing_state.contains_key("new"));
    }

    #[test]
    fn test_eviction_is_idempotent_for_live_peers() {
        let mut doc = SharedDocument::default();
        doc.upsert_presence("a", entry("Alice", at(0)));
        doc.upsert_presence("b", entry("Bob", at(10)));

        assert!(doc.evict_stale(at(40), PRESENCE_TIMEOUT).is_empty());
        assert!(doc.evict_stale(at(44), PRESENCE_TIMEOUT).is_empty());
        assert_eq!(doc.presence.len(), 2);

        assert_eq!(doc.evict_stale(at(46), PRESENCE_TIMEOUT), vec!["a".to_string()]);
        assert!(doc.presence.contains_key("b"));
    }

    #[test]
    fn test_last_seen_never_regresses() {
        let mut doc = SharedDocument::default();
        doc.upsert_presence("a", entry("Alice", at(20)));
        doc.upsert_presence("a", entry("Alice", at(10)));
        assert_eq!(doc.presence["a"].last_seen_at, at(20));
    }

    #[test]
    fn test_future_timestamps_are_fresh() {
        let mut doc = SharedDocument::default();
        doc.upsert_presence("skewed", entry("Skewed", at(100)));
        assert!(doc.evict_stale(at(0), PRESENCE_TIMEOUT).is_empty());
    }

    #[test]
    fn test_json_shape() {
        let mut doc = SharedDocument::default();
        doc.upsert_presence("a", entry("Alice", at(0)));
        doc.try_acquire("m1", "a", "Alice", at(0), LOCK_TIMEOUT);

        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["presence"]["a"]["lastSeenAt"].is_string());
        assert_eq!(json["editingState"]["m1"]["userName"], "Alice");
        assert_eq!(json["editingState"]["m1"]["sessionId"], "a");

        // Older writers omit editingState and revision
        let parsed: SharedDocument = serde_json::from_str(r#"{"presence": {}}"#).unwrap();
        assert!(parsed.editing_state.is_empty());
        assert_eq!(parsed.revision, 0);
    }

    #[test]
    fn test_collaborators_flags_self() {
        let mut doc = SharedDocument::default();
        doc.upsert_presence("a", entry("Alice", at(0)));
        doc.upsert_presence("b", entry("Bob", at(0)));

        let list = doc.collaborators("b");
        assert_eq!(list.len(), 2);
        assert!(list.iter().find(|c| c.session_id == "b").unwrap().is_self);
        assert!(!list.iter().find(|c| c.session_id == "a").unwrap().is_self);
    }

    #[test]
    fn test_presence_path() {
        let path = presence_path_for(Path::new("/mnt/share/reels/cut_04.mov"));
        assert_eq!(path, PathBuf::from("/mnt/share/reels/.cut_04.mov.collab.json"));
    }

    #[test]
    fn test_session_color_stable_hex() {
        let c1 = color_for_session("session-1");
        let c2 = color_for_session("session-1");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 7);
        assert!(c1.starts_with('#'));
        assert!(c1[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }
}
