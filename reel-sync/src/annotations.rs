//! Annotation-state collaborator.
//!
//! The orchestrator never resolves conflicts itself: it forwards every
//! inbound mutation to an [`AnnotationStore`], which owns the records and
//! applies last-write-wins on each record's `updatedAt`/`deletedAt`.
//! Deletions are tombstones (`deleted: true` plus `deletedAt`) so they
//! survive a full-state sync and beat late-arriving stale adds.
//!
//! [`InMemoryAnnotations`] is the reference implementation. Records are
//! plain JSON objects; only `id`, `updatedAt`, `deletedAt`, `deleted`,
//! `frame` and `replies` are interpreted.

use std::collections::BTreeMap;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::AnnotationError;
use crate::protocol::{compare_timestamps, SyncSnapshot};

/// Receiver of remote mutations and source of sync snapshots.
///
/// Every `*_from_remote` returns whether the mutation changed local state;
/// `false` means it lost last-write-wins or referred to an unknown record.
pub trait AnnotationStore: Send + Sync {
    /// Add a comment, or merge it into an existing one with the same id.
    fn add_from_remote(&self, record: Value) -> Result<bool, AnnotationError>;

    fn update_from_remote(
        &self,
        id: &str,
        changes: Value,
        updated_at: Option<&str>,
    ) -> Result<bool, AnnotationError>;

    fn delete_from_remote(&self, id: &str, deleted_at: Option<&str>)
        -> Result<bool, AnnotationError>;

    fn resolve_from_remote(
        &self,
        id: &str,
        resolved: bool,
        updated_at: Option<&str>,
    ) -> Result<bool, AnnotationError> {
        let mut changes = Map::new();
        changes.insert("resolved".into(), Value::Bool(resolved));
        self.update_from_remote(id, Value::Object(changes), updated_at)
    }

    fn add_reply_from_remote(&self, parent_id: &str, reply: Value) -> Result<bool, AnnotationError>;

    fn update_reply_from_remote(
        &self,
        parent_id: &str,
        reply_id: &str,
        changes: Value,
        updated_at: Option<&str>,
    ) -> Result<bool, AnnotationError>;

    fn delete_reply_from_remote(
        &self,
        parent_id: &str,
        reply_id: &str,
        deleted_at: Option<&str>,
    ) -> Result<bool, AnnotationError>;

    fn add_drawing_from_remote(&self, drawing: Value) -> Result<bool, AnnotationError>;

    fn update_drawing_from_remote(
        &self,
        id: &str,
        changes: Value,
        updated_at: Option<&str>,
    ) -> Result<bool, AnnotationError>;

    fn delete_drawing_from_remote(
        &self,
        id: &str,
        deleted_at: Option<&str>,
    ) -> Result<bool, AnnotationError>;

    /// Tombstone every drawing on `frame`, or every drawing when `None`.
    /// Returns how many were cleared.
    fn clear_drawings_from_remote(
        &self,
        frame: Option<u64>,
        cleared_at: Option<&str>,
    ) -> Result<usize, AnnotationError>;

    /// All comments, tombstones included.
    fn get_all(&self) -> Vec<Value>;

    fn get_by_id(&self, id: &str) -> Option<Value>;

    /// All drawings, tombstones included.
    fn get_all_drawings(&self) -> Vec<Value>;

    /// Reload from the durable channel, if the store has one.
    fn refresh(&self) -> BoxFuture<'_, Result<(), AnnotationError>> {
        Box::pin(async { Ok(()) })
    }

    /// Full-state snapshot for `sync:response`.
    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            comments: self.get_all(),
            drawings: self.get_all_drawings(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Record helpers
// ───────────────────────────────────────────────────────────────────

fn record_id(record: &Value) -> Result<String, AnnotationError> {
    record
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AnnotationError::Malformed("record has no id".into()))
}

fn field<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

fn is_deleted(record: &Value) -> bool {
    record.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

/// Latest of `updatedAt`, `deletedAt` and `createdAt`.
fn effective_timestamp(record: &Value) -> Option<&str> {
    ["updatedAt", "deletedAt", "createdAt"]
        .iter()
        .filter_map(|key| field(record, key))
        .max_by(|a, b| compare_timestamps(Some(*a), Some(*b)))
}

/// A change stamped `at` may apply unless it is older than the record.
/// A tombstone only yields to a strictly newer change.
fn change_applies(record: &Value, at: Option<&str>) -> bool {
    let current = effective_timestamp(record);
    if is_deleted(record) {
        compare_timestamps(at, current).is_gt()
    } else {
        !compare_timestamps(at, current).is_lt()
    }
}

fn apply_changes(record: &mut Value, changes: Value, updated_at: Option<&str>) -> Result<(), AnnotationError> {
    let Value::Object(changes) = changes else {
        return Err(AnnotationError::Malformed("changes must be an object".into()));
    };
    let Some(target) = record.as_object_mut() else {
        return Err(AnnotationError::Malformed("record is not an object".into()));
    };
    for (key, value) in changes {
        if key != "id" {
            target.insert(key, value);
        }
    }
    if let Some(at) = updated_at {
        target.insert("updatedAt".into(), Value::String(at.to_string()));
    }
    if target.get("deleted").and_then(Value::as_bool) == Some(true) {
        // Newer edit revives the record
        target.insert("deleted".into(), Value::Bool(false));
        target.remove("deletedAt");
    }
    Ok(())
}

fn tombstone(record: &mut Value, deleted_at: Option<&str>) {
    if let Some(target) = record.as_object_mut() {
        target.insert("deleted".into(), Value::Bool(true));
        if let Some(at) = deleted_at {
            target.insert("deletedAt".into(), Value::String(at.to_string()));
        }
    }
}

fn bare_tombstone(id: &str, deleted_at: Option<&str>) -> Value {
    let mut record = Map::new();
    record.insert("id".into(), Value::String(id.to_string()));
    let mut value = Value::Object(record);
    tombstone(&mut value, deleted_at);
    value
}

/// Last-write-wins insert into a keyed table.
fn merge_into(table: &mut BTreeMap<String, Value>, incoming: Value) -> Result<bool, AnnotationError> {
    let id = record_id(&incoming)?;
    match table.get_mut(&id) {
        None => {
            table.insert(id, incoming);
            Ok(true)
        }
        Some(existing) => {
            let newer = compare_timestamps(
                effective_timestamp(&incoming),
                effective_timestamp(existing),
            )
            .is_gt();
            let replies_changed = merge_replies(existing, &incoming)?;
            if newer {
                let replies = existing.get("replies").cloned();
                *existing = incoming;
                if let (Some(replies), Some(target)) = (replies, existing.as_object_mut()) {
                    target.insert("replies".into(), replies);
                }
            }
            Ok(newer || replies_changed)
        }
    }
}

fn replies_mut(record: &mut Value) -> Option<&mut Vec<Value>> {
    let target = record.as_object_mut()?;
    let replies = target
        .entry("replies")
        .or_insert_with(|| Value::Array(Vec::new()));
    replies.as_array_mut()
}

/// Union the incoming record's replies into `existing`, LWW per reply.
fn merge_replies(existing: &mut Value, incoming: &Value) -> Result<bool, AnnotationError> {
    let Some(theirs) = incoming.get("replies").and_then(Value::as_array) else {
        return Ok(false);
    };
    let mut changed = false;
    for reply in theirs {
        changed |= upsert_reply(existing, reply.clone())?;
    }
    Ok(changed)
}

fn upsert_reply(parent: &mut Value, reply: Value) -> Result<bool, AnnotationError> {
    let reply_id = record_id(&reply)?;
    let Some(replies) = replies_mut(parent) else {
        return Err(AnnotationError::Malformed("replies is not an array".into()));
    };
    match replies.iter_mut().find(|r| field(r, "id") == Some(reply_id.as_str())) {
        None => {
            replies.push(reply);
            Ok(true)
        }
        Some(existing) => {
            if compare_timestamps(effective_timestamp(&reply), effective_timestamp(existing)).is_gt() {
                *existing = reply;
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }
}

fn find_reply<'a>(parent: &'a mut Value, reply_id: &str) -> Option<&'a mut Value> {
    replies_mut(parent)?
        .iter_mut()
        .find(|r| field(r, "id") == Some(reply_id))
}

#[derive(Default)]
struct Tables {
    comments: BTreeMap<String, Value>,
    drawings: BTreeMap<String, Value>,
}

/// In-process annotation store with last-write-wins merge.
#[derive(Default)]
pub struct InMemoryAnnotations {
    tables: Mutex<Tables>,
}

impl InMemoryAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T, AnnotationError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| AnnotationError::Store("annotation table poisoned".into()))?;
        Ok(f(&mut tables))
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Option<T> {
        self.tables.lock().ok().map(|tables| f(&tables))
    }

    /// Live (non-tombstoned) comments.
    pub fn live_comments(&self) -> Vec<Value> {
        self.get_all().into_iter().filter(|c| !is_deleted(c)).collect()
    }

    pub fn live_drawings(&self) -> Vec<Value> {
        self.get_all_drawings().into_iter().filter(|d| !is_deleted(d)).collect()
    }
}

fn update_in(
    table: &mut BTreeMap<String, Value>,
    id: &str,
    changes: Value,
    updated_at: Option<&str>,
) -> Result<bool, AnnotationError> {
    match table.get_mut(id) {
        Some(record) if change_applies(record, updated_at) => {
            apply_changes(record, changes, updated_at)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn delete_in(table: &mut BTreeMap<String, Value>, id: &str, deleted_at: Option<&str>) -> bool {
    match table.get_mut(id) {
        None => {
            // Remember the delete so a stale add arriving later loses
            table.insert(id.to_string(), bare_tombstone(id, deleted_at));
            true
        }
        Some(record) if is_deleted(record) => false,
        Some(record) => {
            if compare_timestamps(deleted_at, effective_timestamp(record)).is_lt() {
                return false;
            }
            tombstone(record, deleted_at);
            true
        }
    }
}

impl AnnotationStore for InMemoryAnnotations {
    fn add_from_remote(&self, record: Value) -> Result<bool, AnnotationError> {
        self.with_tables(|t| merge_into(&mut t.comments, record))?
    }

    fn update_from_remote(
        &self,
        id: &str,
        changes: Value,
        updated_at: Option<&str>,
    ) -> Result<bool, AnnotationError> {
        self.with_tables(|t| update_in(&mut t.comments, id, changes, updated_at))?
    }

    fn delete_from_remote(&self, id: &str, deleted_at: Option<&str>) -> Result<bool, AnnotationError> {
        self.with_tables(|t| delete_in(&mut t.comments, id, deleted_at))
    }

    fn add_reply_from_remote(&self, parent_id: &str, reply: Value) -> Result<bool, AnnotationError> {
        self.with_tables(|t| match t.comments.get_mut(parent_id) {
            Some(parent) => upsert_reply(parent, reply),
            None => Ok(false),
        })?
    }

    fn update_reply_from_remote(
        &self,
        parent_id: &str,
        reply_id: &str,
        changes: Value,
        updated_at: Option<&str>,
    ) -> Result<bool, AnnotationError> {
        self.with_tables(|t| {
            let Some(reply) = t
                .comments
                .get_mut(parent_id)
                .and_then(|parent| find_reply(parent, reply_id))
            else {
                return Ok(false);
            };
            if !change_applies(reply, updated_at) {
                return Ok(false);
            }
            apply_changes(reply, changes, updated_at)?;
            Ok(true)
        })?
    }

    fn delete_reply_from_remote(
        &self,
        parent_id: &str,
        reply_id: &str,
        deleted_at: Option<&str>,
    ) -> Result<bool, AnnotationError> {
        self.with_tables(|t| {
            match t
                .comments
                .get_mut(parent_id)
                .and_then(|parent| find_reply(parent, reply_id))
            {
                Some(reply) if !is_deleted(reply) => {
                    if compare_timestamps(deleted_at, effective_timestamp(reply)).is_lt() {
                        return false;
                    }
                    tombstone(reply, deleted_at);
                    true
                }
                _ => false,
            }
        })
    }

    fn add_drawing_from_remote(&self, drawing: Value) -> Result<bool, AnnotationError> {
        self.with_tables(|t| merge_into(&mut t.drawings, drawing))?
    }

    fn update_drawing_from_remote(
        &self,
        id: &str,
        changes: Value,
        updated_at: Option<&str>,
    ) -> Result<bool, AnnotationError> {
        self.with_tables(|t| update_in(&mut t.drawings, id, changes, updated_at))?
    }

    fn delete_drawing_from_remote(
        &self,
        id: &str,
        deleted_at: Option<&str>,
    ) -> Result<bool, AnnotationError> {
        self.with_tables(|t| delete_in(&mut t.drawings, id, deleted_at))
    }

    fn clear_drawings_from_remote(
        &self,
        frame: Option<u64>,
        cleared_at: Option<&str>,
    ) -> Result<usize, AnnotationError> {
        self.with_tables(|t| {
            let mut cleared = 0;
            for drawing in t.drawings.values_mut() {
                let on_frame = match frame {
                    Some(f) => drawing.get("frame").and_then(Value::as_u64) == Some(f),
                    None => true,
                };
                // Drawings made after the clear survive it
                let stale = compare_timestamps(cleared_at, effective_timestamp(drawing)).is_lt();
                if on_frame && !is_deleted(drawing) && !stale {
                    tombstone(drawing, cleared_at);
                    cleared += 1;
                }
            }
            cleared
        })
    }

    fn get_all(&self) -> Vec<Value> {
        self.read(|t| t.comments.values().cloned().collect())
            .unwrap_or_default()
    }

    fn get_by_id(&self, id: &str) -> Option<Value> {
        self.read(|t| t.comments.get(id).cloned()).flatten()
    }

    fn get_all_drawings(&self) -> Vec<Value> {
        self.read(|t| t.drawings.values().cloned().collect())
            .unwrap_or_default()
    }
}
