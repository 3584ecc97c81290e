//! Typed message catalog exchanged over direct peer connections.
//!
//! Wire format (bincode-encoded envelope):
//! ```text
//! ┌──────────┬─────────────┬──────┬───────────┬───────────┐
//! │ msg_type │ data        │ from │ from_name │ timestamp │
//! │ string   │ JSON bytes? │ str  │ str       │ ISO-8601  │
//! └──────────┴─────────────┴──────┴───────────┴───────────┘
//! ```
//!
//! Callers build an [`OutboundMessage`] (`type` + `data`); the connection
//! manager stamps `from`, `from_name` and `timestamp` when sending. Inbound
//! frames are decoded to a [`WireMessage`] and must pass [`validate`] before
//! anything downstream sees them. Field-level checks are left to the
//! receiving collaborator.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Message types in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Liveness ping, broadcast on a fixed interval
    Heartbeat = 1,

    CommentAdd = 10,
    CommentUpdate = 11,
    CommentDelete = 12,
    CommentResolve = 13,

    ReplyAdd = 20,
    ReplyUpdate = 21,
    ReplyDelete = 22,

    DrawingAdd = 30,
    DrawingUpdate = 31,
    DrawingDelete = 32,
    DrawingClear = 33,

    /// Which frame the sender is looking at
    FramePosition = 40,
    /// Pointer position over the frame
    Cursor = 41,

    /// Ask a peer for its full comment/drawing state
    SyncRequest = 50,
    /// Full comment/drawing snapshot
    SyncResponse = 51,
}

/// Coarse grouping of the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    Connection,
    Mutation,
    Presence,
    Sync,
}

impl MessageType {
    pub const ALL: [MessageType; 16] = [
        MessageType::Heartbeat,
        MessageType::CommentAdd,
        MessageType::CommentUpdate,
        MessageType::CommentDelete,
        MessageType::CommentResolve,
        MessageType::ReplyAdd,
        MessageType::ReplyUpdate,
        MessageType::ReplyDelete,
        MessageType::DrawingAdd,
        MessageType::DrawingUpdate,
        MessageType::DrawingDelete,
        MessageType::DrawingClear,
        MessageType::FramePosition,
        MessageType::Cursor,
        MessageType::SyncRequest,
        MessageType::SyncResponse,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::CommentAdd => "comment:add",
            Self::CommentUpdate => "comment:update",
            Self::CommentDelete => "comment:delete",
            Self::CommentResolve => "comment:resolve",
            Self::ReplyAdd => "reply:add",
            Self::ReplyUpdate => "reply:update",
            Self::ReplyDelete => "reply:delete",
            Self::DrawingAdd => "drawing:add",
            Self::DrawingUpdate => "drawing:update",
            Self::DrawingDelete => "drawing:delete",
            Self::DrawingClear => "drawing:clear",
            Self::FramePosition => "presence:frame",
            Self::Cursor => "presence:cursor",
            Self::SyncRequest => "sync:request",
            Self::SyncResponse => "sync:response",
        }
    }

    /// Look up a wire name. `None` for anything outside the catalog.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    pub fn category(&self) -> MessageCategory {
        match self {
            Self::Heartbeat => MessageCategory::Connection,
            Self::FramePosition | Self::Cursor => MessageCategory::Presence,
            Self::SyncRequest | Self::SyncResponse => MessageCategory::Sync,
            _ => MessageCategory::Mutation,
        }
    }

    /// Comment, reply and drawing mutations.
    pub fn is_mutation(&self) -> bool {
        self.category() == MessageCategory::Mutation
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Payload shapes
// ───────────────────────────────────────────────────────────────────

/// Comment and drawing updates: `{id, changes, updatedAt}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpdate {
    pub id: String,
    pub changes: Value,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Deletes: `{id, deletedAt?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRef {
    pub id: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

/// `{id, resolved, updatedAt}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveChange {
    pub id: String,
    pub resolved: bool,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// `{parentId, reply}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyAdd {
    pub parent_id: String,
    pub reply: Value,
}

/// `{parentId, replyId, changes, updatedAt}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyUpdate {
    pub parent_id: String,
    pub reply_id: String,
    pub changes: Value,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// `{parentId, replyId, deletedAt?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub parent_id: String,
    pub reply_id: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

/// `{frame?, clearedAt?}`: clear drawings on one frame, or all when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingClear {
    #[serde(default)]
    pub frame: Option<u64>,
    #[serde(default)]
    pub cleared_at: Option<String>,
}

/// `{frame}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FramePosition {
    pub frame: u64,
}

/// `{x, y, frame?}` in frame-normalised coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub frame: Option<u64>,
}

/// Full-state snapshot carried by `sync:response`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    #[serde(default)]
    pub comments: Vec<Value>,
    #[serde(default)]
    pub drawings: Vec<Value>,
}

// ───────────────────────────────────────────────────────────────────
// Messages
// ───────────────────────────────────────────────────────────────────

/// What callers hand to the connection manager: `{type, data}`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub msg_type: MessageType,
    pub data: Value,
}

fn to_data<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or_default()
}

impl OutboundMessage {
    pub fn new(msg_type: MessageType, data: Value) -> Self {
        Self { msg_type, data }
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, Value::Object(Default::default()))
    }

    /// Full comment record (the collaborator owns its shape).
    pub fn comment_add(record: Value) -> Self {
        Self::new(MessageType::CommentAdd, record)
    }

    pub fn comment_update(id: impl Into<String>, changes: Value, updated_at: Option<String>) -> Self {
        let payload = RecordUpdate { id: id.into(), changes, updated_at };
        Self::new(MessageType::CommentUpdate, to_data(&payload))
    }

    pub fn comment_delete(id: impl Into<String>, deleted_at: Option<String>) -> Self {
        let payload = RecordRef { id: id.into(), deleted_at };
        Self::new(MessageType::CommentDelete, to_data(&payload))
    }

    pub fn comment_resolve(id: impl Into<String>, resolved: bool, updated_at: Option<String>) -> Self {
        let payload = ResolveChange { id: id.into(), resolved, updated_at };
        Self::new(MessageType::CommentResolve, to_data(&payload))
    }

    pub fn reply_add(parent_id: impl Into<String>, reply: Value) -> Self {
        let payload = ReplyAdd { parent_id: parent_id.into(), reply };
        Self::new(MessageType::ReplyAdd, to_data(&payload))
    }

    pub fn reply_update(
        parent_id: impl Into<String>,
        reply_id: impl Into<String>,
        changes: Value,
        updated_at: Option<String>,
    ) -> Self {
        let payload = ReplyUpdate {
            parent_id: parent_id.into(),
            reply_id: reply_id.into(),
            changes,
            updated_at,
        };
        Self::new(MessageType::ReplyUpdate, to_data(&payload))
    }

    pub fn reply_delete(
        parent_id: impl Into<String>,
        reply_id: impl Into<String>,
        deleted_at: Option<String>,
    ) -> Self {
        let payload = ReplyRef { parent_id: parent_id.into(), reply_id: reply_id.into(), deleted_at };
        Self::new(MessageType::ReplyDelete, to_data(&payload))
    }

    pub fn drawing_add(drawing: Value) -> Self {
        Self::new(MessageType::DrawingAdd, drawing)
    }

    pub fn drawing_update(id: impl Into<String>, changes: Value, updated_at: Option<String>) -> Self {
        let payload = RecordUpdate { id: id.into(), changes, updated_at };
        Self::new(MessageType::DrawingUpdate, to_data(&payload))
    }

    pub fn drawing_delete(id: impl Into<String>, deleted_at: Option<String>) -> Self {
        let payload = RecordRef { id: id.into(), deleted_at };
        Self::new(MessageType::DrawingDelete, to_data(&payload))
    }

    pub fn drawing_clear(frame: Option<u64>, cleared_at: Option<String>) -> Self {
        Self::new(MessageType::DrawingClear, to_data(&DrawingClear { frame, cleared_at }))
    }

    pub fn frame_position(frame: u64) -> Self {
        Self::new(MessageType::FramePosition, to_data(&FramePosition { frame }))
    }

    pub fn cursor(x: f32, y: f32, frame: Option<u64>) -> Self {
        Self::new(MessageType::Cursor, to_data(&CursorPosition { x, y, frame }))
    }

    pub fn sync_request() -> Self {
        Self::new(MessageType::SyncRequest, Value::Object(Default::default()))
    }

    pub fn sync_response(snapshot: &SyncSnapshot) -> Self {
        Self::new(MessageType::SyncResponse, to_data(snapshot))
    }

    /// Stamp sender identity and time, producing the envelope that goes on the wire.
    pub fn stamp(&self, from: &str, from_name: &str) -> SyncMessage {
        SyncMessage {
            msg_type: self.msg_type,
            data: self.data.clone(),
            from: from.to_string(),
            from_name: from_name.to_string(),
            timestamp: now_timestamp(),
        }
    }
}

/// A validated message as seen by handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub data: Value,
    /// Sender session id
    pub from: String,
    pub from_name: String,
    /// ISO-8601 send time
    pub timestamp: String,
}

impl SyncMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let data = serde_json::to_vec(&self.data)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        let wire = WireMessage {
            msg_type: self.msg_type.as_str().to_string(),
            data: Some(data),
            from: self.from.clone(),
            from_name: self.from_name.clone(),
            timestamp: self.timestamp.clone(),
        };
        wire.encode()
    }

    /// Decode and validate in one step.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        validate(WireMessage::decode(bytes)?)
    }

    /// Parse the data payload into a typed shape.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| ProtocolError::DeserializationError(format!("{}: {e}", self.msg_type)))
    }
}

/// Unvalidated envelope as it arrives off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: String,
    /// JSON-encoded payload
    pub data: Option<Vec<u8>>,
    pub from: String,
    pub from_name: String,
    pub timestamp: String,
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// The single boundary check: known type and a present `data` payload.
pub fn validate(wire: WireMessage) -> Result<SyncMessage, ProtocolError> {
    let msg_type = MessageType::from_name(&wire.msg_type)
        .ok_or_else(|| ProtocolError::UnknownMessageType(wire.msg_type.clone()))?;

    let raw = wire
        .data
        .ok_or_else(|| ProtocolError::MissingData(wire.msg_type.clone()))?;
    let data: Value = serde_json::from_slice(&raw)
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    if data.is_null() {
        return Err(ProtocolError::MissingData(wire.msg_type));
    }

    Ok(SyncMessage {
        msg_type,
        data,
        from: wire.from,
        from_name: wire.from_name,
        timestamp: wire.timestamp,
    })
}

// ───────────────────────────────────────────────────────────────────
// Timestamps
// ───────────────────────────────────────────────────────────────────

/// Current time as ISO-8601 with millisecond precision.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 timestamp. Empty or malformed input yields `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Order two timestamps chronologically.
///
/// Missing (or unparseable) timestamps sort before every real one. This is
/// the only comparison last-write-wins decisions may use.
pub fn compare_timestamps(a: Option<&str>, b: Option<&str>) -> Ordering {
    let a = a.and_then(parse_timestamp);
    let b = b.and_then(parse_timestamp);
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

/// True when `candidate` is strictly later than `current`.
pub fn is_newer(candidate: Option<&str>, current: Option<&str>) -> bool {
    compare_timestamps(candidate, current) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_type_name_resolves() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::from_name(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::from_name("comment:explode"), None);
    }

    #[test]
    fn test_categories() {
        assert_eq!(MessageType::Heartbeat.category(), MessageCategory::Connection);
        assert!(MessageType::CommentResolve.is_mutation());
        assert!(MessageType::DrawingClear.is_mutation());
        assert!(MessageType::ReplyDelete.is_mutation());
        assert!(!MessageType::Cursor.is_mutation());
        assert!(!MessageType::SyncResponse.is_mutation());
    }

    #[test]
    fn test_stamp_sets_sender_fields() {
        let out = OutboundMessage::comment_add(json!({"id": "c1", "text": "too dark"}));
        let msg = out.stamp("session-a", "Alice");

        assert_eq!(msg.from, "session-a");
        assert_eq!(msg.from_name, "Alice");
        assert!(parse_timestamp(&msg.timestamp).is_some());
        assert_eq!(msg.data["text"], "too dark");
    }

    #[test]
    fn test_encode_decode() {
        let msg = OutboundMessage::comment_update("c1", json!({"text": "fixed"}), Some(now_timestamp()))
            .stamp("a", "Alice");
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);

        let update: RecordUpdate = decoded.payload().unwrap();
        assert_eq!(update.id, "c1");
        assert_eq!(update.changes["text"], "fixed");
    }

    #[test]
    fn test_delete_payloads_carry_timestamps() {
        let at = "2026-01-05T10:00:00.000Z";
        let msg = OutboundMessage::reply_delete("c1", "r1", Some(at.into())).stamp("a", "Alice");
        assert_eq!(msg.data["deletedAt"], at);
        let reply: ReplyRef = msg.payload().unwrap();
        assert_eq!(reply.deleted_at.as_deref(), Some(at));

        let msg = OutboundMessage::drawing_delete("d1", Some(at.into())).stamp("a", "Alice");
        assert_eq!(msg.data["deletedAt"], at);

        let msg = OutboundMessage::drawing_clear(Some(12), Some(at.into())).stamp("a", "Alice");
        let clear: DrawingClear = msg.payload().unwrap();
        assert_eq!(clear.frame, Some(12));
        assert_eq!(clear.cleared_at.as_deref(), Some(at));

        // Older peers omit the timestamp
        let clear: DrawingClear = serde_json::from_value(json!({ "frame": 3 })).unwrap();
        assert_eq!(clear.cleared_at, None);
    }

    #[test]
    fn test_validate_rejects_unknown_type() {
        let wire = WireMessage {
            msg_type: "layer:add".into(),
            data: Some(b"{}".to_vec()),
            from: "a".into(),
            from_name: "Alice".into(),
            timestamp: now_timestamp(),
        };
        assert_eq!(
            validate(wire),
            Err(ProtocolError::UnknownMessageType("layer:add".into()))
        );
    }

    #[test]
    fn test_validate_rejects_missing_data() {
        let wire = WireMessage {
            msg_type: "comment:add".into(),
            data: None,
            from: "a".into(),
            from_name: "Alice".into(),
            timestamp: now_timestamp(),
        };
        assert!(matches!(validate(wire), Err(ProtocolError::MissingData(_))));

        let null_data = WireMessage {
            msg_type: "comment:add".into(),
            data: Some(b"null".to_vec()),
            from: "a".into(),
            from_name: "Alice".into(),
            timestamp: now_timestamp(),
        };
        assert!(matches!(validate(null_data), Err(ProtocolError::MissingData(_))));
    }

    #[test]
    fn test_validate_leaves_field_shape_alone() {
        // Wrong shape for an update, but the boundary check only cares about type + data.
        let wire = WireMessage {
            msg_type: "comment:update".into(),
            data: Some(br#"{"unexpected": true}"#.to_vec()),
            from: "a".into(),
            from_name: "Alice".into(),
            timestamp: now_timestamp(),
        };
        let msg = validate(wire).unwrap();
        assert!(msg.payload::<RecordUpdate>().is_err());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_compare_timestamps_chronological() {
        let early = "2026-03-01T10:00:00.000Z";
        let late = "2026-03-01T10:00:00.001Z";
        assert_eq!(compare_timestamps(Some(early), Some(late)), Ordering::Less);
        assert_eq!(compare_timestamps(Some(late), Some(early)), Ordering::Greater);
        assert_eq!(compare_timestamps(Some(late), Some(late)), Ordering::Equal);
    }

    #[test]
    fn test_compare_timestamps_respects_offsets() {
        // 10:30+01:00 is 09:30Z, earlier than 10:00Z despite sorting later as text
        let offset = "2026-03-01T10:30:00+01:00";
        let utc = "2026-03-01T10:00:00Z";
        assert_eq!(compare_timestamps(Some(offset), Some(utc)), Ordering::Less);
    }

    #[test]
    fn test_missing_timestamp_is_earliest() {
        let t = "1970-01-01T00:00:00Z";
        assert_eq!(compare_timestamps(None, Some(t)), Ordering::Less);
        assert_eq!(compare_timestamps(Some(t), None), Ordering::Greater);
        assert_eq!(compare_timestamps(Some(""), Some(t)), Ordering::Less);
        assert_eq!(compare_timestamps(None, None), Ordering::Equal);
        assert!(is_newer(Some(t), None));
        assert!(!is_newer(None, Some(t)));
    }

    #[test]
    fn test_compare_timestamps_sorts_consistently() {
        let mut stamps = vec![
            Some("2026-01-02T00:00:00Z"),
            None,
            Some("2025-12-31T23:59:59.999Z"),
            Some("2026-01-01T00:00:00Z"),
        ];
        stamps.sort_by(|a, b| compare_timestamps(*a, *b));
        assert_eq!(
            stamps,
            vec![
                None,
                Some("2025-12-31T23:59:59.999Z"),
                Some("2026-01-01T00:00:00Z"),
                Some("2026-01-02T00:00:00Z"),
            ]
        );
    }

    #[test]
    fn test_payload_constructors_shape() {
        let msg = OutboundMessage::reply_add("c1", json!({"id": "r1"}));
        assert_eq!(msg.data["parentId"], "c1");

        let msg = OutboundMessage::drawing_clear(None, None);
        assert!(msg.data["frame"].is_null());

        let msg = OutboundMessage::cursor(0.25, 0.5, Some(12));
        let pos: CursorPosition = serde_json::from_value(msg.data).unwrap();
        assert_eq!(pos.frame, Some(12));
    }
}
