//! Wire messages between the primary device and the companion.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SyncError;
use crate::domain::TallyId;
use crate::snapshot::{Snapshot, TallyValue};

/// Identity of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates a companion-side add with the primary's confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddToken(Uuid);

impl AddToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AddToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One per-record operation inside a `Delta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeltaOp {
    AdjustBy { id: TallyId, by: i64 },
    Rename { id: TallyId, title: String },
    SetCollapsed { id: TallyId, collapsed: bool },
    SetColor { id: TallyId, color_index: i32 },
    /// Companion-initiated; the primary assigns the id
    Add {
        token: AddToken,
        title: String,
        color_index: i32,
    },
    Remove { id: TallyId },
    Reorder { order: Vec<TallyId> },
    /// Primary's answer to an `Add`, carrying the committed record
    Confirmed { token: AddToken, value: TallyValue },
}

impl DeltaOp {
    /// Record the op targets, if it targets exactly one existing record.
    pub fn target(&self) -> Option<TallyId> {
        match self {
            DeltaOp::AdjustBy { id, .. }
            | DeltaOp::Rename { id, .. }
            | DeltaOp::SetCollapsed { id, .. }
            | DeltaOp::SetColor { id, .. }
            | DeltaOp::Remove { id } => Some(*id),
            DeltaOp::Confirmed { value, .. } => Some(value.id),
            DeltaOp::Add { .. } | DeltaOp::Reorder { .. } => None,
        }
    }

    /// Half of an add handshake. A snapshot cannot stand in for these: it
    /// carries no token.
    pub fn is_add_handshake(&self) -> bool {
        matches!(self, DeltaOp::Add { .. } | DeltaOp::Confirmed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SyncMessage {
    FullSnapshot(Snapshot),
    Delta(Vec<DeltaOp>),
    /// Ask the other side for a `FullSnapshot`
    ResyncRequest,
}

impl SyncMessage {
    pub fn is_full_snapshot(&self) -> bool {
        matches!(self, SyncMessage::FullSnapshot(_))
    }

    pub fn carries_add_handshake(&self) -> bool {
        matches!(self, SyncMessage::Delta(ops) if ops.iter().any(DeltaOp::is_add_handshake))
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncMessage::FullSnapshot(_) => "full_snapshot",
            SyncMessage::Delta(_) => "delta",
            SyncMessage::ResyncRequest => "resync_request",
        }
    }
}

/// A message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Per-direction, starts at 1 after every handshake
    pub seq: u64,
    pub origin: DeviceId,
    pub message: SyncMessage,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(|e| SyncError::Decode(format!("encode seq {}: {}", self.seq, e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let id = TallyId::new();
        let envelope = Envelope {
            seq: 7,
            origin: DeviceId::new("watch"),
            message: SyncMessage::Delta(vec![DeltaOp::AdjustBy { id, by: -2 }]),
        };
        let value: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["origin"], "watch");
        assert_eq!(value["message"]["type"], "delta");
        assert_eq!(value["message"]["body"][0]["kind"], "adjust_by");
        assert_eq!(value["message"]["body"][0]["by"], -2);

        let back = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(matches!(Envelope::decode(b"\x00\x01"), Err(SyncError::Decode(_))));
    }

    #[test]
    fn test_delta_targets() {
        let id = TallyId::new();
        assert_eq!(DeltaOp::Remove { id }.target(), Some(id));
        assert_eq!(DeltaOp::Reorder { order: vec![id] }.target(), None);
    }

    #[test]
    fn test_add_handshake_detection() {
        let add = SyncMessage::Delta(vec![
            DeltaOp::AdjustBy { id: TallyId::new(), by: 1 },
            DeltaOp::Add {
                token: AddToken::new(),
                title: "Water".into(),
                color_index: 0,
            },
        ]);
        assert!(add.carries_add_handshake());
        assert!(!SyncMessage::Delta(vec![DeltaOp::Remove { id: TallyId::new() }]).carries_add_handshake());
        assert!(!SyncMessage::ResyncRequest.carries_add_handshake());
    }
}
