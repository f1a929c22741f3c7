//! Companion Sync
//!
//! Wire messages, the reachability-aware channel, and the primary and
//! companion roles built on it.

mod channel;
mod companion;
mod message;
mod primary;
mod queue;
mod reorder;

pub use channel::{ChannelCore, ChannelStatus, LinkEvent, LinkState, SyncChannel, Transport};
pub use companion::{CompanionMirror, MirrorEntry};
pub use message::{AddToken, DeltaOp, DeviceId, Envelope, SyncMessage};
pub use primary::{Outbox, PrimarySync};
pub use queue::OutboundQueue;
pub use reorder::{Arrival, ReorderBuffer, FIRST_SEQ};

use crate::domain::DomainError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// No full snapshot arrived after repeated resync requests
    #[error("Sync stalled: companion did not answer resync")]
    SyncStalled,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Malformed sync message: {0}")]
    Decode(String),
    #[error("Sync channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Store(#[from] DomainError),
}

impl SyncError {
    /// Stalls and transport hiccups leave local state untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::ChannelClosed)
    }
}
