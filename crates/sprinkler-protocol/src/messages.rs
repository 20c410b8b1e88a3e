//! Wire message types.
//!
//! Two kinds share the multicast group: control announcements (version
//! beacons, Trickle control channel) and data symbols (erasure-coded
//! payloads, Trickle data channel).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{ContentSummary, ProtocolError, SymbolId, Version};

/// What the announcing node is doing with the announced version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// No content, or the version's decode path was abandoned.
    Idle,
    /// Accumulating symbols for the version.
    Seeking,
    /// Holds the complete content and can mint symbols.
    Holding,
}

impl PeerStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            PeerStatus::Idle => 0,
            PeerStatus::Seeking => 1,
            PeerStatus::Holding => 2,
        }
    }

    pub fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(PeerStatus::Idle),
            1 => Ok(PeerStatus::Seeking),
            2 => Ok(PeerStatus::Holding),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

// ============================================================================
// Control
// ============================================================================

/// Version beacon. Enough for a receiver to set up decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub version: Version,
    pub total_blocks: u32,
    pub block_size: u16,
    /// Exact file length; the last source block is zero padded.
    pub file_len: u64,
    pub summary: ContentSummary,
    pub status: PeerStatus,
}

impl Announcement {
    /// Beacon of a node that knows no version.
    pub fn empty() -> Self {
        Self {
            version: 0,
            total_blocks: 0,
            block_size: 0,
            file_len: 0,
            summary: ContentSummary::EMPTY,
            status: PeerStatus::Idle,
        }
    }

    /// Whether two announcements describe the same content, ignoring status.
    pub fn same_content(&self, other: &Announcement) -> bool {
        self.version == other.version
            && self.total_blocks == other.total_blocks
            && self.block_size == other.block_size
            && self.file_len == other.file_len
            && self.summary == other.summary
    }
}

// ============================================================================
// Data
// ============================================================================

/// One encoded symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolPacket {
    pub version: Version,
    pub symbol_id: SymbolId,
    pub payload: Bytes,
}

/// A single datagram's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Control(Announcement),
    Data(SymbolPacket),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Control(_) => MessageKind::Control,
            Message::Data(_) => MessageKind::Data,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            Message::Control(a) => a.version,
            Message::Data(d) => d.version,
        }
    }
}

/// Kind byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Control = 0x01,
    Data = 0x02,
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(MessageKind::Control),
            0x02 => Ok(MessageKind::Data),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}
