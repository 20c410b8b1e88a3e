//! Sprinkler Protocol -- wire types, datagram codec, protocol profile.
//!
//! Every datagram on the multicast group carries exactly one message:
//! a 4-byte magic, a kind byte, then big-endian fields. No fragmentation.

pub mod codec;
pub mod messages;
pub mod profile;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use codec::{decode_datagram, encode_datagram, DatagramCodec};
pub use messages::*;
pub use profile::{ProtocolProfile, CURRENT_PROFILE, PROFILE_0};

/// Protocol magic number: 0x5350524B ("SPRK")
pub const PROTOCOL_MAGIC: u32 = 0x5350_524B;

/// Largest datagram we will build or accept (sourced from current profile).
pub const MAX_DATAGRAM_BYTES: usize = PROFILE_0.max_datagram_bytes;

/// Transfer version. Monotonically increasing; 0 means "no content".
pub type Version = u32;

/// Coder-assigned symbol identifier (opaque to the dissemination core).
pub type SymbolId = u32;

/// SHA-256 digest of the disseminated file, hex encoded when displayed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ContentSummary(pub [u8; 32]);

impl ContentSummary {
    /// Summary of "no content" (all zero).
    pub const EMPTY: ContentSummary = ContentSummary([0u8; 32]);

    /// Compute the summary of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl std::fmt::Debug for ContentSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentSummary({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for ContentSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidMagic { expected: u32, got: u32 },
    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),
    #[error("unknown peer status: {0:#04x}")]
    UnknownStatus(u8),
    #[error("truncated datagram: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
