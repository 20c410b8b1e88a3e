//! Erasure coder capability.
//!
//! The engine never looks inside symbols. A coder mints symbols from the
//! source blocks of a file and reconstructs the blocks from any large
//! enough set of distinct symbols.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sprinkler_protocol::{ContentSummary, SymbolId};

/// Failure probability bound of the LT robust soliton distribution.
pub const LT_DELTA: f64 = 0.5;

/// One encoded symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub id: SymbolId,
    pub payload: Bytes,
}

/// Shape of the source block set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLayout {
    pub total_blocks: u32,
    pub block_size: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum CoderError {
    #[error("block size must be non-zero")]
    ZeroBlockSize,
    #[error("file of {file_len} bytes needs more than {max} blocks")]
    TooManyBlocks { file_len: u64, max: u32 },
    #[error("expected {expected} blocks of {block_size} bytes, got {got_blocks} (first bad length {bad_len:?})")]
    LayoutMismatch {
        expected: u32,
        block_size: u16,
        got_blocks: usize,
        bad_len: Option<usize>,
    },
    #[error("symbol index {0} out of range")]
    IndexOutOfRange(u32),
    #[error("coder backend: {0}")]
    Backend(String),
}

/// Result of a decode attempt. `NeedMore` is not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Decoded(Vec<Bytes>),
    NeedMore,
}

/// The source blocks of one file, last block zero padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlocks {
    layout: BlockLayout,
    file_len: u64,
    blocks: Vec<Bytes>,
}

impl SourceBlocks {
    /// Split a file into blocks. An empty file still occupies one block.
    pub fn from_bytes(data: &[u8], block_size: u16) -> Result<Self, CoderError> {
        if block_size == 0 {
            return Err(CoderError::ZeroBlockSize);
        }
        let bs = block_size as usize;
        let count = data.len().div_ceil(bs).max(1);
        let total_blocks = u32::try_from(count).map_err(|_| CoderError::TooManyBlocks {
            file_len: data.len() as u64,
            max: u32::MAX,
        })?;

        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            let start = (i * bs).min(data.len());
            let end = ((i + 1) * bs).min(data.len());
            let mut block = BytesMut::zeroed(bs);
            block[..end - start].copy_from_slice(&data[start..end]);
            blocks.push(block.freeze());
        }

        Ok(Self {
            layout: BlockLayout {
                total_blocks,
                block_size,
            },
            file_len: data.len() as u64,
            blocks,
        })
    }

    /// Reassemble decoded blocks, checking they match the layout.
    pub fn from_blocks(
        blocks: Vec<Bytes>,
        layout: BlockLayout,
        file_len: u64,
    ) -> Result<Self, CoderError> {
        let bad_len = blocks
            .iter()
            .map(|b| b.len())
            .find(|len| *len != layout.block_size as usize);
        let capacity = layout.total_blocks as u64 * layout.block_size as u64;
        if blocks.len() != layout.total_blocks as usize || bad_len.is_some() || file_len > capacity
        {
            return Err(CoderError::LayoutMismatch {
                expected: layout.total_blocks,
                block_size: layout.block_size,
                got_blocks: blocks.len(),
                bad_len,
            });
        }
        Ok(Self {
            layout,
            file_len,
            blocks,
        })
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn total_blocks(&self) -> u32 {
        self.layout.total_blocks
    }

    pub fn block_size(&self) -> u16 {
        self.layout.block_size
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn blocks(&self) -> &[Bytes] {
        &self.blocks
    }

    /// The file bytes, padding stripped.
    pub fn file_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.file_len as usize);
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out.truncate(self.file_len as usize);
        out.freeze()
    }

    pub fn summary(&self) -> ContentSummary {
        ContentSummary::of(&self.file_bytes())
    }
}

/// Mints symbols for one file. Each index yields a distinct symbol id.
pub trait SymbolSource: Send {
    fn encode(&mut self, index: u32) -> Result<Symbol, CoderError>;
}

/// Erasure coder. Shared across engines, so `Send + Sync`.
pub trait Coder: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn encoder(&self, blocks: &SourceBlocks) -> Result<Box<dyn SymbolSource>, CoderError>;

    /// Attempt reconstruction. Must be deterministic and side-effect free
    /// when the answer is `NeedMore`.
    fn try_decode(
        &self,
        symbols: &[Symbol],
        layout: BlockLayout,
    ) -> Result<DecodeOutcome, CoderError>;

    /// Fresh symbols a seeder sends per demand round.
    fn round_budget(&self, total_blocks: u32) -> u32 {
        lt_round_budget(total_blocks)
    }
}

/// `(1 + gamma) * K` with `gamma = sqrt(K) * ln(K / delta)^2 / K`, gamma
/// rounded to one decimal.
pub fn lt_round_budget(total_blocks: u32) -> u32 {
    if total_blocks == 0 {
        return 0;
    }
    let k = total_blocks as f64;
    let gamma = k.sqrt() * (k / LT_DELTA).ln().powi(2) / k;
    let gamma = (gamma * 10.0).round() / 10.0;
    ((1.0 + gamma) * k).ceil() as u32
}
