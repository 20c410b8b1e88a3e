//! Sprinkler Fountain -- RaptorQ (RFC 6330) behind the `Coder` capability.
//!
//! A file is encoded as a single RaptorQ source block whose symbols are
//! exactly the source blocks, so symbol ids `0..K` carry the file verbatim
//! and every id above that is a repair symbol. Any `K` distinct symbols
//! decode with high probability, a few more make failure negligible.

use bytes::Bytes;
use raptorq::{Decoder, Encoder, EncodingPacket, ObjectTransmissionInformation, PayloadId};
use sprinkler_dissemination::{
    BlockLayout, Coder, CoderError, DecodeOutcome, SourceBlocks, Symbol, SymbolSource,
};
use sprinkler_protocol::SymbolId;

/// Largest source block RaptorQ accepts.
pub const MAX_SOURCE_SYMBOLS: u32 = 56_403;

/// Encoding symbol ids are 24 bits on the RaptorQ side.
const ESI_LIMIT: u32 = 1 << 24;

/// Highest symbol index a source will mint. Leaves room for the padded
/// source count RaptorQ adds in front of repair ids.
pub const MAX_SYMBOL_INDEX: u32 = ESI_LIMIT - MAX_SOURCE_SYMBOLS - 1024;

/// Repair overhead per round, in basis points of `K`.
pub const REPAIR_RATIO_BPS: u32 = 500;

/// Floor on repair symbols per round for small files.
pub const MIN_REPAIR_SYMBOLS: u32 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct RaptorQCoder;

impl RaptorQCoder {
    pub fn new() -> Self {
        Self
    }

    fn transmission_info(
        layout: BlockLayout,
    ) -> Result<ObjectTransmissionInformation, CoderError> {
        if layout.block_size == 0 {
            return Err(CoderError::ZeroBlockSize);
        }
        if layout.total_blocks == 0 || layout.total_blocks > MAX_SOURCE_SYMBOLS {
            return Err(CoderError::TooManyBlocks {
                file_len: layout.total_blocks as u64 * layout.block_size as u64,
                max: MAX_SOURCE_SYMBOLS,
            });
        }
        let transfer_len = layout.total_blocks as u64 * layout.block_size as u64;
        Ok(ObjectTransmissionInformation::new(
            transfer_len,
            layout.block_size,
            1,
            1,
            alignment(layout.block_size),
        ))
    }
}

/// Symbol alignment: 8 when the block size allows it, byte aligned otherwise.
fn alignment(block_size: u16) -> u8 {
    if block_size % 8 == 0 {
        8
    } else {
        1
    }
}

struct RaptorQSource {
    encoder: Encoder,
    source: Vec<EncodingPacket>,
}

impl SymbolSource for RaptorQSource {
    fn encode(&mut self, index: u32) -> Result<Symbol, CoderError> {
        if index > MAX_SYMBOL_INDEX {
            return Err(CoderError::IndexOutOfRange(index));
        }
        let packet = match self.source.get(index as usize) {
            Some(packet) => packet.clone(),
            None => {
                let block = self
                    .encoder
                    .get_block_encoders()
                    .first()
                    .ok_or_else(|| CoderError::Backend("encoder has no source block".into()))?;
                let repair = index - self.source.len() as u32;
                block
                    .repair_packets(repair, 1)
                    .into_iter()
                    .next()
                    .ok_or(CoderError::IndexOutOfRange(index))?
            }
        };
        Ok(Symbol {
            id: packet.payload_id().encoding_symbol_id(),
            payload: Bytes::copy_from_slice(packet.data()),
        })
    }
}

impl Coder for RaptorQCoder {
    fn name(&self) -> &'static str {
        "raptorq"
    }

    fn encoder(&self, blocks: &SourceBlocks) -> Result<Box<dyn SymbolSource>, CoderError> {
        let oti = Self::transmission_info(blocks.layout())?;
        let mut data =
            Vec::with_capacity(blocks.total_blocks() as usize * blocks.block_size() as usize);
        for block in blocks.blocks() {
            data.extend_from_slice(block);
        }
        let encoder = Encoder::new(&data, oti);
        let source = encoder
            .get_block_encoders()
            .first()
            .map(|block| block.source_packets())
            .unwrap_or_default();
        if source.len() != blocks.total_blocks() as usize {
            return Err(CoderError::Backend(format!(
                "expected {} source symbols, encoder produced {}",
                blocks.total_blocks(),
                source.len()
            )));
        }
        tracing::debug!(
            total_blocks = blocks.total_blocks(),
            block_size = blocks.block_size(),
            "raptorq encoder ready"
        );
        Ok(Box::new(RaptorQSource { encoder, source }))
    }

    fn try_decode(
        &self,
        symbols: &[Symbol],
        layout: BlockLayout,
    ) -> Result<DecodeOutcome, CoderError> {
        let oti = Self::transmission_info(layout)?;
        let block_size = layout.block_size as usize;

        let mut ids: Vec<SymbolId> = symbols
            .iter()
            .filter(|s| usable(s, block_size))
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() < layout.total_blocks as usize {
            return Ok(DecodeOutcome::NeedMore);
        }

        let mut decoder = Decoder::new(oti);
        let mut decoded = None;
        for symbol in symbols {
            if !usable(symbol, block_size) {
                tracing::trace!(
                    id = symbol.id,
                    len = symbol.payload.len(),
                    "skipping malformed symbol"
                );
                continue;
            }
            let packet =
                EncodingPacket::new(PayloadId::new(0, symbol.id), symbol.payload.to_vec());
            if let Some(out) = decoder.decode(packet) {
                decoded = Some(out);
                break;
            }
        }

        let Some(out) = decoded else {
            tracing::debug!(distinct = ids.len(), "raptorq decode short of rank");
            return Ok(DecodeOutcome::NeedMore);
        };
        if out.len() != layout.total_blocks as usize * block_size {
            return Err(CoderError::Backend(format!(
                "decoded {} bytes, expected {}",
                out.len(),
                layout.total_blocks as usize * block_size
            )));
        }
        let out = Bytes::from(out);
        let blocks = (0..layout.total_blocks as usize)
            .map(|i| out.slice(i * block_size..(i + 1) * block_size))
            .collect();
        Ok(DecodeOutcome::Decoded(blocks))
    }

    fn round_budget(&self, total_blocks: u32) -> u32 {
        if total_blocks == 0 {
            return 0;
        }
        let repair = (total_blocks as u64 * REPAIR_RATIO_BPS as u64).div_ceil(10_000) as u32;
        total_blocks + repair.max(MIN_REPAIR_SYMBOLS)
    }
}

fn usable(symbol: &Symbol, block_size: usize) -> bool {
    symbol.id < ESI_LIMIT && symbol.payload.len() == block_size
}
