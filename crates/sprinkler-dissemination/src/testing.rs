//! Deterministic test doubles.
//!
//! `StubCoder` is an oracle: it remembers every file it encoded and
//! "decodes" by recognising which remembered file a symbol set belongs to.
//! Symbol `n` carries block `n mod K`, so any `K` distinct symbols of a
//! file decode and `K - 1` never do.

use std::sync::Mutex;

use bytes::Bytes;

use crate::coder::{BlockLayout, Coder, CoderError, DecodeOutcome, SourceBlocks, Symbol, SymbolSource};

#[derive(Debug, Default)]
pub struct StubCoder {
    known: Mutex<Vec<Vec<Bytes>>>,
    budget: Option<u32>,
}

impl StubCoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed round budget instead of the LT bound.
    pub fn with_round_budget(budget: u32) -> Self {
        Self {
            known: Mutex::new(Vec::new()),
            budget: Some(budget),
        }
    }

    /// Make `blocks` decodable without encoding them first.
    pub fn register(&self, blocks: &SourceBlocks) {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        if !known.iter().any(|k| k.as_slice() == blocks.blocks()) {
            known.push(blocks.blocks().to_vec());
        }
    }
}

struct StubSource {
    blocks: Vec<Bytes>,
}

impl SymbolSource for StubSource {
    fn encode(&mut self, index: u32) -> Result<Symbol, CoderError> {
        let k = self.blocks.len();
        Ok(Symbol {
            id: index,
            payload: self.blocks[index as usize % k].clone(),
        })
    }
}

impl Coder for StubCoder {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn encoder(&self, blocks: &SourceBlocks) -> Result<Box<dyn SymbolSource>, CoderError> {
        self.register(blocks);
        Ok(Box::new(StubSource {
            blocks: blocks.blocks().to_vec(),
        }))
    }

    fn try_decode(
        &self,
        symbols: &[Symbol],
        layout: BlockLayout,
    ) -> Result<DecodeOutcome, CoderError> {
        let k = layout.total_blocks as usize;
        let mut ids: Vec<u32> = symbols.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if k == 0 || ids.len() < k {
            return Ok(DecodeOutcome::NeedMore);
        }

        let known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        let matching = known.iter().find(|blocks| {
            blocks.len() == k
                && symbols
                    .iter()
                    .all(|s| blocks[s.id as usize % k] == s.payload)
        });
        match matching {
            Some(blocks) => Ok(DecodeOutcome::Decoded(blocks.clone())),
            None => Err(CoderError::Backend(
                "symbols match no known content".into(),
            )),
        }
    }

    fn round_budget(&self, total_blocks: u32) -> u32 {
        self.budget
            .unwrap_or_else(|| crate::coder::lt_round_budget(total_blocks))
    }
}

/// Pseudo-random file content, stable for a given seed.
pub fn sample_content(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect()
}
