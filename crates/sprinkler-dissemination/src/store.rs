//! Symbol store -- bounded per-version symbol buffer with duplicate
//! accounting.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use sprinkler_protocol::{SymbolId, Version};

use crate::coder::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    DuplicateIgnored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Collecting,
    /// Payloads freed, ids kept for late-duplicate accounting.
    Frozen,
    Released,
}

#[derive(Debug)]
pub struct SymbolStore {
    version: Version,
    capacity: usize,
    state: StoreState,
    /// Insertion order of held payloads, oldest first.
    order: VecDeque<SymbolId>,
    payloads: HashMap<SymbolId, Bytes>,
    frozen_ids: HashSet<SymbolId>,
    redundant: u64,
    evicted: u64,
}

impl SymbolStore {
    pub fn new(version: Version, capacity: usize) -> Self {
        Self {
            version,
            capacity: capacity.max(1),
            state: StoreState::Collecting,
            order: VecDeque::new(),
            payloads: HashMap::new(),
            frozen_ids: HashSet::new(),
            redundant: 0,
            evicted: 0,
        }
    }

    /// Store sized for `total_blocks` source blocks.
    pub fn for_blocks(version: Version, total_blocks: u32, capacity_factor: u32) -> Self {
        let capacity = (total_blocks as usize).saturating_mul(capacity_factor.max(1) as usize);
        Self::new(version, capacity)
    }

    /// Idempotent per symbol id. Once frozen every symbol counts as
    /// redundant.
    pub fn add(&mut self, symbol: Symbol) -> AddOutcome {
        match self.state {
            StoreState::Released => AddOutcome::DuplicateIgnored,
            StoreState::Frozen => {
                self.redundant += 1;
                AddOutcome::DuplicateIgnored
            }
            StoreState::Collecting => {
                if self.payloads.contains_key(&symbol.id) {
                    self.redundant += 1;
                    return AddOutcome::DuplicateIgnored;
                }
                if self.payloads.len() >= self.capacity {
                    if let Some(oldest) = self.order.pop_front() {
                        self.payloads.remove(&oldest);
                        self.evicted += 1;
                    }
                }
                self.order.push_back(symbol.id);
                self.payloads.insert(symbol.id, symbol.payload);
                AddOutcome::Added
            }
        }
    }

    pub fn contains(&self, id: SymbolId) -> bool {
        self.payloads.contains_key(&id) || self.frozen_ids.contains(&id)
    }

    /// Copy of the held symbols in arrival order. Payloads are shared.
    pub fn snapshot(&self) -> Vec<Symbol> {
        self.order
            .iter()
            .filter_map(|id| {
                self.payloads.get(id).map(|payload| Symbol {
                    id: *id,
                    payload: payload.clone(),
                })
            })
            .collect()
    }

    /// Drop payloads, keep ids.
    pub fn mark_complete(&mut self) {
        if self.state != StoreState::Collecting {
            return;
        }
        self.frozen_ids.extend(self.order.drain(..));
        self.payloads = HashMap::new();
        self.state = StoreState::Frozen;
    }

    pub fn release(&mut self) {
        self.order = VecDeque::new();
        self.payloads = HashMap::new();
        self.frozen_ids = HashSet::new();
        self.state = StoreState::Released;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Distinct symbols held (or recorded, once frozen).
    pub fn distinct(&self) -> usize {
        match self.state {
            StoreState::Collecting => self.payloads.len(),
            StoreState::Frozen => self.frozen_ids.len(),
            StoreState::Released => 0,
        }
    }

    pub fn redundant(&self) -> u64 {
        self.redundant
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn held_bytes(&self) -> usize {
        self.payloads.values().map(|p| p.len()).sum()
    }

    pub fn is_collecting(&self) -> bool {
        self.state == StoreState::Collecting
    }

    pub fn is_released(&self) -> bool {
        self.state == StoreState::Released
    }
}
