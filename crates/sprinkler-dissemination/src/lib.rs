//! Sprinkler Dissemination -- the control loop core.
//!
//! Receives decoded messages, drives two Trickle timers, accumulates
//! symbols and decides when to decode. Pure and clock injected: the node
//! crate owns sockets, tasks and the blocking decode pool.
//!
//! Flow per inbound message:
//!   Control -> ConsistencyDetector -> timer reset / supersede / abort
//!   Data    -> SymbolStore -> decode job once K distinct symbols are held

pub mod coder;
pub mod consistency;
pub mod engine;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use coder::{
    lt_round_budget, BlockLayout, Coder, CoderError, DecodeOutcome, SourceBlocks, Symbol,
    SymbolSource,
};
pub use consistency::{Classification, ClassificationCounts, ConsistencyDetector};
pub use engine::{
    CompletedTransfer, DecodeJob, DisseminationEngine, EngineActions, EngineConfig, EngineError,
    EngineStats, SessionEvent, SessionStatus,
};
pub use session::{
    Role, Session, SessionError, SessionManager, SessionReport, SessionState, TransferInfo,
};
pub use store::{AddOutcome, SymbolStore};
