//! Protocol profiles -- versioned parameter sets for a Sprinkler network.
//!
//! A profile fixes the timing and sizing parameters that all nodes on one
//! multicast group should agree on. Node-local knobs (relay, output paths)
//! are configuration, not profile.

/// A named, versioned set of Trickle timing and datagram sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolProfile {
    /// Profile identifier. Monotonically increasing.
    pub id: u16,

    // -- Control channel (version beacons) --
    pub control_interval_min_ms: u64,
    pub control_interval_max_ms: u64,
    /// Redundancy constant k for the control channel.
    pub control_redundancy: u32,

    // -- Data channel (symbol bursts / progress beacons) --
    pub data_interval_min_ms: u64,
    pub data_interval_max_ms: u64,
    pub data_redundancy: u32,

    // -- Sizing --
    /// Largest datagram on the wire. IPv6 minimum MTU minus headers.
    pub max_datagram_bytes: usize,
    /// Source block (and symbol payload) size. Multiple of 8.
    pub block_size: u16,
    /// Fresh symbols minted per non-suppressed data firing.
    pub symbols_per_burst: u32,

    // -- Receiver --
    /// New distinct symbols between decode attempts.
    pub decode_every: u32,
    /// Store capacity as a multiple of the source block count.
    pub store_capacity_factor: u32,
    /// Control beacons a completed receiver sends before falling silent.
    pub post_completion_beacons: u32,
    /// Seconds a completed or superseded store is kept for late duplicates.
    pub retention_secs: u64,
}

/// Profile 0: WiFi multicast defaults.
///
/// Control beacons back off from 1 s to ~1 min. The data channel runs an
/// order of magnitude faster so bursts follow demand quickly.
pub const PROFILE_0: ProtocolProfile = ProtocolProfile {
    id: 0,

    control_interval_min_ms: 1_000,
    control_interval_max_ms: 64_000,
    control_redundancy: 2,

    data_interval_min_ms: 100,
    data_interval_max_ms: 6_400,
    data_redundancy: 2,

    max_datagram_bytes: 1_232,
    block_size: 1_024,
    symbols_per_burst: 16,

    decode_every: 8,
    store_capacity_factor: 4,
    post_completion_beacons: 3,
    retention_secs: 30,
};

/// The active profile.
pub const CURRENT_PROFILE: &ProtocolProfile = &PROFILE_0;
