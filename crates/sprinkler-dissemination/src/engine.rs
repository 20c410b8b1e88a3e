//! Dissemination engine -- Trickle-governed symbol bursts and beacons.
//!
//! Clock injected and free of I/O. Every entry point takes `now` and
//! returns `EngineActions` for the caller to carry out: datagrams to send,
//! at most one decode job to run off-loop, and session events to surface.
//!
//! Two Trickle timers per engine:
//!   - control: version beacons (`Announcement`), backs off when the
//!     neighbourhood agrees, resets on any disagreement.
//!   - data: seeders mint a burst of fresh symbols per firing; receivers
//!     re-broadcast their `Seeking` beacon as a progress signal.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use sprinkler_protocol::{
    Announcement, ContentSummary, Message, PeerStatus, SymbolPacket, Version, CURRENT_PROFILE,
};
use sprinkler_trickle::{TrickleConfig, TrickleError, TrickleEvent, TrickleTimer};

use crate::coder::{BlockLayout, Coder, CoderError, DecodeOutcome, SourceBlocks, Symbol, SymbolSource};
use crate::consistency::{Classification, ClassificationCounts, ConsistencyDetector};
use crate::session::{
    Role, SessionError, SessionManager, SessionReport, SessionState, TransferInfo,
};
use crate::store::AddOutcome;

/// Engine tunables. Defaults come from the current protocol profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub control: TrickleConfig,
    pub data: TrickleConfig,
    /// Fresh symbols minted per non-suppressed data firing.
    pub symbols_per_burst: u32,
    /// New distinct symbols between decode attempts.
    pub decode_every: u32,
    /// Control beacons a completed receiver sends before going quiet.
    pub post_completion_beacons: u32,
    /// Completed receivers answer demand with their own fresh symbols.
    pub relay_after_complete: bool,
    /// Seeders stay in `Announcing` until someone asks.
    pub await_interest: bool,
    pub store_capacity_factor: u32,
    /// How long superseded symbol ids are kept for duplicate accounting.
    pub retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let p = CURRENT_PROFILE;
        Self {
            control: TrickleConfig::from_millis(
                p.control_interval_min_ms,
                p.control_interval_max_ms,
                p.control_redundancy,
            ),
            data: TrickleConfig::from_millis(
                p.data_interval_min_ms,
                p.data_interval_max_ms,
                p.data_redundancy,
            ),
            symbols_per_burst: p.symbols_per_burst,
            decode_every: p.decode_every,
            post_completion_beacons: p.post_completion_beacons,
            relay_after_complete: true,
            await_interest: false,
            store_capacity_factor: p.store_capacity_factor,
            retention: Duration::from_secs(p.retention_secs),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.control.validate()?;
        self.data.validate()?;
        if self.symbols_per_burst == 0 {
            return Err(EngineError::InvalidConfig("symbols_per_burst must be > 0".into()));
        }
        if self.decode_every == 0 {
            return Err(EngineError::InvalidConfig("decode_every must be > 0".into()));
        }
        if self.store_capacity_factor == 0 {
            return Err(EngineError::InvalidConfig(
                "store_capacity_factor must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid engine config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Trickle(#[from] TrickleError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Coder(#[from] CoderError),
}

/// A completed, summary-verified transfer.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub version: Version,
    pub summary: ContentSummary,
    pub content: SourceBlocks,
}

impl CompletedTransfer {
    pub fn file_bytes(&self) -> Bytes {
        self.content.file_bytes()
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Completed(CompletedTransfer),
    Aborted {
        version: Version,
        reason: String,
    },
    Superseded {
        old: Version,
        new: Version,
    },
    /// Same version, different content.
    Inconsistency {
        version: Version,
        local: ContentSummary,
        remote: ContentSummary,
    },
}

/// Snapshot of a receiver's symbols, to be decoded off the decision loop.
#[derive(Debug, Clone)]
pub struct DecodeJob {
    pub job_id: u64,
    pub version: Version,
    pub layout: BlockLayout,
    pub symbols: Vec<Symbol>,
}

/// What the caller must do after an engine call.
#[derive(Debug, Default)]
pub struct EngineActions {
    pub send: Vec<Message>,
    pub decode: Option<DecodeJob>,
    pub events: Vec<SessionEvent>,
}

impl EngineActions {
    pub fn is_empty(&self) -> bool {
        self.send.is_empty() && self.decode.is_none() && self.events.is_empty()
    }

    /// Fold `other` into `self`. A later decode job replaces an earlier one.
    pub fn merge(&mut self, other: EngineActions) {
        self.send.extend(other.send);
        self.events.extend(other.events);
        if other.decode.is_some() {
            self.decode = other.decode;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub symbols_sent: u64,
    pub symbols_received: u64,
    pub symbols_added: u64,
    pub foreign_symbols: u64,
    pub beacons_sent: u64,
    pub progress_beacons_sent: u64,
    pub announcements_received: u64,
    pub control_suppressed: u64,
    pub data_suppressed: u64,
    pub data_firings_skipped: u64,
    pub out_of_cycle_replies: u64,
    pub rounds_spent: u64,
    pub demand_rearms: u64,
    pub decode_attempts: u64,
    pub decode_errors: u64,
    pub stale_decode_results: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerStatus {
    pub running: bool,
    pub interval_ms: u64,
    pub counter: u32,
    pub suppressed: bool,
}

impl TimerStatus {
    fn of(timer: &TrickleTimer) -> Self {
        Self {
            running: timer.is_running(),
            interval_ms: timer.interval().as_millis() as u64,
            counter: timer.counter(),
            suppressed: timer.is_suppressed(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeederStatus {
    pub version: Version,
    pub next_index: u32,
    pub round_sent: u32,
    pub round_budget: u32,
}

/// Everything an operator might ask about a node.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub peer_status: PeerStatus,
    pub session: Option<SessionReport>,
    pub retired_sessions: usize,
    pub control: TimerStatus,
    pub data: TimerStatus,
    pub seeder: Option<SeederStatus>,
    pub post_completion_beacons_left: u32,
    pub classifications: ClassificationCounts,
    pub stats: EngineStats,
}

struct Seeder {
    version: Version,
    source: Box<dyn SymbolSource>,
    next_index: u32,
    round_sent: u32,
    round_budget: u32,
}

impl fmt::Debug for Seeder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seeder")
            .field("version", &self.version)
            .field("next_index", &self.next_index)
            .field("round_sent", &self.round_sent)
            .field("round_budget", &self.round_budget)
            .finish_non_exhaustive()
    }
}

impl Seeder {
    fn remaining(&self) -> u32 {
        self.round_budget.saturating_sub(self.round_sent)
    }

    /// Start a new round if the current one is spent.
    fn rearm(&mut self) -> bool {
        if self.remaining() > 0 {
            return false;
        }
        self.round_sent = 0;
        true
    }
}

#[derive(Debug, Default)]
struct DecodeTracker {
    next_job: u64,
    latest: Option<u64>,
    in_flight: bool,
    attempted: bool,
    new_since_attempt: u32,
}

impl DecodeTracker {
    fn start(&mut self) -> u64 {
        let job = self.next_job;
        self.next_job += 1;
        self.latest = Some(job);
        self.in_flight = true;
        self.attempted = true;
        self.new_since_attempt = 0;
        job
    }

    /// Forget the current version's attempts. Job ids keep increasing so
    /// results of old jobs stay recognisable as stale.
    fn reset(&mut self) {
        self.latest = None;
        self.in_flight = false;
        self.attempted = false;
        self.new_since_attempt = 0;
    }
}

#[derive(Debug)]
pub struct DisseminationEngine {
    config: EngineConfig,
    coder: Arc<dyn Coder>,
    sessions: SessionManager,
    detector: ConsistencyDetector,
    control: TrickleTimer,
    data: TrickleTimer,
    seeder: Option<Seeder>,
    decode: DecodeTracker,
    beacons_left: u32,
    /// Relays start minting at `total_blocks * relay_salt` so two relays
    /// rarely duplicate each other or the original seeder.
    relay_salt: u32,
    stats: EngineStats,
}

impl DisseminationEngine {
    pub fn new(config: EngineConfig, coder: Arc<dyn Coder>, seed: u64) -> Result<Self, EngineError> {
        config.validate()?;
        let control = TrickleTimer::new(config.control, seed)?;
        let data = TrickleTimer::new(config.data, seed.rotate_left(32) ^ 0xD1B5_4A32_D192_ED03)?;
        let sessions = SessionManager::new(config.retention, config.store_capacity_factor);
        Ok(Self {
            beacons_left: config.post_completion_beacons,
            relay_salt: (seed % 16) as u32 + 1,
            config,
            coder,
            sessions,
            detector: ConsistencyDetector::new(),
            control,
            data,
            seeder: None,
            decode: DecodeTracker::default(),
            stats: EngineStats::default(),
        })
    }

    /// Start beaconing. With no session the node announces version 0.
    pub fn start(&mut self, now: Instant) {
        if !self.control.is_running() {
            self.control.reset(now);
        }
    }

    /// Seed `content` as `version`, superseding whatever came before.
    pub fn publish(
        &mut self,
        now: Instant,
        version: Version,
        content: SourceBlocks,
    ) -> Result<EngineActions, EngineError> {
        let info = TransferInfo {
            version,
            total_blocks: content.total_blocks(),
            block_size: content.block_size(),
            file_len: content.file_len(),
            summary: content.summary(),
        };
        let source = self.coder.encoder(&content)?;
        let superseded = self.sessions.begin_seeding(now, info)?;

        let mut actions = EngineActions::default();
        if let Some(old) = superseded {
            tracing::info!(old, new = version, "published version supersedes session");
            actions.events.push(SessionEvent::Superseded { old, new: version });
        }

        self.decode.reset();
        self.seeder = Some(Seeder {
            version,
            source,
            next_index: 0,
            round_sent: 0,
            round_budget: self.coder.round_budget(info.total_blocks),
        });
        self.data.stop();
        self.control.reset(now);
        self.beacons_left = self.config.post_completion_beacons;

        tracing::info!(
            version,
            total_blocks = info.total_blocks,
            file_len = info.file_len,
            summary = %info.summary,
            coder = self.coder.name(),
            "publishing"
        );

        if !self.config.await_interest {
            self.start_transmitting(now)?;
        }
        Ok(actions)
    }

    /// Cancel all timers and release the session's symbols.
    pub fn stop(&mut self) -> EngineActions {
        let mut actions = EngineActions::default();
        self.control.stop();
        self.data.stop();
        self.seeder = None;
        self.decode.reset();
        if let Some(version) = self.sessions.stop() {
            tracing::info!(version, "session stopped");
            actions.events.push(SessionEvent::Aborted {
                version,
                reason: "stopped".into(),
            });
        }
        actions
    }

    pub fn handle_message(&mut self, now: Instant, message: Message) -> EngineActions {
        let mut actions = EngineActions::default();
        match message {
            Message::Control(announcement) => {
                self.on_announcement(now, announcement, &mut actions)
            }
            Message::Data(packet) => self.on_symbol(now, packet, &mut actions),
        }
        actions
    }

    /// Fire whatever timers are due at `now`. After a stall, missed fire
    /// points collapse into a single transmission per channel.
    pub fn poll_timers(&mut self, now: Instant) -> EngineActions {
        let mut actions = EngineActions::default();
        let mut fired = false;
        while let Some(event) = self.control.poll(now) {
            if matches!(event, TrickleEvent::Transmit) && std::mem::replace(&mut fired, true) {
                tracing::trace!("skipped missed control firing");
                continue;
            }
            self.on_control_timer(event, &mut actions);
        }
        let mut fired = false;
        while let Some(event) = self.data.poll(now) {
            if matches!(event, TrickleEvent::Transmit) && std::mem::replace(&mut fired, true) {
                self.stats.data_firings_skipped += 1;
                tracing::trace!("skipped missed data firing");
                continue;
            }
            self.on_data_timer(event, &mut actions);
        }
        for version in self.sessions.release_expired(now) {
            tracing::debug!(version, "released retired session");
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.control.next_deadline(),
            self.data.next_deadline(),
            self.sessions.next_release(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Feed back the result of a decode job. Results of superseded jobs
    /// or versions are dropped.
    pub fn on_decode_result(
        &mut self,
        now: Instant,
        job_id: u64,
        version: Version,
        result: Result<DecodeOutcome, CoderError>,
    ) -> EngineActions {
        let mut actions = EngineActions::default();
        let current = self
            .sessions
            .current()
            .is_some_and(|s| s.is_receiving() && s.version() == version);
        if self.decode.latest != Some(job_id) || !current {
            self.stats.stale_decode_results += 1;
            tracing::debug!(job_id, version, "discarding stale decode result");
            return actions;
        }
        self.decode.in_flight = false;

        match result {
            Ok(DecodeOutcome::NeedMore) => {
                tracing::debug!(job_id, version, "decode needs more symbols");
                self.maybe_decode(false, &mut actions);
            }
            Ok(DecodeOutcome::Decoded(blocks)) => self.on_decoded(now, blocks, &mut actions),
            Err(e) => {
                self.stats.decode_errors += 1;
                tracing::warn!(job_id, version, error = %e, "decode attempt failed");
            }
        }
        actions
    }

    /// Our own beacon.
    pub fn announcement(&self) -> Announcement {
        self.sessions
            .current()
            .map(|s| s.announcement())
            .unwrap_or_else(Announcement::empty)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            peer_status: self.announcement().status,
            session: self.sessions.report(),
            retired_sessions: self.sessions.retired_count(),
            control: TimerStatus::of(&self.control),
            data: TimerStatus::of(&self.data),
            seeder: self.seeder.as_ref().map(|s| SeederStatus {
                version: s.version,
                next_index: s.next_index,
                round_sent: s.round_sent,
                round_budget: s.round_budget,
            }),
            post_completion_beacons_left: self.beacons_left,
            classifications: self.detector.counts().clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn control_timer(&self) -> &TrickleTimer {
        &self.control
    }

    pub fn data_timer(&self) -> &TrickleTimer {
        &self.data
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Control channel
    // ------------------------------------------------------------------

    fn on_announcement(&mut self, now: Instant, obs: Announcement, actions: &mut EngineActions) {
        self.stats.announcements_received += 1;
        let local = self.sessions.current().map(|s| s.announcement());
        let class = self.detector.classify(&obs, local.as_ref());
        tracing::debug!(
            version = obs.version,
            status = ?obs.status,
            ?class,
            "announcement"
        );

        match class {
            Classification::Consistent => {
                // A holder's beacon does not answer a receiver's request.
                let receiving = self.sessions.current().is_some_and(|s| s.is_receiving());
                if !(receiving && obs.status == PeerStatus::Holding) {
                    self.control.hear_consistent();
                }
                if obs.version > 0 && obs.status == PeerStatus::Seeking {
                    self.on_seeking(now);
                }
            }
            Classification::NewerVersion => self.on_newer(now, &obs, actions),
            Classification::StaleVersion => self.on_stale(now, actions),
            Classification::Inconsistent => {
                self.on_inconsistent(now, obs.summary, "conflicting announcement", actions)
            }
        }
    }

    /// A receiver of our version wants symbols.
    fn on_seeking(&mut self, now: Instant) {
        let Some(session) = self.sessions.current() else {
            return;
        };
        if session.is_receiving() {
            // Another receiver's progress beacon covers ours.
            self.data.hear_consistent();
            return;
        }
        if !session.holds_content() {
            return;
        }
        let awaiting = session.role() == Role::Seeder && session.state() == SessionState::Announcing;
        let version = session.version();

        self.rearm_beacons(now);
        if awaiting {
            if let Err(e) = self.start_transmitting(now) {
                tracing::warn!(version, error = %e, "cannot start transmitting");
            }
            return;
        }
        if let Some(seeder) = self.seeder.as_mut() {
            if seeder.rearm() {
                self.stats.demand_rearms += 1;
                tracing::debug!(version, next_index = seeder.next_index, "demand re-armed round");
            }
            self.data.hear_inconsistent(now);
        }
    }

    fn on_newer(&mut self, now: Instant, obs: &Announcement, actions: &mut EngineActions) {
        if obs.status == PeerStatus::Idle {
            tracing::debug!(version = obs.version, "ignoring newer version from idle peer");
            return;
        }
        let info = TransferInfo::from_announcement(obs);
        match self.sessions.adopt(now, info) {
            Ok(superseded) => {
                if let Some(old) = superseded {
                    tracing::info!(old, new = info.version, "session superseded");
                    actions.events.push(SessionEvent::Superseded {
                        old,
                        new: info.version,
                    });
                }
                self.seeder = None;
                self.decode.reset();
                self.data.stop();
                self.control.reset(now);
                self.beacons_left = self.config.post_completion_beacons;
                tracing::info!(
                    version = info.version,
                    total_blocks = info.total_blocks,
                    file_len = info.file_len,
                    summary = %info.summary,
                    "adopted newer version"
                );
            }
            Err(e) => {
                tracing::warn!(version = obs.version, error = %e, "cannot adopt announced version")
            }
        }
    }

    /// A neighbour is behind. Reply at most once per control interval.
    fn on_stale(&mut self, now: Instant, actions: &mut EngineActions) {
        let Some(session) = self.sessions.current() else {
            return;
        };
        if session.state() == SessionState::Aborted {
            return;
        }
        let awaiting = session.role() == Role::Seeder && session.state() == SessionState::Announcing;

        self.rearm_beacons(now);
        self.control.hear_inconsistent(now);
        if self.control.try_out_of_cycle() {
            actions.send.push(Message::Control(self.announcement()));
            self.stats.out_of_cycle_replies += 1;
            self.stats.beacons_sent += 1;
        }
        if awaiting {
            if let Err(e) = self.start_transmitting(now) {
                tracing::warn!(error = %e, "cannot start transmitting");
            }
        }
    }

    fn on_inconsistent(
        &mut self,
        now: Instant,
        remote: ContentSummary,
        reason: &str,
        actions: &mut EngineActions,
    ) {
        let Some(session) = self.sessions.current() else {
            return;
        };
        if session.state() == SessionState::Aborted {
            return;
        }
        let version = session.version();
        let local = session.info().summary;
        let receiving = session.is_receiving();

        tracing::warn!(version, %local, %remote, reason, "inconsistent content for version");
        actions.events.push(SessionEvent::Inconsistency {
            version,
            local,
            remote,
        });

        if !receiving {
            self.rearm_beacons(now);
            self.control.hear_inconsistent(now);
            return;
        }

        self.data.stop();
        self.decode.reset();
        match self.sessions.abort(reason) {
            Ok(version) => actions.events.push(SessionEvent::Aborted {
                version,
                reason: reason.to_string(),
            }),
            Err(e) => tracing::warn!(version, error = %e, "cannot abort session"),
        }
        self.control.reset(now);
    }

    fn on_control_timer(&mut self, event: TrickleEvent, actions: &mut EngineActions) {
        match event {
            TrickleEvent::Transmit => {
                let quieting = self.is_completed_receiver();
                if quieting {
                    if self.beacons_left == 0 {
                        self.control.stop();
                        return;
                    }
                    self.beacons_left -= 1;
                }
                let beacon = self.announcement();
                tracing::debug!(version = beacon.version, status = ?beacon.status, "control beacon");
                actions.send.push(Message::Control(beacon));
                self.stats.beacons_sent += 1;
                if quieting && self.beacons_left == 0 {
                    tracing::debug!("post-completion beacons spent, control channel quiet");
                    self.control.stop();
                }
            }
            TrickleEvent::Suppressed => {
                self.stats.control_suppressed += 1;
                tracing::trace!("control beacon suppressed");
            }
            TrickleEvent::IntervalEnded { interval } => {
                tracing::trace!(interval_ms = interval.as_millis() as u64, "control interval");
            }
        }
    }

    fn is_completed_receiver(&self) -> bool {
        self.sessions
            .current()
            .is_some_and(|s| s.role() == Role::Receiver && s.state() == SessionState::Complete)
    }

    /// Stale, inconsistent and `Seeking` observations wake a quiet
    /// completed receiver for another round of beacons.
    fn rearm_beacons(&mut self, now: Instant) {
        if !self.is_completed_receiver() || self.config.post_completion_beacons == 0 {
            return;
        }
        self.beacons_left = self.config.post_completion_beacons;
        if !self.control.is_running() {
            self.control.reset(now);
        }
    }

    // ------------------------------------------------------------------
    // Data channel
    // ------------------------------------------------------------------

    fn start_transmitting(&mut self, now: Instant) -> Result<(), SessionError> {
        self.sessions.mark_transmitting()?;
        self.data.reset(now);
        tracing::info!(version = self.sessions.current_version(), "transmitting");
        Ok(())
    }

    fn on_symbol(&mut self, now: Instant, packet: SymbolPacket, actions: &mut EngineActions) {
        self.stats.symbols_received += 1;
        let current_version = self.sessions.current_version();
        let symbol = Symbol {
            id: packet.symbol_id,
            payload: packet.payload,
        };

        if current_version == 0 || packet.version != current_version {
            match self.sessions.retired_store_mut(packet.version) {
                Some(store) => {
                    store.add(symbol);
                }
                None => self.stats.foreign_symbols += 1,
            }
            tracing::trace!(version = packet.version, "symbol for non-current version");
            return;
        }

        let Some(session) = self.sessions.current_mut() else {
            return;
        };
        let state = session.state();
        if state == SessionState::Aborted {
            return;
        }
        let receiving = session.is_receiving();
        let outcome = session.store_mut().add(symbol);

        if !receiving || outcome == AddOutcome::DuplicateIgnored {
            self.data.hear_consistent();
            return;
        }

        self.stats.symbols_added += 1;
        if state == SessionState::Announcing {
            if let Err(e) = self.start_transmitting(now) {
                tracing::warn!(version = current_version, error = %e, "cannot start receiving");
                return;
            }
        }
        self.data.hear_consistent();
        self.decode.new_since_attempt += 1;
        self.maybe_decode(false, actions);
    }

    fn on_data_timer(&mut self, event: TrickleEvent, actions: &mut EngineActions) {
        match event {
            TrickleEvent::Transmit => {
                let Some(session) = self.sessions.current() else {
                    return;
                };
                if session.is_receiving() {
                    let beacon = session.announcement();
                    tracing::debug!(
                        version = beacon.version,
                        distinct = session.store().distinct(),
                        "progress beacon"
                    );
                    actions.send.push(Message::Control(beacon));
                    self.stats.progress_beacons_sent += 1;
                } else if session.holds_content() {
                    self.burst(actions);
                }
            }
            TrickleEvent::Suppressed => {
                self.stats.data_suppressed += 1;
                tracing::trace!("data firing suppressed");
            }
            TrickleEvent::IntervalEnded { .. } => self.maybe_decode(true, actions),
        }
    }

    /// Mint up to `symbols_per_burst` fresh symbols within the round budget.
    fn burst(&mut self, actions: &mut EngineActions) {
        let Some(seeder) = self.seeder.as_mut() else {
            return;
        };
        let count = self.config.symbols_per_burst.min(seeder.remaining());
        if count == 0 {
            return;
        }

        for _ in 0..count {
            let index = seeder.next_index;
            let Some(next) = index.checked_add(1) else {
                tracing::warn!(version = seeder.version, "symbol index space exhausted");
                break;
            };
            match seeder.source.encode(index) {
                Ok(symbol) => {
                    actions.send.push(Message::Data(SymbolPacket {
                        version: seeder.version,
                        symbol_id: symbol.id,
                        payload: symbol.payload,
                    }));
                    seeder.next_index = next;
                    seeder.round_sent += 1;
                    self.stats.symbols_sent += 1;
                }
                Err(e) => {
                    tracing::warn!(version = seeder.version, index, error = %e, "encode failed");
                    break;
                }
            }
        }

        tracing::debug!(
            version = seeder.version,
            next_index = seeder.next_index,
            round_sent = seeder.round_sent,
            "symbol burst"
        );
        if seeder.remaining() == 0 {
            self.stats.rounds_spent += 1;
            tracing::debug!(version = seeder.version, "round budget spent, waiting for demand");
        }
    }

    // ------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------

    fn maybe_decode(&mut self, at_boundary: bool, actions: &mut EngineActions) {
        let Some(session) = self.sessions.current() else {
            return;
        };
        if !session.is_receiving() || self.decode.in_flight {
            return;
        }
        let distinct = session.store().distinct();
        if distinct < session.info().total_blocks as usize {
            return;
        }
        let pending = self.decode.new_since_attempt;
        let due = !self.decode.attempted
            || pending >= self.config.decode_every
            || (at_boundary && pending > 0);
        if !due {
            return;
        }

        let version = session.version();
        let layout = session.info().layout();
        let symbols = session.store().snapshot();
        let job_id = self.decode.start();
        self.stats.decode_attempts += 1;
        tracing::debug!(version, job_id, distinct, "starting decode attempt");
        actions.decode = Some(DecodeJob {
            job_id,
            version,
            layout,
            symbols,
        });
    }

    fn on_decoded(&mut self, now: Instant, blocks: Vec<Bytes>, actions: &mut EngineActions) {
        let Some(session) = self.sessions.current() else {
            return;
        };
        let info = *session.info();
        let version = info.version;

        let content = match SourceBlocks::from_blocks(blocks, info.layout(), info.file_len) {
            Ok(content) => content,
            Err(e) => {
                self.stats.decode_errors += 1;
                tracing::warn!(version, error = %e, "decoder returned malformed blocks");
                return;
            }
        };
        let summary = content.summary();
        if summary != info.summary {
            self.on_inconsistent(
                now,
                summary,
                "reconstructed content does not match announced summary",
                actions,
            );
            return;
        }

        if let Err(e) = self.sessions.mark_complete() {
            tracing::warn!(version, error = %e, "cannot complete session");
            return;
        }
        self.data.stop();
        self.decode.reset();
        self.beacons_left = self.config.post_completion_beacons;
        if self.beacons_left > 0 {
            self.control.reset(now);
        } else {
            self.control.stop();
        }
        tracing::info!(version, file_len = info.file_len, %summary, "transfer complete");

        if self.config.relay_after_complete {
            match self.coder.encoder(&content) {
                Ok(source) => {
                    let round_budget = self.coder.round_budget(info.total_blocks);
                    // Relays wait for demand before minting.
                    self.seeder = Some(Seeder {
                        version,
                        source,
                        next_index: info.total_blocks.saturating_mul(self.relay_salt),
                        round_sent: round_budget,
                        round_budget,
                    });
                }
                Err(e) => tracing::warn!(version, error = %e, "cannot relay completed transfer"),
            }
        }

        actions.events.push(SessionEvent::Completed(CompletedTransfer {
            version,
            summary,
            content,
        }));
    }
}
