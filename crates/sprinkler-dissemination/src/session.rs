//! Session manager -- owns transfer identity and lifecycle.
//!
//! At most one current session. Superseded sessions are retired: their
//! payloads are freed at once, their symbol ids kept until the retention
//! deadline so late duplicates are still accounted for.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sprinkler_protocol::{Announcement, ContentSummary, PeerStatus, Version};

use crate::coder::BlockLayout;
use crate::store::SymbolStore;

/// What is being disseminated: everything an announcement carries except
/// the peer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub version: Version,
    pub total_blocks: u32,
    pub block_size: u16,
    pub file_len: u64,
    pub summary: ContentSummary,
}

impl TransferInfo {
    pub fn from_announcement(a: &Announcement) -> Self {
        Self {
            version: a.version,
            total_blocks: a.total_blocks,
            block_size: a.block_size,
            file_len: a.file_len,
            summary: a.summary,
        }
    }

    pub fn announcement(&self, status: PeerStatus) -> Announcement {
        Announcement {
            version: self.version,
            total_blocks: self.total_blocks,
            block_size: self.block_size,
            file_len: self.file_len,
            summary: self.summary,
            status,
        }
    }

    pub fn layout(&self) -> BlockLayout {
        BlockLayout {
            total_blocks: self.total_blocks,
            block_size: self.block_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Announcing,
    Transmitting,
    Complete,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Announcing => "announcing",
            SessionState::Transmitting => "transmitting",
            SessionState::Complete => "complete",
            SessionState::Aborted => "aborted",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Seeder,
    Receiver,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no active session")]
    NoSession,
    #[error("version 0 is reserved for \"no content\"")]
    ZeroVersion,
    #[error("version {version} describes an empty layout ({total_blocks} x {block_size})")]
    EmptyLayout {
        version: Version,
        total_blocks: u32,
        block_size: u16,
    },
    #[error("version {proposed} is not newer than current version {current}")]
    NotNewer { current: Version, proposed: Version },
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

#[derive(Debug)]
pub struct Session {
    info: TransferInfo,
    state: SessionState,
    role: Role,
    store: SymbolStore,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    abort_reason: Option<String>,
}

impl Session {
    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    pub fn version(&self) -> Version {
        self.info.version
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn store(&self) -> &SymbolStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SymbolStore {
        &mut self.store
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// A receiver still collecting symbols.
    pub fn is_receiving(&self) -> bool {
        self.role == Role::Receiver
            && matches!(
                self.state,
                SessionState::Announcing | SessionState::Transmitting
            )
    }

    /// Whether this node has the whole content for the version.
    pub fn holds_content(&self) -> bool {
        match self.role {
            Role::Seeder => self.state != SessionState::Aborted,
            Role::Receiver => self.state == SessionState::Complete,
        }
    }

    pub fn peer_status(&self) -> PeerStatus {
        if self.state == SessionState::Aborted {
            PeerStatus::Idle
        } else if self.holds_content() {
            PeerStatus::Holding
        } else {
            PeerStatus::Seeking
        }
    }

    pub fn announcement(&self) -> Announcement {
        self.info.announcement(self.peer_status())
    }
}

/// Serializable snapshot of the current session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub version: Version,
    pub state: SessionState,
    pub role: Role,
    pub total_blocks: u32,
    pub block_size: u16,
    pub file_len: u64,
    pub summary: String,
    pub distinct_symbols: usize,
    pub redundant_symbols: u64,
    pub evicted_symbols: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub abort_reason: Option<String>,
}

#[derive(Debug)]
struct RetiredSession {
    session: Session,
    release_at: Instant,
}

#[derive(Debug)]
pub struct SessionManager {
    current: Option<Session>,
    retired: Vec<RetiredSession>,
    retention: Duration,
    capacity_factor: u32,
}

impl SessionManager {
    pub fn new(retention: Duration, capacity_factor: u32) -> Self {
        Self {
            current: None,
            retired: Vec::new(),
            retention,
            capacity_factor,
        }
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    pub fn current_version(&self) -> Version {
        self.current.as_ref().map(|s| s.version()).unwrap_or(0)
    }

    /// Start seeding `info`. The seeder already holds the content, so its
    /// store only accounts for symbols heard from others. Returns the
    /// superseded version, if any.
    pub fn begin_seeding(
        &mut self,
        now: Instant,
        info: TransferInfo,
    ) -> Result<Option<Version>, SessionError> {
        self.install(now, info, Role::Seeder)
    }

    /// Follow a newer version heard on the network.
    pub fn adopt(
        &mut self,
        now: Instant,
        info: TransferInfo,
    ) -> Result<Option<Version>, SessionError> {
        self.install(now, info, Role::Receiver)
    }

    fn install(
        &mut self,
        now: Instant,
        info: TransferInfo,
        role: Role,
    ) -> Result<Option<Version>, SessionError> {
        if info.version == 0 {
            return Err(SessionError::ZeroVersion);
        }
        if info.total_blocks == 0 || info.block_size == 0 {
            return Err(SessionError::EmptyLayout {
                version: info.version,
                total_blocks: info.total_blocks,
                block_size: info.block_size,
            });
        }
        let current = self.current_version();
        if info.version <= current {
            return Err(SessionError::NotNewer {
                current,
                proposed: info.version,
            });
        }

        let superseded = self.retire_current(now);

        let mut store = SymbolStore::for_blocks(info.version, info.total_blocks, self.capacity_factor);
        if role == Role::Seeder {
            store.mark_complete();
        }
        self.current = Some(Session {
            info,
            state: SessionState::Announcing,
            role,
            store,
            started_at: Utc::now(),
            completed_at: None,
            abort_reason: None,
        });
        Ok(superseded)
    }

    fn retire_current(&mut self, now: Instant) -> Option<Version> {
        let mut old = self.current.take()?;
        let version = old.version();
        if self.retention.is_zero() {
            old.store.release();
        } else {
            old.store.mark_complete();
            self.retired.push(RetiredSession {
                session: old,
                release_at: now + self.retention,
            });
        }
        Some(version)
    }

    fn transition(&mut self, to: SessionState) -> Result<&mut Session, SessionError> {
        let session = self.current.as_mut().ok_or(SessionError::NoSession)?;
        let from = session.state;
        let allowed = matches!(
            (from, to),
            (SessionState::Announcing, SessionState::Transmitting)
                | (SessionState::Transmitting, SessionState::Complete)
                | (SessionState::Announcing, SessionState::Aborted)
                | (SessionState::Transmitting, SessionState::Aborted)
                | (SessionState::Complete, SessionState::Aborted)
        );
        if !allowed {
            return Err(SessionError::InvalidTransition { from, to });
        }
        session.state = to;
        Ok(session)
    }

    pub fn mark_transmitting(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Transmitting).map(|_| ())
    }

    /// Completion frees payloads; ids stay for late duplicates.
    pub fn mark_complete(&mut self) -> Result<(), SessionError> {
        let session = self.transition(SessionState::Complete)?;
        session.store.mark_complete();
        session.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Abort the current session and release its store.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<Version, SessionError> {
        let session = self.transition(SessionState::Aborted)?;
        session.store.release();
        session.abort_reason = Some(reason.into());
        Ok(session.version())
    }

    /// Explicit stop. Also drops every retired store.
    pub fn stop(&mut self) -> Option<Version> {
        for mut r in self.retired.drain(..) {
            r.session.store.release();
        }
        match self.current.as_ref().map(|s| s.state) {
            Some(SessionState::Aborted) | None => None,
            Some(_) => self.abort("stopped").ok(),
        }
    }

    pub fn retired_store(&self, version: Version) -> Option<&SymbolStore> {
        self.retired
            .iter()
            .find(|r| r.session.version() == version)
            .map(|r| &r.session.store)
    }

    /// Store of a retired session, for late-duplicate accounting.
    pub fn retired_store_mut(&mut self, version: Version) -> Option<&mut SymbolStore> {
        self.retired
            .iter_mut()
            .find(|r| r.session.version() == version)
            .map(|r| &mut r.session.store)
    }

    /// Release retired sessions whose retention has passed.
    pub fn release_expired(&mut self, now: Instant) -> Vec<Version> {
        let mut released = Vec::new();
        self.retired.retain_mut(|r| {
            if r.release_at > now {
                return true;
            }
            r.session.store.release();
            released.push(r.session.version());
            false
        });
        released
    }

    pub fn next_release(&self) -> Option<Instant> {
        self.retired.iter().map(|r| r.release_at).min()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    pub fn report(&self) -> Option<SessionReport> {
        self.current.as_ref().map(|s| SessionReport {
            version: s.version(),
            state: s.state,
            role: s.role,
            total_blocks: s.info.total_blocks,
            block_size: s.info.block_size,
            file_len: s.info.file_len,
            summary: s.info.summary.to_hex(),
            distinct_symbols: s.store.distinct(),
            redundant_symbols: s.store.redundant(),
            evicted_symbols: s.store.evicted(),
            started_at: s.started_at,
            completed_at: s.completed_at,
            abort_reason: s.abort_reason.clone(),
        })
    }
}
