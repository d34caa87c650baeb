//! Matchmaking core: the waiting pool, the pairing engine, and the session
//! table with its teardown state machine.
//!
//! All three structures live behind one mutex so that matching is a single
//! atomic step: no observer can ever see a connection as both waiting and
//! paired, or see a session with only one member present. Critical sections
//! are short and never perform collaborator I/O; media-engine calls happen
//! entirely outside this module.

use crate::protocol::{generate_room_id, SessionMode};
use crate::registry::ConnectionRegistry;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, warn};

/// How a partner is picked among eligible waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Uniformly random among eligible candidates.
    Random,
    /// Oldest waiter first. Deterministic; used by tests and available for
    /// deployments that prefer queue fairness over anonymity.
    Fifo,
}

impl MatchPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "random" => Some(MatchPolicy::Random),
            "fifo" => Some(MatchPolicy::Fifo),
            _ => None,
        }
    }
}

/// A connection actively searching for a partner.
#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub connection_id: String,
    pub mode: SessionMode,
    pub enqueued_at: Instant,
}

/// One member's view of a session. Both members hold an entry with the same
/// room id and mode, each naming the other as partner.
#[derive(Debug, Clone)]
pub struct SessionMembership {
    pub room_id: String,
    pub partner_id: String,
    pub mode: SessionMode,
    pub paired_at: Instant,
}

/// Result of tearing down a paired session, reported once per teardown so the
/// caller can notify the partner exactly once.
#[derive(Debug, Clone)]
pub struct Teardown {
    pub room_id: String,
    pub partner_id: String,
    pub mode: SessionMode,
}

/// A session removed by the orphan sweep, with both member ids so their
/// transports can be released.
#[derive(Debug, Clone)]
pub struct OrphanedSession {
    pub room_id: String,
    pub members: [String; 2],
}

/// Result of a successfully committed pairing.
#[derive(Debug, Clone)]
pub struct PairedSession {
    pub room_id: String,
    pub mode: SessionMode,
    /// The searching side that triggered the match.
    pub initiator: String,
    /// The side that was already waiting.
    pub responder: String,
}

#[derive(Debug)]
pub enum SearchOutcome {
    /// No eligible candidate; the connection stays queued.
    Waiting,
    Paired(PairedSession),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("already searching")]
    AlreadyQueued,
    #[error("already in a session")]
    AlreadyPaired,
}

#[derive(Default)]
struct MatchState {
    waiting: HashMap<String, WaitingEntry>,
    sessions: HashMap<String, SessionMembership>,
}

pub struct Matchmaker {
    state: Mutex<MatchState>,
    registry: Arc<ConnectionRegistry>,
    policy: MatchPolicy,
    rng: Mutex<StdRng>,
}

impl Matchmaker {
    pub fn new(registry: Arc<ConnectionRegistry>, policy: MatchPolicy) -> Self {
        Self::with_rng(registry, policy, StdRng::from_entropy())
    }

    /// Construct with a caller-supplied RNG so random pairing is
    /// reproducible in tests.
    pub fn with_rng(registry: Arc<ConnectionRegistry>, policy: MatchPolicy, rng: StdRng) -> Self {
        Self {
            state: Mutex::new(MatchState::default()),
            registry,
            policy,
            rng: Mutex::new(rng),
        }
    }

    /// Enter the waiting pool and attempt an immediate match. The caller is
    /// expected to have left any current session first ("search again"
    /// semantics live in the event handler).
    pub fn enqueue(
        &self,
        connection_id: &str,
        mode: SessionMode,
    ) -> Result<SearchOutcome, MatchError> {
        let mut state = self.state.lock();
        if state.sessions.contains_key(connection_id) {
            return Err(MatchError::AlreadyPaired);
        }
        if state.waiting.contains_key(connection_id) {
            return Err(MatchError::AlreadyQueued);
        }

        match self.select_candidate(&mut state, connection_id, mode) {
            Some(partner_id) => Ok(SearchOutcome::Paired(self.commit_pair(
                &mut state,
                connection_id,
                &partner_id,
                mode,
            ))),
            None => {
                state.waiting.insert(
                    connection_id.to_string(),
                    WaitingEntry {
                        connection_id: connection_id.to_string(),
                        mode,
                        enqueued_at: Instant::now(),
                    },
                );
                Ok(SearchOutcome::Waiting)
            }
        }
    }

    /// Remove from the waiting pool. Idempotent; returns whether an entry
    /// was actually removed.
    pub fn dequeue(&self, connection_id: &str) -> bool {
        self.state.lock().waiting.remove(connection_id).is_some()
    }

    /// Leave the current session or waiting pool. Idempotent: an idle
    /// connection is a no-op. Returns teardown details when a paired session
    /// was dissolved, so the caller can notify the partner exactly once.
    pub fn leave(&self, connection_id: &str) -> Option<Teardown> {
        let mut state = self.state.lock();
        state.waiting.remove(connection_id);
        self.remove_session_pair(&mut state, connection_id)
    }

    /// Leave the current partner and immediately re-enter the waiting pool
    /// with the session's mode, attempting a fresh match in the same atomic
    /// step. Returns the teardown (if any) and the new search outcome (None
    /// when the connection had no session or search to resume).
    pub fn request_next(&self, connection_id: &str) -> (Option<Teardown>, Option<SearchOutcome>) {
        let mut state = self.state.lock();

        if state.waiting.contains_key(connection_id) {
            // Already searching; keep the queue position.
            return (None, Some(SearchOutcome::Waiting));
        }

        let Some(teardown) = self.remove_session_pair(&mut state, connection_id) else {
            return (None, None);
        };
        let mode = teardown.mode;

        let outcome = match self.select_candidate(&mut state, connection_id, mode) {
            Some(partner_id) => {
                SearchOutcome::Paired(self.commit_pair(&mut state, connection_id, &partner_id, mode))
            }
            None => {
                state.waiting.insert(
                    connection_id.to_string(),
                    WaitingEntry {
                        connection_id: connection_id.to_string(),
                        mode,
                        enqueued_at: Instant::now(),
                    },
                );
                SearchOutcome::Waiting
            }
        };
        (Some(teardown), Some(outcome))
    }

    /// Current session membership of a connection, if any. This lookup is
    /// the sole authority for signaling relay targets.
    pub fn session_of(&self, connection_id: &str) -> Option<SessionMembership> {
        self.state.lock().sessions.get(connection_id).cloned()
    }

    pub fn is_waiting(&self, connection_id: &str) -> bool {
        self.state.lock().waiting.contains_key(connection_id)
    }

    pub fn waiting_count(&self, mode: SessionMode) -> usize {
        self.state
            .lock()
            .waiting
            .values()
            .filter(|entry| entry.mode == mode)
            .count()
    }

    /// Number of active sessions (pairs, not members).
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len() / 2
    }

    /// Evict waiting entries older than `timeout`. Returns the evicted
    /// entries so their owners can be notified exactly once.
    pub fn reap_stale_waiters(&self, timeout: Duration) -> Vec<WaitingEntry> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let expired: Vec<String> = state
            .waiting
            .values()
            .filter(|entry| now.duration_since(entry.enqueued_at) >= timeout)
            .map(|entry| entry.connection_id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| state.waiting.remove(id))
            .collect()
    }

    /// Remove sessions where neither member is reachable any more. Defensive
    /// cleanup for missed disconnect events; sessions with one live member
    /// are left to the disconnect path.
    pub fn reap_orphaned_sessions(&self) -> Vec<OrphanedSession> {
        let mut state = self.state.lock();
        let mut seen_rooms = HashSet::new();
        let mut orphaned = Vec::new();
        for (id, membership) in &state.sessions {
            if !seen_rooms.insert(membership.room_id.clone()) {
                continue;
            }
            if !self.registry.is_reachable(id) && !self.registry.is_reachable(&membership.partner_id)
            {
                orphaned.push(OrphanedSession {
                    room_id: membership.room_id.clone(),
                    members: [id.clone(), membership.partner_id.clone()],
                });
            }
        }
        for session in &orphaned {
            for member in &session.members {
                state.sessions.remove(member);
            }
        }
        orphaned
    }

    /// Pick one eligible candidate for `seeker` in `mode`, pruning
    /// unreachable waiters encountered during the scan.
    fn select_candidate(
        &self,
        state: &mut MatchState,
        seeker: &str,
        mode: SessionMode,
    ) -> Option<String> {
        let mut dead = Vec::new();
        let mut eligible: Vec<(Instant, String)> = Vec::new();
        for entry in state.waiting.values() {
            if entry.connection_id == seeker || entry.mode != mode {
                continue;
            }
            if state.sessions.contains_key(&entry.connection_id) {
                // Waiting and paired at once should be impossible.
                warn!(connection_id = %entry.connection_id, "waiting entry already claimed by a session, skipping");
                continue;
            }
            if self.registry.is_reachable(&entry.connection_id) {
                eligible.push((entry.enqueued_at, entry.connection_id.clone()));
            } else {
                dead.push(entry.connection_id.clone());
            }
        }
        for id in dead {
            state.waiting.remove(&id);
        }
        if eligible.is_empty() {
            return None;
        }
        match self.policy {
            MatchPolicy::Fifo => eligible
                .iter()
                .min_by_key(|(enqueued_at, _)| *enqueued_at)
                .map(|(_, id)| id.clone()),
            MatchPolicy::Random => {
                let index = self.rng.lock().gen_range(0..eligible.len());
                Some(eligible[index].1.clone())
            }
        }
    }

    /// Commit a match: both waiting entries out, both session entries in,
    /// one new room id. Single step under the caller's lock.
    fn commit_pair(
        &self,
        state: &mut MatchState,
        seeker: &str,
        partner: &str,
        mode: SessionMode,
    ) -> PairedSession {
        state.waiting.remove(seeker);
        state.waiting.remove(partner);
        let room_id = generate_room_id();
        let paired_at = Instant::now();
        state.sessions.insert(
            seeker.to_string(),
            SessionMembership {
                room_id: room_id.clone(),
                partner_id: partner.to_string(),
                mode,
                paired_at,
            },
        );
        state.sessions.insert(
            partner.to_string(),
            SessionMembership {
                room_id: room_id.clone(),
                partner_id: seeker.to_string(),
                mode,
                paired_at,
            },
        );
        PairedSession {
            room_id,
            mode,
            initiator: seeker.to_string(),
            responder: partner.to_string(),
        }
    }

    /// Remove both sides of a session. Removal is always symmetric; a
    /// half-present session is an internal invariant violation and is torn
    /// down forcibly rather than left corrupt.
    fn remove_session_pair(&self, state: &mut MatchState, connection_id: &str) -> Option<Teardown> {
        let mine = state.sessions.remove(connection_id)?;
        match state.sessions.remove(&mine.partner_id) {
            Some(partner) => {
                if partner.partner_id != connection_id || partner.room_id != mine.room_id {
                    error!(
                        room_id = %mine.room_id,
                        connection_id = %connection_id,
                        partner_id = %mine.partner_id,
                        "session table inconsistency, tearing down both sides"
                    );
                }
            }
            None => {
                error!(
                    room_id = %mine.room_id,
                    connection_id = %connection_id,
                    partner_id = %mine.partner_id,
                    "half-paired session found, removing remaining side"
                );
            }
        }
        Some(Teardown {
            room_id: mine.room_id,
            partner_id: mine.partner_id,
            mode: mine.mode,
        })
    }
}
