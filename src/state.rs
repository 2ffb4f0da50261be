//! Analysis Lifecycle State
//!
//! Tracks the lifecycle of the latest analysis per caller session. Each new
//! submission takes a fresh generation number; an older attempt whose
//! generation is no longer current has been superseded and may not move the
//! session's state any further.
//!
//! Finished sessions are kept for a retention window so their last state can
//! still be read, then pruned. Pruning runs every `PRUNE_INTERVAL` attempts.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::metrics;

/// How long a finished session stays readable
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

const PRUNE_INTERVAL: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisState {
    Idle,
    Uploading,
    Classifying,
    CandidatesReady,
    Resolving,
    Completed,
    Errored,
}

impl AnalysisState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisState::Completed | AnalysisState::Errored)
    }

    pub fn can_transition_to(&self, next: AnalysisState) -> bool {
        use AnalysisState::*;

        if next == Errored {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Uploading)
                | (Uploading, Classifying)
                | (Classifying, CandidatesReady)
                // nothing passed admission
                | (Classifying, Completed)
                | (CandidatesReady, Resolving)
                | (Resolving, Completed)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("Attempt {generation} was superseded")]
    Superseded { generation: u64 },

    #[error("Invalid transition: {from:?} -> {to:?}")]
    Invalid { from: AnalysisState, to: AnalysisState },
}

/// Handle for one submission within a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub session: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: AnalysisState,
    pub generation: u64,
    pub updated_at: i64,
}

/// Latest attempt and its state for every session
pub struct SessionTracker {
    sessions: DashMap<String, SessionSnapshot>,
    next_generation: AtomicU64,
    retention_ms: i64,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            next_generation: AtomicU64::new(1),
            retention_ms: i64::try_from(retention.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Start a new attempt, superseding whatever the session was running.
    pub fn begin(&self, session: &str) -> Attempt {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        if generation % PRUNE_INTERVAL == 0 {
            self.prune();
        }
        let snapshot = SessionSnapshot {
            state: AnalysisState::Idle,
            generation,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };

        if let Some(previous) = self.sessions.insert(session.to_string(), snapshot) {
            if !previous.state.is_terminal() {
                metrics::ANALYSES_SUPERSEDED.inc();
                tracing::info!(
                    session = %session,
                    superseded = previous.generation,
                    state = ?previous.state,
                    "Resubmission supersedes in-flight analysis"
                );
            }
        }

        Attempt {
            session: session.to_string(),
            generation,
        }
    }

    pub fn is_current(&self, attempt: &Attempt) -> bool {
        self.sessions
            .get(&attempt.session)
            .map(|s| s.generation == attempt.generation)
            .unwrap_or(false)
    }

    /// Move the attempt's session to `to` if the attempt is still current.
    pub fn transition(&self, attempt: &Attempt, to: AnalysisState) -> Result<(), TransitionError> {
        let mut entry = self
            .sessions
            .get_mut(&attempt.session)
            .ok_or(TransitionError::Superseded {
                generation: attempt.generation,
            })?;

        if entry.generation != attempt.generation {
            return Err(TransitionError::Superseded {
                generation: attempt.generation,
            });
        }
        if !entry.state.can_transition_to(to) {
            return Err(TransitionError::Invalid { from: entry.state, to });
        }

        tracing::info!(session = %attempt.session, "Analysis state transition: {:?} -> {:?}", entry.state, to);
        entry.state = to;
        entry.updated_at = chrono::Utc::now().timestamp_millis();
        Ok(())
    }

    pub fn state(&self, session: &str) -> Option<AnalysisState> {
        self.sessions.get(session).map(|s| s.state)
    }

    pub fn snapshot(&self, session: &str) -> Option<SessionSnapshot> {
        self.sessions.get(session).map(|s| s.value().clone())
    }

    pub fn in_flight(&self) -> usize {
        self.sessions.iter().filter(|s| !s.state.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop finished sessions older than the retention window. In-flight
    /// sessions are never dropped. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis().saturating_sub(self.retention_ms);
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| !(s.state.is_terminal() && s.updated_at <= cutoff));

        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.sessions.len(), "Pruned finished sessions");
        }
        removed
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}
