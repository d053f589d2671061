//! Lifecycle phase of a cash collection session.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one purchase attempt from session start to finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where the cash session of the current attempt stands.
///
/// Replaces the independent `sessionActive` / `collectionAllowed` /
/// `finishing` / `attemptFinalized` flags: each combination that made sense
/// is one variant, and the others cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session; a new attempt may begin.
    Idle,
    /// Acceptors enabled (or being enabled) and money may come in.
    Collecting { attempt: AttemptId },
    /// The finalizer owns the attempt; no collection, only payout.
    Finishing { attempt: AttemptId },
    /// Settled. Baselines are gone; only post-settlement refunds remain possible.
    Finalized { attempt: AttemptId },
}

impl SessionPhase {
    pub fn attempt(&self) -> Option<AttemptId> {
        match self {
            SessionPhase::Idle => None,
            SessionPhase::Collecting { attempt }
            | SessionPhase::Finishing { attempt }
            | SessionPhase::Finalized { attempt } => Some(*attempt),
        }
    }

    /// Session active, collection allowed, not finishing.
    pub fn is_collecting(&self) -> bool {
        matches!(self, SessionPhase::Collecting { .. })
    }

    /// A new session may start from here.
    pub fn can_begin(&self) -> bool {
        matches!(self, SessionPhase::Idle | SessionPhase::Finalized { .. })
    }

    /// The finalizer may take over `attempt` from here.
    pub fn can_finish(&self, attempt: AttemptId) -> bool {
        matches!(self, SessionPhase::Collecting { attempt: a } if *a == attempt)
    }

    pub fn is_finishing(&self, attempt: AttemptId) -> bool {
        matches!(self, SessionPhase::Finishing { attempt: a } if *a == attempt)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "idle"),
            SessionPhase::Collecting { .. } => write!(f, "collecting"),
            SessionPhase::Finishing { .. } => write!(f, "finishing"),
            SessionPhase::Finalized { .. } => write!(f, "finalized"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_predicates() {
        let attempt = AttemptId::new();
        let other = AttemptId::new();

        assert!(SessionPhase::Idle.can_begin());
        assert!(SessionPhase::Finalized { attempt }.can_begin());
        assert!(!SessionPhase::Collecting { attempt }.can_begin());

        assert!(SessionPhase::Collecting { attempt }.can_finish(attempt));
        assert!(!SessionPhase::Collecting { attempt }.can_finish(other));
        assert!(!SessionPhase::Finalized { attempt }.can_finish(attempt));

        assert!(SessionPhase::Collecting { attempt }.is_collecting());
        assert!(!SessionPhase::Finishing { attempt }.is_collecting());
        assert_eq!(SessionPhase::Finishing { attempt }.attempt(), Some(attempt));
    }
}
