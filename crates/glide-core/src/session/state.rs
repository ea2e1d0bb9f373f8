//! Session identity, phases, and the externally visible snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{Pricing, TokenLedger};

/// Unique identifier for one rental session.
///
/// A device can be rented many times; the uuid nonce distinguishes the
/// generations. The id also scopes every idempotency key the session
/// issues. Built from the raw device string: id generation happens
/// before device validation, which is a session step of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh session id for a device rental.
    ///
    /// Format: `ride-{device}-{uuid}`
    #[must_use]
    pub fn generate(device: &str) -> Self {
        Self(format!("ride-{device}-{}", Uuid::new_v4()))
    }

    /// Returns the id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phase of a rental session.
///
/// ```text
///                unlock charged          threshold reached
///  INITIALIZING ---------------> ACTIVE ------------------> BLOCKED
///       |                       |   ^                      |  |  |
///       | fatal             end |   |       approved       |  |  | wait
///       v                       v   +----------------------+  |  | elapsed
///     FAILED                  ENDED <---- end while blocked --+  v
///                                                            TIMED_OUT
/// ```
///
/// `ENDED`, `FAILED`, and `TIMED_OUT` are terminal; a session never
/// re-enters `INITIALIZING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Resolving the customer and posting the unlock charge.
    Initializing,
    /// Metering usage.
    Active,
    /// Waiting for consumption approval.
    Blocked,
    /// Rider ended the rental; metering session closed.
    Ended,
    /// A fatal error stopped the session.
    Failed,
    /// Approval never arrived; session force-closed.
    TimedOut,
}

impl Phase {
    /// Stable phase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Active => "ACTIVE",
            Self::Blocked => "BLOCKED",
            Self::Ended => "ENDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    /// Whether the phase is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed | Self::TimedOut)
    }

    /// Whether a transition from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Initializing => matches!(next, Self::Active | Self::Failed),
            Self::Active => matches!(next, Self::Blocked | Self::Ended | Self::Failed),
            Self::Blocked => {
                matches!(next, Self::Active | Self::Ended | Self::TimedOut | Self::Failed)
            },
            Self::Ended | Self::Failed | Self::TimedOut => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible state of a session.
///
/// Published whole on every mutation; readers always observe a
/// consistent snapshot, never a partial update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Session identifier.
    pub session_id: SessionId,

    /// Device being rented, as supplied at start. Validated during
    /// startup, not at construction.
    pub device_id: String,

    /// Current lifecycle phase.
    pub phase: Phase,

    /// When the session started.
    pub started_at: DateTime<Utc>,

    /// When the last elapsed-time charge was posted (or the session
    /// started, before the first one).
    pub last_meter_at: DateTime<Utc>,

    /// When the session reached a terminal phase.
    pub ended_at: Option<DateTime<Utc>>,

    /// Distance traveled so far, in feet. Non-decreasing.
    pub distance_ft: u64,

    /// Token consumption by category.
    pub tokens: TokenLedger,

    /// Pricing terms for this session.
    pub pricing: Pricing,

    /// Amount due so far, in currency minor units.
    pub amount_due_minor: u64,

    /// Display text of the fatal error, if the session failed.
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    /// Initial snapshot for a session that is about to start.
    #[must_use]
    pub fn initial(session_id: SessionId, device_id: String, pricing: Pricing) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            device_id,
            phase: Phase::Initializing,
            started_at: now,
            last_meter_at: now,
            ended_at: None,
            distance_ft: 0,
            tokens: TokenLedger::new(),
            pricing,
            amount_due_minor: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_terminality() {
        assert!(!Phase::Initializing.is_terminal());
        assert!(!Phase::Active.is_terminal());
        assert!(!Phase::Blocked.is_terminal());
        assert!(Phase::Ended.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::TimedOut.is_terminal());
    }

    #[test]
    fn test_no_transitions_out_of_terminal() {
        let all = [
            Phase::Initializing,
            Phase::Active,
            Phase::Blocked,
            Phase::Ended,
            Phase::Failed,
            Phase::TimedOut,
        ];
        for terminal in [Phase::Ended, Phase::Failed, Phase::TimedOut] {
            for next in all {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_no_reentry_into_initializing() {
        for from in [Phase::Active, Phase::Blocked, Phase::Ended] {
            assert!(!from.can_transition_to(Phase::Initializing));
        }
    }

    #[test]
    fn test_expected_transitions() {
        assert!(Phase::Initializing.can_transition_to(Phase::Active));
        assert!(Phase::Initializing.can_transition_to(Phase::Failed));
        assert!(!Phase::Initializing.can_transition_to(Phase::Blocked));
        assert!(Phase::Active.can_transition_to(Phase::Blocked));
        assert!(Phase::Active.can_transition_to(Phase::Ended));
        assert!(Phase::Blocked.can_transition_to(Phase::Active));
        assert!(Phase::Blocked.can_transition_to(Phase::TimedOut));
        assert!(Phase::Blocked.can_transition_to(Phase::Ended));
        // Timeout is only reachable from the approval wait
        assert!(!Phase::Active.can_transition_to(Phase::TimedOut));
    }

    #[test]
    fn test_session_id_format() {
        let id = SessionId::generate("42");
        assert!(id.as_str().starts_with("ride-42-"));

        // Generations are distinct
        let other = SessionId::generate("42");
        assert_ne!(id, other);
    }

    #[test]
    fn test_phase_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&Phase::TimedOut).unwrap(),
            "\"TIMED_OUT\""
        );
        assert_eq!(
            serde_json::to_string(&Phase::Initializing).unwrap(),
            "\"INITIALIZING\""
        );
    }
}
