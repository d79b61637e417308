//! Core data model.
//!
//! A work unit has identity, a lifecycle state, and once finished an
//! outcome. Queues carry a policy that decides how many units run at once.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for work unit IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Constructed, not yet handed to a queue.
    Created,
    /// Accepted by a queue, waiting for dependencies or a free slot.
    Ready,
    /// Job is running on a queue worker.
    Executing,
    /// Job returned successfully. Terminal.
    Completed,
    /// Cancelled before start or observed cancellation while running. Terminal.
    Cancelled,
    /// Job returned an error or panicked. Terminal.
    Failed,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Created, Ready)
                | (Ready, Executing)
                | (Ready, Cancelled)    // cancelled before the queue started it
                | (Executing, Completed)
                | (Executing, Cancelled)
                | (Executing, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Cancelled | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Created => "created",
            State::Ready => "ready",
            State::Executing => "executing",
            State::Completed => "completed",
            State::Cancelled => "cancelled",
            State::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(State::Created),
            "ready" => Ok(State::Ready),
            "executing" => Ok(State::Executing),
            "completed" => Ok(State::Completed),
            "cancelled" => Ok(State::Cancelled),
            "failed" => Ok(State::Failed),
            other => Err(format!("unknown state: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// A recorded state change of a work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Process-wide monotonic sequence number. Orders transitions across
    /// units and threads without relying on wall-clock resolution.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub from: State,
    pub to: State,
}

impl Transition {
    pub(crate) fn record(from: State, to: State) -> Self {
        Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::SeqCst),
            at: Utc::now(),
            from,
            to,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of work execution, stored with the unit once it is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Arbitrary result data. Opaque to the queue.
    pub data: Option<serde_json::Value>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Execution duration. Zero for units cancelled before they started.
    pub duration_ms: u64,
}

impl Outcome {
    pub(crate) fn cancelled(duration_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: None,
            duration_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue policy
// ---------------------------------------------------------------------------

/// How an execution queue schedules its units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// One unit at a time, earliest submitted ready unit first.
    Serial,
    /// Any ready unit may start. `None` means unbounded.
    Concurrent { max_concurrent: Option<usize> },
}

impl QueuePolicy {
    /// Maximum number of units executing at once, if bounded.
    pub fn max_concurrent(self) -> Option<usize> {
        match self {
            QueuePolicy::Serial => Some(1),
            QueuePolicy::Concurrent { max_concurrent } => max_concurrent.map(|n| n.max(1)),
        }
    }

    pub fn is_serial(self) -> bool {
        matches!(self, QueuePolicy::Serial)
    }
}

impl std::fmt::Display for QueuePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueuePolicy::Serial => write!(f, "serial"),
            QueuePolicy::Concurrent {
                max_concurrent: Some(n),
            } => write!(f, "concurrent({n})"),
            QueuePolicy::Concurrent {
                max_concurrent: None,
            } => write!(f, "concurrent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        use State::*;
        let all = [Created, Ready, Executing, Completed, Cancelled, Failed];
        for from in all.into_iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} allowed");
            }
        }
    }

    #[test]
    fn created_units_cannot_skip_the_queue() {
        assert!(!State::Created.can_transition_to(State::Executing));
        assert!(!State::Created.can_transition_to(State::Cancelled));
        assert!(State::Created.can_transition_to(State::Ready));
    }

    #[test]
    fn state_parses_its_display_form() {
        for s in ["created", "ready", "executing", "completed", "cancelled", "failed"] {
            let state: State = s.parse().unwrap();
            assert_eq!(state.to_string(), s);
        }
        assert!("dead".parse::<State>().is_err());
    }

    #[test]
    fn transition_seq_is_monotonic() {
        let a = Transition::record(State::Created, State::Ready);
        let b = Transition::record(State::Ready, State::Executing);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn serial_policy_is_bounded_to_one() {
        assert_eq!(QueuePolicy::Serial.max_concurrent(), Some(1));
        let unbounded = QueuePolicy::Concurrent {
            max_concurrent: None,
        };
        assert_eq!(unbounded.max_concurrent(), None);
        assert_eq!(unbounded.to_string(), "concurrent");
    }
}
